//! Application payload carried inside a [`NetworkMessage`](crate::transport::NetworkMessage).
//!
//! Request:
//! ```text
//! command:u8 | flags:u8 | key_len:u8 | key | value_len:u16 | value | version:i32 | [reply_to]
//! reply_to = family:u8 (4|6) | ip octets | port:u16
//! flags = replica 0x01 | reply_to 0x02 | forwarded 0x04
//! ```
//! Response:
//! ```text
//! err_code:u8 | flags:u8 | [value_len:u16 value version:i32] | [pid:u32] | [count:u32] | [wait_ms:u32]
//! ```
//! All integers are big-endian.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{KvError, Result};

pub const MAX_KEY_LEN: usize = 32;
pub const MAX_VALUE_LEN: usize = 10_000;

const FLAG_REPLICA: u8 = 0x01;
const FLAG_REPLY_TO: u8 = 0x02;
const FLAG_FORWARDED: u8 = 0x04;

const FLAG_VALUE: u8 = 0x01;
const FLAG_PID: u8 = 0x02;
const FLAG_MEMBERSHIP: u8 = 0x04;
const FLAG_OVERLOAD: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Put,
    Get,
    Remove,
    Shutdown,
    Wipeout,
    IsAlive,
    GetPid,
    GetMembershipCount,
    Unknown(u8),
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Put => 0x01,
            Command::Get => 0x02,
            Command::Remove => 0x03,
            Command::Shutdown => 0x04,
            Command::Wipeout => 0x05,
            Command::IsAlive => 0x06,
            Command::GetPid => 0x07,
            Command::GetMembershipCount => 0x08,
            Command::Unknown(code) => code,
        }
    }

    /// Commands addressed to the key's owner rather than the receiving node.
    pub fn is_keyed(self) -> bool {
        matches!(self, Command::Put | Command::Get | Command::Remove)
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Command::Put,
            0x02 => Command::Get,
            0x03 => Command::Remove,
            0x04 => Command::Shutdown,
            0x05 => Command::Wipeout,
            0x06 => Command::IsAlive,
            0x07 => Command::GetPid,
            0x08 => Command::GetMembershipCount,
            other => Command::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0x00,
    NonExistentKey = 0x01,
    OutOfSpace = 0x02,
    SystemOverload = 0x03,
    InternalKvStoreFailure = 0x04,
    UnrecognizedCommand = 0x05,
    InvalidKey = 0x06,
    InvalidVal = 0x07,
}

impl TryFrom<u8> for ErrorCode {
    type Error = KvError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x00 => ErrorCode::Success,
            0x01 => ErrorCode::NonExistentKey,
            0x02 => ErrorCode::OutOfSpace,
            0x03 => ErrorCode::SystemOverload,
            0x04 => ErrorCode::InternalKvStoreFailure,
            0x05 => ErrorCode::UnrecognizedCommand,
            0x06 => ErrorCode::InvalidKey,
            0x07 => ErrorCode::InvalidVal,
            other => return Err(KvError::protocol(format!("unknown error code {:#04x}", other))),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Success => "SUCCESS",
            ErrorCode::NonExistentKey => "NON_EXISTENT_KEY",
            ErrorCode::OutOfSpace => "OUT_OF_SPACE",
            ErrorCode::SystemOverload => "SYSTEM_OVERLOAD",
            ErrorCode::InternalKvStoreFailure => "INTERNAL_KVSTORE_FAILURE",
            ErrorCode::UnrecognizedCommand => "UNRECOGNIZED_COMMAND",
            ErrorCode::InvalidKey => "INVALID_KEY",
            ErrorCode::InvalidVal => "INVALID_VAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub key: Bytes,
    pub value: Bytes,
    pub version: i32,
    /// Set on copies a primary pushes to its replicas.
    pub replica: bool,
    /// Set by a node handing the request to the key's owner.
    pub forwarded: bool,
    /// Original client of a forwarded request.
    pub reply_to: Option<SocketAddr>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            key: Bytes::new(),
            value: Bytes::new(),
            version: 0,
            replica: false,
            forwarded: false,
            reply_to: None,
        }
    }

    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>, version: i32) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
            ..Self::new(Command::Put)
        }
    }

    pub fn get(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            ..Self::new(Command::Get)
        }
    }

    pub fn remove(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            ..Self::new(Command::Remove)
        }
    }

    /// Check sizes before the request is accepted for processing.
    pub fn validate(&self) -> std::result::Result<(), ErrorCode> {
        if let Command::Unknown(_) = self.command {
            return Err(ErrorCode::UnrecognizedCommand);
        }
        if !self.command.is_keyed() {
            return Ok(());
        }
        if self.key.is_empty() || self.key.len() > MAX_KEY_LEN {
            return Err(ErrorCode::InvalidKey);
        }
        if self.value.len() > MAX_VALUE_LEN {
            return Err(ErrorCode::InvalidVal);
        }
        if self.command != Command::Put && !self.value.is_empty() {
            return Err(ErrorCode::InvalidVal);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.key.len() > u8::MAX as usize {
            return Err(KvError::protocol(format!("key of {} bytes", self.key.len())));
        }
        if self.value.len() > u16::MAX as usize {
            return Err(KvError::protocol(format!("value of {} bytes", self.value.len())));
        }

        let mut flags = 0;
        if self.replica {
            flags |= FLAG_REPLICA;
        }
        if self.reply_to.is_some() {
            flags |= FLAG_REPLY_TO;
        }
        if self.forwarded {
            flags |= FLAG_FORWARDED;
        }

        let mut buf = BytesMut::with_capacity(9 + self.key.len() + self.value.len() + 19);
        buf.put_u8(self.command.code());
        buf.put_u8(flags);
        buf.put_u8(self.key.len() as u8);
        buf.put_slice(&self.key);
        buf.put_u16(self.value.len() as u16);
        buf.put_slice(&self.value);
        buf.put_i32(self.version);
        if let Some(addr) = self.reply_to {
            put_addr(&mut buf, addr);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let command = Command::from(take_u8(&mut buf)?);
        let flags = take_u8(&mut buf)?;
        let key_len = take_u8(&mut buf)? as usize;
        let key = take_bytes(&mut buf, key_len)?;
        let value_len = take_u16(&mut buf)? as usize;
        let value = take_bytes(&mut buf, value_len)?;
        let version = take_i32(&mut buf)?;
        let reply_to = if flags & FLAG_REPLY_TO != 0 {
            Some(take_addr(&mut buf)?)
        } else {
            None
        };
        expect_end(buf)?;

        Ok(Self {
            command,
            key,
            value,
            version,
            replica: flags & FLAG_REPLICA != 0,
            forwarded: flags & FLAG_FORWARDED != 0,
            reply_to,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: ErrorCode,
    pub value: Option<(Bytes, i32)>,
    pub pid: Option<u32>,
    pub membership_count: Option<u32>,
    pub overload_wait_ms: Option<u32>,
}

impl Response {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            value: None,
            pid: None,
            membership_count: None,
            overload_wait_ms: None,
        }
    }

    pub fn success() -> Self {
        Self::new(ErrorCode::Success)
    }

    pub fn value(value: Bytes, version: i32) -> Self {
        Self {
            value: Some((value, version)),
            ..Self::success()
        }
    }

    pub fn overloaded(wait_ms: u32) -> Self {
        Self {
            overload_wait_ms: Some(wait_ms),
            ..Self::new(ErrorCode::SystemOverload)
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut flags = 0;
        if self.value.is_some() {
            flags |= FLAG_VALUE;
        }
        if self.pid.is_some() {
            flags |= FLAG_PID;
        }
        if self.membership_count.is_some() {
            flags |= FLAG_MEMBERSHIP;
        }
        if self.overload_wait_ms.is_some() {
            flags |= FLAG_OVERLOAD;
        }

        let value_len = self.value.as_ref().map_or(0, |(v, _)| v.len());
        let mut buf = BytesMut::with_capacity(2 + 6 + value_len + 12);
        buf.put_u8(self.code as u8);
        buf.put_u8(flags);
        if let Some((value, version)) = &self.value {
            // Values are bounded by MAX_VALUE_LEN when stored
            let len = value.len().min(u16::MAX as usize);
            buf.put_u16(len as u16);
            buf.put_slice(&value[..len]);
            buf.put_i32(*version);
        }
        if let Some(pid) = self.pid {
            buf.put_u32(pid);
        }
        if let Some(count) = self.membership_count {
            buf.put_u32(count);
        }
        if let Some(wait) = self.overload_wait_ms {
            buf.put_u32(wait);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let code = ErrorCode::try_from(take_u8(&mut buf)?)?;
        let flags = take_u8(&mut buf)?;

        let value = if flags & FLAG_VALUE != 0 {
            let len = take_u16(&mut buf)? as usize;
            let value = take_bytes(&mut buf, len)?;
            Some((value, take_i32(&mut buf)?))
        } else {
            None
        };
        let pid = (flags & FLAG_PID != 0).then(|| take_u32(&mut buf)).transpose()?;
        let membership_count = (flags & FLAG_MEMBERSHIP != 0)
            .then(|| take_u32(&mut buf))
            .transpose()?;
        let overload_wait_ms = (flags & FLAG_OVERLOAD != 0)
            .then(|| take_u32(&mut buf))
            .transpose()?;
        expect_end(buf)?;

        Ok(Self {
            code,
            value,
            pid,
            membership_count,
            overload_wait_ms,
        })
    }
}

pub(crate) fn short(what: &str) -> KvError {
    KvError::protocol(format!("payload too short for {}", what))
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(short("u8"));
    }
    Ok(buf.get_u8())
}

pub(crate) fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(short("u16"));
    }
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(short("u32"));
    }
    Ok(buf.get_u32())
}

fn take_i32(buf: &mut &[u8]) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(short("i32"));
    }
    Ok(buf.get_i32())
}

fn take_bytes(buf: &mut &[u8], len: usize) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(short("field"));
    }
    Ok(buf.copy_to_bytes(len))
}

pub(crate) fn expect_end(buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(KvError::protocol(format!("{} trailing bytes", buf.len())))
    }
}

pub(crate) fn put_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

pub(crate) fn take_addr(buf: &mut &[u8]) -> Result<SocketAddr> {
    let ip = match take_u8(buf)? {
        4 => {
            let mut octets = [0u8; 4];
            if buf.remaining() < octets.len() {
                return Err(short("IPv4 address"));
            }
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            let mut octets = [0u8; 16];
            if buf.remaining() < octets.len() {
                return Err(short("IPv6 address"));
            }
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(KvError::protocol(format!("address family {}", other))),
    };
    Ok(SocketAddr::new(ip, take_u16(buf)?))
}
