//! Checksummed wire envelope.
//!
//! ```text
//! +-----------+-----------+---------------+-----------+-------------+
//! | id_len:u16| id (16)   | payload_len:u32| payload  | crc32:u32   |
//! +-----------+-----------+---------------+-----------+-------------+
//! ```
//!
//! All integers are big-endian. The CRC-32 covers `id || payload`. One
//! datagram carries exactly one envelope, so a decoder consumes the whole
//! buffer it is handed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use super::message::{truncate_payload, MessageId, NetworkMessage, ID_SIZE, MAX_PAYLOAD_SIZE};

const HEADER_LEN: usize = 2 + ID_SIZE + 4;
const TRAILER_LEN: usize = 4;

/// Largest datagram a valid envelope can occupy.
pub const MAX_ENVELOPE_SIZE: usize = HEADER_LEN + MAX_PAYLOAD_SIZE + TRAILER_LEN;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl CodecError {
    fn malformed(msg: impl Into<String>) -> Self {
        CodecError::Malformed(msg.into())
    }
}

fn checksum(id: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(id);
    hasher.update(payload);
    hasher.finalize()
}

/// Serialize `id` and `payload` into one envelope.
pub fn encode(id: MessageId, payload: &[u8]) -> Bytes {
    let payload = truncate_payload(Bytes::copy_from_slice(payload));
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    buf.put_u16(ID_SIZE as u16);
    buf.put_slice(id.as_bytes());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32(checksum(id.as_bytes(), &payload));
    buf.freeze()
}

/// Parse one envelope and verify its checksum.
pub fn decode(data: &[u8]) -> Result<NetworkMessage, CodecError> {
    let mut buf = data;

    if buf.remaining() < HEADER_LEN + TRAILER_LEN {
        return Err(CodecError::malformed(format!(
            "datagram of {} bytes is shorter than an empty envelope",
            data.len()
        )));
    }

    let id_len = buf.get_u16() as usize;
    if id_len != ID_SIZE {
        return Err(CodecError::malformed(format!("id length {}", id_len)));
    }
    let id = MessageId::try_from(&buf[..ID_SIZE])
        .map_err(|len| CodecError::malformed(format!("id length {}", len)))?;
    buf.advance(ID_SIZE);

    let payload_len = buf.get_u32() as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(CodecError::malformed(format!("payload length {}", payload_len)));
    }
    if buf.remaining() != payload_len + TRAILER_LEN {
        return Err(CodecError::malformed(format!(
            "payload length {} does not match {} remaining bytes",
            payload_len,
            buf.remaining()
        )));
    }
    let payload = Bytes::copy_from_slice(&buf[..payload_len]);
    buf.advance(payload_len);

    let expected = buf.get_u32();
    let actual = checksum(id.as_bytes(), &payload);
    if expected != actual {
        debug!(%id, expected, actual, "Checksum mismatch");
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    Ok(NetworkMessage::new(id, payload))
}
