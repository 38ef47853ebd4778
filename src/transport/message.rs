//! Network message and its unique id.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::warn;

/// Size of a message id in bytes.
pub const ID_SIZE: usize = 16;
/// Largest payload carried by one message.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Request/reply correlation id.
///
/// Layout: IPv4 address (4) | port (2) | random (2) | clock nanos (8).
/// Uniqueness is probabilistic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; ID_SIZE]);

impl MessageId {
    pub fn new(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a fresh id for a requester reachable at `addr`.
    pub fn generate(addr: SocketAddr) -> Self {
        let mut id = [0u8; ID_SIZE];

        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                [octets[12], octets[13], octets[14], octets[15]]
            }
        };
        id[0..4].copy_from_slice(&ip);
        id[4..6].copy_from_slice(&addr.port().to_be_bytes());
        id[6..8].copy_from_slice(&rand::random::<[u8; 2]>());

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        id[8..16].copy_from_slice(&nanos.to_be_bytes());

        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl TryFrom<&[u8]> for MessageId {
    type Error = usize;

    /// Fails with the offending length.
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; ID_SIZE]>::try_from(bytes)
            .map(Self)
            .map_err(|_| bytes.len())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// One logical request or reply.
///
/// `sender` is filled in by the receive loop from the datagram source and is
/// `None` for locally built messages. It never goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    id: MessageId,
    payload: Bytes,
    sender: Option<SocketAddr>,
}

impl NetworkMessage {
    /// Oversize payloads are truncated to [`MAX_PAYLOAD_SIZE`].
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: truncate_payload(payload.into()),
            sender: None,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn sender(&self) -> Option<SocketAddr> {
        self.sender
    }

    pub fn with_sender(mut self, sender: SocketAddr) -> Self {
        self.sender = Some(sender);
        self
    }
}

pub(crate) fn truncate_payload(payload: Bytes) -> Bytes {
    if payload.len() > MAX_PAYLOAD_SIZE {
        warn!(
            len = payload.len(),
            max = MAX_PAYLOAD_SIZE,
            "Payload too long, truncating"
        );
        payload.slice(..MAX_PAYLOAD_SIZE)
    } else {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_layout() {
        let addr: SocketAddr = "10.1.2.3:4321".parse().unwrap();
        let id = MessageId::generate(addr);
        let bytes = id.as_bytes();
        assert_eq!(&bytes[0..4], &[10, 1, 2, 3]);
        assert_eq!(&bytes[4..6], &4321u16.to_be_bytes());
    }

    #[test]
    fn test_generated_ids_differ() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let a = MessageId::generate(addr);
        let b = MessageId::generate(addr);
        assert_ne!(a, b);
    }

    #[test]
    fn test_oversize_payload_truncated() {
        let id = MessageId::new([7; ID_SIZE]);
        let msg = NetworkMessage::new(id, vec![1u8; MAX_PAYLOAD_SIZE + 100]);
        assert_eq!(msg.payload().len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_id_from_wrong_length_slice() {
        assert_eq!(MessageId::try_from(&[0u8; 3][..]), Err(3));
        assert!(MessageId::try_from(&[0u8; ID_SIZE][..]).is_ok());
    }
}
