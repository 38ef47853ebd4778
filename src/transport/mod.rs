//! Datagram transport: envelope codec, receive loop, timeouts and the
//! request client built on them.

pub mod client;
pub mod codec;
pub mod message;
pub mod overload;
pub mod receiver;
pub mod timeout;

pub use client::KvClient;
pub use codec::CodecError;
pub use message::{MessageId, NetworkMessage};
pub use overload::OverloadBackoff;
pub use receiver::{MessageKind, MessageObserver, MessageTuple, Receiver, ReceiverHandle};
pub use timeout::{ExponentialTimeout, FixedTimeout, SharedTimeout, TimeoutStrategy};
