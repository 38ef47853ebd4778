//! Socket receive loop.
//!
//! A [`Receiver`] owns the read side of one UDP socket on a dedicated task.
//! Every iteration produces exactly one [`MessageTuple`], which is handed to
//! the attached observer and/or pushed onto a queue.
//!
//! Stopping is cooperative: the stop flag is checked at the top of each
//! iteration and an in-flight receive is never interrupted, so shutdown can
//! take up to the current timeout. With no timeout strategy attached the
//! loop only notices the flag after the next datagram arrives.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::codec::{self, CodecError, MAX_ENVELOPE_SIZE};
use super::message::NetworkMessage;
use super::timeout::SharedTimeout;

/// Classification of one receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    MsgReceived,
    Timeout,
    ChecksumError,
    Error,
}

#[derive(Debug, Clone)]
pub struct MessageTuple {
    pub kind: MessageKind,
    /// Present only for [`MessageKind::MsgReceived`].
    pub message: Option<NetworkMessage>,
    /// The timeout that elapsed, for [`MessageKind::Timeout`].
    pub timeout: Option<Duration>,
}

impl MessageTuple {
    fn received(message: NetworkMessage) -> Self {
        Self {
            kind: MessageKind::MsgReceived,
            message: Some(message),
            timeout: None,
        }
    }

    fn timed_out(timeout: Duration) -> Self {
        Self {
            kind: MessageKind::Timeout,
            message: None,
            timeout: Some(timeout),
        }
    }

    fn failed(kind: MessageKind) -> Self {
        Self {
            kind,
            message: None,
            timeout: None,
        }
    }
}

/// Synchronous listener notified for every tuple the loop produces.
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, kind: MessageKind, message: Option<&NetworkMessage>);
}

/// Per-loop counters.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub received: AtomicU64,
    pub timeouts: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub malformed: AtomicU64,
    pub errors: AtomicU64,
}

impl ReceiverStats {
    fn record(&self, tuple: &MessageTuple) {
        let counter = match tuple.kind {
            MessageKind::MsgReceived => &self.received,
            MessageKind::Timeout => &self.timeouts,
            MessageKind::ChecksumError => &self.checksum_errors,
            MessageKind::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Receiver {
    socket: Arc<UdpSocket>,
    timeout: Option<SharedTimeout>,
    queue: Option<mpsc::UnboundedSender<MessageTuple>>,
    observer: Option<Arc<dyn MessageObserver>>,
    stop: Arc<AtomicBool>,
    stats: Arc<ReceiverStats>,
}

impl Receiver {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            timeout: None,
            queue: None,
            observer: None,
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ReceiverStats::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: SharedTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_queue(mut self, queue: mpsc::UnboundedSender<MessageTuple>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MessageObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn spawn(self) -> ReceiverHandle {
        let stop = self.stop.clone();
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run());
        ReceiverHandle { stop, stats, join }
    }

    async fn run(self) {
        let mut buf = vec![0u8; MAX_ENVELOPE_SIZE + 1];

        if let Some(timeout) = &self.timeout {
            timeout.lock().reset();
        }

        while !self.stop.load(Ordering::Acquire) {
            let tuple = self.receive_once(&mut buf).await;
            self.publish(tuple);
        }
        debug!("Receive loop stopped");
    }

    async fn receive_once(&self, buf: &mut [u8]) -> MessageTuple {
        let current = self.timeout.as_ref().map(|t| t.lock().timeout());

        let received = match current {
            Some(limit) => match tokio::time::timeout(limit, self.socket.recv_from(buf)).await {
                Ok(result) => result,
                Err(_) => return self.on_timed_out(limit),
            },
            None => self.socket.recv_from(buf).await,
        };

        match received {
            Ok((len, from)) => match codec::decode(&buf[..len]) {
                Ok(message) => {
                    if let Some(timeout) = &self.timeout {
                        timeout.lock().reset();
                    }
                    MessageTuple::received(message.with_sender(from))
                }
                Err(CodecError::ChecksumMismatch { .. }) => {
                    debug!(%from, len, "Dropping datagram with bad checksum");
                    MessageTuple::failed(MessageKind::ChecksumError)
                }
                Err(e) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!(%from, len, "Dropping datagram: {}", e);
                    MessageTuple::failed(MessageKind::Error)
                }
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                let limit = current.unwrap_or_default();
                self.on_timed_out(limit)
            }
            Err(e) => {
                warn!("Socket receive failed: {}", e);
                MessageTuple::failed(MessageKind::Error)
            }
        }
    }

    fn on_timed_out(&self, elapsed: Duration) -> MessageTuple {
        if let Some(timeout) = &self.timeout {
            timeout.lock().on_timed_out();
        }
        MessageTuple::timed_out(elapsed)
    }

    fn publish(&self, tuple: MessageTuple) {
        self.stats.record(&tuple);

        if let Some(observer) = &self.observer {
            observer.on_message(tuple.kind, tuple.message.as_ref());
        }
        if let Some(queue) = &self.queue {
            if queue.send(tuple).is_err() {
                trace!("Receive queue closed, tuple dropped");
            }
        }
    }
}

/// Control side of a spawned [`Receiver`].
pub struct ReceiverHandle {
    stop: Arc<AtomicBool>,
    stats: Arc<ReceiverStats>,
    join: JoinHandle<()>,
}

impl ReceiverHandle {
    /// Ask the loop to exit before its next receive.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop and wait for the loop to exit.
    pub async fn stop(self) {
        self.signal_stop();
        if let Err(e) = self.join.await {
            warn!("Receive loop task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::codec::encode;
    use crate::transport::message::{MessageId, ID_SIZE};
    use crate::transport::timeout::{ExponentialTimeout, FixedTimeout};
    use parking_lot::Mutex;

    async fn socket_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (Arc::new(receiver), sender)
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<MessageKind>>);

    impl MessageObserver for Recording {
        fn on_message(&self, kind: MessageKind, _message: Option<&NetworkMessage>) {
            self.0.lock().push(kind);
        }
    }

    #[tokio::test]
    async fn test_valid_datagram_is_received() {
        let (socket, sender) = socket_pair().await;
        let addr = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Receiver::new(socket).with_queue(tx).spawn();

        let id = MessageId::new([5; ID_SIZE]);
        sender.send_to(&encode(id, b"ping"), addr).await.unwrap();

        let tuple = rx.recv().await.unwrap();
        assert_eq!(tuple.kind, MessageKind::MsgReceived);
        let message = tuple.message.unwrap();
        assert_eq!(message.id(), id);
        assert_eq!(message.payload().as_ref(), b"ping");
        assert_eq!(message.sender(), Some(sender.local_addr().unwrap()));

        handle.signal_stop();
    }

    #[tokio::test]
    async fn test_corrupted_datagram_is_checksum_error() {
        let (socket, sender) = socket_pair().await;
        let addr = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Receiver::new(socket).with_queue(tx).spawn();

        let mut bytes = encode(MessageId::new([1; ID_SIZE]), b"payload").to_vec();
        let last_payload_byte = bytes.len() - 5;
        bytes[last_payload_byte] ^= 0x01;
        sender.send_to(&bytes, addr).await.unwrap();

        let tuple = rx.recv().await.unwrap();
        assert_eq!(tuple.kind, MessageKind::ChecksumError);
        assert!(tuple.message.is_none());
        assert_eq!(handle.stats().checksum_errors.load(Ordering::Relaxed), 1);

        handle.signal_stop();
    }

    #[tokio::test]
    async fn test_garbage_is_error() {
        let (socket, sender) = socket_pair().await;
        let addr = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Receiver::new(socket).with_queue(tx).spawn();

        sender.send_to(b"garbage", addr).await.unwrap();

        let tuple = rx.recv().await.unwrap();
        assert_eq!(tuple.kind, MessageKind::Error);
        assert_eq!(handle.stats().malformed.load(Ordering::Relaxed), 1);

        handle.signal_stop();
    }

    #[tokio::test]
    async fn test_timeouts_double_then_reset() {
        let (socket, sender) = socket_pair().await;
        let addr = socket.local_addr().unwrap();
        let timeout = ExponentialTimeout::new(Duration::from_millis(20)).shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Receiver::new(socket)
            .with_timeout(timeout.clone())
            .with_queue(tx)
            .spawn();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, MessageKind::Timeout);
        assert_eq!(first.timeout, Some(Duration::from_millis(20)));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, MessageKind::Timeout);
        assert_eq!(second.timeout, Some(Duration::from_millis(40)));

        sender
            .send_to(&encode(MessageId::new([2; ID_SIZE]), b"x"), addr)
            .await
            .unwrap();
        loop {
            let tuple = rx.recv().await.unwrap();
            if tuple.kind == MessageKind::MsgReceived {
                break;
            }
        }
        // The first timeout after a successful receive starts from initial again
        let after = rx.recv().await.unwrap();
        assert_eq!(after.kind, MessageKind::Timeout);
        assert_eq!(after.timeout, Some(Duration::from_millis(20)));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_observer_sees_every_tuple() {
        let (socket, sender) = socket_pair().await;
        let addr = socket.local_addr().unwrap();
        let observer = Arc::new(Recording::default());
        let handle = Receiver::new(socket)
            .with_observer(observer.clone())
            .spawn();

        sender
            .send_to(&encode(MessageId::new([3; ID_SIZE]), b"a"), addr)
            .await
            .unwrap();
        sender.send_to(b"junk", addr).await.unwrap();

        for _ in 0..50 {
            if observer.0.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *observer.0.lock(),
            vec![MessageKind::MsgReceived, MessageKind::Error]
        );

        handle.signal_stop();
    }

    #[tokio::test]
    async fn test_stop_is_bounded_by_timeout() {
        let (socket, _sender) = socket_pair().await;
        let handle = Receiver::new(socket)
            .with_timeout(FixedTimeout(Duration::from_millis(30)).shared())
            .spawn();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stopped = tokio::time::timeout(Duration::from_secs(2), handle.stop()).await;
        assert!(stopped.is_ok());
    }
}
