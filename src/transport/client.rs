//! Request/reply client with retries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use super::codec;
use super::message::MessageId;
use super::receiver::{MessageKind, MessageTuple, Receiver, ReceiverHandle};
use super::timeout::{ExponentialTimeout, SharedTimeout};
use crate::config::ClientConfig;
use crate::error::{KvError, Result};
use crate::protocol::{Command, ErrorCode, Request, Response};

/// Sends one request at a time and waits for the matching reply.
///
/// A lost datagram is resent with the same message id until `max_retries`
/// resends have timed out. Overloaded replies are honoured by sleeping the
/// advertised wait before resending.
pub struct KvClient {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    replies: Mutex<mpsc::UnboundedReceiver<MessageTuple>>,
    timeout: SharedTimeout,
    receiver: ReceiverHandle,
    max_retries: u32,
}

impl KvClient {
    pub async fn bind(local: SocketAddr, config: &ClientConfig) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let local_addr = socket.local_addr()?;

        let timeout = ExponentialTimeout::new(config.initial_timeout())
            .with_max(config.max_timeout())
            .shared();
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = Receiver::new(socket.clone())
            .with_timeout(timeout.clone())
            .with_queue(tx)
            .spawn();

        debug!(%local_addr, "Client bound");
        Ok(Self {
            socket,
            local_addr,
            replies: Mutex::new(rx),
            timeout,
            receiver,
            max_retries: config.max_retries,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn request(&self, server: SocketAddr, request: &Request) -> Result<Response> {
        let mut replies = self.replies.lock().await;

        let id = MessageId::generate(self.local_addr);
        let envelope = codec::encode(id, &request.encode()?);

        let mut timeouts = 0u32;
        let mut overloads = 0u32;
        self.start_attempt(&mut replies, &envelope, server).await?;

        loop {
            let tuple = replies
                .recv()
                .await
                .ok_or_else(|| KvError::internal("client receive loop stopped"))?;

            match tuple.kind {
                MessageKind::MsgReceived => {
                    let Some(message) = tuple.message else { continue };
                    if message.id() != id {
                        trace!(expected = %id, got = %message.id(), "Ignoring unrelated reply");
                        continue;
                    }
                    let response = Response::decode(message.payload())?;
                    if response.code != ErrorCode::SystemOverload {
                        return Ok(response);
                    }

                    overloads += 1;
                    if overloads > self.max_retries {
                        return Err(KvError::Overloaded);
                    }
                    let wait = Duration::from_millis(u64::from(response.overload_wait_ms.unwrap_or(0)));
                    debug!(%server, %id, wait_ms = wait.as_millis() as u64, "Server overloaded, backing off");
                    tokio::time::sleep(wait).await;
                    self.start_attempt(&mut replies, &envelope, server).await?;
                }
                MessageKind::Timeout => {
                    timeouts += 1;
                    if timeouts > self.max_retries {
                        warn!(%server, %id, attempts = timeouts, "Request timed out");
                        return Err(KvError::Timeout { attempts: timeouts });
                    }
                    trace!(%server, %id, elapsed = ?tuple.timeout, "Resending request");
                    self.socket.send_to(&envelope, server).await?;
                }
                MessageKind::ChecksumError | MessageKind::Error => {
                    trace!(kind = ?tuple.kind, "Ignoring undeliverable datagram");
                }
            }
        }
    }

    /// Drop tuples left from earlier requests, reset the backoff and send.
    async fn start_attempt(
        &self,
        replies: &mut mpsc::UnboundedReceiver<MessageTuple>,
        envelope: &Bytes,
        server: SocketAddr,
    ) -> Result<()> {
        while replies.try_recv().is_ok() {}
        self.timeout.lock().reset();
        self.socket.send_to(envelope, server).await?;
        Ok(())
    }

    pub async fn put(
        &self,
        server: SocketAddr,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        version: i32,
    ) -> Result<ErrorCode> {
        let response = self.request(server, &Request::put(key, value, version)).await?;
        Ok(response.code)
    }

    /// `value` is set only when the code is `SUCCESS`.
    pub async fn get(&self, server: SocketAddr, key: impl Into<Bytes>) -> Result<Response> {
        self.request(server, &Request::get(key)).await
    }

    pub async fn remove(&self, server: SocketAddr, key: impl Into<Bytes>) -> Result<ErrorCode> {
        let response = self.request(server, &Request::remove(key)).await?;
        Ok(response.code)
    }

    pub async fn wipeout(&self, server: SocketAddr) -> Result<ErrorCode> {
        let response = self.request(server, &Request::new(Command::Wipeout)).await?;
        Ok(response.code)
    }

    pub async fn is_alive(&self, server: SocketAddr) -> Result<bool> {
        let response = self.request(server, &Request::new(Command::IsAlive)).await?;
        Ok(response.code == ErrorCode::Success)
    }

    pub async fn get_pid(&self, server: SocketAddr) -> Result<u32> {
        let response = self.request(server, &Request::new(Command::GetPid)).await?;
        response
            .pid
            .ok_or_else(|| KvError::protocol(format!("GET_PID answered {} without a pid", response.code)))
    }

    pub async fn membership_count(&self, server: SocketAddr) -> Result<u32> {
        let response = self
            .request(server, &Request::new(Command::GetMembershipCount))
            .await?;
        response.membership_count.ok_or_else(|| {
            KvError::protocol(format!("GET_MEMBERSHIP_COUNT answered {} without a count", response.code))
        })
    }

    pub async fn shutdown(&self, server: SocketAddr) -> Result<ErrorCode> {
        let response = self.request(server, &Request::new(Command::Shutdown)).await?;
        Ok(response.code)
    }
}

impl Drop for KvClient {
    fn drop(&mut self) {
        self.receiver.signal_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::codec::decode;

    fn fast_config(max_retries: u32) -> ClientConfig {
        ClientConfig {
            initial_timeout_ms: 20,
            max_timeout_ms: 80,
            max_retries,
        }
    }

    async fn fake_server() -> (Arc<UdpSocket>, SocketAddr) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn test_times_out_after_retries() {
        let (server, addr) = fake_server().await;
        let client = KvClient::bind("127.0.0.1:0".parse().unwrap(), &fast_config(2))
            .await
            .unwrap();

        let err = client.is_alive(addr).await.unwrap_err();
        assert!(matches!(err, KvError::Timeout { attempts: 3 }));

        // Original send plus two resends, all with the same id
        let mut buf = vec![0u8; 2048];
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (len, _) = server.recv_from(&mut buf).await.unwrap();
            ids.push(decode(&buf[..len]).unwrap().id());
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_honours_overload_then_succeeds() {
        let (server, addr) = fake_server().await;
        // Long enough that no resend races the overloaded reply
        let config = ClientConfig {
            initial_timeout_ms: 500,
            max_timeout_ms: 1000,
            max_retries: 3,
        };
        let client = KvClient::bind("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let first = decode(&buf[..len]).unwrap();
            let overloaded = codec::encode(first.id(), &Response::overloaded(30).encode());
            server.send_to(&overloaded, from).await.unwrap();

            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let second = decode(&buf[..len]).unwrap();
            assert_eq!(second.id(), first.id());
            let ok = codec::encode(second.id(), &Response::success().encode());
            server.send_to(&ok, from).await.unwrap();
        });

        let started = std::time::Instant::now();
        assert!(client.is_alive(addr).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(30));
        responder.await.unwrap();
    }
}
