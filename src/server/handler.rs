//! Per-request logic: validation, routing, replication and node commands.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::cluster::{Cluster, VirtualNode};
use crate::error::{KvError, Result};
use crate::protocol::{Command, ErrorCode, Request, Response};
use crate::store::KeyValueStore;
use crate::transport::{codec, MessageId, NetworkMessage};

/// Result of handling one request.
#[derive(Debug)]
pub enum Outcome {
    Reply { to: SocketAddr, response: Response },
    /// Handed to the owner, which answers the client itself.
    Forwarded,
    /// Replica writes and messages without a return address.
    NoReply,
    /// Reply, then stop the node.
    Shutdown { to: SocketAddr, response: Response },
}

pub struct Handler {
    cluster: Arc<Cluster>,
    store: Arc<KeyValueStore>,
    socket: Arc<UdpSocket>,
}

impl Handler {
    pub fn new(cluster: Arc<Cluster>, store: Arc<KeyValueStore>, socket: Arc<UdpSocket>) -> Self {
        Self {
            cluster,
            store,
            socket,
        }
    }

    pub async fn handle(&self, message: &NetworkMessage) -> Outcome {
        let Some(sender) = message.sender() else {
            return Outcome::NoReply;
        };

        let request = match Request::decode(message.payload()) {
            Ok(request) => self.admit(request, sender),
            Err(e) if self.cluster.is_member_addr(sender) => {
                // Members only send requests, so this is a stray reply
                debug!(id = %message.id(), %sender, "Ignoring undecodable datagram from member: {}", e);
                return Outcome::NoReply;
            }
            Err(e) => {
                debug!(id = %message.id(), %sender, "Undecodable request: {}", e);
                return Outcome::Reply {
                    to: sender,
                    response: Response::new(ErrorCode::UnrecognizedCommand),
                };
            }
        };
        let reply_to = request.reply_to.unwrap_or(sender);

        if let Err(code) = request.validate() {
            trace!(id = %message.id(), command = ?request.command, %code, "Rejected request");
            if request.replica {
                return Outcome::NoReply;
            }
            return Outcome::Reply {
                to: reply_to,
                response: Response::new(code),
            };
        }

        if request.replica {
            self.apply_replica(&request);
            return Outcome::NoReply;
        }

        match self.dispatch(message.id(), sender, &request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(id = %message.id(), command = ?request.command, "Request failed: {}", e);
                Outcome::Reply {
                    to: reply_to,
                    response: Response::new(ErrorCode::InternalKvStoreFailure),
                }
            }
        }
    }

    async fn dispatch(&self, id: MessageId, sender: SocketAddr, request: &Request) -> Result<Outcome> {
        let to = request.reply_to.unwrap_or(sender);
        let response = match request.command {
            Command::Put | Command::Get | Command::Remove => {
                let owner = self.cluster.owner_of(&request.key)?;
                // Forwarded requests are served here even if our view differs
                if !self.cluster.is_local(owner.node) && !request.forwarded {
                    self.forward(id, sender, request, &owner).await?;
                    return Ok(Outcome::Forwarded);
                }
                self.serve_keyed(request, &owner).await
            }
            Command::Shutdown => {
                return Ok(Outcome::Shutdown {
                    to,
                    response: Response::success(),
                })
            }
            Command::Wipeout => {
                self.store.clear();
                Response::success()
            }
            Command::IsAlive => Response::success(),
            Command::GetPid => Response {
                pid: Some(std::process::id()),
                ..Response::success()
            },
            Command::GetMembershipCount => Response {
                membership_count: Some(self.cluster.membership_count() as u32),
                ..Response::success()
            },
            Command::Unknown(_) => Response::new(ErrorCode::UnrecognizedCommand),
        };
        Ok(Outcome::Reply { to, response })
    }

    async fn serve_keyed(&self, request: &Request, owner: &VirtualNode) -> Response {
        match request.command {
            Command::Put => {
                match self
                    .store
                    .put(request.key.clone(), request.value.clone(), request.version)
                {
                    Ok(()) => {
                        self.replicate(request, owner).await;
                        Response::success()
                    }
                    Err(KvError::OutOfSpace) => Response::new(ErrorCode::OutOfSpace),
                    Err(e) => {
                        warn!("Store rejected put: {}", e);
                        Response::new(ErrorCode::InternalKvStoreFailure)
                    }
                }
            }
            Command::Get => match self.store.get(&request.key) {
                Some(stored) => Response::value(stored.value, stored.version),
                None => Response::new(ErrorCode::NonExistentKey),
            },
            Command::Remove => {
                if self.store.remove(&request.key) {
                    self.replicate(request, owner).await;
                    Response::success()
                } else {
                    Response::new(ErrorCode::NonExistentKey)
                }
            }
            _ => Response::new(ErrorCode::UnrecognizedCommand),
        }
    }

    async fn forward(
        &self,
        id: MessageId,
        sender: SocketAddr,
        request: &Request,
        owner: &VirtualNode,
    ) -> Result<()> {
        let addr = self.cluster.route(owner.node)?;
        let forwarded = Request {
            forwarded: true,
            reply_to: Some(sender),
            ..request.clone()
        };
        let envelope = codec::encode(id, &forwarded.encode()?);
        self.socket.send_to(&envelope, addr).await?;
        debug!(%id, owner = %owner.node, %addr, "Forwarded request to owner");
        Ok(())
    }

    /// Push a successful primary write or removal to the replica set. Best effort.
    async fn replicate(&self, request: &Request, owner: &VirtualNode) {
        let replica = Request {
            replica: true,
            forwarded: false,
            reply_to: None,
            ..request.clone()
        };
        let payload = match replica.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode replica write: {}", e);
                return;
            }
        };

        for node in self.cluster.replica_targets(owner) {
            if self.cluster.is_local(node) {
                continue;
            }
            let addr = match self.cluster.route(node) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Skipping replica: {}", e);
                    continue;
                }
            };
            let envelope = codec::encode(MessageId::generate(self.cluster.self_addr()), &payload);
            if let Err(e) = self.socket.send_to(&envelope, addr).await {
                warn!(%node, %addr, "Failed to send replica: {}", e);
            }
        }
    }

    fn apply_replica(&self, request: &Request) {
        match request.command {
            Command::Put => {
                if let Err(e) = self
                    .store
                    .put(request.key.clone(), request.value.clone(), request.version)
                {
                    warn!("Failed to apply replica write: {}", e);
                }
            }
            Command::Remove => {
                self.store.remove(&request.key);
            }
            command => trace!(?command, "Ignoring replica of non-keyed command"),
        }
    }

    /// Where the answer to `payload` received from `sender` goes. `None`
    /// for messages that are never answered.
    pub fn reply_address(&self, payload: &[u8], sender: SocketAddr) -> Option<SocketAddr> {
        match Request::decode(payload) {
            Ok(request) => {
                let request = self.admit(request, sender);
                (!request.replica).then(|| request.reply_to.unwrap_or(sender))
            }
            Err(_) => (!self.cluster.is_member_addr(sender)).then_some(sender),
        }
    }

    /// Peer-only flags are honoured from ring members alone. A request from
    /// anyone else is served as a plain client request and answered at its
    /// source address.
    fn admit(&self, mut request: Request, sender: SocketAddr) -> Request {
        let peer_flags = request.forwarded || request.replica || request.reply_to.is_some();
        if peer_flags && !self.cluster.is_member_addr(sender) {
            debug!(%sender, "Ignoring peer flags from a non-member");
            request.forwarded = false;
            request.replica = false;
            request.reply_to = None;
        }
        if !request.forwarded {
            request.reply_to = None;
        }
        request
    }
}
