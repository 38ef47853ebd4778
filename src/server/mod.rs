//! Storage node: receive loop, dispatcher and background tasks (checkup,
//! reply cache sweeper, membership gossip).

pub mod cache;
pub mod handler;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::cluster::gossip::{self, Gossip};
use crate::cluster::{AntiEntropy, CheckupHandle, Cluster, Migrator};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::protocol::Response;
use crate::store::KeyValueStore;
use crate::transport::receiver::ReceiverStats;
use crate::transport::{
    codec, FixedTimeout, MessageId, MessageKind, MessageTuple, NetworkMessage, OverloadBackoff, Receiver,
    ReceiverHandle,
};

use cache::{Lookup, ReplyCache};
use handler::{Handler, Outcome};

/// A bound but not yet running node.
pub struct Server {
    config: NodeConfig,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    cluster: Arc<Cluster>,
    store: Arc<KeyValueStore>,
}

impl Server {
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let self_addr = config.advertise_addr.unwrap_or(local_addr);

        let cluster = Arc::new(Cluster::from_config(&config, self_addr)?);
        let store = Arc::new(KeyValueStore::new(config.server.store_capacity_bytes));

        info!(%local_addr, %self_addr, "Server bound");
        Ok(Self {
            config,
            socket,
            local_addr,
            cluster,
            store,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cluster(&self) -> Arc<Cluster> {
        self.cluster.clone()
    }

    /// Spawn every task the node runs and return its control handle.
    pub fn start(self) -> ServerHandle {
        let settings = &self.config.server;
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let receiver = Receiver::new(self.socket.clone())
            .with_timeout(FixedTimeout(settings.receive_poll()).shared())
            .with_queue(queue_tx)
            .spawn();

        let cache = Arc::new(ReplyCache::new(settings.cache_ttl(), settings.cache_max_entries));
        let sweeper = cache.clone().start_sweeper();

        let checkup = Arc::new(AntiEntropy::new(self.cluster.clone(), self.store.clone()))
            .start(self.config.cluster.checkup_interval());

        let membership = &self.config.membership;
        let migrator = Arc::new(Migrator::new(
            self.cluster.clone(),
            self.store.clone(),
            self.socket.clone(),
            membership,
        ));
        let gossip = Arc::new(Gossip::new(
            self.cluster.clone(),
            self.socket.clone(),
            migrator,
            membership,
        ));
        let gossip_task = gossip.clone().start(membership.gossip_interval());

        let dispatcher = Arc::new(Dispatcher {
            socket: self.socket.clone(),
            handler: Handler::new(self.cluster.clone(), self.store.clone(), self.socket.clone()),
            gossip,
            cache,
            permits: Arc::new(Semaphore::new(settings.max_inflight)),
            backoff: OverloadBackoff::from_config(&self.config.overload),
            stop: stop_tx.clone(),
        });
        let dispatcher = tokio::spawn(dispatcher.run(queue_rx, stop_rx));

        info!(addr = %self.local_addr, node = %self.cluster.self_id(), "Server started");
        ServerHandle {
            local_addr: self.local_addr,
            cluster: self.cluster,
            store: self.store,
            stop: stop_tx,
            receiver,
            dispatcher,
            checkup,
            sweeper,
            gossip: gossip_task,
        }
    }
}

struct Dispatcher {
    socket: Arc<UdpSocket>,
    handler: Handler,
    gossip: Arc<Gossip>,
    cache: Arc<ReplyCache>,
    permits: Arc<Semaphore>,
    backoff: OverloadBackoff,
    stop: Arc<watch::Sender<bool>>,
}

impl Dispatcher {
    async fn run(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<MessageTuple>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let tuple = tokio::select! {
                tuple = queue.recv() => match tuple {
                    Some(tuple) => tuple,
                    None => break,
                },
                _ = stop.wait_for(|stopped| *stopped) => break,
            };

            match tuple.kind {
                MessageKind::MsgReceived => {
                    if let Some(message) = tuple.message {
                        self.on_message(message).await;
                    }
                }
                MessageKind::Timeout => {}
                kind => trace!(?kind, "Dropped undeliverable datagram"),
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn on_message(self: &Arc<Self>, message: NetworkMessage) {
        let Some(sender) = message.sender() else {
            return;
        };
        let id = message.id();

        // Heartbeats are cheap and never answered, so they skip the cache and permits
        if gossip::is_heartbeat(message.payload()) {
            if let Err(e) = self.gossip.on_heartbeat(sender, message.payload()) {
                debug!(%sender, "Dropped heartbeat: {}", e);
            }
            return;
        }

        match self.cache.begin(id) {
            Lookup::New => {}
            Lookup::InFlight => {
                trace!(%id, "Duplicate of in-flight request dropped");
                return;
            }
            Lookup::Completed { to, reply } => {
                trace!(%id, "Answering duplicate from cache");
                self.send(codec::encode(id, &reply), to).await;
                return;
            }
            Lookup::Full => {
                self.reject_overloaded(&message, sender).await;
                return;
            }
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.cache.forget(id);
                self.reject_overloaded(&message, sender).await;
                return;
            }
        };

        let this = self.clone();
        tokio::spawn(async move { this.serve(message, permit).await });
    }

    async fn serve(&self, message: NetworkMessage, _permit: OwnedSemaphorePermit) {
        let id = message.id();
        match self.handler.handle(&message).await {
            Outcome::Reply { to, response } => self.reply(id, to, &response).await,
            Outcome::Forwarded | Outcome::NoReply => self.cache.forget(id),
            Outcome::Shutdown { to, response } => {
                self.reply(id, to, &response).await;
                info!(%to, "Shutdown requested");
                self.stop.send_replace(true);
            }
        }
    }

    async fn reply(&self, id: MessageId, to: SocketAddr, response: &Response) {
        let payload = response.encode();
        self.send(codec::encode(id, &payload), to).await;
        self.cache.complete(id, to, payload);
    }

    async fn reject_overloaded(&self, message: &NetworkMessage, sender: SocketAddr) {
        let Some(to) = self.handler.reply_address(message.payload(), sender) else {
            trace!(id = %message.id(), %sender, "Overloaded, dropping unanswered message");
            return;
        };
        let wait_ms = self.backoff.next_wait_millis();
        debug!(id = %message.id(), %to, wait_ms, "Overloaded, rejecting request");
        let reply = Response::overloaded(wait_ms).encode();
        self.send(codec::encode(message.id(), &reply), to).await;
    }

    async fn send(&self, envelope: Bytes, to: SocketAddr) {
        if let Err(e) = self.socket.send_to(&envelope, to).await {
            warn!(%to, "Failed to send reply: {}", e);
        }
    }
}

/// Control handle of a running node.
pub struct ServerHandle {
    local_addr: SocketAddr,
    cluster: Arc<Cluster>,
    store: Arc<KeyValueStore>,
    stop: Arc<watch::Sender<bool>>,
    receiver: ReceiverHandle,
    dispatcher: JoinHandle<()>,
    checkup: CheckupHandle,
    sweeper: JoinHandle<()>,
    gossip: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn store(&self) -> &Arc<KeyValueStore> {
        &self.store
    }

    pub fn receiver_stats(&self) -> Arc<ReceiverStats> {
        self.receiver.stats()
    }

    /// Resolves once a stop was requested, locally or by a SHUTDOWN command.
    pub async fn stopped(&self) {
        let mut stop = self.stop.subscribe();
        let _ = stop.wait_for(|stopped| *stopped).await;
    }

    /// Stop every task and wait for them to exit.
    ///
    /// Takes up to the receive poll timeout, since the receive loop only
    /// observes the stop flag between receives.
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        self.receiver.stop().await;
        self.checkup.abort();
        self.sweeper.abort();
        self.gossip.abort();
        if let Err(e) = self.dispatcher.await {
            error!("Dispatcher task failed: {}", e);
        }
        info!(addr = %self.local_addr, "Server stopped");
    }

    /// Run until stopped, then shut down.
    pub async fn wait(self) {
        self.stopped().await;
        self.shutdown().await;
    }
}
