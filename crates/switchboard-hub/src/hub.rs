//! Top-level connection registry.
//!
//! The hub owns a fixed table of shard inboxes built at startup. A user's
//! connections always live on the same shard, picked by hashing the user id,
//! so one lookup finds all of them. The hub keeps no per-connection state of
//! its own.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use switchboard_core::{Broadcast, ResponseEnvelope, SessionId, UserId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cluster::ClusterForwarder;
use crate::connection::{ConnIdentity, Outbound, SlowConsumerPolicy, WebConn};
use crate::metrics::{CLUSTER_RECEIVED_TOTAL, HUB_BROADCASTS_TOTAL};
use crate::shard::{Shard, ShardCommand};

/// Hub tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Number of shards. `0` means twice the available parallelism.
    pub shard_count: usize,
    /// Capacity of each shard inbox.
    pub shard_inbox_capacity: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,
    /// Eviction policy for connections that stop draining.
    pub slow_consumer: SlowConsumerPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shard_count: 0,
            shard_inbox_capacity: 4096,
            outbound_queue_capacity: 256,
            slow_consumer: SlowConsumerPolicy::default(),
        }
    }
}

impl HubConfig {
    /// Shard count with `0` resolved against the machine.
    pub fn resolved_shard_count(&self) -> usize {
        if self.shard_count > 0 {
            return self.shard_count;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get) * 2
    }
}

/// Hub operation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The hub has been shut down.
    #[error("hub is stopped")]
    Stopped,
}

/// Sharded registry of live connections.
pub struct Hub {
    node_id: String,
    shards: Vec<mpsc::Sender<ShardCommand>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    forwarder: Option<ClusterForwarder>,
    config: HubConfig,
    stopped: AtomicBool,
}

impl Hub {
    /// Spawn the shard loops and return the hub.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: HubConfig,
        node_id: impl Into<String>,
        forwarder: Option<ClusterForwarder>,
    ) -> Arc<Self> {
        let count = config.resolved_shard_count();
        let mut shards = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, handle) =
                Shard::spawn(index, config.shard_inbox_capacity, config.slow_consumer.clone());
            shards.push(tx);
            handles.push(handle);
        }
        let node_id = node_id.into();
        info!(node_id = %node_id, shards = count, clustered = forwarder.is_some(), "hub started");
        Arc::new(Self {
            node_id,
            shards,
            handles: Mutex::new(handles),
            forwarder,
            config,
            stopped: AtomicBool::new(false),
        })
    }

    /// This node's id, stamped on outgoing broadcasts.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Tuning the hub was started with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Shard that owns every connection of `user_id`.
    pub fn shard_index(&self, user_id: &UserId) -> usize {
        let mut hasher = DefaultHasher::new();
        user_id.as_str().hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let hash = hasher.finish() as usize;
        hash % self.shards.len()
    }

    fn shard_for(&self, user_id: &UserId) -> &mpsc::Sender<ShardCommand> {
        &self.shards[self.shard_index(user_id)]
    }

    /// Create a connection sized with this hub's outbound queue capacity.
    pub fn new_connection(&self, identity: ConnIdentity) -> (Arc<WebConn>, mpsc::Receiver<Outbound>) {
        WebConn::new(identity, self.config.outbound_queue_capacity)
    }

    /// Hand a connection to its shard. Returns the shard index.
    ///
    /// Does not wait for the shard to process it: the inbox is FIFO, so any
    /// later command from the same caller sees the connection.
    pub async fn register(&self, conn: Arc<WebConn>) -> Result<usize, HubError> {
        if self.is_stopped() {
            return Err(HubError::Stopped);
        }
        let index = self.shard_index(&conn.user_id);
        self.shards[index]
            .send(ShardCommand::Register { conn })
            .await
            .map_err(|_| HubError::Stopped)?;
        Ok(index)
    }

    /// Remove a connection. Idempotent; returns whether this call removed it.
    ///
    /// When this returns, no broadcast submitted afterwards reaches the
    /// connection.
    pub async fn unregister(&self, conn: &WebConn) -> bool {
        let (done, rx) = oneshot::channel();
        let cmd = ShardCommand::Unregister {
            user_id: conn.user_id.clone(),
            conn_id: conn.id.clone(),
            done,
        };
        if self.shard_for(&conn.user_id).send(cmd).await.is_err() {
            conn.mark_inactive();
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Live connections of one user.
    pub async fn connections_for_user(&self, user_id: &UserId) -> Vec<Arc<WebConn>> {
        let (reply, rx) = oneshot::channel();
        let cmd = ShardCommand::ConnectionsForUser {
            user_id: user_id.clone(),
            reply,
        };
        if self.shard_for(user_id).send(cmd).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Submit a broadcast.
    ///
    /// Waits only for shard inbox capacity, never for recipients. User and
    /// connection targets go to the owning shard; everything else goes to
    /// all shards. Broadcasts that may have remote recipients and did not
    /// come from a peer are also handed to the cluster forwarder.
    pub async fn broadcast(&self, mut msg: Broadcast) {
        if msg.origin_node.is_none() {
            msg.origin_node = Some(self.node_id.clone());
        }
        counter!(HUB_BROADCASTS_TOTAL, "target" => msg.target.kind()).increment(1);
        let msg = Arc::new(msg);

        if !msg.forwarded && msg.target.may_be_remote() {
            if let Some(forwarder) = &self.forwarder {
                let _ = forwarder.forward(Arc::clone(&msg));
            }
        }

        if self.is_stopped() {
            debug!(event = %msg.payload.event, "hub stopped, broadcast dropped");
            return;
        }

        match msg.target.owner() {
            Some(user_id) => {
                let cmd = ShardCommand::Broadcast(Arc::clone(&msg));
                if self.shard_for(user_id).send(cmd).await.is_err() {
                    debug!(event = %msg.payload.event, "shard stopped, broadcast dropped");
                }
            }
            None => {
                for shard in &self.shards {
                    if shard.send(ShardCommand::Broadcast(Arc::clone(&msg))).await.is_err() {
                        debug!(event = %msg.payload.event, "shard stopped, broadcast dropped");
                    }
                }
            }
        }
    }

    /// Accept a broadcast forwarded by a peer.
    ///
    /// Messages that originated here are dropped. Accepted messages are
    /// marked forwarded so they are delivered locally and never sent on.
    pub async fn accept_forwarded(&self, mut msg: Broadcast) -> bool {
        if msg.origin_node.as_deref() == Some(self.node_id.as_str()) {
            debug!(event = %msg.payload.event, "ignoring broadcast that originated here");
            return false;
        }
        msg.forwarded = true;
        counter!(CLUSTER_RECEIVED_TOTAL).increment(1);
        self.broadcast(msg).await;
        true
    }

    /// Queue a response for exactly one connection, through its shard.
    pub async fn send(&self, conn: &WebConn, response: ResponseEnvelope) {
        let cmd = ShardCommand::Send {
            user_id: conn.user_id.clone(),
            conn_id: conn.id.clone(),
            response,
        };
        if self.shard_for(&conn.user_id).send(cmd).await.is_err() {
            debug!(conn_id = %conn.id, "shard stopped, response dropped");
        }
    }

    /// Close and unregister every connection of `user_id` bound to
    /// `session_id`. Returns how many were closed.
    pub async fn evict_session(&self, user_id: &UserId, session_id: &SessionId) -> usize {
        let (reply, rx) = oneshot::channel();
        let cmd = ShardCommand::EvictSession {
            user_id: user_id.clone(),
            session_id: session_id.clone(),
            reply,
        };
        if self.shard_for(user_id).send(cmd).await.is_err() {
            return 0;
        }
        let closed = rx.await.unwrap_or(0);
        if closed > 0 {
            info!(%user_id, %session_id, closed, "evicted session connections");
        }
        closed
    }

    /// Live connections across all shards.
    pub async fn connection_count(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            let (reply, rx) = oneshot::channel();
            if shard.send(ShardCommand::Count { reply }).await.is_ok() {
                total += rx.await.unwrap_or(0);
            }
        }
        total
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop every shard, closing remaining connections with
    /// `ServerShutdown`, and stop the forwarder.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(forwarder) = &self.forwarder {
            forwarder.shutdown();
        }
        for shard in &self.shards {
            let _ = shard.send(ShardCommand::Stop).await;
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                debug!("shard loop did not stop in time");
            }
        }
        info!(node_id = %self.node_id, "hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_identity;
    use assert_matches::assert_matches;
    use switchboard_core::{BroadcastTarget, WebSocketEvent};

    fn config(shards: usize) -> HubConfig {
        HubConfig {
            shard_count: shards,
            ..HubConfig::default()
        }
    }

    #[test]
    fn zero_shard_count_resolves() {
        assert!(HubConfig::default().resolved_shard_count() >= 2);
        assert_eq!(config(3).resolved_shard_count(), 3);
    }

    #[tokio::test]
    async fn shard_index_is_stable() {
        let hub = Hub::start(config(8), "node-a", None);
        let user = UserId::from("stable-user");
        let first = hub.shard_index(&user);
        for _ in 0..10 {
            assert_eq!(hub.shard_index(&user), first);
        }
        assert!(first < 8);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn register_returns_owning_shard() {
        let hub = Hub::start(config(4), "node-a", None);
        let (conn, _rx) = hub.new_connection(test_identity("u1"));
        let index = hub.register(conn.clone()).await.unwrap();
        assert_eq!(index, hub.shard_index(&conn.user_id));
        assert_eq!(hub.connection_count().await, 1);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = Hub::start(config(2), "node-a", None);
        let (conn, _rx) = hub.new_connection(test_identity("u1"));
        let _ = hub.register(conn.clone()).await.unwrap();
        assert!(hub.unregister(&conn).await);
        assert!(!hub.unregister(&conn).await);
        assert!(!conn.is_active());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_stamps_origin() {
        let hub = Hub::start(config(2), "node-a", None);
        let (conn, mut rx) = hub.new_connection(test_identity("u1"));
        let _ = hub.register(conn).await.unwrap();
        hub.broadcast(Broadcast::new(
            WebSocketEvent::new("ping"),
            BroadcastTarget::User { user_id: "u1".into() },
        ))
        .await;
        assert_matches!(rx.recv().await, Some(Outbound::Event(b)) if b.origin_node.as_deref() == Some("node-a"));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn accept_forwarded_ignores_own_origin() {
        let hub = Hub::start(config(2), "node-a", None);
        let mut msg = Broadcast::new(WebSocketEvent::new("posted"), BroadcastTarget::All);
        msg.origin_node = Some("node-a".into());
        assert!(!hub.accept_forwarded(msg.clone()).await);
        msg.origin_node = Some("node-b".into());
        assert!(hub.accept_forwarded(msg).await);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn register_after_shutdown_fails() {
        let hub = Hub::start(config(2), "node-a", None);
        let (conn, _rx) = hub.new_connection(test_identity("u1"));
        let _ = hub.register(conn.clone()).await.unwrap();
        hub.shutdown().await;
        assert!(conn.is_closed());
        let (late, _rx2) = hub.new_connection(test_identity("u2"));
        assert_eq!(hub.register(late).await, Err(HubError::Stopped));
        assert_eq!(hub.connection_count().await, 0);
        assert!(!hub.unregister(&conn).await);
    }
}
