//! A partition of connections owned by one sequential task.
//!
//! Every membership change and every outbound push for the shard's
//! connections happens inside [`Shard::run`], so commands submitted in order
//! take effect in order and no per-connection locking is needed.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use switchboard_core::{Broadcast, BroadcastTarget, ConnectionId, ResponseEnvelope, SessionId, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{CloseReason, Outbound, PushOutcome, SlowConsumerPolicy, WebConn};
use crate::metrics::{
    HUB_CONNECTIONS_REGISTERED, HUB_DELIVERIES_DROPPED_TOTAL, HUB_SLOW_CONSUMER_EVICTIONS_TOTAL,
};

/// Work submitted to a shard.
#[derive(Debug)]
pub enum ShardCommand {
    /// Add a connection.
    Register {
        /// The connection.
        conn: Arc<WebConn>,
    },
    /// Remove a connection. Replies whether it was present.
    Unregister {
        /// Owner.
        user_id: UserId,
        /// Connection to remove.
        conn_id: ConnectionId,
        /// Completion signal.
        done: oneshot::Sender<bool>,
    },
    /// Fan a broadcast out to matching connections.
    Broadcast(Arc<Broadcast>),
    /// Push a response to one connection.
    Send {
        /// Owner.
        user_id: UserId,
        /// Recipient.
        conn_id: ConnectionId,
        /// The response.
        response: ResponseEnvelope,
    },
    /// Live connections of one user.
    ConnectionsForUser {
        /// The user.
        user_id: UserId,
        /// Reply channel.
        reply: oneshot::Sender<Vec<Arc<WebConn>>>,
    },
    /// Close and remove a user's connections bound to one session.
    EvictSession {
        /// The user.
        user_id: UserId,
        /// The revoked session.
        session_id: SessionId,
        /// Number of connections closed.
        reply: oneshot::Sender<usize>,
    },
    /// Number of live connections.
    Count {
        /// Reply channel.
        reply: oneshot::Sender<usize>,
    },
    /// Close every connection and exit the loop.
    Stop,
}

/// Single-task owner of a connection partition.
pub struct Shard {
    index: usize,
    users: HashMap<UserId, HashMap<ConnectionId, Arc<WebConn>>>,
    policy: SlowConsumerPolicy,
}

impl Shard {
    /// Create an empty shard.
    pub fn new(index: usize, policy: SlowConsumerPolicy) -> Self {
        Self {
            index,
            users: HashMap::new(),
            policy,
        }
    }

    /// Spawn the shard loop with an inbox of `capacity` commands.
    pub fn spawn(
        index: usize,
        capacity: usize,
        policy: SlowConsumerPolicy,
    ) -> (mpsc::Sender<ShardCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shard = Self::new(index, policy);
        let handle = tokio::spawn(shard.run(rx));
        (tx, handle)
    }

    /// Process commands until `Stop` or until every sender is dropped.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<ShardCommand>) {
        debug!(shard = self.index, "shard loop started");
        while let Some(cmd) = inbox.recv().await {
            if !self.handle(cmd) {
                break;
            }
        }
        // registers queued behind Stop were already acknowledged
        inbox.close();
        while let Ok(cmd) = inbox.try_recv() {
            if let ShardCommand::Register { conn } = cmd {
                self.register(conn);
            }
        }
        self.close_all(CloseReason::ServerShutdown);
        debug!(shard = self.index, "shard loop stopped");
    }

    /// Apply one command. Returns `false` when the loop should stop.
    pub fn handle(&mut self, cmd: ShardCommand) -> bool {
        match cmd {
            ShardCommand::Register { conn } => self.register(conn),
            ShardCommand::Unregister {
                user_id,
                conn_id,
                done,
            } => {
                let _ = done.send(self.unregister(&user_id, &conn_id).is_some());
            }
            ShardCommand::Broadcast(msg) => self.deliver(&msg),
            ShardCommand::Send {
                user_id,
                conn_id,
                response,
            } => self.send(&user_id, &conn_id, response),
            ShardCommand::ConnectionsForUser { user_id, reply } => {
                let _ = reply.send(self.connections_for_user(&user_id));
            }
            ShardCommand::EvictSession {
                user_id,
                session_id,
                reply,
            } => {
                let _ = reply.send(self.evict_session(&user_id, &session_id));
            }
            ShardCommand::Count { reply } => {
                let _ = reply.send(self.count());
            }
            ShardCommand::Stop => return false,
        }
        true
    }

    fn register(&mut self, conn: Arc<WebConn>) {
        debug!(shard = self.index, conn_id = %conn.id, user_id = %conn.user_id, "register");
        let previous = self
            .users
            .entry(conn.user_id.clone())
            .or_default()
            .insert(conn.id.clone(), conn);
        if previous.is_none() {
            gauge!(HUB_CONNECTIONS_REGISTERED).increment(1.0);
        }
    }

    fn unregister(&mut self, user_id: &UserId, conn_id: &ConnectionId) -> Option<Arc<WebConn>> {
        let conns = self.users.get_mut(user_id)?;
        let removed = conns.remove(conn_id)?;
        if conns.is_empty() {
            let _ = self.users.remove(user_id);
        }
        removed.mark_inactive();
        gauge!(HUB_CONNECTIONS_REGISTERED).decrement(1.0);
        debug!(shard = self.index, %conn_id, %user_id, "unregister");
        Some(removed)
    }

    /// Enqueue a broadcast on every matching connection.
    pub fn deliver(&mut self, msg: &Arc<Broadcast>) {
        let mut evicted: Vec<(UserId, ConnectionId)> = Vec::new();
        let mut delivered = 0usize;
        let mut dropped = 0u64;

        let mut offer = |conn: &Arc<WebConn>| {
            if msg.excludes(&conn.user_id, &conn.id) {
                return;
            }
            match conn.try_push(Outbound::Event(Arc::clone(msg)), &self.policy) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::Dropped => dropped += 1,
                PushOutcome::Evict => {
                    dropped += 1;
                    evicted.push((conn.user_id.clone(), conn.id.clone()));
                }
                PushOutcome::Closed => {}
            }
        };

        match &msg.target {
            BroadcastTarget::User { user_id } => {
                if let Some(conns) = self.users.get(user_id) {
                    conns.values().for_each(&mut offer);
                }
            }
            BroadcastTarget::Connection {
                user_id,
                connection_id,
            } => {
                if let Some(conn) = self.users.get(user_id).and_then(|c| c.get(connection_id)) {
                    offer(conn);
                }
            }
            BroadcastTarget::Channel { .. } | BroadcastTarget::Team { .. } | BroadcastTarget::All => {
                self.users
                    .values()
                    .flat_map(HashMap::values)
                    .for_each(&mut offer);
            }
        }

        if dropped > 0 {
            counter!(HUB_DELIVERIES_DROPPED_TOTAL).increment(dropped);
        }
        debug!(
            shard = self.index,
            event = %msg.payload.event,
            target = msg.target.kind(),
            delivered,
            dropped,
            "broadcast delivered"
        );
        self.evict_slow(evicted);
    }

    fn send(&mut self, user_id: &UserId, conn_id: &ConnectionId, response: ResponseEnvelope) {
        let Some(conn) = self.users.get(user_id).and_then(|c| c.get(conn_id)) else {
            debug!(shard = self.index, %conn_id, seq = response.seq, "response for unknown connection dropped");
            return;
        };
        match conn.try_push(Outbound::Response(response), &self.policy) {
            PushOutcome::Queued | PushOutcome::Closed => {}
            PushOutcome::Dropped => counter!(HUB_DELIVERIES_DROPPED_TOTAL).increment(1),
            PushOutcome::Evict => {
                counter!(HUB_DELIVERIES_DROPPED_TOTAL).increment(1);
                let key = (conn.user_id.clone(), conn.id.clone());
                self.evict_slow(vec![key]);
            }
        }
    }

    fn evict_slow(&mut self, evicted: Vec<(UserId, ConnectionId)>) {
        for (user_id, conn_id) in evicted {
            if let Some(conn) = self.unregister(&user_id, &conn_id) {
                warn!(
                    shard = self.index,
                    %conn_id,
                    %user_id,
                    dropped = conn.drop_count(),
                    "evicting slow consumer"
                );
                counter!(HUB_SLOW_CONSUMER_EVICTIONS_TOTAL).increment(1);
                conn.close(CloseReason::SlowConsumer);
            }
        }
    }

    /// Live connections of one user.
    pub fn connections_for_user(&self, user_id: &UserId) -> Vec<Arc<WebConn>> {
        self.users
            .get(user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Close and remove the user's connections bound to `session_id`.
    pub fn evict_session(&mut self, user_id: &UserId, session_id: &SessionId) -> usize {
        let matching: Vec<ConnectionId> = self
            .users
            .get(user_id)
            .map(|conns| {
                conns
                    .values()
                    .filter(|c| &c.session_id == session_id)
                    .map(|c| c.id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut closed = 0;
        for conn_id in matching {
            if let Some(conn) = self.unregister(user_id, &conn_id) {
                conn.close(CloseReason::SessionRevoked);
                closed += 1;
            }
        }
        closed
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.users.values().map(HashMap::len).sum()
    }

    fn close_all(&mut self, reason: CloseReason) {
        let total = self.count();
        for (_, conns) in self.users.drain() {
            for conn in conns.into_values() {
                conn.mark_inactive();
                conn.close(reason);
            }
        }
        if total > 0 {
            #[allow(clippy::cast_precision_loss)]
            gauge!(HUB_CONNECTIONS_REGISTERED).decrement(total as f64);
        }
    }
}
