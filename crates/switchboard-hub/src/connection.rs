//! Per-client connection state and outbound queue discipline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchboard_core::{Broadcast, ConnectionId, ResponseEnvelope, SessionId, UserId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// A message waiting in a connection's outbound queue.
#[derive(Clone, Debug)]
pub enum Outbound {
    /// A broadcast event. Shared between every recipient.
    Event(Arc<Broadcast>),
    /// A reply to a request issued on this connection.
    Response(ResponseEnvelope),
}

impl Outbound {
    /// Serialize for the wire.
    ///
    /// `next_event_seq` is the connection's event counter; it is stamped on
    /// events and advanced, responses leave it untouched.
    pub fn encode(&self, next_event_seq: &mut i64) -> serde_json::Result<String> {
        match self {
            Self::Event(broadcast) => {
                let frame = broadcast.encode_frame(*next_event_seq)?;
                *next_event_seq += 1;
                Ok(frame)
            }
            Self::Response(response) => serde_json::to_string(response),
        }
    }
}

/// Why a connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the transport.
    TransportClosed,
    /// A read or write on the transport failed.
    TransportError,
    /// The outbound queue stayed full past the slow-consumer policy.
    SlowConsumer,
    /// No pong within the heartbeat timeout.
    HeartbeatTimeout,
    /// The bound session was revoked.
    SessionRevoked,
    /// The server is shutting down.
    ServerShutdown,
}

impl CloseReason {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportClosed => "transport_closed",
            Self::TransportError => "transport_error",
            Self::SlowConsumer => "slow_consumer",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SessionRevoked => "session_revoked",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

/// When a connection that keeps refusing messages gets evicted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlowConsumerPolicy {
    /// Consecutive full-queue pushes that trigger eviction.
    pub max_consecutive_full: u32,
    /// Longest a full streak may last before eviction.
    pub max_backlog_age: Duration,
}

impl Default for SlowConsumerPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_full: 3,
            max_backlog_age: Duration::from_secs(30),
        }
    }
}

/// Result of a non-blocking push onto the outbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued.
    Queued,
    /// Queue full; the message was dropped for this connection.
    Dropped,
    /// Queue full and the slow-consumer policy is exceeded.
    Evict,
    /// The writer is gone.
    Closed,
}

/// Identity a connection is created with, taken from the authenticated
/// session at accept time.
#[derive(Clone, Debug)]
pub struct ConnIdentity {
    /// Owning user.
    pub user_id: UserId,
    /// Session the connection authenticated with.
    pub session_id: SessionId,
    /// Token re-validated on every request.
    pub session_token: String,
    /// Client locale, e.g. `en`.
    pub locale: String,
}

/// One live client connection.
///
/// Created by the transport, owned by its shard once registered. The shard
/// loop is the only producer on `tx`; the transport writer is the only
/// consumer.
#[derive(Debug)]
pub struct WebConn {
    /// Unique connection id.
    pub id: ConnectionId,
    /// Owning user.
    pub user_id: UserId,
    /// Session the connection authenticated with.
    pub session_id: SessionId,
    session_token: String,
    /// Client locale.
    pub locale: String,
    tx: mpsc::Sender<Outbound>,
    /// When the transport was accepted.
    pub connected_at: Instant,
    active: AtomicBool,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    consecutive_full: AtomicU32,
    slow_since: Mutex<Option<Instant>>,
    dropped_messages: AtomicU64,
    close_token: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

impl WebConn {
    /// Create a connection with an outbound queue of `capacity` messages.
    pub fn new(identity: ConnIdentity, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Instant::now();
        let conn = Self {
            id: ConnectionId::new(),
            user_id: identity.user_id,
            session_id: identity.session_id,
            session_token: identity.session_token,
            locale: identity.locale,
            tx,
            connected_at: now,
            active: AtomicBool::new(true),
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            consecutive_full: AtomicU32::new(0),
            slow_since: Mutex::new(None),
            dropped_messages: AtomicU64::new(0),
            close_token: CancellationToken::new(),
            close_reason: Mutex::new(None),
        };
        (Arc::new(conn), rx)
    }

    /// Token presented on every request.
    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// Push without blocking, applying the slow-consumer policy.
    ///
    /// Drop-new: when the queue is full the offered message is discarded.
    /// A successful push ends the slow streak.
    pub fn try_push(&self, msg: Outbound, policy: &SlowConsumerPolicy) -> PushOutcome {
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.consecutive_full.store(0, Ordering::Relaxed);
                *self.slow_since.lock() = None;
                PushOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                let streak = self.consecutive_full.fetch_add(1, Ordering::Relaxed) + 1;
                let started = *self.slow_since.lock().get_or_insert_with(Instant::now);
                if streak >= policy.max_consecutive_full
                    || started.elapsed() >= policy.max_backlog_age
                {
                    PushOutcome::Evict
                } else {
                    PushOutcome::Dropped
                }
            }
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Messages dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Whether the last push found the queue full.
    pub fn is_slow(&self) -> bool {
        self.consecutive_full.load(Ordering::Relaxed) > 0
    }

    /// Whether the connection is still registered with its shard.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Close the connection. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.close_token.cancel();
    }

    /// Reason passed to the first [`close`](Self::close) call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// Token cancelled when the connection closes.
    pub fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    /// Mark the connection as alive (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last pong (or since accept).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
pub(crate) fn test_identity(user: &str) -> ConnIdentity {
    ConnIdentity {
        user_id: user.into(),
        session_id: SessionId::from(format!("sess-{user}")),
        session_token: format!("token-{user}"),
        locale: "en".into(),
    }
}
