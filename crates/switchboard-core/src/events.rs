//! Server-pushed events and the routing wrapper the hub fans out.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ChannelId, ConnectionId, TeamId, UserId};

/// Well-known event names.
pub mod names {
    /// First event on every connection.
    pub const HELLO: &str = "hello";
    /// A user is typing in a channel.
    pub const TYPING: &str = "typing";
    /// A post was created.
    pub const POSTED: &str = "posted";
    /// A channel was updated.
    pub const CHANNEL_UPDATED: &str = "channel_updated";
}

/// An application event pushed to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebSocketEvent {
    /// Event name (e.g. `posted`).
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl WebSocketEvent {
    /// Create an event with empty data.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: Map::new(),
        }
    }

    /// Add a data field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.data.insert(key.into(), value.into());
        self
    }
}

/// Which connections a broadcast is aimed at.
///
/// Channel and team membership is never resolved by the hub: those targets
/// reach every connection and clients filter on the ids carried in the
/// frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastTarget {
    /// Every connection of one user.
    User {
        /// Recipient user.
        user_id: UserId,
    },
    /// Exactly one connection. Never leaves the local node.
    Connection {
        /// Owner of the connection (selects the shard).
        user_id: UserId,
        /// Recipient connection.
        connection_id: ConnectionId,
    },
    /// Members of a channel.
    Channel {
        /// Target channel.
        channel_id: ChannelId,
    },
    /// Members of a team.
    Team {
        /// Target team.
        team_id: TeamId,
    },
    /// Every active connection.
    All,
}

impl BroadcastTarget {
    /// The user whose shard owns every recipient, when there is one.
    pub fn owner(&self) -> Option<&UserId> {
        match self {
            Self::User { user_id } | Self::Connection { user_id, .. } => Some(user_id),
            Self::Channel { .. } | Self::Team { .. } | Self::All => None,
        }
    }

    /// Whether recipients may live on a peer node.
    pub fn may_be_remote(&self) -> bool {
        !matches!(self, Self::Connection { .. })
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Connection { .. } => "connection",
            Self::Channel { .. } => "channel",
            Self::Team { .. } => "team",
            Self::All => "all",
        }
    }
}

/// An event plus its routing metadata. Also the inter-node wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadcast {
    /// Recipient selector.
    pub target: BroadcastTarget,
    /// The event itself.
    pub payload: WebSocketEvent,
    /// Users excluded from delivery.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub omit_users: BTreeSet<UserId>,
    /// Connection excluded from delivery (usually the sender).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omit_connection: Option<ConnectionId>,
    /// Node that first emitted this broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_node: Option<String>,
    /// Set by the receiving node; a forwarded broadcast is never re-forwarded.
    #[serde(default)]
    pub forwarded: bool,
}

impl Broadcast {
    /// Wrap an event for the given target.
    pub fn new(payload: WebSocketEvent, target: BroadcastTarget) -> Self {
        Self {
            target,
            payload,
            omit_users: BTreeSet::new(),
            omit_connection: None,
            origin_node: None,
            forwarded: false,
        }
    }

    /// Exclude a user.
    #[must_use]
    pub fn omit_user(mut self, user_id: UserId) -> Self {
        let _ = self.omit_users.insert(user_id);
        self
    }

    /// Exclude one connection.
    #[must_use]
    pub fn omit_connection(mut self, connection_id: ConnectionId) -> Self {
        self.omit_connection = Some(connection_id);
        self
    }

    /// Whether the omit lists exclude this recipient.
    pub fn excludes(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        self.omit_users.contains(user_id) || self.omit_connection.as_ref() == Some(connection_id)
    }

    /// Serialize the client-facing frame with the connection's sequence number.
    pub fn encode_frame(&self, seq: i64) -> serde_json::Result<String> {
        serde_json::to_string(&EventFrame {
            event: &self.payload.event,
            data: &self.payload.data,
            broadcast: FrameBroadcast {
                target: &self.target,
                omit_users: &self.omit_users,
                omit_connection_id: self.omit_connection.as_ref(),
            },
            seq,
        })
    }
}

#[derive(Serialize)]
struct EventFrame<'a> {
    event: &'a str,
    data: &'a Map<String, Value>,
    broadcast: FrameBroadcast<'a>,
    seq: i64,
}

#[derive(Serialize)]
struct FrameBroadcast<'a> {
    #[serde(flatten)]
    target: &'a BroadcastTarget,
    #[serde(skip_serializing_if = "is_empty_set")]
    omit_users: &'a BTreeSet<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    omit_connection_id: Option<&'a ConnectionId>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_empty_set(set: &&BTreeSet<UserId>) -> bool {
    set.is_empty()
}
