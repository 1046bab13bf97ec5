//! Broadcast forwarding to peer nodes.
//!
//! The hub hands broadcasts that may have recipients elsewhere to a
//! [`ClusterForwarder`]. The forwarder owns a bounded queue and a background
//! task that sends each message to every peer through a [`ClusterTransport`].
//! Peer failures are logged and counted, never reported back to the hub.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use switchboard_core::Broadcast;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::{
    CLUSTER_FORWARD_ERRORS_TOTAL, CLUSTER_FORWARDS_DROPPED_TOTAL, CLUSTER_FORWARDS_TOTAL,
};

/// Failure sending a broadcast to one peer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The peer could not be reached.
    #[error("peer {peer} unreachable: {message}")]
    Unreachable {
        /// Peer address.
        peer: String,
        /// Transport error text.
        message: String,
    },
    /// The peer answered with a non-success status.
    #[error("peer {peer} rejected broadcast with status {status}")]
    Rejected {
        /// Peer address.
        peer: String,
        /// HTTP status code.
        status: u16,
    },
    /// The broadcast could not be serialized.
    #[error("failed to encode broadcast: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How broadcasts reach peer nodes.
#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    /// Current peer addresses.
    fn peers(&self) -> Vec<String>;

    /// Deliver one broadcast to one peer.
    async fn send_to_peer(&self, peer: &str, msg: &Broadcast) -> Result<(), ClusterError>;
}

/// Handle to the background forwarding task.
#[derive(Clone, Debug)]
pub struct ClusterForwarder {
    tx: mpsc::Sender<Arc<Broadcast>>,
    cancel: CancellationToken,
}

impl ClusterForwarder {
    /// Spawn the forwarding task with a queue of `capacity` messages.
    pub fn spawn(transport: Arc<dyn ClusterTransport>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_forwarder(transport, rx, cancel.clone()));
        (Self { tx, cancel }, handle)
    }

    /// Queue a broadcast for peers without waiting.
    ///
    /// Returns `false` when the queue is full or the task has stopped; the
    /// message is dropped in that case.
    pub fn forward(&self, msg: Arc<Broadcast>) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!(event = %msg.payload.event, "cluster forward queue full, dropping broadcast");
                counter!(CLUSTER_FORWARDS_DROPPED_TOTAL).increment(1);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop the forwarding task. Queued messages are discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn run_forwarder(
    transport: Arc<dyn ClusterTransport>,
    mut rx: mpsc::Receiver<Arc<Broadcast>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let _ = forward_to_peers(transport.as_ref(), &msg).await;
            }
        }
    }
    debug!("cluster forwarder stopped");
}

/// Send one broadcast to every peer concurrently. Returns the failure count.
pub async fn forward_to_peers(transport: &dyn ClusterTransport, msg: &Broadcast) -> usize {
    let peers = transport.peers();
    if peers.is_empty() {
        return 0;
    }
    let results = join_all(peers.iter().map(|peer| transport.send_to_peer(peer, msg))).await;

    let mut failures = 0;
    for (peer, result) in peers.iter().zip(results) {
        match result {
            Ok(()) => counter!(CLUSTER_FORWARDS_TOTAL).increment(1),
            Err(e) => {
                failures += 1;
                warn!(peer = %peer, error = %e, event = %msg.payload.event, "cluster forward failed");
                counter!(CLUSTER_FORWARD_ERRORS_TOTAL, "peer" => peer.clone()).increment(1);
            }
        }
    }
    failures
}
