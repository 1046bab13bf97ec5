//! In-process cluster transport.
//!
//! Several hubs in one process form a cluster through a shared
//! [`MemoryCluster`]. Useful for tests and single-binary development setups;
//! it delivers through the same [`Hub::accept_forwarded`] path the HTTP
//! endpoint uses.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use switchboard_core::Broadcast;

use crate::cluster::{ClusterError, ClusterTransport};
use crate::hub::Hub;

/// Registry of in-process nodes, keyed by node id.
#[derive(Default)]
pub struct MemoryCluster {
    nodes: RwLock<BTreeMap<String, Weak<Hub>>>,
}

impl MemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a node known before its hub exists. Sends to it fail until it
    /// joins.
    pub fn reserve(&self, node_id: impl Into<String>) {
        let _ = self.nodes.write().entry(node_id.into()).or_default();
    }

    /// Attach a running hub under its node id.
    pub fn join(&self, hub: &Arc<Hub>) {
        let _ = self
            .nodes
            .write()
            .insert(hub.node_id().to_string(), Arc::downgrade(hub));
    }

    /// Detach a node. It stays listed as a peer but is unreachable.
    pub fn leave(&self, node_id: &str) {
        if let Some(slot) = self.nodes.write().get_mut(node_id) {
            *slot = Weak::new();
        }
    }

    /// Transport for the node `local`, whose peers are every other node.
    pub fn transport(self: &Arc<Self>, local: impl Into<String>) -> Arc<MemoryTransport> {
        let local = local.into();
        self.reserve(local.clone());
        Arc::new(MemoryTransport {
            cluster: Arc::clone(self),
            local,
        })
    }

    fn hub(&self, node_id: &str) -> Option<Arc<Hub>> {
        self.nodes.read().get(node_id).and_then(Weak::upgrade)
    }
}

/// One node's view of a [`MemoryCluster`].
pub struct MemoryTransport {
    cluster: Arc<MemoryCluster>,
    local: String,
}

#[async_trait]
impl ClusterTransport for MemoryTransport {
    fn peers(&self) -> Vec<String> {
        self.cluster
            .nodes
            .read()
            .keys()
            .filter(|id| **id != self.local)
            .cloned()
            .collect()
    }

    async fn send_to_peer(&self, peer: &str, msg: &Broadcast) -> Result<(), ClusterError> {
        let hub = self.cluster.hub(peer).ok_or_else(|| ClusterError::Unreachable {
            peer: peer.to_string(),
            message: "node has not joined".into(),
        })?;
        let _ = hub.accept_forwarded(msg.clone()).await;
        Ok(())
    }
}
