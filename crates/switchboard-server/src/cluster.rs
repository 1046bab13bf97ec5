//! HTTP transport for forwarding broadcasts between nodes.

use std::time::Duration;

use async_trait::async_trait;
use switchboard_core::Broadcast;
use switchboard_hub::{ClusterError, ClusterTransport};
use tracing::debug;

/// Header carrying the shared cluster secret.
pub const CLUSTER_SECRET_HEADER: &str = "x-switchboard-cluster-secret";

/// Path peers accept forwarded broadcasts on.
pub const CLUSTER_BROADCAST_PATH: &str = "/cluster/broadcast";

/// Sends broadcasts to peers as `POST {peer}/cluster/broadcast`.
#[derive(Clone, Debug)]
pub struct HttpClusterTransport {
    client: reqwest::Client,
    peers: Vec<String>,
    secret: Option<String>,
}

impl HttpClusterTransport {
    /// Build a transport with a per-request `timeout`.
    pub fn new(
        peers: Vec<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            peers: peers
                .into_iter()
                .map(|p| p.trim_end_matches('/').to_owned())
                .filter(|p| !p.is_empty())
                .collect(),
            secret,
        })
    }

    /// Endpoint for one peer.
    pub fn endpoint(peer: &str) -> String {
        format!("{}{CLUSTER_BROADCAST_PATH}", peer.trim_end_matches('/'))
    }
}

/// Compare a presented secret without leaking where it differs.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[async_trait]
impl ClusterTransport for HttpClusterTransport {
    fn peers(&self) -> Vec<String> {
        self.peers.clone()
    }

    async fn send_to_peer(&self, peer: &str, msg: &Broadcast) -> Result<(), ClusterError> {
        let body = serde_json::to_vec(msg)?;
        let mut request = self
            .client
            .post(Self::endpoint(peer))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(secret) = &self.secret {
            request = request.header(CLUSTER_SECRET_HEADER, secret);
        }

        let response = request.send().await.map_err(|e| ClusterError::Unreachable {
            peer: peer.to_owned(),
            message: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClusterError::Rejected {
                peer: peer.to_owned(),
                status: status.as_u16(),
            });
        }
        debug!(peer, event = %msg.payload.event, "forwarded broadcast");
        Ok(())
    }
}
