use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque identifier of a remote peer session, assigned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notifications from the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Message { from: PeerId, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("no reachable peers")]
    NoPeers,
    #[error("send failed: {0}")]
    Send(String),
    #[error("peer {0} disconnected")]
    Disconnected(PeerId),
}

/// Local peer-to-peer link. Connection setup and discovery live behind it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Broadcast an encoded message to every connected peer.
    async fn send(&self, payload: &[u8], reliable: bool) -> Result<(), TransportError>;

    /// Currently reachable peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Ask the discovery layer to look for peers again.
    async fn rediscover(&self);
}
