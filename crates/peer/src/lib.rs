//! Peer delivery: wire codec, per-sender sequencing, reordering and
//! deduplication, plus an outbox that retries with backoff.

mod dedup;
mod outbox;
mod sequencer;
mod wire;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dedup::DedupSet;
pub use outbox::Outbox;
pub use sequencer::{Delivery, DeliveryOrder, OutboundSequencer, PeerSequencer, Received};
pub use wire::{epoch_seconds, WireMessage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("malformed peer message: {0}")]
    Malformed(String),

    #[error("peer uses the superseded turnId message shape")]
    Superseded,

    #[error("failed to encode peer message: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// How long a gap in a sender's sequence is waited out before
    /// buffered messages are released by timestamp.
    pub reorder_window_ms: u64,
    pub dedup_capacity: usize,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            reorder_window_ms: 500,
            dedup_capacity: 64,
        }
    }
}

impl PeerSettings {
    pub fn reorder_window(&self) -> Duration {
        Duration::from_millis(self.reorder_window_ms)
    }
}
