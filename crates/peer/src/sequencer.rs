use std::collections::{BTreeMap, HashMap};

use parley_engine::PeerId;
use parley_lang::Language;
use tokio::time::Instant;

use crate::dedup::DedupSet;
use crate::wire::{epoch_seconds, WireMessage};
use crate::PeerSettings;

/// Assigns sequence numbers for one sending session.
#[derive(Debug, Default)]
pub struct OutboundSequencer {
    next_seq: u64,
}

impl OutboundSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session; the next message gets seq 0.
    pub fn reset(&mut self) {
        self.next_seq = 0;
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Stamp an outgoing message. Partial and final messages both consume
    /// a sequence number.
    pub fn message(
        &mut self,
        id: impl Into<String>,
        text: impl Into<String>,
        source_lang: Language,
        is_final: bool,
    ) -> WireMessage {
        let seq = self.next_seq;
        self.next_seq += 1;
        WireMessage {
            id: id.into(),
            seq,
            text: text.into(),
            source_lang,
            is_final,
            timestamp: epoch_seconds(),
        }
    }
}

/// How a message reached the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrder {
    /// In sequence.
    InOrder,
    /// The reorder window expired with a gap; buffered messages were
    /// released by timestamp.
    TimestampFallback,
    /// Arrived after its sequence slot was skipped.
    Late,
}

impl DeliveryOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InOrder => "in_order",
            Self::TimestampFallback => "timestamp_fallback",
            Self::Late => "late",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub from: PeerId,
    pub message: WireMessage,
    pub order: DeliveryOrder,
    /// The sequence number the receiver was waiting for.
    pub expected: u64,
}

#[derive(Debug, Default)]
struct PeerState {
    next_expected: u64,
    buffer: BTreeMap<u64, WireMessage>,
    deadline: Option<Instant>,
}

/// Result of one `receive` call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Received {
    pub deliveries: Vec<Delivery>,
    pub duplicate: bool,
}

/// Receive-side ordering for every remote session.
///
/// Per peer: deliver in sequence, buffer ahead-of-sequence arrivals for a
/// bounded window, and fall back to timestamp order when the window expires.
/// Ids of delivered messages are remembered in an LRU set so retransmissions
/// are dropped.
#[derive(Debug)]
pub struct PeerSequencer {
    settings: PeerSettings,
    peers: HashMap<PeerId, PeerState>,
    delivered: DedupSet,
}

impl PeerSequencer {
    pub fn new(settings: PeerSettings) -> Self {
        let delivered = DedupSet::new(settings.dedup_capacity);
        Self {
            settings,
            peers: HashMap::new(),
            delivered,
        }
    }

    /// A peer (re)connected: its next message starts a new session.
    pub fn connect(&mut self, peer: &PeerId) {
        self.peers.insert(peer.clone(), PeerState::default());
    }

    /// Drop all receive state for a peer. Returns the number of buffered
    /// messages discarded.
    pub fn disconnect(&mut self, peer: &PeerId) -> usize {
        self.peers.remove(peer).map_or(0, |state| state.buffer.len())
    }

    pub fn receive(&mut self, from: &PeerId, message: WireMessage, now: Instant) -> Received {
        if self.delivered.check(&message.id) {
            tracing::debug!(peer = %from, seq = message.seq, "duplicate message dropped");
            return Received {
                deliveries: Vec::new(),
                duplicate: true,
            };
        }

        let window = self.settings.reorder_window();
        let state = self.peers.entry(from.clone()).or_default();
        let expected = state.next_expected;
        let mut deliveries = Vec::new();

        if message.seq < expected {
            tracing::info!(
                peer = %from,
                seq = message.seq,
                expected,
                "late message delivered out of order"
            );
            deliveries.push(Delivery {
                from: from.clone(),
                message,
                order: DeliveryOrder::Late,
                expected,
            });
        } else if message.seq > expected {
            if state.buffer.contains_key(&message.seq) {
                return Received {
                    deliveries,
                    duplicate: true,
                };
            }
            tracing::debug!(
                peer = %from,
                seq = message.seq,
                expected,
                "buffering ahead of sequence"
            );
            state.buffer.insert(message.seq, message);
            state.deadline = Some(now + window);
        } else {
            state.next_expected += 1;
            deliveries.push(Delivery {
                from: from.clone(),
                message,
                order: DeliveryOrder::InOrder,
                expected,
            });
            while let Some(next) = state.buffer.remove(&state.next_expected) {
                deliveries.push(Delivery {
                    from: from.clone(),
                    message: next,
                    order: DeliveryOrder::InOrder,
                    expected: state.next_expected,
                });
                state.next_expected += 1;
            }
            if state.buffer.is_empty() {
                state.deadline = None;
            }
        }

        for delivery in &deliveries {
            self.delivered.insert(&delivery.message.id);
        }
        Received {
            deliveries,
            duplicate: false,
        }
    }

    /// Release buffers whose reorder window has expired, in timestamp order.
    pub fn expire(&mut self, now: Instant) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for (peer, state) in &mut self.peers {
            match state.deadline {
                Some(deadline) if deadline <= now => {}
                _ => continue,
            }
            state.deadline = None;
            let expected = state.next_expected;
            let mut flushed: Vec<WireMessage> =
                std::mem::take(&mut state.buffer).into_values().collect();
            flushed.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
            if let Some(max_seq) = flushed.iter().map(|m| m.seq).max() {
                state.next_expected = max_seq + 1;
            }
            tracing::info!(
                peer = %peer,
                expected,
                released = flushed.len(),
                "reorder window expired, delivering by timestamp"
            );
            deliveries.extend(flushed.into_iter().map(|message| Delivery {
                from: peer.clone(),
                message,
                order: DeliveryOrder::TimestampFallback,
                expected,
            }));
        }
        for delivery in &deliveries {
            self.delivered.insert(&delivery.message.id);
        }
        deliveries
    }

    /// Earliest pending reorder deadline across peers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.peers.values().filter_map(|s| s.deadline).min()
    }

    pub fn buffered(&self) -> usize {
        self.peers.values().map(|s| s.buffer.len()).sum()
    }
}
