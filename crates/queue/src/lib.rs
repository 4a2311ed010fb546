//! Strict FIFO of committed phrases between the coordinator and the
//! speech-output drain.
//!
//! There is no capacity limit: commit must never block capture. Depth above
//! `alert_depth` is only reported.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_engine::PeerId;
use parley_lang::Language;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("phrase queue closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Where a phrase was spoken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhraseOrigin {
    Local,
    Remote(PeerId),
}

/// An utterance frozen at commit. Consumed exactly once by the drain.
#[derive(Debug, Clone, PartialEq)]
pub struct PhraseCommit {
    pub id: Uuid,
    pub source: Language,
    pub target: Language,
    pub text: String,
    /// When the language was decided, for commit-to-speech latency.
    pub decided_at: Instant,
    /// Wall clock epoch seconds.
    pub timestamp: f64,
    pub confidence: f32,
    pub origin: PhraseOrigin,
}

/// How the drain keeps up when phrases pile up behind the one being spoken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthPolicy {
    /// Cut the current phrase at the next word boundary.
    BargeIn,
    /// Speak everything, keeping the gap between phrases under `max_gap_ms`.
    #[default]
    MaxGap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub alert_depth: usize,
    pub policy: DepthPolicy,
    pub max_gap_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            alert_depth: 5,
            policy: DepthPolicy::MaxGap,
            max_gap_ms: 150,
        }
    }
}

impl QueueSettings {
    pub fn max_gap(&self) -> Duration {
        Duration::from_millis(self.max_gap_ms)
    }
}

struct Shared {
    items: Mutex<VecDeque<PhraseCommit>>,
    notify: Notify,
    closed: AtomicBool,
    depth_tx: watch::Sender<usize>,
}

impl Shared {
    fn publish_depth(&self, depth: usize) {
        self.depth_tx.send_replace(depth);
    }
}

/// Create a connected producer/consumer pair.
pub fn phrase_queue(settings: QueueSettings) -> (PhraseProducer, PhraseConsumer) {
    let (depth_tx, _) = watch::channel(0);
    let shared = Arc::new(Shared {
        items: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        depth_tx,
    });
    (
        PhraseProducer {
            shared: Arc::clone(&shared),
            alert_depth: settings.alert_depth,
            alerting: false,
        },
        PhraseConsumer { shared },
    )
}

/// Commit side, owned by the coordinator.
pub struct PhraseProducer {
    shared: Arc<Shared>,
    alert_depth: usize,
    alerting: bool,
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub depth: usize,
    /// True only on the enqueue that crossed the alert threshold.
    pub alert: bool,
}

impl PhraseProducer {
    pub fn enqueue(&mut self, commit: PhraseCommit) -> Result<Enqueued> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let id = commit.id;
        let depth = {
            let mut items = self.shared.items.lock();
            items.push_back(commit);
            items.len()
        };
        self.shared.publish_depth(depth);
        self.shared.notify.notify_one();

        let over = depth > self.alert_depth;
        let alert = over && !self.alerting;
        self.alerting = over;
        if alert {
            tracing::warn!(
                depth,
                threshold = self.alert_depth,
                "phrase queue depth over alert threshold"
            );
        }
        tracing::trace!(phrase_id = %id, depth, "phrase enqueued");
        Ok(Enqueued { depth, alert })
    }

    pub fn depth(&self) -> usize {
        self.shared.items.lock().len()
    }

    /// Stop accepting phrases. Already queued phrases can still be drained.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for PhraseProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drain side, owned by the speech-output task.
pub struct PhraseConsumer {
    shared: Arc<Shared>,
}

impl PhraseConsumer {
    /// Next phrase in commit order. `None` once closed and empty.
    pub async fn next(&mut self) -> Option<PhraseCommit> {
        loop {
            if let Some(commit) = self.try_next() {
                return Some(commit);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_next(&mut self) -> Option<PhraseCommit> {
        let (commit, depth) = {
            let mut items = self.shared.items.lock();
            let commit = items.pop_front()?;
            (commit, items.len())
        };
        self.shared.publish_depth(depth);
        Some(commit)
    }

    pub fn depth(&self) -> usize {
        self.shared.items.lock().len()
    }

    /// Follows the number of phrases waiting behind the current one.
    pub fn watch_depth(&self) -> watch::Receiver<usize> {
        self.shared.depth_tx.subscribe()
    }

    /// Drop everything still queued, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = {
            let mut items = self.shared.items.lock();
            let n = items.len();
            items.clear();
            n
        };
        self.shared.publish_depth(0);
        dropped
    }
}
