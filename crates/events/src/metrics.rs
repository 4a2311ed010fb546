use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Pipeline counters with atomic fields for lock-free updates.
///
/// Shared as `Arc<TurnMetrics>` between the coordinator, the speech drain
/// and the peer outbox.
#[derive(Debug, Default)]
pub struct TurnMetrics {
    floor_acquisitions: AtomicU64,
    capture_resumes: AtomicU64,
    language_flips: AtomicU64,
    /// Gauge, not a counter.
    queue_depth: AtomicU64,
    /// Timer arms that had to cancel a live timer of the same class.
    cancel_retries: AtomicU64,
    phrases_committed: AtomicU64,
    fragments_discarded: AtomicU64,
    repairs_selective: AtomicU64,
    repairs_full: AtomicU64,
    gap_overruns: AtomicU64,
    duplicates_dropped: AtomicU64,
}

impl TurnMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Getters ---

    pub fn floor_acquisitions(&self) -> u64 {
        self.floor_acquisitions.load(Ordering::Relaxed)
    }

    pub fn capture_resumes(&self) -> u64 {
        self.capture_resumes.load(Ordering::Relaxed)
    }

    pub fn language_flips(&self) -> u64 {
        self.language_flips.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn cancel_retries(&self) -> u64 {
        self.cancel_retries.load(Ordering::Relaxed)
    }

    pub fn phrases_committed(&self) -> u64 {
        self.phrases_committed.load(Ordering::Relaxed)
    }

    pub fn fragments_discarded(&self) -> u64 {
        self.fragments_discarded.load(Ordering::Relaxed)
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped.load(Ordering::Relaxed)
    }

    // --- Updates ---

    pub fn record_floor_acquisition(&self) {
        self.floor_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_resume(&self) {
        self.capture_resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_language_flip(&self) {
        self.language_flips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn record_cancel_retry(&self) {
        self.cancel_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_phrase_committed(&self) {
        self.phrases_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fragment_discarded(&self) {
        self.fragments_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repair(&self, selective: u8, full: u8) {
        self.repairs_selective
            .fetch_add(u64::from(selective), Ordering::Relaxed);
        self.repairs_full.fetch_add(u64::from(full), Ordering::Relaxed);
    }

    pub fn record_gap_overrun(&self) {
        self.gap_overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a snapshot for serialization/display.
    pub fn snapshot(&self) -> TurnMetricsSnapshot {
        TurnMetricsSnapshot {
            floor_acquisitions: self.floor_acquisitions(),
            capture_resumes: self.capture_resumes(),
            language_flips: self.language_flips(),
            queue_depth: self.queue_depth(),
            cancel_retries: self.cancel_retries(),
            phrases_committed: self.phrases_committed(),
            fragments_discarded: self.fragments_discarded(),
            repairs_selective: self.repairs_selective.load(Ordering::Relaxed),
            repairs_full: self.repairs_full.load(Ordering::Relaxed),
            gap_overruns: self.gap_overruns.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped(),
        }
    }
}

/// Snapshot of pipeline counters for serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnMetricsSnapshot {
    pub floor_acquisitions: u64,
    pub capture_resumes: u64,
    pub language_flips: u64,
    pub queue_depth: u64,
    pub cancel_retries: u64,
    pub phrases_committed: u64,
    pub fragments_discarded: u64,
    pub repairs_selective: u64,
    pub repairs_full: u64,
    pub gap_overruns: u64,
    pub duplicates_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = TurnMetrics::new();
        metrics.record_floor_acquisition();
        metrics.record_floor_acquisition();
        metrics.set_queue_depth(3);
        metrics.set_queue_depth(1);
        metrics.record_repair(1, 1);
        metrics.record_repair(1, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.floor_acquisitions, 2);
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.repairs_selective, 2);
        assert_eq!(snapshot.repairs_full, 1);
        assert_eq!(snapshot.capture_resumes, 0);
    }
}
