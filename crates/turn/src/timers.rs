//! Named deadline slots driven by the coordinator's single clock.
//!
//! Each timer class has exactly one slot. Arming a slot replaces whatever
//! was pending in it, so two timers of the same class can never race.

use std::sync::Arc;

use parley_events::TurnMetrics;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    StableCutoff,
    HardCap,
    NoGrowth,
    Retarget,
    /// Floor release after speech, and resume after a pause.
    Grace,
    ReorderBuffer,
    Recovery,
}

impl TimerKind {
    pub const ALL: [TimerKind; 7] = [
        TimerKind::StableCutoff,
        TimerKind::HardCap,
        TimerKind::NoGrowth,
        TimerKind::Retarget,
        TimerKind::Grace,
        TimerKind::ReorderBuffer,
        TimerKind::Recovery,
    ];

    fn index(self) -> usize {
        match self {
            Self::StableCutoff => 0,
            Self::HardCap => 1,
            Self::NoGrowth => 2,
            Self::Retarget => 3,
            Self::Grace => 4,
            Self::ReorderBuffer => 5,
            Self::Recovery => 6,
        }
    }

    /// Slots pushed back on every transcript update. Re-arming them is
    /// routine, not a race.
    fn extends_on_growth(self) -> bool {
        matches!(self, Self::StableCutoff | Self::NoGrowth)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StableCutoff => "stable_cutoff",
            Self::HardCap => "hard_cap",
            Self::NoGrowth => "no_growth",
            Self::Retarget => "retarget",
            Self::Grace => "grace",
            Self::ReorderBuffer => "reorder_buffer",
            Self::Recovery => "recovery",
        }
    }
}

pub struct TimerBank {
    slots: [Option<Instant>; 7],
    metrics: Arc<TurnMetrics>,
}

impl TimerBank {
    pub fn new(metrics: Arc<TurnMetrics>) -> Self {
        Self {
            slots: [None; 7],
            metrics,
        }
    }

    /// Arm `kind` at `deadline`, cancelling any live instance first.
    ///
    /// Returns true when a live instance was replaced; that is counted as a
    /// cancel-retry unless the slot is one that tracks transcript growth.
    pub fn arm(&mut self, kind: TimerKind, deadline: Instant) -> bool {
        let replaced = self.slots[kind.index()].replace(deadline).is_some();
        if replaced && !kind.extends_on_growth() {
            self.metrics.record_cancel_retry();
            tracing::trace!(timer = kind.as_str(), "timer re-armed");
        }
        replaced
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.slots[kind.index()].take().is_some()
    }

    pub fn cancel_all(&mut self) {
        self.slots = [None; 7];
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.slots[kind.index()]
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().min().copied()
    }

    /// Remove and return every slot due at `now`, in class order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        TimerKind::ALL
            .into_iter()
            .filter(|kind| {
                let slot = &mut self.slots[kind.index()];
                let due = matches!(slot, Some(deadline) if *deadline <= now);
                if due {
                    *slot = None;
                }
                due
            })
            .collect()
    }

    pub fn pending(&self) -> Vec<TimerKind> {
        TimerKind::ALL
            .into_iter()
            .filter(|kind| self.is_armed(*kind))
            .collect()
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn bank() -> (TimerBank, Arc<TurnMetrics>) {
        let metrics = Arc::new(TurnMetrics::new());
        (TimerBank::new(Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn test_rearm_replaces_and_counts() {
        let (mut timers, metrics) = bank();
        let now = Instant::now();
        assert!(!timers.arm(TimerKind::Grace, now + Duration::from_millis(1200)));
        assert!(timers.arm(TimerKind::Grace, now + Duration::from_millis(1400)));
        assert_eq!(timers.pending(), vec![TimerKind::Grace]);
        assert_eq!(
            timers.deadline(TimerKind::Grace),
            Some(now + Duration::from_millis(1400))
        );
        assert_eq!(metrics.cancel_retries(), 1);
    }

    #[test]
    fn test_growth_pushback_is_not_a_retry() {
        let (mut timers, metrics) = bank();
        let now = Instant::now();
        for step in 0..5 {
            let at = now + Duration::from_millis(100 * step);
            timers.arm(TimerKind::StableCutoff, at + Duration::from_millis(1300));
            timers.arm(TimerKind::NoGrowth, at + Duration::from_secs(30));
        }
        assert_eq!(metrics.cancel_retries(), 0);
        assert_eq!(
            timers.deadline(TimerKind::StableCutoff),
            Some(now + Duration::from_millis(1700))
        );

        timers.arm(TimerKind::Retarget, now);
        timers.arm(TimerKind::Retarget, now + Duration::from_millis(500));
        assert_eq!(metrics.cancel_retries(), 1);
    }

    #[test]
    fn test_cancel_is_not_a_retry() {
        let (mut timers, metrics) = bank();
        let now = Instant::now();
        timers.arm(TimerKind::HardCap, now);
        assert!(timers.cancel(TimerKind::HardCap));
        assert!(!timers.cancel(TimerKind::HardCap));
        timers.arm(TimerKind::HardCap, now);
        assert_eq!(metrics.cancel_retries(), 0);
    }

    #[test]
    fn test_take_expired_leaves_future_slots() {
        let (mut timers, _) = bank();
        let now = Instant::now();
        timers.arm(TimerKind::Recovery, now);
        timers.arm(TimerKind::StableCutoff, now - Duration::from_millis(1));
        timers.arm(TimerKind::NoGrowth, now + Duration::from_secs(30));

        assert_eq!(timers.next_deadline(), Some(now - Duration::from_millis(1)));
        assert_eq!(
            timers.take_expired(now),
            vec![TimerKind::StableCutoff, TimerKind::Recovery]
        );
        assert_eq!(timers.pending(), vec![TimerKind::NoGrowth]);
        timers.cancel_all();
        assert_eq!(timers.next_deadline(), None);
    }
}
