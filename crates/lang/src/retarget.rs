use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::Language;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetargetSettings {
    /// How long after utterance start the recognition locale may change.
    pub window_ms: u64,
    /// Normalized voter margin the new leader must hold.
    pub flip_margin: f32,
    /// How long that margin must be held before flipping.
    pub sustain_ms: u64,
}

impl Default for RetargetSettings {
    fn default() -> Self {
        Self {
            window_ms: 2000,
            flip_margin: 0.30,
            sustain_ms: 500,
        }
    }
}

impl RetargetSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sustain(&self) -> Duration {
        Duration::from_millis(self.sustain_ms)
    }
}

/// One-flip recognition locale correction at the start of an utterance.
///
/// Only the recognizer locale is affected; the language an utterance is
/// spoken in is decided at its own commit.
#[derive(Debug, Default)]
pub struct RetargetTracker {
    settings: RetargetSettings,
    opened_at: Option<Instant>,
    candidate: Option<(Language, Instant)>,
    flipped: bool,
}

impl RetargetTracker {
    pub fn new(settings: RetargetSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn begin(&mut self, now: Instant) {
        self.opened_at = Some(now);
        self.candidate = None;
        self.flipped = false;
    }

    pub fn close(&mut self) {
        self.opened_at = None;
        self.candidate = None;
    }

    pub fn is_open(&self, now: Instant) -> bool {
        match self.opened_at {
            Some(opened) => {
                !self.flipped && now.saturating_duration_since(opened) <= self.settings.window()
            }
            None => false,
        }
    }

    /// When the current candidate will have been sustained long enough,
    /// if that still falls inside the window.
    pub fn candidate_deadline(&self) -> Option<Instant> {
        let (_, since) = self.candidate.as_ref()?;
        let opened = self.opened_at?;
        let due = *since + self.settings.sustain();
        (due <= opened + self.settings.window()).then_some(due)
    }

    /// Feed the voter's current leader. Returns the locale to switch the
    /// recognizer to when a flip fires.
    pub fn observe(
        &mut self,
        now: Instant,
        leader: &Language,
        margin: f32,
        active_locale: &Language,
    ) -> Option<Language> {
        if !self.is_open(now) {
            if self.opened_at.is_some() && !self.flipped {
                self.close();
            }
            return None;
        }

        if leader.same_primary(active_locale) || margin < self.settings.flip_margin {
            self.candidate = None;
            return None;
        }

        match &self.candidate {
            Some((lang, since)) if lang.same_primary(leader) => {
                if now.saturating_duration_since(*since) >= self.settings.sustain() {
                    self.flipped = true;
                    self.candidate = None;
                    tracing::debug!(
                        from = %active_locale,
                        to = %leader,
                        margin,
                        "recognition locale retarget"
                    );
                    return Some(leader.clone());
                }
            }
            _ => self.candidate = Some((leader.clone(), now)),
        }
        None
    }

    pub fn flipped(&self) -> bool {
        self.flipped
    }
}
