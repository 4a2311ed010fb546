//! The one named configuration set for a conversation session.

use std::path::Path;
use std::time::Duration;

use parley_engine::{RetrySettings, VoiceSettings};
use parley_floor::FloorSettings;
use parley_lang::{lexicon_for, LanguagePair, RetargetSettings, VoterSettings};
use parley_peer::PeerSettings;
use parley_purity::PuritySettings;
use parley_queue::QueueSettings;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// When an utterance is frozen into a phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitSettings {
    /// Unchanged transcript for this long commits.
    pub stable_cutoff_ms: u64,
    /// Hard cap on utterance length.
    pub max_utterance_ms: u64,
    /// Hard cap under reduced-power operation.
    pub low_power_max_utterance_ms: u64,
    /// Finalized text shorter than this (in characters) is discarded.
    pub min_fragment_chars: usize,
    /// Rotate recognition when no update arrives for this long.
    pub no_growth_rotate_ms: u64,
    /// Send clause-sized pieces to peers before the utterance commits.
    pub early_streaming: bool,
    pub early_stream_min_words: usize,
    /// Share of words heard during speech output that must match what was
    /// spoken for the text to be dropped as an echo.
    pub echo_overlap: f32,
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            stable_cutoff_ms: 1300,
            max_utterance_ms: 7000,
            low_power_max_utterance_ms: 8500,
            min_fragment_chars: 3,
            no_growth_rotate_ms: 30_000,
            early_streaming: false,
            early_stream_min_words: 4,
            echo_overlap: 0.6,
        }
    }
}

impl CommitSettings {
    pub fn stable_cutoff(&self) -> Duration {
        Duration::from_millis(self.stable_cutoff_ms)
    }

    pub fn max_utterance(&self, low_power: bool) -> Duration {
        if low_power {
            Duration::from_millis(self.low_power_max_utterance_ms)
        } else {
            Duration::from_millis(self.max_utterance_ms)
        }
    }

    pub fn no_growth(&self) -> Duration {
        Duration::from_millis(self.no_growth_rotate_ms)
    }
}

/// Where locally committed phrases go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Spoken on this device only.
    Local,
    /// Sent to peers only.
    Peers,
    #[default]
    Both,
}

impl DeliveryMode {
    pub fn speaks_locally(&self) -> bool {
        matches!(self, Self::Local | Self::Both)
    }

    pub fn sends_to_peers(&self) -> bool {
        matches!(self, Self::Peers | Self::Both)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub languages: LanguagePair,
    pub delivery: DeliveryMode,
    pub commit: CommitSettings,
    pub voter: VoterSettings,
    pub retarget: RetargetSettings,
    pub purity: PuritySettings,
    pub queue: QueueSettings,
    pub floor: FloorSettings,
    pub peer: PeerSettings,
    pub retry: RetrySettings,
    pub voices: VoiceSettings,
}

impl ParleyConfig {
    /// Read a JSON config. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.languages
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        for lang in self.languages.languages() {
            if lexicon_for(lang).is_none() {
                return Err(invalid(format!("no word lists for language {lang}")));
            }
        }

        let windows = [
            ("commit.stable_cutoff_ms", self.commit.stable_cutoff_ms),
            ("commit.max_utterance_ms", self.commit.max_utterance_ms),
            (
                "commit.low_power_max_utterance_ms",
                self.commit.low_power_max_utterance_ms,
            ),
            ("commit.no_growth_rotate_ms", self.commit.no_growth_rotate_ms),
            ("voter.half_life_ms", self.voter.half_life_ms),
            ("retarget.window_ms", self.retarget.window_ms),
            ("peer.reorder_window_ms", self.peer.reorder_window_ms),
            ("retry.transport_initial_ms", self.retry.transport_initial_ms),
        ];
        for (name, value) in windows {
            if value == 0 {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.commit.max_utterance_ms < self.commit.stable_cutoff_ms {
            return Err(invalid(
                "commit.max_utterance_ms must not be shorter than the stable cutoff".into(),
            ));
        }
        if self.peer.dedup_capacity == 0 {
            return Err(invalid("peer.dedup_capacity must be greater than zero".into()));
        }
        if self.retry.transport_max_ms < self.retry.transport_initial_ms {
            return Err(invalid(
                "retry.transport_max_ms must not be below retry.transport_initial_ms".into(),
            ));
        }

        let ratios = [
            ("purity.min_purity", self.purity.min_purity),
            ("voter.min_decision_margin", self.voter.min_decision_margin),
            ("retarget.flip_margin", self.retarget.flip_margin),
            ("commit.echo_overlap", self.commit.echo_overlap),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{name} must be between 0 and 1")));
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}
