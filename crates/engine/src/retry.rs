//! Retry and backoff policy, keyed by error category.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RecognizerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Delay between retries of a busy or failing recognizer.
    pub busy_backoff_ms: u64,
    /// Retries before a busy recognizer is rotated.
    pub busy_attempts: u32,
    /// Delays between retries after no speech was detected.
    pub no_speech_backoff_ms: Vec<u64>,
    /// First delay after a failed peer send.
    pub transport_initial_ms: u64,
    /// Upper bound for the peer send delay.
    pub transport_max_ms: u64,
    /// Consecutive send failures after which delivery freezes.
    pub transport_freeze_after: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            busy_backoff_ms: 250,
            busy_attempts: 3,
            no_speech_backoff_ms: vec![200, 400, 600],
            transport_initial_ms: 500,
            transport_max_ms: 2000,
            transport_freeze_after: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Do not retry; the session cannot continue.
    Fatal,
    /// Same delay for a fixed number of attempts, then rotate.
    FixedShort { delay: Duration, attempts: u32 },
    /// Growing delays, one per attempt, then rotate.
    Incremental { steps: Vec<Duration> },
    /// Doubling delays up to `max`; give up after `give_up_after` failures.
    ExponentialCapped {
        initial: Duration,
        max: Duration,
        give_up_after: u32,
    },
    /// Restart the pipeline right away.
    Rotate,
    /// Tear down and rebuild from scratch.
    HardReboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Rotate,
    HardReboot,
    GiveUp,
}

impl RetryPolicy {
    pub fn for_recognizer(error: &RecognizerError, settings: &RetrySettings) -> Self {
        match error {
            RecognizerError::Unavailable | RecognizerError::PermissionDenied => Self::Fatal,
            RecognizerError::Busy | RecognizerError::Recognition(_) => Self::FixedShort {
                delay: Duration::from_millis(settings.busy_backoff_ms),
                attempts: settings.busy_attempts,
            },
            RecognizerError::NoSpeech => Self::Incremental {
                steps: settings
                    .no_speech_backoff_ms
                    .iter()
                    .copied()
                    .map(Duration::from_millis)
                    .collect(),
            },
            RecognizerError::Task(_) => Self::Rotate,
            RecognizerError::ServiceCrashed => Self::HardReboot,
        }
    }

    pub fn transport(settings: &RetrySettings) -> Self {
        Self::ExponentialCapped {
            initial: Duration::from_millis(settings.transport_initial_ms),
            max: Duration::from_millis(settings.transport_max_ms),
            give_up_after: settings.transport_freeze_after,
        }
    }

    /// What to do after the `attempt`-th consecutive failure (1-based).
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        let attempt = attempt.max(1);
        match self {
            Self::Fatal => RetryDecision::GiveUp,
            Self::FixedShort { delay, attempts } => {
                if attempt <= *attempts {
                    RetryDecision::RetryAfter(*delay)
                } else {
                    RetryDecision::Rotate
                }
            }
            Self::Incremental { steps } => match steps.get(attempt as usize - 1) {
                Some(delay) => RetryDecision::RetryAfter(*delay),
                None => RetryDecision::Rotate,
            },
            Self::ExponentialCapped {
                initial,
                max,
                give_up_after,
            } => {
                if attempt >= *give_up_after {
                    return RetryDecision::GiveUp;
                }
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                let delay = initial.saturating_mul(factor).min(*max);
                RetryDecision::RetryAfter(delay)
            }
            Self::Rotate => RetryDecision::Rotate,
            Self::HardReboot => RetryDecision::HardReboot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> RetryDecision {
        RetryDecision::RetryAfter(Duration::from_millis(v))
    }

    #[test]
    fn test_busy_retries_then_rotates() {
        let policy = RetryPolicy::for_recognizer(&RecognizerError::Busy, &RetrySettings::default());
        assert_eq!(policy.decide(1), ms(250));
        assert_eq!(policy.decide(3), ms(250));
        assert_eq!(policy.decide(4), RetryDecision::Rotate);
    }

    #[test]
    fn test_no_speech_is_incremental() {
        let policy =
            RetryPolicy::for_recognizer(&RecognizerError::NoSpeech, &RetrySettings::default());
        assert_eq!(policy.decide(1), ms(200));
        assert_eq!(policy.decide(2), ms(400));
        assert_eq!(policy.decide(3), ms(600));
        assert_eq!(policy.decide(4), RetryDecision::Rotate);
    }

    #[test]
    fn test_terminal_categories() {
        let settings = RetrySettings::default();
        let decide = |e: RecognizerError| RetryPolicy::for_recognizer(&e, &settings).decide(1);
        assert_eq!(decide(RecognizerError::PermissionDenied), RetryDecision::GiveUp);
        assert_eq!(decide(RecognizerError::Task("gone".into())), RetryDecision::Rotate);
        assert_eq!(decide(RecognizerError::ServiceCrashed), RetryDecision::HardReboot);
    }

    #[test]
    fn test_transport_backoff_caps_and_freezes() {
        let settings = RetrySettings {
            transport_freeze_after: 5,
            ..RetrySettings::default()
        };
        let policy = RetryPolicy::transport(&settings);
        assert_eq!(policy.decide(1), ms(500));
        assert_eq!(policy.decide(2), ms(1000));
        assert_eq!(policy.decide(3), ms(2000));
        assert_eq!(policy.decide(4), ms(2000));
        assert_eq!(policy.decide(5), RetryDecision::GiveUp);

        let default = RetryPolicy::transport(&RetrySettings::default());
        assert_eq!(default.decide(2), ms(1000));
        assert_eq!(default.decide(3), RetryDecision::GiveUp);
    }
}
