use async_trait::async_trait;
use parley_lang::Language;

use crate::VoiceId;

/// How a `speak` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    Completed,
    /// Stopped early by `stop`.
    Interrupted,
}

/// Where an interrupted utterance may be cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBoundary {
    Immediate,
    /// After the word currently being spoken.
    Word,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisError {
    #[error("no voice for {0}")]
    NoVoice(Language),
    #[error("synthesis failed: {0}")]
    Failed(String),
}

/// Speech output.
///
/// `speak` resolves when the utterance has finished playing or has been
/// stopped, so the caller can time the floor release from it.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn speak(
        &self,
        text: &str,
        language: &Language,
        voice: Option<&VoiceId>,
    ) -> Result<SpeechOutcome, SynthesisError>;

    fn stop(&self, boundary: StopBoundary);

    /// Installed voices for a language, best match first.
    fn voices(&self, language: &Language) -> Vec<VoiceId>;
}
