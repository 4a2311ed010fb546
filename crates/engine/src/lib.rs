//! Interfaces to the external engines the conversation pipeline drives.
//!
//! The pipeline never recognizes, translates or synthesizes speech itself.
//! Platform crates implement these traits; tests implement them with
//! scripted fakes.

mod device;
mod recognizer;
mod retry;
mod synthesizer;
mod translator;
mod transport;
mod voice;

pub use device::{AudioDevice, AudioSessionError, NullAudioDevice};
pub use recognizer::{
    Recognizer, RecognizerError, RecognizerErrorKind, RecognizerEvent, RecognizerMessage,
    RecognizerSink, TranscriptUpdate,
};
pub use retry::{RetryDecision, RetryPolicy, RetrySettings};
pub use synthesizer::{SpeechOutcome, StopBoundary, SynthesisError, Synthesizer};
pub use translator::{TranslateError, Translator};
pub use transport::{PeerId, Transport, TransportError, TransportEvent};
pub use voice::{VoiceId, VoiceSettings};

use std::sync::Arc;

/// The set of engines one conversation session runs against.
#[derive(Clone)]
pub struct Engines {
    pub recognizer: Arc<dyn Recognizer>,
    pub translator: Arc<dyn Translator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub transport: Arc<dyn Transport>,
    pub audio_device: Arc<dyn AudioDevice>,
}
