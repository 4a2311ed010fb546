use async_trait::async_trait;
use parley_lang::Language;
use serde::Serialize;
use tokio::sync::mpsc;

/// One partial or final transcript from the recognizer.
///
/// `text` is the accumulated text of the current recognition segment, not
/// a delta.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptUpdate {
    pub text: String,
    /// Language the recognizer believes it heard, if it reports one.
    pub language: Option<Language>,
    pub confidence: f32,
    /// End of the recognition segment.
    pub is_final: bool,
}

impl TranscriptUpdate {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: None,
            confidence: 0.0,
            is_final: false,
        }
    }

    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            is_final: true,
            ..Self::partial(text)
        }
    }

    pub fn with_language(mut self, language: Language, confidence: f32) -> Self {
        self.language = Some(language);
        self.confidence = confidence;
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecognizerError {
    #[error("speech recognition unavailable")]
    Unavailable,
    #[error("speech recognition permission denied")]
    PermissionDenied,
    #[error("recognizer busy")]
    Busy,
    #[error("no speech detected")]
    NoSpeech,
    #[error("recognition service crashed")]
    ServiceCrashed,
    #[error("recognition failed: {0}")]
    Recognition(String),
    #[error("recognition task failed: {0}")]
    Task(String),
}

/// Coarse error category, as reported in events and used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognizerErrorKind {
    Unavailable,
    PermissionDenied,
    Busy,
    NoSpeech,
    ServiceCrashed,
    Recognition,
    Task,
}

impl RecognizerError {
    pub fn category(&self) -> RecognizerErrorKind {
        match self {
            Self::Unavailable => RecognizerErrorKind::Unavailable,
            Self::PermissionDenied => RecognizerErrorKind::PermissionDenied,
            Self::Busy => RecognizerErrorKind::Busy,
            Self::NoSpeech => RecognizerErrorKind::NoSpeech,
            Self::ServiceCrashed => RecognizerErrorKind::ServiceCrashed,
            Self::Recognition(_) => RecognizerErrorKind::Recognition,
            Self::Task(_) => RecognizerErrorKind::Task,
        }
    }

    /// Errors after which capture cannot continue in this session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable | Self::PermissionDenied)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    Update(TranscriptUpdate),
    Error(RecognizerError),
}

/// A recognizer event tagged with the run that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizerMessage {
    pub epoch: u64,
    pub event: RecognizerEvent,
}

/// Where a running recognizer delivers its events.
///
/// Each start hands out a sink with a fresh epoch, so events from a run
/// that was rotated away can be told apart and dropped.
#[derive(Debug, Clone)]
pub struct RecognizerSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<RecognizerMessage>,
}

impl RecognizerSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<RecognizerMessage>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the pipeline is gone.
    pub fn update(&self, update: TranscriptUpdate) -> bool {
        self.send(RecognizerEvent::Update(update))
    }

    pub fn error(&self, error: RecognizerError) -> bool {
        self.send(RecognizerEvent::Error(error))
    }

    fn send(&self, event: RecognizerEvent) -> bool {
        self.tx
            .send(RecognizerMessage {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// A continuous speech recognizer.
///
/// `start` begins streaming updates into the sink and returns once the
/// recognizer is running. `stop` must be safe to call when not running.
#[async_trait]
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, locale: &Language, sink: RecognizerSink) -> Result<(), RecognizerError>;

    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RecognizerError::Unavailable.is_fatal());
        assert!(RecognizerError::PermissionDenied.is_fatal());
        assert!(!RecognizerError::Busy.is_fatal());
        assert!(!RecognizerError::Task("x".into()).is_fatal());
        assert_eq!(
            RecognizerError::Recognition("decoder".into()).category(),
            RecognizerErrorKind::Recognition
        );
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&RecognizerErrorKind::PermissionDenied).unwrap();
        assert_eq!(json, "\"permission_denied\"");
    }

    #[tokio::test]
    async fn test_sink_tags_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = RecognizerSink::new(7, tx);
        assert!(sink.update(TranscriptUpdate::partial("hola")));
        let message = rx.recv().await.unwrap();
        assert_eq!(message.epoch, 7);
        assert_eq!(
            message.event,
            RecognizerEvent::Update(TranscriptUpdate::partial("hola"))
        );

        drop(rx);
        assert!(!sink.error(RecognizerError::Busy));
    }
}
