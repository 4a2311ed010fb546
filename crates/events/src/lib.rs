//! Event contracts for the conversation pipeline.
//!
//! Defines the topics and payloads the coordinator emits, the `EventBus`
//! abstraction they travel over, and the shared `TurnMetrics` counters.
//! Payloads carry names, ids, languages and timings. Speech text only
//! appears in `transcript:*` payloads, which are meant for the on-screen
//! transcript and are redacted by the logging bus.

mod bus;
mod metrics;

pub use bus::{
    emit, EmittedEvent, EventBus, EventBusRef, FanoutEventBus, InMemoryEventBus, NullEventBus,
    TracingEventBus,
};
pub use metrics::{TurnMetrics, TurnMetricsSnapshot};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event topic names.
pub mod topics {
    pub const UTTERANCE_START: &str = "turn:utterance_start";
    pub const PARTIAL_UPDATE: &str = "turn:partial_update";
    pub const PHRASE_COMMIT: &str = "turn:phrase_commit";
    pub const LANGUAGE_DECISION: &str = "turn:language_decision";
    pub const CAPTURE_RESUME: &str = "turn:capture_resume";
    pub const SPEECH_START: &str = "speech:start";
    pub const SPEECH_END: &str = "speech:end";
    pub const PEER_REORDERED: &str = "peer:reordered";
    pub const PEER_DISCONNECTED: &str = "peer:disconnected";
    pub const QUEUE_DEPTH_ALERT: &str = "queue:depth_alert";
    pub const TRANSCRIPT_DISPLAY: &str = "transcript:display";
    pub const TRANSCRIPT_REVISED: &str = "transcript:revised";
    pub const NOTICE_FATAL: &str = "notice:fatal";
    pub const NOTICE_UNTRANSLATED: &str = "notice:untranslated";
    pub const NOTICE_TRANSPORT_FROZEN: &str = "notice:transport_frozen";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtteranceStartEvent {
    pub utterance: u64,
    /// Language the recognizer is listening in.
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialUpdateEvent {
    pub utterance: u64,
    pub text_len: usize,
    pub is_final: bool,
}

/// What closed an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitReason {
    Punctuation,
    StablePause,
    HardCap,
    Final,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhraseCommitEvent {
    pub phrase_id: Uuid,
    pub utterance: u64,
    pub reason: CommitReason,
    pub source: String,
    pub target: String,
    pub text_len: usize,
    /// Milliseconds from utterance start to commit.
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageDecisionEvent {
    pub utterance: u64,
    pub language: String,
    pub margin: f32,
    pub confidence: f32,
    pub fell_back: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechStartEvent {
    pub phrase_id: Uuid,
    pub language: String,
    pub queue_depth: usize,
    /// Milliseconds from commit to the start of speech.
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechEndEvent {
    pub phrase_id: Uuid,
    pub interrupted: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResumeEvent {
    pub route: String,
    pub grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReorderedEvent {
    pub peer: String,
    pub seq: u64,
    pub expected: u64,
    /// `timestamp_fallback` or `late`.
    pub order: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDisconnectedEvent {
    pub peer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDepthAlertEvent {
    pub depth: usize,
    pub threshold: usize,
}

/// Text shown in the on-screen transcript for a spoken phrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptDisplayEvent {
    pub phrase_id: Uuid,
    pub source_text: String,
    pub display_text: String,
    pub language: String,
    pub untranslated: bool,
}

/// Late purity repair result for the on-screen transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRevisedEvent {
    pub phrase_id: Uuid,
    pub text: String,
    pub purity: f32,
}

/// Non-blocking user notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeEvent {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phrase_id: Option<Uuid>,
}
