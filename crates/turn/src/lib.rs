//! Turn-taking for a two-language conversation.
//!
//! [`TurnCoordinator`] listens through a recognizer, decides when an
//! utterance is complete and in which language it was spoken, and hands
//! the phrase to local speech output, to peers, or both. While its own
//! speech plays it holds the floor so the emit path stays closed.

mod config;
mod context;
mod coordinator;
mod drain;
mod echo;
mod error;
mod timers;

pub use config::{CommitSettings, DeliveryMode, ParleyConfig};
pub use context::TurnContext;
pub use coordinator::{CoordinatorHandle, CoordinatorSnapshot, TurnCoordinator, TurnState};
pub use drain::UNTRANSLATED_MARKER;
pub use echo::EchoFilter;
pub use error::{ConfigError, CoordinatorError, Result};
pub use timers::{TimerBank, TimerKind};
