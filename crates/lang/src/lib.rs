//! Language handling for the conversation pipeline.
//!
//! - `Language` / `LanguagePair`: language-region tags and the two active languages
//! - `Lexicon`: per-language stopwords, special characters, fillers and pronouns
//! - `LanguageVoter`: decaying per-utterance scores and the commit-time decision
//! - `RetargetTracker`: the one-flip recognition locale correction window

mod language;
mod lexicon;
mod retarget;
mod voter;

pub use language::{Language, LanguagePair};
pub use lexicon::{lexicon_for, tokenize, trailing_token, Lexicon};
pub use retarget::{RetargetSettings, RetargetTracker};
pub use voter::{LanguageDecision, LanguageVoter, VoterSettings};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LangError {
    #[error("invalid language tag: {0:?}")]
    InvalidTag(String),
    #[error("no lexicon for language {0}")]
    UnsupportedLanguage(String),
    #[error("language pair needs two distinct languages, got {0} twice")]
    DegeneratePair(String),
}

pub type Result<T> = std::result::Result<T, LangError>;
