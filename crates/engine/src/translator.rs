use async_trait::async_trait;
use parley_lang::Language;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TranslateError {
    #[error("translator unavailable: {0}")]
    Unavailable(String),
    #[error("no model for {from} -> {to}")]
    UnsupportedPair { from: Language, to: Language },
    #[error("translation failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source: &Language,
        target: &Language,
    ) -> Result<String, TranslateError>;
}
