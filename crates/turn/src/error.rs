use parley_engine::RecognizerError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("turn coordinator has stopped")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("speech recognition cannot run: {0}")]
    Fatal(RecognizerError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
