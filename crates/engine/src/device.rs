/// Errors from activating or releasing the shared audio session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AudioSessionError {
    /// Another client still has I/O running. Benign on deactivation.
    #[error("audio session busy")]
    Busy,
    #[error("audio session unavailable: {0}")]
    Unavailable(String),
}

/// The physical audio session shared by capture and speech output.
pub trait AudioDevice: Send + Sync {
    fn activate(&self) -> Result<(), AudioSessionError>;

    fn deactivate(&self) -> Result<(), AudioSessionError>;
}

/// Device for headless runs where there is no session to manage.
pub struct NullAudioDevice;

impl AudioDevice for NullAudioDevice {
    fn activate(&self) -> Result<(), AudioSessionError> {
        Ok(())
    }

    fn deactivate(&self) -> Result<(), AudioSessionError> {
        Ok(())
    }
}
