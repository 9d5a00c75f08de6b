/// Result alias that carries the custom [`SpectrumError`] type.
pub type Result<T> = std::result::Result<T, SpectrumError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SpectrumError {
    /// A configuration value was rejected at construction time (non power of
    /// two FFT size, zero sample rate or band count, and so on).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// A WebSocket upgrade request could not be completed. Only the affected
    /// connection is dropped; the accept loop keeps running.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A TOML configuration file could not be parsed.
    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
    /// The spectrum payload could not be serialised.
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
    /// The WAV recording sink failed.
    #[error("recording: {0}")]
    Recording(#[from] hound::Error),
}

impl SpectrumError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Shorthand for [`SpectrumError::InvalidConfiguration`].
    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}

impl From<&str> for SpectrumError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SpectrumError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
