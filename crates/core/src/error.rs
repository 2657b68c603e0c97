/// Result alias that carries the custom [`ClickTrackError`] type.
pub type Result<T> = std::result::Result<T, ClickTrackError>;

/// Common error type for the core crate.
///
/// Out-of-range tempo or beat counts never show up here: they are clamped by
/// the setters. Redundant start/stop calls are no-ops rather than errors.
#[derive(Debug, thiserror::Error)]
pub enum ClickTrackError {
    /// The audio backend could not be created. Playback is refused and the
    /// session state is left untouched; the caller may try `start` again.
    #[error("audio backend unavailable: {0}")]
    BackendUnavailable(String),
    /// A configuration value was rejected after parsing.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Configuration text could not be parsed.
    #[error("{0}")]
    Config(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Free-form failure such as a re-entrant session borrow.
    #[error("{0}")]
    Message(String),
}

impl ClickTrackError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Creates a [`ClickTrackError::BackendUnavailable`] from any displayable reason.
    pub fn backend_unavailable<T: std::fmt::Display>(reason: T) -> Self {
        Self::BackendUnavailable(reason.to_string())
    }
}

impl From<&str> for ClickTrackError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ClickTrackError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
