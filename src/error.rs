use thiserror::Error;

/// Errors raised by log sources and the buffered layer above them
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("log contains no messages: {0}")]
    Empty(String),

    #[error("failed to initialize log: {0}")]
    Initialization(String),

    #[error("source used before initialization")]
    Uninitialized,

    #[error("read failed: {0}")]
    Read(String),

    #[error("log data is corrupt: {0}")]
    Corrupt(String),

    #[error("failed to parse record: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl SourceError {
    /// Cancellation is not a failure and never becomes a problem entry
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SourceError::Cancelled)
    }
}

/// Errors returned by the player's control surface and state bodies
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("a listener is already registered")]
    ListenerAlreadySet,

    #[error("{0} is not supported by this data source")]
    Unsupported(&'static str),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("invalid playback speed {0}")]
    InvalidSpeed(f64),

    #[error("no log sources were provided")]
    NoSources,

    #[error("player is closed")]
    Closed,

    #[error("Error initializing: {0}")]
    Initialize(#[source] SourceError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl PlayerError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        PlayerError::Invariant(message.into())
    }
}

pub type SourceResult<T> = Result<T, SourceError>;
pub type PlayerResult<T> = Result<T, PlayerError>;
