//! Error handling for MeterEye.

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error (validation, env substitution). Carries the dotted
    /// path of the first offending field where one exists.
    #[error("Config error: {0}")]
    Config(String),

    /// Stream error (connect, read, decode). Drives the camera state machine
    /// and is never surfaced beyond the camera status flag.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Recognition error. Caught at the worker boundary and converted into a
    /// failure Reading; never propagates out of the frame loop.
    #[error("Recognition error: {0}")]
    Recognition(String),

    /// Export error (transient or permanent, per sink)
    #[error("Export error: {0}")]
    Export(String),

    /// Registry error (unknown id lookups) - a programming error
    #[error("Registry error: {0}")]
    Registry(String),

    /// No frame captured yet for a camera (preview path, maps to 409)
    #[error("No frame yet: {0}")]
    NoFrame(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a config error pointing at a specific dotted field path.
    pub fn config_at(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config(format!("{}: {}", path.into(), message.into()))
    }
}
