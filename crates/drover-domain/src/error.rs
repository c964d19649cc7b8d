/// Shared error type used across all Drover crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("workspace is not a git repository (.git not found)")]
    NotGitRepo,

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when this error was raised by a tripped cancel token.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
