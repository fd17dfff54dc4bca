use thiserror::Error;

/// Errors raised while fetching, computing or persisting levels.
#[derive(Error, Debug)]
pub enum LevelsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Storage error at {path}: {message}")]
    Storage { path: String, message: String },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LevelsResult<T> = Result<T, LevelsError>;

impl LevelsError {
    /// Network failures, rate limiting (429) and server errors (5xx) are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            LevelsError::Http(_) => true,
            LevelsError::Api { status_code, .. } => *status_code >= 500 || *status_code == 429,
            _ => false,
        }
    }

    pub fn parse_error<S: Into<String>>(message: S) -> Self {
        LevelsError::Parse {
            message: message.into(),
        }
    }

    pub fn api_error<S: Into<String>>(status_code: u16, message: S) -> Self {
        LevelsError::Api {
            status_code,
            message: message.into(),
        }
    }
}
