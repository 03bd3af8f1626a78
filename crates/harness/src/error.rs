use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<HarnessError>,
    },

    #[error("invalid client setup: {0}")]
    Setup(String),
}

impl HarnessError {
    /// Transport failures, timeouts and 5xx responses are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            HarnessError::Transport(_) | HarnessError::Timeout => true,
            HarnessError::Status { status, .. } => *status >= 500,
            HarnessError::RetryExhausted { .. } | HarnessError::Setup(_) => false,
        }
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HarnessError::Timeout
        } else {
            HarnessError::Transport(e.to_string())
        }
    }
}
