use reqwest::StatusCode;
use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure; this layer never retries it.
    #[error("network error: {0}")]
    Network(String),
    /// Authorization still failed after the one refresh-and-retry.
    #[error("authorization expired and the retried request was rejected")]
    AuthExpired,
    /// The session is gone: refresh was rejected, or nobody is logged in.
    #[error("session terminated: {0}")]
    AuthRejected(String),
    #[error("request rejected by backend ({status}): {message}")]
    Validation { status: u16, message: String },
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("realtime connection is not established")]
    RealtimeDisconnected,
    #[error("failed to decode backend response: {0}")]
    Decode(String),
    #[error("credential storage failed: {source}")]
    Storage { source: anyhow::Error },
}

impl ClientError {
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = ApiError::from_body(body).message;
        let status = status.as_u16();
        match ErrorCode::from_status(status) {
            ErrorCode::Validation => Self::Validation { status, message },
            _ => Self::Status { status, message },
        }
    }

    /// True for errors that mean the user has to sign in again.
    pub fn is_session_terminated(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Network(value.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(format!("websocket: {value}"))
    }
}
