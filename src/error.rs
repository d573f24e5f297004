use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The server could not be reached, or the connection dropped.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-2xx status.
    #[error("request failed with status {status}: {}", describe(code.as_deref(), message))]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// One frame could not be parsed. Never fatal for the stream.
    #[error("malformed stream frame ({reason}): {payload}")]
    StreamDecode { payload: String, reason: String },

    /// The server emitted an explicit `error` event mid-stream.
    #[error("stream error: {}", describe(code.as_deref(), message))]
    StreamProtocol {
        code: Option<String>,
        message: String,
        status: Option<u16>,
    },

    #[error("upload failed: {message}")]
    Upload { status: Option<u16>, message: String },

    /// Only the connect phase is bounded; see `ClientConfig::connect_timeout`.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// A successful response whose body did not have the expected shape.
    #[error("invalid response body: {0}")]
    InvalidResponse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl ClientError {
    /// Status code when the server produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            ClientError::Upload { status, .. } | ClientError::StreamProtocol { status, .. } => *status,
            _ => None,
        }
    }

    /// True when retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout(_) => true,
            ClientError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            let detail = std::error::Error::source(&err)
                .map(|source| source.to_string())
                .unwrap_or_else(|| err.to_string());
            ClientError::InvalidResponse(detail)
        } else if err.is_timeout() {
            ClientError::Network(format!("request timed out: {}", err))
        } else if err.is_connect() {
            ClientError::Network(format!("connection failed: {}", err))
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

fn describe(code: Option<&str>, message: &str) -> String {
    match code {
        Some(code) if !code.is_empty() && !message.is_empty() => format!("{}: {}", code, message),
        Some(code) if !code.is_empty() => code.to_string(),
        _ => message.to_string(),
    }
}
