// src/error.rs
use reqwest::header::InvalidHeaderValue;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    #[error("Unsupported query shape: {0}")]
    UnsupportedQueryShape(String),

    #[error("HTTP request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Parse server error (code {code}): {message}")]
    ServerError { code: i64, message: String },

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid session token: {0}")]
    InvalidSessionToken(String),

    #[error("Master key required: {0}")]
    MasterKeyRequired(String),

    #[error("Save conflict: {0}")]
    Conflict(String),

    #[error("URL parsing failed: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON processing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("JSON deserialization failed: {0}")]
    JsonDeserializationFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid class name: {0}")]
    InvalidClassName(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(InvalidHeaderValue),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ParseError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ParseError::WebSocketError(err.to_string())
    }
}

impl ParseError {
    /// Creates a `ParseError` from an HTTP status code and a JSON response body.
    pub(crate) fn from_response(status_code: u16, response_body: Value) -> Self {
        let error_code = response_body
            .get("code")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let error_message = response_body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error")
            .to_string();

        match error_code {
            100 => ParseError::ConnectionFailed(format!("({}) {}", error_code, error_message)),
            101 => ParseError::ObjectNotFound(format!("({}) {}", error_code, error_message)),
            119 => ParseError::MasterKeyRequired(format!("({}) {}", error_code, error_message)),
            209 => ParseError::InvalidSessionToken(format!("({}) {}", error_code, error_message)),
            _ => match status_code {
                404 => ParseError::ObjectNotFound(format!(
                    "Not found (HTTP {}): ({}) {}",
                    status_code, error_code, error_message
                )),
                409 => ParseError::Conflict(format!("({}) {}", error_code, error_message)),
                _ => ParseError::ServerError {
                    code: if error_code == 0 {
                        status_code as i64
                    } else {
                        error_code
                    },
                    message: error_message,
                },
            },
        }
    }

    /// True for failures of the underlying connection rather than of the request itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ParseError::ReqwestError(_)
                | ParseError::WebSocketError(_)
                | ParseError::Timeout(_)
                | ParseError::ConnectionFailed(_)
        )
    }

    /// The Parse error code carried by server-originated errors.
    pub fn code(&self) -> Option<i64> {
        match self {
            ParseError::ServerError { code, .. } => Some(*code),
            ParseError::ObjectNotFound(_) => Some(101),
            ParseError::MasterKeyRequired(_) => Some(119),
            ParseError::InvalidSessionToken(_) => Some(209),
            _ => None,
        }
    }
}
