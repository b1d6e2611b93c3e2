use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Unknown message type: {0}")]
    UnknownKind(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid fragment: {0}")]
    InvalidFragment(String),

    #[error("Invalid content: {0}")]
    InvalidContent(String),
}
