/// Error types for the MeshMS RESTful interface
use crate::send_message::FormError;
use crate::status::{MeshmsResponse, MeshmsStatus};
use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshmsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("{0}")]
    Forbidden(String),

    #[error("Invalid MeshMS token")]
    InvalidToken,

    #[error("{0}")]
    Form(#[from] FormError),

    #[error("MeshMS status: {0}")]
    Status(MeshmsStatus),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl MeshmsError {
    /// Map this error onto the HTTP result it is reported as.
    pub fn to_response(&self) -> MeshmsResponse {
        match self {
            MeshmsError::NotFound(msg) => MeshmsResponse::plain(StatusCode::NOT_FOUND, msg),
            MeshmsError::InvalidToken => MeshmsResponse::plain(StatusCode::NOT_FOUND, "Not found"),
            MeshmsError::MethodNotAllowed => {
                MeshmsResponse::plain(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
            }
            MeshmsError::Forbidden(msg) => MeshmsResponse::plain(StatusCode::FORBIDDEN, msg),
            MeshmsError::Form(e) => MeshmsResponse::plain(StatusCode::BAD_REQUEST, &e.to_string()),
            MeshmsError::Status(status) => MeshmsResponse::from_status(*status, None, None),
            other => MeshmsResponse::plain(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string()),
        }
    }
}

impl From<MeshmsStatus> for MeshmsError {
    fn from(status: MeshmsStatus) -> Self {
        MeshmsError::Status(status)
    }
}

impl From<sled::Error> for MeshmsError {
    fn from(e: sled::Error) -> Self {
        MeshmsError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshmsError>;
