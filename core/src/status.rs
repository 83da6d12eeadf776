/// MeshMS domain status codes and their mapping onto HTTP results
use serde::Serialize;
use std::fmt;
use http::StatusCode;
use tracing::error;

/// Outcome reported by the message store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshmsStatus {
    Error,
    Ok,
    Updated,
    /// Identity is not unlocked in the keyring.
    SidLocked,
    ProtocolFault,
}

impl MeshmsStatus {
    /// Wire value carried in the `meshms_status_code` annotation.
    pub fn code(self) -> i32 {
        match self {
            MeshmsStatus::Error => -1,
            MeshmsStatus::Ok => 0,
            MeshmsStatus::Updated => 1,
            MeshmsStatus::SidLocked => 2,
            MeshmsStatus::ProtocolFault => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(MeshmsStatus::Error),
            0 => Some(MeshmsStatus::Ok),
            1 => Some(MeshmsStatus::Updated),
            2 => Some(MeshmsStatus::SidLocked),
            3 => Some(MeshmsStatus::ProtocolFault),
            _ => None,
        }
    }

    /// Anything other than OK or UPDATED ends the operation.
    pub fn is_failed(self) -> bool {
        !matches!(self, MeshmsStatus::Ok | MeshmsStatus::Updated)
    }
}

impl fmt::Display for MeshmsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeshmsStatus::Error => "ERROR",
            MeshmsStatus::Ok => "OK",
            MeshmsStatus::Updated => "UPDATED",
            MeshmsStatus::SidLocked => "SID_LOCKED",
            MeshmsStatus::ProtocolFault => "PROTOCOL_FAULT",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// A complete, non-generated HTTP result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshmsResponse {
    pub http_status: StatusCode,
    pub message: String,
    /// Domain status annotation; `None` for failures that never reached the store.
    pub meshms_status_code: Option<i32>,
}

#[derive(Serialize)]
struct ResponseBody<'a> {
    http_status_code: u16,
    http_status_message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    meshms_status_code: Option<i32>,
}

impl MeshmsResponse {
    pub fn plain(http_status: StatusCode, message: &str) -> Self {
        Self {
            http_status,
            message: message.to_string(),
            meshms_status_code: None,
        }
    }

    pub fn from_status(
        status: MeshmsStatus,
        http_status: Option<StatusCode>,
        message: Option<&str>,
    ) -> Self {
        map_status(status.code(), http_status, message)
    }

    /// JSON body: `{"http_status_code":N,"http_status_message":"...","meshms_status_code":N}`
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&ResponseBody {
            http_status_code: self.http_status.as_u16(),
            http_status_message: &self.message,
            meshms_status_code: self.meshms_status_code,
        })
    }
}

/// Translate a raw domain status code into an HTTP result, filling in
/// defaults for whatever the caller did not override.
pub fn map_status(
    code: i32,
    http_status: Option<StatusCode>,
    message: Option<&str>,
) -> MeshmsResponse {
    let (default_status, default_message) = match MeshmsStatus::from_code(code) {
        Some(MeshmsStatus::Ok) => (StatusCode::OK, "OK"),
        Some(MeshmsStatus::Updated) => (StatusCode::CREATED, "Updated"),
        Some(MeshmsStatus::SidLocked) => (StatusCode::FORBIDDEN, "Identity unknown"),
        Some(MeshmsStatus::ProtocolFault) => (StatusCode::FORBIDDEN, "MeshMS protocol fault"),
        Some(MeshmsStatus::Error) => (StatusCode::INTERNAL_SERVER_ERROR, ""),
        None => {
            error!("Invalid MeshMS status code {}", code);
            return MeshmsResponse {
                http_status: StatusCode::INTERNAL_SERVER_ERROR,
                message: message.unwrap_or_default().to_string(),
                meshms_status_code: Some(code),
            };
        }
    };
    MeshmsResponse {
        http_status: http_status.unwrap_or(default_status),
        message: message.unwrap_or(default_message).to_string(),
        meshms_status_code: Some(code),
    }
}
