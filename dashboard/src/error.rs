use thiserror::Error;

/// The telemetry stream could not be established or was lost.
///
/// Never fatal: it is surfaced to consumers as a liveness change.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid stream url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("connection dropped: {0}")]
    Dropped(String),
    #[error("connection closed by server")]
    ClosedByPeer,
}

/// A stream message that could not be read as a push envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("telemetry payload invalid: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("telemetry message has no device_id")]
    MissingDeviceId,
    #[error("telemetry message has no data")]
    MissingData,
    #[error("binary frame is not utf-8")]
    NotUtf8,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("credential rejected with status {status}")]
    Unauthorized { status: u16 },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("unexpected response body: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CommandSendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("credential rejected with status {status}")]
    Unauthorized { status: u16 },
    #[error("backend refused {cmd} with status {status}")]
    Rejected { cmd: String, status: u16 },
}

impl FetchError {
    /// The external auth collaborator should end the session on this.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, FetchError::Unauthorized { .. })
    }
}

impl CommandSendError {
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, CommandSendError::Unauthorized { .. })
    }
}

pub(crate) fn is_auth_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
}
