//! Error types for the push channel and the REST client.

use callwatch_core::ProtocolError;
use thiserror::Error;

/// Failures of the push channel and the commands sent over it.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No live push connection when a send was attempted.
    #[error("push transport unavailable: {0}")]
    TransportUnavailable(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("server refused connection: {0}")]
    ConnectRefused(String),

    #[error("no ping from server within {0}ms")]
    HeartbeatTimeout(u64),

    #[error("unexpected handshake: {0}")]
    Handshake(String),

    #[error("invalid channel url: {0}")]
    Url(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Failures of the authenticated REST client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The backend answered 401. The session has already been cleared.
    #[error("authorization lost")]
    AuthorizationLost,

    #[error("no session credential")]
    NoCredential,

    #[error("api error {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid api url: {0}")]
    Url(String),
}

impl ApiError {
    pub fn is_auth_lost(&self) -> bool {
        matches!(self, Self::AuthorizationLost)
    }
}
