use crate::client::SessionState;
use tokio_tungstenite::tungstenite;

/// Errors surfaced by the session client.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connect is only valid while disconnected (state: {0:?})")]
    InvalidState(SessionState),
    #[error("failed to open connection: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("timed out opening connection")]
    ConnectTimeout,
    #[error("timed out waiting for setup acknowledgement")]
    SetupTimeout,
    #[error("connection closed before setup completed")]
    ClosedDuringSetup,
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session was cancelled")]
    Cancelled,
}
