//! Session client for the Gemini Live bidirectional streaming API.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{LiveClient, SessionState};
pub use error::SessionError;

/// Default Live API websocket endpoint; the API key is appended as `?key=`.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Builds the websocket URL for `endpoint` with `api_key` attached.
pub fn endpoint_url(endpoint: &str, api_key: &str) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{separator}key={api_key}")
}
