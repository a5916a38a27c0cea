//! Provider-agnostic envelope and event types shared by every component.
//!
//! The session client translates these to and from a concrete wire format;
//! nothing in here knows about websockets or JSON field spellings.

use serde_json::{Value, json};

/// Output modalities the remote model may be asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Audio,
}

/// Generic configuration for initializing a real-time session with any provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfig {
    /// Model identity, e.g. `models/gemini-2.0-flash-live-001`.
    pub model: String,
    pub response_modalities: Vec<Modality>,
    /// Prebuilt voice name used for synthesized speech.
    pub voice_name: Option<String>,
    /// Persona / system instruction text, assembled by the host.
    pub system_instruction: Option<String>,
    /// Compiled function declarations from the tool registry.
    pub tools: Vec<Value>,
}

/// A message unit sent to the remote model. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEnvelope {
    Setup(SessionConfig),
    /// A text turn from the user side of the conversation.
    UserTurn { text: String, turn_complete: bool },
    /// Little-endian PCM16 audio at `sample_rate`.
    AudioChunk { pcm: Vec<u8>, sample_rate: u32 },
    /// A compressed still frame (JPEG).
    ImageFrame { jpeg: Vec<u8> },
    ToolResponse(ToolResponse),
}

impl OutboundEnvelope {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEnvelope::Setup(_) => "setup",
            OutboundEnvelope::UserTurn { .. } => "client_content",
            OutboundEnvelope::AudioChunk { .. } => "realtime_input/audio",
            OutboundEnvelope::ImageFrame { .. } => "realtime_input/image",
            OutboundEnvelope::ToolResponse(_) => "tool_response",
        }
    }

    pub fn is_setup(&self) -> bool {
        matches!(self, OutboundEnvelope::Setup(_))
    }
}

/// Events decoded from the remote side, normalized from any wire spelling.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SetupAcknowledged,
    TextDelta(String),
    /// Little-endian PCM16 audio. `sample_rate` comes from the MIME type when present.
    AudioDelta { pcm: Vec<u8>, sample_rate: Option<u32> },
    ToolCallRequest(PendingToolCall),
    /// The remote side stopped generating because the user barged in.
    TurnInterrupted,
    /// The model finished its turn.
    TurnComplete,
    ConnectionClosed { reason: String },
}

/// Open correlation state between a tool-call request and its response.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub call_id: String,
    pub name: String,
    pub raw_arguments: Value,
}

/// The single answer to a `PendingToolCall`, correlated by `call_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub call_id: String,
    pub name: String,
    pub outcome: Result<Value, String>,
}

impl ToolResponse {
    pub fn success(call: &PendingToolCall, result: Value) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            outcome: Ok(result),
        }
    }

    pub fn error(call: &PendingToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            outcome: Err(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The response document sent back to the model.
    pub fn payload(&self) -> Value {
        match &self.outcome {
            Ok(result) => json!({ "status": "success", "result": result }),
            Err(message) => json!({ "status": "error", "error": message }),
        }
    }
}

/// What happened to an envelope handed to a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the transport.
    Sent,
    /// Discarded because the session was not ready for it.
    Dropped,
}
