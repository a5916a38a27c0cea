//! Wire format for the Gemini Live `BidiGenerateContent` stream.
//!
//! Outbound envelopes are serialized in camelCase. Inbound messages are
//! accepted in either camelCase or snake_case and normalized into
//! [`InboundEvent`] values before any other component sees them.

use base64::Engine;
use embody_core::generic_types::{InboundEvent, Modality, OutboundEnvelope, PendingToolCall};
use serde_json::Value;
use tracing::{debug, warn};

pub const AUDIO_PCM_MIME_PREFIX: &str = "audio/pcm";
pub const IMAGE_JPEG_MIME: &str = "image/jpeg";

// --- Local Gemini Realtime Types (for encapsulation) ---
mod gemini_realtime_types {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) enum ClientMessage {
        Setup(BidiGenerateContentSetup),
        ClientContent(BidiGenerateContentClientContent),
        RealtimeInput(BidiGenerateContentRealtimeInput),
        ToolResponse(BidiGenerateContentToolResponse),
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct BidiGenerateContentSetup {
        pub model: String,
        pub generation_config: GenerationConfig,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub system_instruction: Option<Content>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub tools: Vec<Tool>,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GenerationConfig {
        pub response_modalities: Vec<ResponseModality>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub speech_config: Option<SpeechConfig>,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub(super) enum ResponseModality {
        Text,
        Audio,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct SpeechConfig {
        pub voice_config: VoiceConfig,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct VoiceConfig {
        pub prebuilt_voice_config: PrebuiltVoiceConfig,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct PrebuiltVoiceConfig {
        pub voice_name: String,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Tool {
        pub function_declarations: Vec<Value>,
    }
    #[derive(Serialize)]
    pub(super) struct Content {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub role: Option<String>,
        pub parts: Vec<Part>,
    }
    #[derive(Serialize)]
    pub(super) struct Part {
        pub text: String,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct BidiGenerateContentClientContent {
        pub turns: Vec<Content>,
        pub turn_complete: bool,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct BidiGenerateContentRealtimeInput {
        pub media_chunks: Vec<Blob>,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Blob {
        pub mime_type: String,
        pub data: String,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct BidiGenerateContentToolResponse {
        pub function_responses: Vec<FunctionResponse>,
    }
    #[derive(Serialize)]
    pub(super) struct FunctionResponse {
        pub id: String,
        pub name: String,
        pub response: Value,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerMessage {
        #[serde(alias = "setup_complete")]
        pub setup_complete: Option<Value>,
        #[serde(alias = "server_content")]
        pub server_content: Option<LiveServerContent>,
        #[serde(alias = "tool_call")]
        pub tool_call: Option<LiveToolCall>,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct LiveServerContent {
        #[serde(alias = "model_turn")]
        pub model_turn: Option<ServerContentTurn>,
        pub interrupted: Option<bool>,
        #[serde(alias = "turn_complete")]
        pub turn_complete: Option<bool>,
    }
    #[derive(Deserialize, Debug)]
    pub(super) struct ServerContentTurn {
        #[serde(default)]
        pub parts: Vec<ServerPart>,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerPart {
        pub text: Option<String>,
        #[serde(alias = "inline_data")]
        pub inline_data: Option<ServerBlob>,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerBlob {
        #[serde(alias = "mime_type", default)]
        pub mime_type: String,
        pub data: String,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct LiveToolCall {
        #[serde(alias = "function_calls", default)]
        pub function_calls: Vec<FunctionCall>,
    }
    #[derive(Deserialize, Debug)]
    pub(super) struct FunctionCall {
        pub id: Option<String>,
        pub name: String,
        pub args: Option<Value>,
    }
}

use gemini_realtime_types as wire;

fn user_content(text: String) -> wire::Content {
    wire::Content {
        role: Some("user".to_string()),
        parts: vec![wire::Part { text }],
    }
}

fn media_chunk(mime_type: String, bytes: &[u8]) -> wire::ClientMessage {
    wire::ClientMessage::RealtimeInput(wire::BidiGenerateContentRealtimeInput {
        media_chunks: vec![wire::Blob {
            mime_type,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }],
    })
}

/// Serializes an envelope into one text frame.
pub fn encode_envelope(envelope: &OutboundEnvelope) -> serde_json::Result<String> {
    let message = match envelope {
        OutboundEnvelope::Setup(config) => {
            wire::ClientMessage::Setup(wire::BidiGenerateContentSetup {
                model: config.model.clone(),
                generation_config: wire::GenerationConfig {
                    response_modalities: config
                        .response_modalities
                        .iter()
                        .map(|m| match m {
                            Modality::Text => wire::ResponseModality::Text,
                            Modality::Audio => wire::ResponseModality::Audio,
                        })
                        .collect(),
                    speech_config: config.voice_name.clone().map(|voice_name| wire::SpeechConfig {
                        voice_config: wire::VoiceConfig {
                            prebuilt_voice_config: wire::PrebuiltVoiceConfig { voice_name },
                        },
                    }),
                },
                system_instruction: config.system_instruction.clone().map(|text| wire::Content {
                    role: None,
                    parts: vec![wire::Part { text }],
                }),
                tools: if config.tools.is_empty() {
                    Vec::new()
                } else {
                    vec![wire::Tool {
                        function_declarations: config.tools.clone(),
                    }]
                },
            })
        }
        OutboundEnvelope::UserTurn {
            text,
            turn_complete,
        } => wire::ClientMessage::ClientContent(wire::BidiGenerateContentClientContent {
            turns: vec![user_content(text.clone())],
            turn_complete: *turn_complete,
        }),
        OutboundEnvelope::AudioChunk { pcm, sample_rate } => {
            media_chunk(format!("{AUDIO_PCM_MIME_PREFIX};rate={sample_rate}"), pcm)
        }
        OutboundEnvelope::ImageFrame { jpeg } => media_chunk(IMAGE_JPEG_MIME.to_string(), jpeg),
        OutboundEnvelope::ToolResponse(response) => {
            wire::ClientMessage::ToolResponse(wire::BidiGenerateContentToolResponse {
                function_responses: vec![wire::FunctionResponse {
                    id: response.call_id.clone(),
                    name: response.name.clone(),
                    response: response.payload(),
                }],
            })
        }
    };
    serde_json::to_string(&message)
}

/// Extracts `N` from a MIME type such as `audio/pcm;rate=N`. A zero rate is
/// treated as absent.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

/// Decodes one server frame into zero or more events, in wire order.
pub fn decode_server_message(text: &str) -> serde_json::Result<Vec<InboundEvent>> {
    let message: wire::ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(InboundEvent::SetupAcknowledged);
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text {
                    if !text.is_empty() {
                        events.push(InboundEvent::TextDelta(text));
                    }
                }
                if let Some(blob) = part.inline_data {
                    if !blob.mime_type.is_empty() && !blob.mime_type.starts_with("audio/") {
                        debug!(mime_type = %blob.mime_type, "Ignoring non-audio inline data");
                        continue;
                    }
                    match base64::engine::general_purpose::STANDARD.decode(&blob.data) {
                        Ok(pcm) => events.push(InboundEvent::AudioDelta {
                            pcm,
                            sample_rate: parse_pcm_rate(&blob.mime_type),
                        }),
                        Err(e) => warn!(error = %e, "Dropping audio part with invalid base64"),
                    }
                }
            }
        }
        if content.interrupted == Some(true) {
            events.push(InboundEvent::TurnInterrupted);
        }
        if content.turn_complete == Some(true) {
            events.push(InboundEvent::TurnComplete);
        }
    }

    if let Some(tool_call) = message.tool_call {
        for (index, call) in tool_call.function_calls.into_iter().enumerate() {
            let call_id = call
                .id
                .unwrap_or_else(|| format!("{}-{}", call.name, index));
            events.push(InboundEvent::ToolCallRequest(PendingToolCall {
                call_id,
                name: call.name,
                raw_arguments: call.args.unwrap_or_else(|| Value::Object(Default::default())),
            }));
        }
    }

    Ok(events)
}
