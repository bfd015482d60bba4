//! Wire messages exchanged with the realtime AI provider.
//!
//! The provider's message shapes are structurally dynamic JSON; everything
//! the bridge consumes is modeled as a sum type tagged by the `type` field
//! with an `Unknown` fall-through that is logged and dropped rather than
//! failing the session.

use serde::{Deserialize, Serialize};

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.3,
            prefix_padding_ms: 200,
            silence_duration_ms: 400,
        }
    }
}

/// A function tool exposed to the AI.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".to_string(),
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// The `session.update` payload sent on every (re)connect.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: TurnDetection,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
}

impl SessionConfig {
    /// Bridge defaults: G.711 μ-law both ways so SIP audio passes through
    /// untranscoded, plus the call-control tools.
    pub fn new(instructions: &str, voice: &str) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: instructions.to_string(),
            voice: voice.to_string(),
            input_audio_format: "g711_ulaw".to_string(),
            output_audio_format: "g711_ulaw".to_string(),
            turn_detection: TurnDetection::default(),
            tools: vec![
                ToolDefinition::function(
                    "transfer_call",
                    "Transfer the caller to another extension",
                    serde_json::json!({
                        "type": "object",
                        "properties": {
                            "extension": { "type": "string" }
                        },
                        "required": ["extension"]
                    }),
                ),
                ToolDefinition::function(
                    "end_call",
                    "Hang up the current call",
                    serde_json::json!({ "type": "object", "properties": {} }),
                ),
            ],
            temperature: 0.8,
            max_response_output_tokens: 4096,
        }
    }

    /// Switches both directions to 16-bit linear PCM for wideband peers.
    pub fn with_pcm16(mut self) -> Self {
        self.input_audio_format = "pcm16".to_string();
        self.output_audio_format = "pcm16".to_string();
        self
    }
}

/// Part of a conversation item.
#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// A conversation item (used for the welcome prompt).
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    pub fn user_text(text: &str) -> Self {
        Self {
            kind: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: text.to_string(),
            }],
        }
    }
}

/// Messages the bridge sends to the provider.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

/// Session metadata echoed by the provider.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionMeta {
    #[serde(default)]
    pub id: Option<String>,
}

/// Error payload from the provider.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorInfo {
    /// Session-invalidating errors are fatal for the owning call; everything
    /// else is logged and the session continues.
    pub fn is_fatal(&self) -> bool {
        self.code
            .as_deref()
            .map(|c| c.contains("session"))
            .unwrap_or(false)
    }
}

/// Messages the provider sends to the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionMeta },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionMeta },
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,
    #[serde(rename = "response.text.delta")]
    ResponseTextDelta { delta: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        call_id: Option<String>,
        arguments: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error { error: ErrorInfo },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_serializes_with_dotted_type() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig::new("You are a helpful receptionist.", "alloy"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["voice"], "alloy");
        assert_eq!(json["session"]["input_audio_format"], "g711_ulaw");
        assert_eq!(json["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(json["session"]["tools"][0]["name"], "transfer_call");
    }

    #[test]
    fn append_event_carries_audio_inline() {
        let event = ClientEvent::InputAudioBufferAppend {
            audio: "AAAA".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            "{\"type\":\"input_audio_buffer.append\",\"audio\":\"AAAA\"}"
        );
    }

    #[test]
    fn audio_delta_deserializes() {
        let raw = r#"{"type":"response.audio.delta","response_id":"r1","delta":"c29tZQ=="}"#;
        match serde_json::from_str::<ServerEvent>(raw).unwrap() {
            ServerEvent::ResponseAudioDelta { delta } => assert_eq!(delta, "c29tZQ=="),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn session_updated_extracts_id() {
        let raw = r#"{"type":"session.updated","session":{"id":"sess_42","voice":"alloy"}}"#;
        match serde_json::from_str::<ServerEvent>(raw).unwrap() {
            ServerEvent::SessionUpdated { session } => {
                assert_eq!(session.id.as_deref(), Some("sess_42"))
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn unrecognized_types_become_unknown() {
        let raw = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        assert!(matches!(
            serde_json::from_str::<ServerEvent>(raw).unwrap(),
            ServerEvent::Unknown
        ));
    }

    #[test]
    fn function_call_done_deserializes() {
        let raw = r#"{"type":"response.function_call_arguments.done","name":"end_call","call_id":"c1","arguments":"{}"}"#;
        match serde_json::from_str::<ServerEvent>(raw).unwrap() {
            ServerEvent::FunctionCallArgumentsDone { name, arguments, .. } => {
                assert_eq!(name.as_deref(), Some("end_call"));
                assert_eq!(arguments, "{}");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn error_fatality_depends_on_code() {
        let fatal = ErrorInfo {
            code: Some("session_expired".to_string()),
            message: None,
        };
        let benign = ErrorInfo {
            code: Some("rate_limit_exceeded".to_string()),
            message: None,
        };
        assert!(fatal.is_fatal());
        assert!(!benign.is_fatal());
    }
}
