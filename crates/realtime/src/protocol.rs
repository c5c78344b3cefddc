//! Wire-level event types for the realtime speech service.
//!
//! Only the subset of the protocol the session manager actually speaks is
//! modelled; inbound events outside that subset deserialize into
//! [`ServerEvent::Unknown`] and are ignored by the receive pipeline.

use serde::{Deserialize, Serialize};

use crate::config::{SessionConfig, TRANSCRIPTION_MODEL};

/// Error code the service returns when a response is already in flight.
/// Idempotent from our point of view, so the receive pipeline suppresses it.
pub const ERR_ACTIVE_RESPONSE: &str = "conversation_already_has_active_response";

/// Events sent from this client to the service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseSpec },
}

impl ClientEvent {
    /// Builds the configuration event sent at session start and on live
    /// parameter updates.
    ///
    /// Automatic response creation is disabled: the client decides when a
    /// response is generated, after the caller has had the chance to merge
    /// retrieval context into the instructions.
    pub fn session_update(config: &SessionConfig) -> Self {
        Self::SessionUpdate {
            session: SessionUpdate {
                model: config.model.clone(),
                instructions: config.instructions.clone(),
                modalities: modalities(),
                voice: config.voice.clone(),
                input_audio_format: PCM16.to_string(),
                output_audio_format: PCM16.to_string(),
                turn_detection: TurnDetection {
                    kind: "server_vad".to_string(),
                    threshold: config.vad_threshold(),
                    silence_duration_ms: config.vad_silence_ms(),
                    create_response: false,
                },
                input_audio_transcription: InputAudioTranscription {
                    model: TRANSCRIPTION_MODEL.to_string(),
                },
            },
        }
    }

    /// Builds an append event for one base64-encoded PCM16 frame.
    pub fn audio_append(audio: String) -> Self {
        Self::InputAudioBufferAppend { audio }
    }

    /// Builds the user-message item for a typed text submission.
    pub fn user_message(text: String) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem {
                kind: "message".to_string(),
                role: "user".to_string(),
                content: vec![ContentPart {
                    kind: "input_text".to_string(),
                    text,
                }],
            },
        }
    }

    /// Asks the service to generate an audio+text response for the current
    /// conversation.
    pub fn response_create() -> Self {
        Self::ResponseCreate {
            response: ResponseSpec {
                modalities: modalities(),
            },
        }
    }
}

const PCM16: &str = "pcm16";

fn modalities() -> Vec<String> {
    vec!["audio".to_string(), "text".to_string()]
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionUpdate {
    pub model: String,
    pub instructions: String,
    pub modalities: Vec<String>,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: TurnDetection,
    pub input_audio_transcription: InputAudioTranscription,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseSpec {
    pub modalities: Vec<String>,
}

/// Events received from the service.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        delta: Option<String>,
    },
    #[serde(rename = "response.audio.done")]
    AudioDone,
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        delta: Option<String>,
    },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        transcript: Option<String>,
    },
    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        delta: Option<String>,
    },
    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted {
        #[serde(default)]
        transcript: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorDetail,
    },
    /// Any event kind this client does not handle.
    #[serde(other)]
    Unknown,
}

/// Payload of an inbound `error` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorDetail {
    /// Human-readable description for the error notification.
    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (Some(code), None) => code.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) => "unknown server error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_serializes_expected_fields() {
        let config = SessionConfig::default();
        let event = ClientEvent::session_update(&config);
        let json = serde_json::to_value(&event).expect("serialize");

        assert_eq!(json["type"], "session.update");
        let session = &json["session"];
        assert_eq!(session["voice"], "alloy");
        assert_eq!(session["input_audio_format"], "pcm16");
        assert_eq!(session["output_audio_format"], "pcm16");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["turn_detection"]["create_response"], false);
        assert_eq!(session["turn_detection"]["silence_duration_ms"], 1600);
        assert_eq!(
            session["input_audio_transcription"]["model"],
            TRANSCRIPTION_MODEL
        );
    }

    #[test]
    fn user_message_pairs_with_response_create() {
        let item = ClientEvent::user_message("hello".to_string());
        let json = serde_json::to_value(&item).expect("serialize");
        assert_eq!(json["type"], "conversation.item.create");
        assert_eq!(json["item"]["role"], "user");
        assert_eq!(json["item"]["content"][0]["type"], "input_text");
        assert_eq!(json["item"]["content"][0]["text"], "hello");

        let response = ClientEvent::response_create();
        let json = serde_json::to_value(&response).expect("serialize");
        assert_eq!(json["type"], "response.create");
        assert_eq!(json["response"]["modalities"][0], "audio");
    }

    #[test]
    fn deserializes_known_server_events() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"response.audio.delta","delta":"AAA="}"#)
                .expect("parse");
        match event {
            ServerEvent::AudioDelta { delta } => assert_eq!(delta.as_deref(), Some("AAA=")),
            other => panic!("unexpected event: {other:?}"),
        }

        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"response.text.done","event_id":"ev_1","text":"done"}"#,
        )
        .expect("parse");
        match event {
            ServerEvent::TextDone { text } => assert_eq!(text.as_deref(), Some("done")),
            other => panic!("unexpected event: {other:?}"),
        }

        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"error","error":{"code":"conversation_already_has_active_response"}}"#,
        )
        .expect("parse");
        match event {
            ServerEvent::Error { error } => {
                assert_eq!(error.code.as_deref(), Some(ERR_ACTIVE_RESPONSE));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_kinds_fall_through() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"session.created","session":{}}"#).expect("parse");
        assert!(matches!(event, ServerEvent::Unknown));
    }
}
