//! Defines the JSON event vocabulary carried over the session data channel.
//!
//! Control messages flow engine → agent ([`ClientEvent`]); protocol events
//! flow agent → engine ([`ServerEvent`]). Both sides are internally tagged on
//! `type`; unknown inbound event types fail to parse and are logged and
//! ignored by the dispatcher.

use crate::config::TurnDetectionTunables;
use serde::{Deserialize, Serialize};

/// Control messages sent from the engine to the agent.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "conversation.item.delete")]
    ConversationItemDelete { item_id: String },
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseParams>,
    },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
}

/// Session configuration pushed with `session.update`.
///
/// `turn_detection` is doubly optional: `None` omits the field entirely,
/// `Some(None)` serializes an explicit `null` to disable server-side turn
/// detection.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<Option<TurnDetection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
}

impl SessionUpdate {
    /// The update sent on every language-policy application.
    pub fn language_policy(
        instructions: String,
        voice: String,
        turn_detection: &TurnDetectionTunables,
        transcription_model: String,
        transcription_language: String,
    ) -> Self {
        Self {
            instructions: Some(instructions),
            voice: Some(voice),
            turn_detection: Some(Some(TurnDetection::ServerVad {
                threshold: turn_detection.threshold,
                prefix_padding_ms: turn_detection.prefix_padding_ms,
                silence_duration_ms: turn_detection.silence_duration_ms,
            })),
            input_audio_transcription: Some(TranscriptionConfig {
                model: transcription_model,
                language: Some(transcription_language),
            }),
            output_audio_format: Some("pcm16".to_string()),
        }
    }

    /// The best-effort update sent during teardown.
    pub fn disable_turn_detection() -> Self {
        Self {
            turn_detection: Some(None),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TranscriptionConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A conversation item injected with `conversation.item.create`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ItemContent>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ItemContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ConversationItem {
    pub fn system_text(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            role: "system".to_string(),
            content: vec![ItemContent {
                kind: "input_text".to_string(),
                text: text.into(),
            }],
        }
    }
}

/// Optional parameters for `response.create`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResponseParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ResponseParams {
    /// Marks a response as a replay so its events bypass the primary
    /// transcript bookkeeping.
    pub fn replay() -> Self {
        Self {
            instructions: None,
            metadata: Some(ResponseMetadata {
                kind: Some("replay".to_string()),
            }),
        }
    }
}

/// Events received from the agent over the data channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseHead },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { response_id: String, delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        response_id: String,
        transcript: String,
    },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { response_id: String, delta: String },
    #[serde(rename = "response.output_text.done")]
    OutputTextDone { response_id: String, text: String },
    #[serde(rename = "response.text.delta")]
    TextDelta { response_id: String, delta: String },
    #[serde(rename = "response.text.done")]
    TextDone { response_id: String, text: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { item_id: String, transcript: String },
    #[serde(rename = "response.completed")]
    ResponseCompleted { response: ResponseHead },
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseHead },
    #[serde(rename = "response.canceled")]
    ResponseCanceled { response: ResponseHead },
    #[serde(rename = "error")]
    Error { error: ErrorPayload },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseHead {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

impl ResponseHead {
    pub fn is_replay(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.kind.as_deref())
            .is_some_and(|kind| kind == "replay")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn response_cancel_is_bare_tag() {
        let json = serde_json::to_string(&ClientEvent::ResponseCancel).unwrap();
        assert_eq!(json, r#"{"type":"response.cancel"}"#);
    }

    #[test]
    fn session_update_serializes_server_vad() {
        let update = SessionUpdate::language_policy(
            "speak spanish".into(),
            "alloy".into(),
            &TurnDetectionTunables::default(),
            "whisper-1".into(),
            "es".into(),
        );
        let value = serde_json::to_value(ClientEvent::SessionUpdate { session: update }).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["turn_detection"]["silence_duration_ms"], 700);
        assert_eq!(value["session"]["turn_detection"]["prefix_padding_ms"], 200);
        assert_eq!(value["session"]["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(value["session"]["output_audio_format"], "pcm16");
    }

    #[test]
    fn disabled_turn_detection_serializes_null() {
        let value = serde_json::to_value(ClientEvent::SessionUpdate {
            session: SessionUpdate::disable_turn_detection(),
        })
        .unwrap();
        assert_eq!(value["session"]["turn_detection"], Value::Null);
        // Unset fields are omitted entirely.
        assert!(value["session"].get("voice").is_none());
    }

    #[test]
    fn replay_params_tag_metadata() {
        let value = serde_json::to_value(ClientEvent::ResponseCreate {
            response: Some(ResponseParams::replay()),
        })
        .unwrap();
        assert_eq!(value["response"]["metadata"]["kind"], "replay");
    }

    #[test]
    fn parses_response_created_with_metadata() {
        let raw = r#"{"type":"response.created","response":{"id":"resp_1","metadata":{"kind":"replay"}}}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::ResponseCreated { response } => {
                assert_eq!(response.id, "resp_1");
                assert!(response.is_replay());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_delta_and_done_variants() {
        let delta: ServerEvent = serde_json::from_str(
            r#"{"type":"response.audio_transcript.delta","response_id":"r","delta":"Ho"}"#,
        )
        .unwrap();
        assert!(matches!(delta, ServerEvent::AudioTranscriptDelta { .. }));

        let done: ServerEvent = serde_json::from_str(
            r#"{"type":"response.output_text.done","response_id":"r","text":"Hola"}"#,
        )
        .unwrap();
        assert!(matches!(done, ServerEvent::OutputTextDone { .. }));
    }

    #[test]
    fn parses_transcription_completed() {
        let raw = json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": "item_9",
            "transcript": "hola, ¿qué tal?",
            "content_index": 0
        })
        .to_string();
        let event: ServerEvent = serde_json::from_str(&raw).unwrap();
        match event {
            ServerEvent::InputTranscriptionCompleted { item_id, transcript } => {
                assert_eq!(item_id, "item_9");
                assert_eq!(transcript, "hola, ¿qué tal?");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_fails_to_parse() {
        let raw = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        assert!(serde_json::from_str::<ServerEvent>(raw).is_err());
    }

    #[test]
    fn error_event_parses_without_code() {
        let raw = r#"{"type":"error","error":{"message":"no active response"}}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        match event {
            ServerEvent::Error { error } => {
                assert_eq!(error.message, "no active response");
                assert!(error.code.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
