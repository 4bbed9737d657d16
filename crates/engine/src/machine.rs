//! The protocol state machine: one typed dispatch function consuming
//! data-channel events, owning the response-id ↔ message-id table and the
//! session's per-response resources.

use crate::audio::AudioFrame;
use crate::clips::ClipStore;
use crate::config::Tunables;
use crate::goals::GoalEngine;
use crate::protocol::{ErrorPayload, ResponseHead, ServerEvent};
use crate::recorder::{self, RecorderHandle};
use crate::transcript::TranscriptAggregator;
use crate::translate::TranslationPipeline;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parla_core::settings::ConversationSettings;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// UI-facing session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

/// Error messages that are expected artifacts of cancel/idle-wait races and
/// are suppressed instead of surfaced.
const TRANSIENT_ERRORS: &[&str] = &["cancellation failed", "no active response"];

/// Idle flag plus waiter support: configuration changes await idleness,
/// bounded by a timeout.
pub struct IdleGate {
    tx: watch::Sender<bool>,
}

impl IdleGate {
    pub fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(true);
        Arc::new(Self { tx })
    }

    pub fn set(&self, idle: bool) {
        self.tx.send_replace(idle);
    }

    pub fn is_idle(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until idle or the timeout elapses. Returns whether idleness was
    /// reached; callers proceed regardless.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|idle| *idle))
            .await
            .is_ok()
    }
}

/// Snapshot of machine-owned resources, used to verify teardown.
#[derive(Debug, PartialEq, Eq)]
pub struct MachineResources {
    pub mappings: usize,
    pub replays: usize,
    pub recorders: usize,
}

pub struct StateMachine {
    tunables: Tunables,
    settings: Arc<RwLock<ConversationSettings>>,
    transcript: Arc<TranscriptAggregator>,
    clips: Arc<dyn ClipStore>,
    translations: Arc<TranslationPipeline>,
    goals: Arc<GoalEngine>,
    idle: Arc<IdleGate>,
    ui: Arc<watch::Sender<UiState>>,
    errors: Arc<watch::Sender<Option<String>>>,
    audio: broadcast::Sender<AudioFrame>,

    response_map: HashMap<String, Uuid>,
    replay_ids: HashSet<String>,
    recorders: HashMap<String, RecorderHandle>,
    current_response_started: Option<DateTime<Utc>>,
    last_user_transcript: Option<(String, DateTime<Utc>)>,
    surfaced_errors: HashSet<String>,
}

impl StateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tunables: Tunables,
        settings: Arc<RwLock<ConversationSettings>>,
        transcript: Arc<TranscriptAggregator>,
        clips: Arc<dyn ClipStore>,
        translations: Arc<TranslationPipeline>,
        goals: Arc<GoalEngine>,
        idle: Arc<IdleGate>,
        ui: Arc<watch::Sender<UiState>>,
        errors: Arc<watch::Sender<Option<String>>>,
        audio: broadcast::Sender<AudioFrame>,
    ) -> Self {
        Self {
            tunables,
            settings,
            transcript,
            clips,
            translations,
            goals,
            idle,
            ui,
            errors,
            audio,
            response_map: HashMap::new(),
            replay_ids: HashSet::new(),
            recorders: HashMap::new(),
            current_response_started: None,
            last_user_transcript: None,
            surfaced_errors: HashSet::new(),
        }
    }

    /// Parses and dispatches one raw data-channel payload. Malformed or
    /// unknown payloads are logged and ignored; the session continues.
    pub async fn dispatch(&mut self, raw: &str) {
        match serde_json::from_str::<ServerEvent>(raw) {
            Ok(event) => self.handle(event).await,
            Err(e) => debug!(error = %e, "ignoring unrecognized data-channel payload"),
        }
    }

    async fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ResponseCreated { response } => self.on_response_created(response).await,
            ServerEvent::AudioTranscriptDelta { response_id, delta }
            | ServerEvent::OutputTextDelta { response_id, delta }
            | ServerEvent::TextDelta { response_id, delta } => {
                self.on_delta(&response_id, &delta).await
            }
            ServerEvent::AudioTranscriptDone {
                response_id,
                transcript,
            } => self.on_done(&response_id, &transcript).await,
            ServerEvent::OutputTextDone { response_id, text }
            | ServerEvent::TextDone { response_id, text } => {
                self.on_done(&response_id, &text).await
            }
            ServerEvent::InputTranscriptionCompleted { transcript, .. } => {
                self.on_user_transcript(transcript).await
            }
            ServerEvent::ResponseCompleted { response }
            | ServerEvent::ResponseDone { response }
            | ServerEvent::ResponseCanceled { response } => self.on_terminal(&response.id).await,
            ServerEvent::Error { error } => self.on_error(error),
        }
    }

    async fn on_response_created(&mut self, response: ResponseHead) {
        self.recorders.retain(|_, handle| !handle.is_finished());

        // Replay responses never enter the primary mapping.
        if response.is_replay() {
            debug!(rid = %response.id, "tracking replay response");
            self.replay_ids.insert(response.id);
            return;
        }
        if self.response_map.contains_key(&response.id) {
            warn!(rid = %response.id, "duplicate response.created");
            return;
        }

        let message_id = Uuid::new_v4();
        let now = Utc::now();
        let lang = self.settings.read().await.target_lang.clone();
        self.transcript
            .insert_assistant(message_id, lang, now)
            .await;

        let handle = recorder::spawn(
            message_id,
            self.audio.subscribe(),
            self.clips.clone(),
            self.transcript.clone(),
            self.tunables.recorder.clone(),
        );
        self.recorders.insert(response.id.clone(), handle);
        self.response_map.insert(response.id, message_id);
        self.current_response_started = Some(now);
        self.idle.set(false);
        self.ui.send_replace(UiState::Speaking);
    }

    async fn on_delta(&mut self, response_id: &str, delta: &str) {
        if self.replay_ids.contains(response_id) {
            return;
        }
        let Some(&message_id) = self.response_map.get(response_id) else {
            debug!(rid = %response_id, "delta for unmapped response");
            return;
        };
        self.transcript.append_delta(message_id, delta).await;
        let settings = self.settings.read().await;
        let (source, target) = (settings.target_lang.clone(), settings.native_lang.clone());
        drop(settings);
        self.translations.schedule(message_id, source, target).await;
    }

    async fn on_done(&mut self, response_id: &str, text: &str) {
        if self.replay_ids.contains(response_id) {
            return;
        }
        let Some(&message_id) = self.response_map.get(response_id) else {
            debug!(rid = %response_id, "done for unmapped response");
            return;
        };
        self.transcript.finalize(message_id, Some(text)).await;
    }

    async fn on_user_transcript(&mut self, transcript: String) {
        let text = transcript.trim().to_string();
        if text.is_empty() {
            return;
        }

        // Identical text arriving within the duplicate window is an artifact
        // of overlapping transcription events, not a new turn.
        let now = Utc::now();
        let window = ChronoDuration::milliseconds(
            self.tunables.duplicate_transcript_window_ms as i64,
        );
        if let Some((previous, at)) = &self.last_user_transcript {
            if *previous == text && now - *at < window {
                debug!("suppressing duplicate user transcript");
                return;
            }
        }
        self.last_user_transcript = Some((text.clone(), now));

        // Back-date so the utterance renders before the reply it provoked,
        // even though this event usually arrives after response.created.
        let timestamp = self
            .current_response_started
            .map(|started| started - ChronoDuration::milliseconds(1))
            .unwrap_or(now);

        let settings = self.settings.read().await.clone();
        let message_id = Uuid::new_v4();
        self.transcript
            .insert_user(message_id, settings.target_lang.clone(), text.clone(), timestamp)
            .await;

        if *self.ui.borrow() == UiState::Listening {
            self.ui.send_replace(UiState::Thinking);
        }

        self.goals
            .on_user_turn(
                text,
                settings.target_lang,
                settings.pronunciation_practice,
            )
            .await;
    }

    async fn on_terminal(&mut self, response_id: &str) {
        if self.replay_ids.remove(response_id) {
            debug!(rid = %response_id, "replay response finished");
            return;
        }
        // The mapping is released on the first terminal event, so a duplicate
        // terminal for the same rid is a no-op.
        let Some(message_id) = self.response_map.remove(response_id) else {
            debug!(rid = %response_id, "terminal event for unmapped response");
            return;
        };

        self.transcript.finalize(message_id, None).await;
        // The recorder keeps draining the audio tail and stops itself via the
        // silence heuristic or the hard cap.

        let settings = self.settings.read().await.clone();
        self.translations
            .schedule(
                message_id,
                settings.target_lang.clone(),
                settings.native_lang.clone(),
            )
            .await;

        if let Some((utterance, _)) = self.last_user_transcript.clone() {
            self.goals
                .on_user_turn(
                    utterance,
                    settings.target_lang,
                    settings.pronunciation_practice,
                )
                .await;
        }

        self.current_response_started = None;
        self.idle.set(true);
        self.ui.send_replace(UiState::Idle);
    }

    fn on_error(&mut self, payload: ErrorPayload) {
        let lowered = payload.message.to_lowercase();
        if TRANSIENT_ERRORS.iter().any(|t| lowered.contains(t)) {
            debug!(message = %payload.message, "suppressing transient protocol error");
            return;
        }
        if self.surfaced_errors.insert(lowered) {
            error!(message = %payload.message, code = ?payload.code, "agent error");
            self.errors.send_replace(Some(payload.message));
        } else {
            debug!(message = %payload.message, "repeated agent error");
        }
    }

    /// Stops every recorder, aborts pending translation work, and empties all
    /// bookkeeping. Nothing owned by the machine survives this call.
    pub async fn clear(&mut self) {
        for (_, handle) in self.recorders.drain() {
            handle.stop().await;
        }
        self.response_map.clear();
        self.replay_ids.clear();
        self.current_response_started = None;
        self.last_user_transcript = None;
        self.surfaced_errors.clear();
        self.translations.clear().await;
        self.transcript.clear_buffers().await;
        self.goals.clear().await;
        self.idle.set(true);
        self.ui.send_replace(UiState::Idle);
    }

    pub fn resources(&self) -> MachineResources {
        MachineResources {
            mappings: self.response_map.len(),
            replays: self.replay_ids.len(),
            recorders: self.recorders.len(),
        }
    }
}
