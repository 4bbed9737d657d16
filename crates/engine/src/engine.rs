//! The engine facade: owns the collaborators, the shared settings, and the
//! single live session.

use crate::clips::{AudioClip, ClipStore, MemoryClipStore};
use crate::config::Config;
use crate::error::EngineError;
use crate::goals::{GoalEngine, MemoryProgressStore, ProgressStore};
use crate::machine::UiState;
use crate::media::{MicrophoneSource, PeerConnector};
use crate::profile::{MemoryProfileStore, ProfileStore};
use crate::session::{SessionConnector, SessionStatus};
use crate::signaling::{HttpSignalingClient, SignalingClient};
use crate::transcript::{Message, TranscriptAggregator};
use crate::translate::TranslationPipeline;
use parla_core::goal::{Goal, GoalEvaluator, GoalSeeder, LlmEvaluator, RotationSeeder};
use parla_core::responses::ResponsesClient;
use parla_core::settings::ConversationSettings;
use parla_core::translate::{LlmTranslator, Translator};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tracing::warn;
use uuid::Uuid;

/// How a replay request was satisfied.
#[derive(Debug)]
pub enum Replay {
    /// A cached clip exists; play it locally.
    Cached(AudioClip),
    /// No clip; the agent was asked to re-speak the line.
    Requested,
    /// No clip and no open session.
    Unavailable,
}

/// The engine's pluggable collaborators. [`Services::from_config`] wires the
/// LLM-backed defaults; tests substitute fakes field by field.
pub struct Services {
    pub translator: Arc<dyn Translator>,
    pub evaluator: Arc<dyn GoalEvaluator>,
    pub seeder: Arc<dyn GoalSeeder>,
    pub clips: Arc<dyn ClipStore>,
    pub profile: Arc<dyn ProfileStore>,
    pub progress: Arc<dyn ProgressStore>,
}

impl Services {
    pub fn from_config(config: &Config) -> Self {
        let backend = Arc::new(ResponsesClient::new(
            &config.responses_url,
            &config.api_key,
            &config.chat_model,
        ));
        Self {
            translator: Arc::new(LlmTranslator::new(backend.clone())),
            evaluator: Arc::new(LlmEvaluator::new(backend)),
            seeder: Arc::new(RotationSeeder::default()),
            clips: Arc::new(MemoryClipStore::new()),
            profile: Arc::new(MemoryProfileStore::new()),
            progress: Arc::new(MemoryProgressStore::new()),
        }
    }
}

/// One engine instance drives one conversation practice session at a time.
pub struct Engine {
    config: Config,
    settings: Arc<RwLock<ConversationSettings>>,
    transcript: Arc<TranscriptAggregator>,
    clips: Arc<dyn ClipStore>,
    profile: Arc<dyn ProfileStore>,
    goals: Arc<GoalEngine>,
    connector: Arc<SessionConnector>,
}

impl Engine {
    pub fn new(
        config: Config,
        services: Services,
        mic: Arc<dyn MicrophoneSource>,
        peers: Arc<dyn PeerConnector>,
    ) -> Self {
        let signaling: Arc<dyn SignalingClient> = Arc::new(HttpSignalingClient::new(
            &config.signaling_url,
            &config.realtime_model,
            &config.api_key,
        ));
        Self::with_signaling(config, services, mic, peers, signaling)
    }

    /// Full wiring with an explicit signaling client (tests use a fake).
    pub fn with_signaling(
        config: Config,
        services: Services,
        mic: Arc<dyn MicrophoneSource>,
        peers: Arc<dyn PeerConnector>,
        signaling: Arc<dyn SignalingClient>,
    ) -> Self {
        let settings = Arc::new(RwLock::new(ConversationSettings::default()));
        let transcript = TranscriptAggregator::new();
        let translations = TranslationPipeline::new(
            services.translator.clone(),
            transcript.clone(),
            config.tunables.translation_debounce_ms,
        );
        let goals = GoalEngine::new(
            services.evaluator.clone(),
            services.seeder.clone(),
            services.progress.clone(),
            config.tunables.xp.clone(),
        );
        let connector = SessionConnector::new(
            config.clone(),
            signaling,
            mic,
            peers,
            settings.clone(),
            transcript.clone(),
            services.clips.clone(),
            translations,
            goals.clone(),
        );
        Self {
            config,
            settings,
            transcript,
            clips: services.clips,
            profile: services.profile,
            goals,
            connector,
        }
    }

    /// Connects the session: loads persisted settings, seeds the first goal
    /// if none is active, establishes the peer, and optionally sends the
    /// opening turn.
    pub async fn start(&self) -> Result<(), EngineError> {
        match self.profile.load_settings().await {
            Ok(Some(saved)) => *self.settings.write().await = saved,
            Ok(None) => {}
            Err(e) => warn!(error = ?e, "profile load failed, using current settings"),
        }

        let target_lang = self.settings.read().await.target_lang.clone();
        if let Err(e) = self.goals.seed_initial(&target_lang).await {
            warn!(error = ?e, "initial goal seeding failed");
        }

        self.connector.start().await?;
        if self.config.kickoff_greeting {
            self.connector.kick_off().await;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.connector.stop().await;
    }

    /// Replaces the conversation settings, persists them, and re-applies the
    /// language policy to any live session.
    pub async fn update_settings(
        &self,
        settings: ConversationSettings,
    ) -> Result<(), EngineError> {
        *self.settings.write().await = settings.clone();
        if let Err(e) = self.profile.save_settings(&settings).await {
            warn!(error = ?e, "failed to persist settings");
        }
        self.connector.apply_language_policy().await
    }

    pub async fn settings(&self) -> ConversationSettings {
        self.settings.read().await.clone()
    }

    /// Replays a turn: from the clip cache when possible, otherwise by asking
    /// the agent to re-speak it. Cache failures degrade to the network path.
    pub async fn replay(&self, message_id: Uuid) -> Replay {
        match self.clips.get(message_id).await {
            Ok(Some(clip)) => return Replay::Cached(clip),
            Ok(None) => {}
            Err(e) => warn!(%message_id, error = %e, "clip cache unavailable"),
        }
        let Some(message) = self.transcript.message(message_id).await else {
            return Replay::Unavailable;
        };
        if message.text_final.is_empty() {
            return Replay::Unavailable;
        }
        if self.connector.request_replay(&message.text_final).await {
            Replay::Requested
        } else {
            Replay::Unavailable
        }
    }

    /// Replay availability, driven purely by clip existence.
    pub async fn can_replay(&self, message_id: Uuid) -> bool {
        matches!(self.clips.get(message_id).await, Ok(Some(_)))
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.transcript.snapshot().await
    }

    pub fn transcript_revisions(&self) -> watch::Receiver<u64> {
        self.transcript.subscribe()
    }

    pub async fn active_goal(&self) -> Option<Goal> {
        self.goals.active_goal().await
    }

    pub fn xp_total(&self) -> u64 {
        self.goals.xp_total()
    }

    pub fn ui_state(&self) -> watch::Receiver<UiState> {
        self.connector.ui_state()
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.connector.status()
    }

    pub fn errors(&self) -> watch::Receiver<Option<String>> {
        self.connector.errors()
    }
}
