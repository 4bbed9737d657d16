//! Session lifecycle: microphone + peer establishment, SDP exchange, the
//! event pump, and idle-gated configuration changes.

use crate::clips::ClipStore;
use crate::config::Config;
use crate::error::EngineError;
use crate::goals::GoalEngine;
use crate::machine::{IdleGate, StateMachine, UiState};
use crate::media::{MicrophoneSource, PeerConnector, PeerHandle};
use crate::protocol::{ClientEvent, ConversationItem, ResponseParams, SessionUpdate};
use crate::signaling::SignalingClient;
use crate::transcript::TranscriptAggregator;
use crate::translate::TranslationPipeline;
use parla_core::instructions::build_instructions;
use parla_core::settings::ConversationSettings;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything owned by one live session and destroyed with it.
struct LiveSession {
    peer: Box<dyn PeerHandle>,
    machine: Arc<Mutex<StateMachine>>,
    pump: JoinHandle<()>,
    flush: JoinHandle<()>,
    policy_task: JoinHandle<()>,
}

/// Establishes and tears down sessions; exactly one may be live at a time.
pub struct SessionConnector {
    config: Config,
    signaling: Arc<dyn SignalingClient>,
    mic: Arc<dyn MicrophoneSource>,
    peers: Arc<dyn PeerConnector>,
    settings: Arc<RwLock<ConversationSettings>>,
    transcript: Arc<TranscriptAggregator>,
    clips: Arc<dyn ClipStore>,
    translations: Arc<TranslationPipeline>,
    goals: Arc<GoalEngine>,
    idle: Arc<IdleGate>,
    ui: Arc<watch::Sender<UiState>>,
    errors: Arc<watch::Sender<Option<String>>>,
    status: Arc<watch::Sender<SessionStatus>>,
    alive: AtomicBool,
    session: Mutex<Option<LiveSession>>,
    /// Self-handle for the goal-change watcher task.
    weak: Weak<SessionConnector>,
}

impl SessionConnector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        signaling: Arc<dyn SignalingClient>,
        mic: Arc<dyn MicrophoneSource>,
        peers: Arc<dyn PeerConnector>,
        settings: Arc<RwLock<ConversationSettings>>,
        transcript: Arc<TranscriptAggregator>,
        clips: Arc<dyn ClipStore>,
        translations: Arc<TranslationPipeline>,
        goals: Arc<GoalEngine>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            signaling,
            mic,
            peers,
            settings,
            transcript,
            clips,
            translations,
            goals,
            idle: IdleGate::new(),
            ui: Arc::new(watch::channel(UiState::Idle).0),
            errors: Arc::new(watch::channel(None).0),
            status: Arc::new(watch::channel(SessionStatus::Disconnected).0),
            alive: AtomicBool::new(false),
            session: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn ui_state(&self) -> watch::Receiver<UiState> {
        self.ui.subscribe()
    }

    pub fn errors(&self) -> watch::Receiver<Option<String>> {
        self.errors.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Acquires media, builds the peer, exchanges SDP, and spawns the event
    /// pump. Any failure resets to disconnected and surfaces a single error;
    /// there is no automatic retry.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            warn!("start() called with a live session");
            return Ok(());
        }
        self.status.send_replace(SessionStatus::Connecting);

        match self.establish().await {
            Ok(live) => {
                *guard = Some(live);
                drop(guard);
                self.alive.store(true, Ordering::SeqCst);
                self.status.send_replace(SessionStatus::Connected);
                self.ui.send_replace(UiState::Listening);
                info!("session connected");
                if let Err(e) = self.apply_language_policy().await {
                    warn!(error = %e, "initial language policy application failed");
                }
                Ok(())
            }
            Err(e) => {
                self.alive.store(false, Ordering::SeqCst);
                self.status.send_replace(SessionStatus::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<LiveSession, EngineError> {
        let local = self
            .mic
            .open()
            .await
            .map_err(|e| EngineError::MediaAccess(e.to_string()))?;
        let peer = self
            .peers
            .connect(local)
            .await
            .map_err(|e| EngineError::Connection(format!("peer setup failed: {e}")))?;

        let offer = peer
            .create_offer()
            .await
            .map_err(|e| EngineError::Connection(format!("offer creation failed: {e}")))?;
        let answer = self.signaling.exchange(&offer).await?;
        peer.accept_answer(&answer)
            .await
            .map_err(|e| EngineError::Connection(format!("answer rejected: {e}")))?;

        let inbound = peer
            .take_inbound()
            .ok_or_else(|| EngineError::Connection("data channel unavailable".to_string()))?;

        let machine = Arc::new(Mutex::new(StateMachine::new(
            self.config.tunables.clone(),
            self.settings.clone(),
            self.transcript.clone(),
            self.clips.clone(),
            self.translations.clone(),
            self.goals.clone(),
            self.idle.clone(),
            self.ui.clone(),
            self.errors.clone(),
            peer.remote_audio(),
        )));

        let pump = tokio::spawn(
            pump_events(inbound, machine.clone()).instrument(tracing::info_span!("session_pump")),
        );
        let flush = tokio::spawn(flush_frames(
            self.transcript.clone(),
            self.config.tunables.frame_flush_ms,
        ));
        let policy_task = tokio::spawn(reapply_policy_on_goal_change(
            self.weak.clone(),
            self.goals.subscribe(),
        ));

        Ok(LiveSession {
            peer,
            machine,
            pump,
            flush,
            policy_task,
        })
    }

    /// Idempotent teardown, safe from any state. Best-effort cancel messages
    /// first, then every machine-owned resource is cleared; no background
    /// work outlives the session.
    pub async fn stop(&self) {
        let Some(live) = self.session.lock().await.take() else {
            self.alive.store(false, Ordering::SeqCst);
            self.status.send_replace(SessionStatus::Disconnected);
            return;
        };

        if live.peer.is_open() {
            let tx = live.peer.data_channel();
            for event in [
                ClientEvent::ResponseCancel,
                ClientEvent::InputAudioBufferClear,
                ClientEvent::SessionUpdate {
                    session: SessionUpdate::disable_turn_detection(),
                },
            ] {
                if send_event(&tx, &event).await.is_err() {
                    debug!("best-effort teardown message not delivered");
                }
            }
        }
        live.peer.close().await;
        live.pump.abort();
        live.flush.abort();
        live.policy_task.abort();
        live.machine.lock().await.clear().await;

        self.alive.store(false, Ordering::SeqCst);
        self.status.send_replace(SessionStatus::Disconnected);
        self.ui.send_replace(UiState::Idle);
        info!("session stopped");
    }

    /// Builds instructions from current settings + active goal and pushes a
    /// `session.update`. A configuration change during an in-flight response
    /// first cancels it and awaits idleness, bounded by a timeout. No-op when
    /// no channel is open; safe to re-invoke on every settings change.
    pub async fn apply_language_policy(&self) -> Result<(), EngineError> {
        let tx = {
            let guard = self.session.lock().await;
            match guard.as_ref() {
                Some(live) if live.peer.is_open() => live.peer.data_channel(),
                _ => return Ok(()),
            }
        };

        if !self.idle.is_idle() {
            let _ = send_event(&tx, &ClientEvent::ResponseCancel).await;
            let timeout = Duration::from_millis(self.config.tunables.idle_wait_timeout_ms);
            if !self.idle.wait_idle(timeout).await {
                warn!("idle wait timed out, applying configuration anyway");
            }
        }

        let settings = self.settings.read().await.clone();
        let goal = self.goals.active_goal().await;
        let instructions = build_instructions(&settings, goal.as_ref());
        let update = SessionUpdate::language_policy(
            instructions,
            self.config.voice.clone(),
            &self.config.tunables.turn_detection,
            self.config.transcription_model.clone(),
            settings.target_lang.clone(),
        );
        if send_event(&tx, &ClientEvent::SessionUpdate { session: update })
            .await
            .is_err()
        {
            debug!("language policy not delivered, channel closed");
        }
        Ok(())
    }

    /// Seeds the agent's opening line.
    pub async fn kick_off(&self) {
        let sent = self
            .send_events(&[
                ClientEvent::ConversationItemCreate {
                    item: ConversationItem::system_text(
                        "Greet the learner warmly and ask an easy opening question.",
                    ),
                },
                ClientEvent::ResponseCreate { response: None },
            ])
            .await;
        if !sent {
            debug!("kick-off skipped, no open channel");
        }
    }

    /// Asks the agent to re-speak an earlier line. The resulting response is
    /// tagged as a replay and bypasses the primary transcript.
    pub async fn request_replay(&self, text: &str) -> bool {
        self.send_events(&[
            ClientEvent::ConversationItemCreate {
                item: ConversationItem::system_text(format!(
                    "Repeat this earlier line exactly, at a slightly slower pace: \"{text}\""
                )),
            },
            ClientEvent::ResponseCreate {
                response: Some(ResponseParams::replay()),
            },
        ])
        .await
    }

    async fn send_events(&self, events: &[ClientEvent]) -> bool {
        let tx = {
            let guard = self.session.lock().await;
            match guard.as_ref() {
                Some(live) if live.peer.is_open() => live.peer.data_channel(),
                _ => return false,
            }
        };
        for event in events {
            if send_event(&tx, event).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Resource introspection for teardown verification.
    pub async fn open_resources(&self) -> Option<crate::machine::MachineResources> {
        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(live) => Some(live.machine.lock().await.resources()),
            None => None,
        }
    }
}

async fn send_event(tx: &mpsc::Sender<String>, event: &ClientEvent) -> anyhow::Result<()> {
    let raw = serde_json::to_string(event)?;
    tx.send(raw).await?;
    Ok(())
}

/// Feeds inbound data-channel payloads through the state machine until the
/// channel closes.
async fn pump_events(mut inbound: mpsc::Receiver<String>, machine: Arc<Mutex<StateMachine>>) {
    while let Some(raw) = inbound.recv().await {
        machine.lock().await.dispatch(&raw).await;
    }
    debug!("data channel closed");
}

/// Commits buffered transcript deltas once per frame.
async fn flush_frames(transcript: Arc<TranscriptAggregator>, frame_ms: u64) {
    let mut tick = tokio::time::interval(Duration::from_millis(frame_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        transcript.flush_frame().await;
    }
}

/// A freshly seeded goal changes the instruction set, so the language policy
/// is re-applied.
async fn reapply_policy_on_goal_change(
    connector: Weak<SessionConnector>,
    mut goals: watch::Receiver<Option<uuid::Uuid>>,
) {
    while goals.changed().await.is_ok() {
        let Some(connector) = connector.upgrade() else {
            break;
        };
        if let Err(e) = connector.apply_language_policy().await {
            warn!(error = %e, "failed to re-apply language policy after goal change");
        }
    }
}
