//! Engine configuration loaded from the environment, plus the tunables that
//! drive every timing heuristic in the session pipeline.

use parla_core::goal::XpPolicy;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL the local SDP offer is POSTed to.
    pub signaling_url: String,
    /// URL of the text responses endpoint used for translation and
    /// evaluation.
    pub responses_url: String,
    pub api_key: String,
    pub realtime_model: String,
    pub chat_model: String,
    pub transcription_model: String,
    pub voice: String,
    /// Send an opening agent turn right after connecting.
    pub kickoff_greeting: bool,
    pub tunables: Tunables,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let signaling_url = std::env::var("SIGNALING_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1/realtime".to_string());
        let responses_url = std::env::var("RESPONSES_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1/responses".to_string());
        for (name, value) in [
            ("SIGNALING_URL", &signaling_url),
            ("RESPONSES_URL", &responses_url),
        ] {
            if !value.starts_with("http://") && !value.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    format!("'{value}' is not an http(s) URL"),
                ));
            }
        }

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let realtime_model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| "gpt-4o-realtime-preview".to_string());
        let chat_model =
            std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let transcription_model =
            std::env::var("TRANSCRIPTION_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        let voice = std::env::var("VOICE").unwrap_or_else(|_| "alloy".to_string());

        let kickoff_greeting = match std::env::var("KICKOFF_GREETING") {
            Err(_) => true,
            Ok(raw) => raw.parse::<bool>().map_err(|_| {
                ConfigError::InvalidValue(
                    "KICKOFF_GREETING".to_string(),
                    format!("'{raw}' is not a boolean"),
                )
            })?,
        };

        Ok(Self {
            signaling_url,
            responses_url,
            api_key,
            realtime_model,
            chat_model,
            transcription_model,
            voice,
            kickoff_greeting,
            tunables: Tunables::default(),
        })
    }
}

/// Timing and scoring heuristics. All values are empirically chosen UX
/// tuning, kept configurable rather than treated as invariants.
#[derive(Clone, Debug, PartialEq)]
pub struct Tunables {
    /// Debounce before a finalized/streaming turn is sent for translation.
    pub translation_debounce_ms: u64,
    /// Identical user transcripts inside this window are dropped as
    /// duplicates.
    pub duplicate_transcript_window_ms: u64,
    /// Upper bound on waiting for the idle state before applying a
    /// configuration change.
    pub idle_wait_timeout_ms: u64,
    /// Cadence at which buffered transcript deltas are committed.
    pub frame_flush_ms: u64,
    pub recorder: RecorderTunables,
    pub turn_detection: TurnDetectionTunables,
    pub xp: XpPolicy,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            translation_debounce_ms: 300,
            duplicate_transcript_window_ms: 2000,
            idle_wait_timeout_ms: 2500,
            frame_flush_ms: 16,
            recorder: RecorderTunables::default(),
            turn_detection: TurnDetectionTunables::default(),
            xp: XpPolicy::default(),
        }
    }
}

/// Tail-silence detection parameters for the turn recorder.
#[derive(Clone, Debug, PartialEq)]
pub struct RecorderTunables {
    /// RMS poll cadence.
    pub poll_interval_ms: u64,
    /// RMS amplitude above which a sample counts as voice.
    pub arm_threshold: f32,
    /// Voice must persist this long before tail-silence tracking arms.
    pub min_active_ms: u64,
    /// Quiet span after arming that ends the recording.
    pub quiet_ms: u64,
    /// Hard cap on total recording length.
    pub max_ms: u64,
    /// Sample rate clips are stored at.
    pub clip_sample_rate: u32,
}

impl Default for RecorderTunables {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            arm_threshold: 0.015,
            min_active_ms: 900,
            quiet_ms: 900,
            max_ms: 20_000,
            clip_sample_rate: 24_000,
        }
    }
}

/// Server-side voice-activity turn detection parameters sent with
/// `session.update`.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnDetectionTunables {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetectionTunables {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 200,
            silence_duration_ms: 700,
        }
    }
}
