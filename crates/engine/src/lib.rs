//! Parla Engine Library
//!
//! The session/protocol/evaluation engine for voice conversation practice:
//! it opens a real-time duplex audio session with a remote conversational
//! agent, renders a live transcript, caches recorded reply clips for replay,
//! continuously translates agent turns, and scores learner speech against an
//! adaptive goal. Structured into modules for clarity:
//!
//! - `config`: environment-driven configuration and the timing tunables.
//! - `protocol`: the typed JSON event vocabulary of the data channel.
//! - `media`: platform seams for microphone capture and the peer connection.
//! - `signaling`: the HTTP SDP offer/answer exchange.
//! - `session`: session lifecycle and idle-gated configuration changes.
//! - `machine`: the protocol state machine driving everything below it.
//! - `transcript`: delta coalescing into finalized per-turn messages.
//! - `recorder` / `clips`: tail-silence turn recording and clip storage.
//! - `translate`: the debounced translation pipeline.
//! - `goals`: goal evaluation, idempotent XP awards, and goal seeding.

pub mod audio;
pub mod clips;
pub mod config;
pub mod engine;
pub mod error;
pub mod goals;
pub mod machine;
pub mod media;
pub mod profile;
pub mod protocol;
pub mod recorder;
pub mod session;
pub mod signaling;
pub mod transcript;
pub mod translate;

pub use config::{Config, ConfigError, Tunables};
pub use engine::{Engine, Replay, Services};
pub use error::EngineError;
pub use machine::UiState;
pub use session::SessionStatus;
pub use transcript::{Message, Role};
