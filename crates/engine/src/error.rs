//! Engine error taxonomy.
//!
//! Connection and media failures are fatal to the session and require a
//! manual reconnect. Protocol, translation, evaluation, and cache failures
//! degrade the affected capability and leave the session running.

use crate::clips::CacheError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// SDP/ICE/signaling failure. Fatal; no automatic retry.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Microphone permission denied or capture unavailable. Fatal to start().
    #[error("microphone access failed: {0}")]
    MediaAccess(String),
    /// Malformed or unexpected data-channel payload.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Translation endpoint failure after all parsing fallbacks.
    #[error("translation failed: {0}")]
    Translation(String),
    /// Goal evaluation failure; the attempt counter is still persisted.
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    /// Clip storage unavailable; replay is disabled, session continues.
    #[error("clip cache failed: {0}")]
    Cache(#[from] CacheError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = EngineError::Connection("signaling endpoint returned 500".into());
        assert_eq!(
            err.to_string(),
            "connection failed: signaling endpoint returned 500"
        );
    }

    #[test]
    fn cache_error_converts() {
        let err: EngineError = CacheError::Unavailable.into();
        assert!(matches!(err, EngineError::Cache(_)));
    }
}
