//! HTTP SDP exchange with the signaling endpoint.

use crate::error::EngineError;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

/// Performs the offer/answer exchange. Abstracted so session tests can run
/// without a network.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn exchange(&self, offer_sdp: &str) -> Result<String, EngineError>;
}

/// POSTs the local offer as `application/sdp`; a 2xx body is the remote
/// answer, anything else is a fatal connection error.
pub struct HttpSignalingClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpSignalingClient {
    pub fn new(base_url: &str, model: &str, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: with_model(base_url, model),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl SignalingClient for HttpSignalingClient {
    async fn exchange(&self, offer_sdp: &str) -> Result<String, EngineError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("signaling request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Connection(format!("signaling body unreadable: {e}")))?;
        if !status.is_success() {
            return Err(EngineError::Connection(format!(
                "signaling endpoint returned {status}: {body}"
            )));
        }
        debug!(bytes = body.len(), "received answer SDP");
        Ok(body)
    }
}

/// Appends the model query parameter to the signaling base URL.
pub fn with_model(base_url: &str, model: &str) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{separator}model={model}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_model_appends_query() {
        assert_eq!(
            with_model("https://api.example.com/v1/realtime", "gpt-rt"),
            "https://api.example.com/v1/realtime?model=gpt-rt"
        );
    }

    #[test]
    fn with_model_extends_existing_query() {
        assert_eq!(
            with_model("https://api.example.com/v1/realtime?a=b", "gpt-rt"),
            "https://api.example.com/v1/realtime?a=b&model=gpt-rt"
        );
    }
}
