//! Translation with phrase alignment for tap-to-highlight study.

use crate::responses::{CompletionBackend, extract_json_object};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// One aligned phrase chunk: `lhs` in the source language, `rhs` in the
/// learner's language.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AlignmentPair {
    pub lhs: String,
    pub rhs: String,
}

/// A translated turn with its phrase alignment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Translation {
    pub translation: String,
    #[serde(default)]
    pub pairs: Vec<AlignmentPair>,
}

/// Defines the contract for any service that can translate a finalized turn.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Translation>;
}

/// LLM-backed [`Translator`] requesting structured JSON output.
pub struct LlmTranslator {
    backend: Arc<dyn CompletionBackend>,
}

impl LlmTranslator {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Translator for LlmTranslator {
    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Translation> {
        let prompt = translation_prompt(text, source_lang, target_lang);
        let raw = self.backend.complete(&prompt).await?;
        Ok(parse_translation(&raw))
    }
}

fn translation_prompt(text: &str, source_lang: &str, target_lang: &str) -> String {
    format!(
        "Translate the following {source_lang} text into {target_lang}.\n\
         Respond with JSON only, in this exact shape:\n\
         {{\"translation\": string, \"pairs\": [{{\"lhs\": string, \"rhs\": string}}]}}\n\
         Each pair aligns a short phrase chunk of 2-6 words from the source \
         (lhs) with its translation (rhs), in order. Use at most 8 pairs.\n\
         Text:\n{text}"
    )
}

/// Parses a completion into a [`Translation`], degrading gracefully.
///
/// Acceptance order: the whole body as JSON, then the substring between the
/// first `{` and the last `}`, then the raw text as the translation with no
/// pairs.
pub fn parse_translation(raw: &str) -> Translation {
    if let Ok(parsed) = serde_json::from_str::<Translation>(raw) {
        return parsed;
    }
    if let Some(slice) = extract_json_object(raw) {
        if let Ok(parsed) = serde_json::from_str::<Translation>(slice) {
            return parsed;
        }
    }
    debug!("translation response was not JSON, using raw text");
    Translation {
        translation: raw.trim().to_string(),
        pairs: Vec::new(),
    }
}

/// Deterministic [`Translator`] for development and integration testing.
pub struct MockTranslator;

#[async_trait]
impl Translator for MockTranslator {
    async fn translate(
        &self,
        text: &str,
        _source_lang: &str,
        target_lang: &str,
    ) -> Result<Translation> {
        Ok(Translation {
            translation: format!("[{target_lang}] {text}"),
            pairs: Vec::new(),
        })
    }
}
