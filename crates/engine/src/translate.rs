//! Debounced translation pipeline for finalized and streaming agent turns.
//!
//! Every new piece of text for a message reschedules its pending translation;
//! only a quiet period of `debounce` actually issues the request. Alignment
//! pairs are post-processed so the UI never renders oversized chunks.

use crate::transcript::TranscriptAggregator;
use parla_core::translate::{AlignmentPair, Translator};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_PAIRS: usize = 8;
const MAX_PAIR_CHARS: usize = 80;
const SPLIT_DELIMITERS: [char; 4] = [',', ';', '·', '•'];

/// Debounce map keyed by message id. Rescheduling aborts the prior pending
/// task.
pub struct TranslationPipeline {
    translator: Arc<dyn Translator>,
    transcript: Arc<TranscriptAggregator>,
    pending: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    debounce: Duration,
}

impl TranslationPipeline {
    pub fn new(
        translator: Arc<dyn Translator>,
        transcript: Arc<TranscriptAggregator>,
        debounce_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            translator,
            transcript,
            pending: Mutex::new(HashMap::new()),
            debounce: Duration::from_millis(debounce_ms),
        })
    }

    /// (Re)schedules translation of `id` after the debounce window.
    pub async fn schedule(&self, id: Uuid, source_lang: String, target_lang: String) {
        let translator = self.translator.clone();
        let transcript = self.transcript.clone();
        let debounce = self.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            translate_now(translator, transcript, id, &source_lang, &target_lang).await;
        });

        let mut pending = self.pending.lock().await;
        pending.retain(|_, handle| !handle.is_finished());
        if let Some(previous) = pending.insert(id, task) {
            previous.abort();
        }
    }

    /// Aborts every pending debounce. Called on session teardown.
    pub async fn clear(&self) {
        let mut pending = self.pending.lock().await;
        for (id, handle) in pending.drain() {
            debug!(%id, "aborting pending translation");
            handle.abort();
        }
    }

    pub async fn pending_len(&self) -> usize {
        let mut pending = self.pending.lock().await;
        pending.retain(|_, handle| !handle.is_finished());
        pending.len()
    }
}

async fn translate_now(
    translator: Arc<dyn Translator>,
    transcript: Arc<TranscriptAggregator>,
    id: Uuid,
    source_lang: &str,
    target_lang: &str,
) {
    let Some(message) = transcript.message(id).await else {
        return;
    };
    let text = message.display_text().to_string();
    if text.trim().is_empty() {
        return;
    }

    // Matching languages short-circuit: the text is its own translation.
    if source_lang == target_lang {
        transcript.set_translation(id, text, Vec::new()).await;
        return;
    }

    match translator.translate(&text, source_lang, target_lang).await {
        Ok(result) => {
            let pairs = postprocess_pairs(result.pairs);
            transcript
                .set_translation(id, result.translation, pairs)
                .await;
        }
        // Degrade: the turn stays untranslated, the session continues.
        Err(e) => warn!(%id, error = ?e, "translation request failed"),
    }
}

/// Enforces the pair-size contract: sides longer than [`MAX_PAIR_CHARS`] are
/// re-split on common delimiters when both sides split into the same number
/// of segments (otherwise truncated), and the list is capped at
/// [`MAX_PAIRS`].
pub fn postprocess_pairs(pairs: Vec<AlignmentPair>) -> Vec<AlignmentPair> {
    let mut out = Vec::new();
    for pair in pairs {
        if char_len(&pair.lhs) <= MAX_PAIR_CHARS && char_len(&pair.rhs) <= MAX_PAIR_CHARS {
            out.push(pair);
            continue;
        }
        match aligned_split(&pair.lhs, &pair.rhs) {
            Some(split) => out.extend(split),
            None => out.push(AlignmentPair {
                lhs: truncate_chars(&pair.lhs, MAX_PAIR_CHARS),
                rhs: truncate_chars(&pair.rhs, MAX_PAIR_CHARS),
            }),
        }
    }
    out.truncate(MAX_PAIRS);
    out
}

/// Splits both sides on the first delimiter that yields the same number of
/// non-empty segments on each side.
fn aligned_split(lhs: &str, rhs: &str) -> Option<Vec<AlignmentPair>> {
    for delimiter in SPLIT_DELIMITERS {
        let left: Vec<&str> = split_segments(lhs, delimiter);
        let right: Vec<&str> = split_segments(rhs, delimiter);
        if left.len() > 1 && left.len() == right.len() {
            return Some(
                left.into_iter()
                    .zip(right)
                    .map(|(l, r)| AlignmentPair {
                        lhs: truncate_chars(l, MAX_PAIR_CHARS),
                        rhs: truncate_chars(r, MAX_PAIR_CHARS),
                    })
                    .collect(),
            );
        }
    }
    None
}

fn split_segments(text: &str, delimiter: char) -> Vec<&str> {
    text.split(delimiter)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use parla_core::translate::Translation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and returns a fixed translation.
    struct CountingTranslator {
        calls: AtomicUsize,
    }

    impl CountingTranslator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Translator for CountingTranslator {
        async fn translate(
            &self,
            text: &str,
            _source_lang: &str,
            _target_lang: &str,
        ) -> Result<Translation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Translation {
                translation: format!("T({text})"),
                pairs: Vec::new(),
            })
        }
    }

    async fn seeded_transcript(text: &str) -> (Arc<TranscriptAggregator>, Uuid) {
        let transcript = TranscriptAggregator::new();
        let id = Uuid::new_v4();
        transcript
            .insert_assistant(id, "es".into(), Utc::now())
            .await;
        transcript.append_delta(id, text).await;
        transcript.flush_frame().await;
        (transcript, id)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_reschedules_collapse_into_one_call() {
        let translator = CountingTranslator::new();
        let (transcript, id) = seeded_transcript("Hola").await;
        let pipeline = TranslationPipeline::new(translator.clone(), transcript.clone(), 300);

        for _ in 0..5 {
            pipeline.schedule(id, "es".into(), "en".into()).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
        let message = transcript.message(id).await.unwrap();
        assert_eq!(message.translation.as_deref(), Some("T(Hola)"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_language_short_circuits() {
        let translator = CountingTranslator::new();
        let (transcript, id) = seeded_transcript("Hola").await;
        let pipeline = TranslationPipeline::new(translator.clone(), transcript.clone(), 300);

        pipeline.schedule(id, "es".into(), "es".into()).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
        let message = transcript.message(id).await.unwrap();
        assert_eq!(message.translation.as_deref(), Some("Hola"));
        assert!(message.alignment_pairs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_aborts_pending_work() {
        let translator = CountingTranslator::new();
        let (transcript, id) = seeded_transcript("Hola").await;
        let pipeline = TranslationPipeline::new(translator.clone(), transcript.clone(), 300);

        pipeline.schedule(id, "es".into(), "en".into()).await;
        pipeline.clear().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_is_skipped() {
        let translator = CountingTranslator::new();
        let transcript = TranscriptAggregator::new();
        let id = Uuid::new_v4();
        transcript
            .insert_assistant(id, "es".into(), Utc::now())
            .await;
        let pipeline = TranslationPipeline::new(translator.clone(), transcript.clone(), 300);

        pipeline.schedule(id, "es".into(), "en".into()).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn short_pairs_pass_through() {
        let pairs = vec![AlignmentPair {
            lhs: "Hola".into(),
            rhs: "Hello".into(),
        }];
        assert_eq!(postprocess_pairs(pairs.clone()), pairs);
    }

    #[test]
    fn oversized_pairs_resplit_when_aligned() {
        let lhs = format!("{}, {}", "a".repeat(60), "b".repeat(60));
        let rhs = format!("{}, {}", "x".repeat(60), "y".repeat(60));
        let out = postprocess_pairs(vec![AlignmentPair { lhs, rhs }]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].lhs, "a".repeat(60));
        assert_eq!(out[1].rhs, "y".repeat(60));
    }

    #[test]
    fn misaligned_oversized_pairs_truncate() {
        let lhs = format!("{}, {}", "a".repeat(60), "b".repeat(60)); // 2 segments
        let rhs = "x".repeat(120); // 1 segment
        let out = postprocess_pairs(vec![AlignmentPair { lhs, rhs }]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].lhs.chars().count(), 80);
        assert_eq!(out[0].rhs.chars().count(), 80);
    }

    #[test]
    fn pair_list_is_capped_at_eight() {
        let pairs: Vec<AlignmentPair> = (0..12)
            .map(|i| AlignmentPair {
                lhs: format!("l{i}"),
                rhs: format!("r{i}"),
            })
            .collect();
        let out = postprocess_pairs(pairs);
        assert_eq!(out.len(), 8);
        assert_eq!(out[0].lhs, "l0");
    }

    #[test]
    fn every_output_side_is_within_bounds() {
        let pairs = vec![
            AlignmentPair {
                lhs: "α".repeat(200),
                rhs: "β".repeat(200),
            },
            AlignmentPair {
                lhs: format!("{}; {}", "m".repeat(90), "n".repeat(90)),
                rhs: format!("{}; {}", "p".repeat(90), "q".repeat(90)),
            },
        ];
        for pair in postprocess_pairs(pairs) {
            assert!(pair.lhs.chars().count() <= 80);
            assert!(pair.rhs.chars().count() <= 80);
        }
    }
}
