//! Learner goals: the current objective, its evaluation contract, the XP
//! policy, and seeding of the next goal after completion.

use crate::responses::{CompletionBackend, extract_json_object};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use uuid::Uuid;

/// The learner's current objective, scored per turn and replaced on
/// completion.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Goal {
    pub id: Uuid,
    /// Short localized title shown to the learner.
    pub title: String,
    /// What the evaluator scores the utterance against.
    pub rubric: String,
    pub attempts: u32,
    pub completed: bool,
    /// Set once the success XP for this goal id has been granted. Cleared
    /// only by seeding a new goal.
    pub xp_awarded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    pub fn new(title: impl Into<String>, rubric: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            rubric: rubric.into(),
            attempts: 0,
            completed: false,
            xp_awarded: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Outcome of evaluating one learner utterance against the active goal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub met: bool,
    /// 0..1; how close the utterance came to satisfying the rubric.
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub feedback: String,
}

/// Scores a learner utterance against a goal rubric.
///
/// Contract: `met` requires BOTH the target-language condition and the
/// topical-relevance condition. An on-topic utterance in the wrong language,
/// or an off-topic utterance in flawless target language, must not be met.
#[async_trait]
pub trait GoalEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        rubric: &str,
        target_lang: &str,
        utterance: &str,
    ) -> Result<Evaluation>;
}

/// LLM-backed [`GoalEvaluator`].
pub struct LlmEvaluator {
    backend: Arc<dyn CompletionBackend>,
}

impl LlmEvaluator {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl GoalEvaluator for LlmEvaluator {
    async fn evaluate(
        &self,
        rubric: &str,
        target_lang: &str,
        utterance: &str,
    ) -> Result<Evaluation> {
        let prompt = format!(
            "You are grading a language learner's spoken utterance.\n\
             Goal rubric: {rubric}\n\
             Required language: {target_lang}\n\
             Utterance: {utterance}\n\
             Mark \"met\" true ONLY if the utterance is in the required \
             language AND is topically relevant to the rubric. An on-topic \
             utterance in the wrong language is not met. An off-topic \
             utterance in the correct language is not met.\n\
             Respond with JSON only: {{\"met\": bool, \"confidence\": number \
             between 0 and 1, \"feedback\": string}}"
        );
        let raw = self.backend.complete(&prompt).await?;
        let mut evaluation = parse_evaluation(&raw)
            .with_context(|| format!("unparseable evaluation response: {raw}"))?;
        evaluation.confidence = evaluation.confidence.clamp(0.0, 1.0);
        Ok(evaluation)
    }
}

fn parse_evaluation(raw: &str) -> Option<Evaluation> {
    if let Ok(parsed) = serde_json::from_str::<Evaluation>(raw) {
        return Some(parsed);
    }
    extract_json_object(raw).and_then(|slice| serde_json::from_str(slice).ok())
}

/// Deterministic [`GoalEvaluator`] for development and integration testing.
///
/// Topical relevance is approximated by content-word overlap between rubric
/// and utterance; the language condition is assumed satisfied.
pub struct MockEvaluator;

#[async_trait]
impl GoalEvaluator for MockEvaluator {
    async fn evaluate(
        &self,
        rubric: &str,
        _target_lang: &str,
        utterance: &str,
    ) -> Result<Evaluation> {
        let rubric_words: Vec<String> = content_words(rubric);
        let utterance_words: Vec<String> = content_words(utterance);
        let overlap = utterance_words
            .iter()
            .filter(|w| rubric_words.contains(w))
            .count();
        let met = overlap > 0;
        let confidence = if rubric_words.is_empty() {
            0.0
        } else {
            (overlap as f64 / rubric_words.len() as f64).clamp(0.0, 1.0)
        };
        Ok(Evaluation {
            met,
            confidence,
            feedback: if met {
                "On topic.".to_string()
            } else {
                "Try to address the goal topic.".to_string()
            },
        })
    }
}

fn content_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(str::to_string)
        .collect()
}

/// Experience-point policy. Tunable; the defaults are empirically chosen UX
/// values, not invariants.
#[derive(Debug, Clone, PartialEq)]
pub struct XpPolicy {
    pub met_min: f64,
    pub met_max: f64,
    pub met_base: f64,
    pub pronunciation_bonus: f64,
    pub attempt_penalty: f64,
    pub unmet_max: f64,
    pub unmet_scale: f64,
}

impl Default for XpPolicy {
    fn default() -> Self {
        Self {
            met_min: 4.0,
            met_max: 7.0,
            met_base: 6.0,
            pronunciation_bonus: 1.0,
            attempt_penalty: 0.5,
            unmet_max: 4.0,
            unmet_scale: 4.0,
        }
    }
}

impl XpPolicy {
    /// XP for a goal completed on the given attempt count.
    pub fn success_xp(&self, attempts: u32, pronunciation_practice: bool) -> u32 {
        let bonus = if pronunciation_practice {
            self.pronunciation_bonus
        } else {
            0.0
        };
        let penalty = self.attempt_penalty * attempts.saturating_sub(1) as f64;
        (self.met_base + bonus - penalty)
            .clamp(self.met_min, self.met_max)
            .round() as u32
    }

    /// Per-turn consolation XP for an unmet attempt.
    pub fn turn_xp(&self, confidence: f64) -> u32 {
        (confidence * self.unmet_scale)
            .round()
            .clamp(0.0, self.unmet_max) as u32
    }
}

/// Produces the next goal once the current one completes.
#[async_trait]
pub trait GoalSeeder: Send + Sync {
    /// `previous` is the just-completed goal (None when seeding the first
    /// goal); `context` is recent transcript text the seeder may draw on.
    async fn next_goal(
        &self,
        previous: Option<&Goal>,
        context: &str,
        target_lang: &str,
    ) -> Result<Goal>;
}

/// A goal title/rubric template.
#[derive(Debug, Clone)]
pub struct GoalTemplate {
    pub title: &'static str,
    pub rubric: &'static str,
}

/// Built-in conversation objectives, rotated in order.
pub const DEFAULT_GOAL_VARIATIONS: &[GoalTemplate] = &[
    GoalTemplate {
        title: "Introduce yourself",
        rubric: "Say your name and one thing about yourself",
    },
    GoalTemplate {
        title: "Talk about your day",
        rubric: "Describe something you did today or plan to do",
    },
    GoalTemplate {
        title: "Order at a café",
        rubric: "Order a drink or something to eat, politely",
    },
    GoalTemplate {
        title: "Describe your favorite food",
        rubric: "Talk about a dish you love and why",
    },
    GoalTemplate {
        title: "Ask a question",
        rubric: "Ask the tutor a question about their day or interests",
    },
    GoalTemplate {
        title: "Talk about the weather",
        rubric: "Describe today's weather or the season",
    },
    GoalTemplate {
        title: "Make weekend plans",
        rubric: "Propose an activity for the weekend",
    },
    GoalTemplate {
        title: "Describe where you live",
        rubric: "Say something about your home, street, or city",
    },
];

/// Content-driven [`GoalSeeder`] that rotates through a variation list,
/// skipping entries too similar to the goal just completed so the learner
/// never sees an immediate repetition.
pub struct RotationSeeder {
    variations: Vec<GoalTemplate>,
    cursor: AtomicUsize,
}

impl RotationSeeder {
    pub fn new(variations: Vec<GoalTemplate>) -> Self {
        Self {
            variations,
            cursor: AtomicUsize::new(0),
        }
    }

    fn too_similar(previous: &Goal, candidate: &GoalTemplate) -> bool {
        let matcher = SkimMatcherV2::default();
        matcher
            .fuzzy_match(candidate.title, &previous.title)
            .is_some_and(|score| score > 60)
    }
}

impl Default for RotationSeeder {
    fn default() -> Self {
        Self::new(DEFAULT_GOAL_VARIATIONS.to_vec())
    }
}

#[async_trait]
impl GoalSeeder for RotationSeeder {
    async fn next_goal(
        &self,
        previous: Option<&Goal>,
        _context: &str,
        _target_lang: &str,
    ) -> Result<Goal> {
        anyhow::ensure!(!self.variations.is_empty(), "empty goal variation list");
        for _ in 0..self.variations.len() {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.variations.len();
            let candidate = &self.variations[idx];
            if let Some(prev) = previous {
                if Self::too_similar(prev, candidate) {
                    debug!(title = candidate.title, "skipping near-duplicate goal");
                    continue;
                }
            }
            return Ok(Goal::new(candidate.title, candidate.rubric));
        }
        // Every variation matched the previous goal; take the next anyway.
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.variations.len();
        let candidate = &self.variations[idx];
        Ok(Goal::new(candidate.title, candidate.rubric))
    }
}

/// [`GoalSeeder`] that derives the next goal from recent transcript context.
pub struct LlmSeeder {
    backend: Arc<dyn CompletionBackend>,
}

impl LlmSeeder {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }
}

#[derive(Deserialize)]
struct SeededGoal {
    title: String,
    rubric: String,
}

#[async_trait]
impl GoalSeeder for LlmSeeder {
    async fn next_goal(
        &self,
        previous: Option<&Goal>,
        context: &str,
        target_lang: &str,
    ) -> Result<Goal> {
        let avoid = previous.map(|g| g.title.as_str()).unwrap_or("none");
        let prompt = format!(
            "Suggest the next speaking objective for a {target_lang} learner.\n\
             Recent conversation:\n{context}\n\
             Do not repeat this objective: {avoid}\n\
             Respond with JSON only: {{\"title\": string, \"rubric\": string}}"
        );
        let raw = self.backend.complete(&prompt).await?;
        let seeded: SeededGoal = serde_json::from_str(&raw)
            .or_else(|_| {
                extract_json_object(&raw)
                    .context("no JSON object in seeder response")
                    .and_then(|slice| serde_json::from_str(slice).map_err(Into::into))
            })
            .with_context(|| format!("unparseable goal seed: {raw}"))?;
        Ok(Goal::new(seeded.title, seeded.rubric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responses::MockCompletionBackend;

    #[test]
    fn success_xp_stays_in_bounds() {
        let policy = XpPolicy::default();
        // First attempt, no bonus: base 6.
        assert_eq!(policy.success_xp(1, false), 6);
        // Bonus pushes to 7.
        assert_eq!(policy.success_xp(1, true), 7);
        // Penalty of 0.5 per extra attempt, floored at 4.
        assert_eq!(policy.success_xp(3, false), 5);
        assert_eq!(policy.success_xp(20, false), 4);
        // Clamp before rounding keeps the ceiling at 7.
        assert_eq!(policy.success_xp(0, true), 7);
    }

    #[test]
    fn turn_xp_scales_with_confidence() {
        let policy = XpPolicy::default();
        assert_eq!(policy.turn_xp(0.0), 0);
        assert_eq!(policy.turn_xp(0.5), 2);
        assert_eq!(policy.turn_xp(1.0), 4);
        assert_eq!(policy.turn_xp(7.5), 4);
    }

    #[tokio::test]
    async fn off_topic_utterance_is_not_met() {
        // Valid target-language grammar, topically irrelevant.
        let evaluation = MockEvaluator
            .evaluate(
                "talk about your favorite restaurant",
                "es",
                "mi perro es blanco",
            )
            .await
            .unwrap();
        assert!(!evaluation.met);
    }

    #[tokio::test]
    async fn on_topic_utterance_is_met() {
        let evaluation = MockEvaluator
            .evaluate(
                "talk about your favorite restaurant",
                "es",
                "my favorite restaurant serves tapas",
            )
            .await
            .unwrap();
        assert!(evaluation.met);
        assert!(evaluation.confidence > 0.0);
    }

    #[tokio::test]
    async fn llm_evaluator_parses_wrapped_json() {
        let mut backend = MockCompletionBackend::new();
        backend.expect_complete().returning(|_| {
            Ok("Here you go: {\"met\": true, \"confidence\": 0.9, \"feedback\": \"good\"} done"
                .to_string())
        });
        let evaluator = LlmEvaluator::new(Arc::new(backend));
        let evaluation = evaluator.evaluate("rubric", "es", "hola").await.unwrap();
        assert!(evaluation.met);
        assert!((evaluation.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn llm_evaluator_clamps_confidence() {
        let mut backend = MockCompletionBackend::new();
        backend
            .expect_complete()
            .returning(|_| Ok(r#"{"met": false, "confidence": 3.2}"#.to_string()));
        let evaluator = LlmEvaluator::new(Arc::new(backend));
        let evaluation = evaluator.evaluate("rubric", "es", "hola").await.unwrap();
        assert!((evaluation.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn llm_evaluator_errors_on_garbage() {
        let mut backend = MockCompletionBackend::new();
        backend
            .expect_complete()
            .returning(|_| Ok("I cannot grade that.".to_string()));
        let evaluator = LlmEvaluator::new(Arc::new(backend));
        assert!(evaluator.evaluate("rubric", "es", "hola").await.is_err());
    }

    #[tokio::test]
    async fn rotation_seeder_rotates() {
        let seeder = RotationSeeder::default();
        let first = seeder.next_goal(None, "", "es").await.unwrap();
        let second = seeder.next_goal(Some(&first), "", "es").await.unwrap();
        assert_ne!(first.title, second.title);
        assert_ne!(first.id, second.id);
        assert!(!second.xp_awarded);
    }

    #[tokio::test]
    async fn rotation_seeder_skips_immediate_repetition() {
        let seeder = RotationSeeder::new(vec![
            GoalTemplate {
                title: "Talk about your day",
                rubric: "r1",
            },
            GoalTemplate {
                title: "Order at a café",
                rubric: "r2",
            },
        ]);
        let previous = Goal::new("Talk about your day", "r1");
        let next = seeder.next_goal(Some(&previous), "", "es").await.unwrap();
        assert_eq!(next.title, "Order at a café");
    }

    #[tokio::test]
    async fn llm_seeder_parses_goal() {
        let mut backend = MockCompletionBackend::new();
        backend.expect_complete().returning(|_| {
            Ok(r#"{"title": "Describe your pet", "rubric": "Talk about an animal you know"}"#
                .to_string())
        });
        let seeder = LlmSeeder::new(Arc::new(backend));
        let goal = seeder.next_goal(None, "we talked about dogs", "es").await.unwrap();
        assert_eq!(goal.title, "Describe your pet");
        assert_eq!(goal.attempts, 0);
    }
}
