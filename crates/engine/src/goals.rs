//! Goal evaluation engine: scores finalized user turns against the active
//! goal, awards XP idempotently, and seeds the next goal on completion.

use anyhow::Result;
use async_trait::async_trait;
use parla_core::goal::{Evaluation, Goal, GoalEvaluator, GoalSeeder, XpPolicy};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Persistence surface for goal progress. Session-scoped stores are fine;
/// durable backends implement the same contract.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Persists the goal after an attempt-counter or completion mutation.
    async fn save_goal(&self, goal: &Goal) -> Result<()>;
    async fn record_completion(&self, goal: &Goal, xp: u32) -> Result<()>;
    async fn record_turn_xp(&self, goal_id: Uuid, xp: u32) -> Result<()>;
}

/// In-memory progress store.
#[derive(Default)]
pub struct MemoryProgressStore {
    saved: Mutex<Vec<Goal>>,
    completions: Mutex<Vec<(Uuid, u32)>>,
    turn_xp: Mutex<Vec<(Uuid, u32)>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn completions(&self) -> Vec<(Uuid, u32)> {
        self.completions.lock().await.clone()
    }

    pub async fn turn_xp_events(&self) -> Vec<(Uuid, u32)> {
        self.turn_xp.lock().await.clone()
    }

    pub async fn saved_count(&self) -> usize {
        self.saved.lock().await.len()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn save_goal(&self, goal: &Goal) -> Result<()> {
        self.saved.lock().await.push(goal.clone());
        Ok(())
    }

    async fn record_completion(&self, goal: &Goal, xp: u32) -> Result<()> {
        self.completions.lock().await.push((goal.id, xp));
        Ok(())
    }

    async fn record_turn_xp(&self, goal_id: Uuid, xp: u32) -> Result<()> {
        self.turn_xp.lock().await.push((goal_id, xp));
        Ok(())
    }
}

struct GoalState {
    goal: Option<Goal>,
    /// Serializes evaluation requests; overlapping triggers are dropped.
    busy: bool,
    /// Last (goal id, utterance) already evaluated, so a transcript-completed
    /// event and a response-completed event referencing the same utterance
    /// produce one evaluation.
    last_evaluated: Option<(Uuid, String)>,
}

/// Holds exactly one active goal and drives its lifecycle.
pub struct GoalEngine {
    evaluator: Arc<dyn GoalEvaluator>,
    seeder: Arc<dyn GoalSeeder>,
    progress: Arc<dyn ProgressStore>,
    policy: XpPolicy,
    state: Mutex<GoalState>,
    xp_total: AtomicU64,
    goal_rev: watch::Sender<Option<Uuid>>,
    eval_task: Mutex<Option<JoinHandle<()>>>,
    /// Self-handle for the background evaluation task.
    weak: Weak<GoalEngine>,
}

impl GoalEngine {
    pub fn new(
        evaluator: Arc<dyn GoalEvaluator>,
        seeder: Arc<dyn GoalSeeder>,
        progress: Arc<dyn ProgressStore>,
        policy: XpPolicy,
    ) -> Arc<Self> {
        let (goal_rev, _) = watch::channel(None);
        Arc::new_cyclic(|weak| Self {
            evaluator,
            seeder,
            progress,
            policy,
            state: Mutex::new(GoalState {
                goal: None,
                busy: false,
                last_evaluated: None,
            }),
            xp_total: AtomicU64::new(0),
            goal_rev,
            eval_task: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Seeds the first goal of the session. No-op when one is already active.
    pub async fn seed_initial(&self, target_lang: &str) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.goal.is_some() {
                return Ok(());
            }
        }
        let goal = self.seeder.next_goal(None, "", target_lang).await?;
        info!(title = %goal.title, "seeded initial goal");
        let id = goal.id;
        self.state.lock().await.goal = Some(goal);
        self.goal_rev.send_replace(Some(id));
        Ok(())
    }

    pub async fn active_goal(&self) -> Option<Goal> {
        self.state.lock().await.goal.clone()
    }

    /// Observers see the active goal id change whenever a goal is seeded.
    pub fn subscribe(&self) -> watch::Receiver<Option<Uuid>> {
        self.goal_rev.subscribe()
    }

    /// Total XP granted this session (success and per-turn).
    pub fn xp_total(&self) -> u64 {
        self.xp_total.load(Ordering::SeqCst)
    }

    /// Handles one finalized user turn. The evaluation itself runs in a
    /// background task; duplicate triggers for the same utterance and
    /// overlapping triggers while an evaluation is in flight are dropped.
    pub async fn on_user_turn(
        &self,
        utterance: String,
        target_lang: String,
        pronunciation_practice: bool,
    ) {
        if utterance.trim().is_empty() {
            return;
        }
        let Some(this) = self.weak.upgrade() else {
            return;
        };

        let snapshot = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(goal) = state.goal.as_mut() else {
                return;
            };
            if state
                .last_evaluated
                .as_ref()
                .is_some_and(|(gid, text)| *gid == goal.id && *text == utterance)
            {
                debug!("utterance already evaluated for this goal");
                return;
            }
            if state.busy {
                debug!("evaluation already in flight, dropping overlapping trigger");
                return;
            }
            state.busy = true;
            state.last_evaluated = Some((goal.id, utterance.clone()));
            goal.attempts += 1;
            goal.touch();
            goal.clone()
        };

        // Persist the attempt increment before the evaluation round-trip.
        if let Err(e) = self.progress.save_goal(&snapshot).await {
            warn!(error = ?e, "failed to persist goal attempt");
        }

        let task = tokio::spawn(async move {
            this.run_evaluation(snapshot, utterance, target_lang, pronunciation_practice)
                .await;
        });
        *self.eval_task.lock().await = Some(task);
    }

    async fn run_evaluation(
        self: Arc<Self>,
        snapshot: Goal,
        utterance: String,
        target_lang: String,
        pronunciation_practice: bool,
    ) {
        let evaluation = self
            .evaluator
            .evaluate(&snapshot.rubric, &target_lang, &utterance)
            .await;

        match evaluation {
            Err(e) => {
                // Swallowed: the attempt is already persisted and the busy
                // flag is released so a later turn can retry.
                warn!(error = ?e, "goal evaluation failed");
                self.state.lock().await.busy = false;
            }
            Ok(evaluation) => {
                self.apply_evaluation(&snapshot, &evaluation, &utterance, &target_lang, pronunciation_practice)
                    .await;
            }
        }
    }

    async fn apply_evaluation(
        &self,
        snapshot: &Goal,
        evaluation: &Evaluation,
        utterance: &str,
        target_lang: &str,
        pronunciation_practice: bool,
    ) {
        let (completed, xp) = {
            let mut guard = self.state.lock().await;
            guard.busy = false;
            let Some(goal) = guard.goal.as_mut() else {
                return;
            };
            // A newer goal replaced this one while the request was in flight.
            if goal.id != snapshot.id {
                return;
            }

            if !evaluation.met {
                let xp = self.policy.turn_xp(evaluation.confidence);
                debug!(xp, feedback = %evaluation.feedback, "goal not met");
                let goal_id = goal.id;
                drop(guard);
                if xp > 0 {
                    self.xp_total.fetch_add(xp as u64, Ordering::SeqCst);
                    if let Err(e) = self.progress.record_turn_xp(goal_id, xp).await {
                        warn!(error = ?e, "failed to record turn xp");
                    }
                }
                return;
            }

            goal.completed = true;
            goal.touch();
            // Success XP at most once per goal id, even when two evaluations
            // for it resolve concurrently or out of order.
            let xp = if goal.xp_awarded {
                None
            } else {
                goal.xp_awarded = true;
                Some(
                    self.policy
                        .success_xp(goal.attempts, pronunciation_practice),
                )
            };
            (goal.clone(), xp)
        };

        if let Some(xp) = xp {
            info!(title = %completed.title, xp, "goal completed");
            self.xp_total.fetch_add(xp as u64, Ordering::SeqCst);
            if let Err(e) = self.progress.record_completion(&completed, xp).await {
                warn!(error = ?e, "failed to record goal completion");
            }
        }

        // Seed the successor asynchronously; on failure the completed goal
        // simply stays in place until the next trigger.
        match self
            .seeder
            .next_goal(Some(&completed), utterance, target_lang)
            .await
        {
            Ok(next) => {
                info!(title = %next.title, "seeded next goal");
                let id = next.id;
                let mut state = self.state.lock().await;
                state.goal = Some(next);
                state.last_evaluated = None;
                drop(state);
                self.goal_rev.send_replace(Some(id));
            }
            Err(e) => warn!(error = ?e, "failed to seed next goal"),
        }
    }

    /// Aborts in-flight evaluation and releases the busy flag. The active
    /// goal itself survives so a reconnect resumes it.
    pub async fn clear(&self) {
        if let Some(task) = self.eval_task.lock().await.take() {
            task.abort();
        }
        let mut state = self.state.lock().await;
        state.busy = false;
        state.last_evaluated = None;
    }

    pub async fn is_busy(&self) -> bool {
        self.state.lock().await.busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parla_core::goal::RotationSeeder;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Scripted evaluator: returns a fixed outcome, optionally after a delay.
    struct ScriptedEvaluator {
        met: bool,
        confidence: f64,
        delay_ms: u64,
        calls: AtomicUsize,
        fail: bool,
    }

    impl ScriptedEvaluator {
        fn met() -> Arc<Self> {
            Arc::new(Self {
                met: true,
                confidence: 1.0,
                delay_ms: 0,
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn unmet(confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                met: false,
                confidence,
                delay_ms: 0,
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                met: false,
                confidence: 0.0,
                delay_ms: 0,
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }

        fn slow_met(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                met: true,
                confidence: 1.0,
                delay_ms,
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl GoalEvaluator for ScriptedEvaluator {
        async fn evaluate(
            &self,
            _rubric: &str,
            _target_lang: &str,
            _utterance: &str,
        ) -> Result<Evaluation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                anyhow::bail!("evaluator offline");
            }
            Ok(Evaluation {
                met: self.met,
                confidence: self.confidence,
                feedback: String::new(),
            })
        }
    }

    fn engine_with(evaluator: Arc<ScriptedEvaluator>) -> (Arc<GoalEngine>, Arc<MemoryProgressStore>) {
        let progress = Arc::new(MemoryProgressStore::new());
        let engine = GoalEngine::new(
            evaluator,
            Arc::new(RotationSeeder::default()),
            progress.clone(),
            XpPolicy::default(),
        );
        (engine, progress)
    }

    async fn settle() {
        // Let spawned evaluation tasks run to completion.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn met_turn_completes_goal_and_seeds_next() {
        let evaluator = ScriptedEvaluator::met();
        let (engine, progress) = engine_with(evaluator);
        engine.seed_initial("es").await.unwrap();
        let first = engine.active_goal().await.unwrap();

        engine
            .on_user_turn("me llamo Ana".into(), "es".into(), false)
            .await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let completions = progress.completions().await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, first.id);
        // First attempt, no pronunciation bonus.
        assert_eq!(completions[0].1, 6);
        assert_eq!(engine.xp_total(), 6);

        let next = engine.active_goal().await.unwrap();
        assert_ne!(next.id, first.id);
        assert_eq!(next.attempts, 0);
        assert!(!next.xp_awarded);
        assert!(!engine.is_busy().await);
    }

    #[tokio::test]
    async fn unmet_turn_grants_consolation_xp_and_keeps_goal() {
        let evaluator = ScriptedEvaluator::unmet(0.5);
        let (engine, progress) = engine_with(evaluator);
        engine.seed_initial("es").await.unwrap();
        let goal = engine.active_goal().await.unwrap();

        engine
            .on_user_turn("mi perro es blanco".into(), "es".into(), false)
            .await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(progress.completions().await.is_empty());
        assert_eq!(progress.turn_xp_events().await, vec![(goal.id, 2)]);
        let after = engine.active_goal().await.unwrap();
        assert_eq!(after.id, goal.id);
        assert_eq!(after.attempts, 1);
        assert!(!after.completed);
    }

    #[tokio::test]
    async fn duplicate_utterance_evaluates_once() {
        let evaluator = ScriptedEvaluator::unmet(0.0);
        let (engine, progress) = engine_with(evaluator.clone());
        engine.seed_initial("es").await.unwrap();

        // Transcript-completed and response-completed both reference the
        // same utterance.
        engine
            .on_user_turn("hola".into(), "es".into(), false)
            .await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine
            .on_user_turn("hola".into(), "es".into(), false)
            .await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.active_goal().await.unwrap().attempts, 1);
        assert_eq!(progress.saved_count().await, 1);
    }

    #[tokio::test]
    async fn busy_flag_drops_overlapping_triggers() {
        let evaluator = ScriptedEvaluator::slow_met(50);
        let (engine, _progress) = engine_with(evaluator.clone());
        engine.seed_initial("es").await.unwrap();

        engine
            .on_user_turn("primera".into(), "es".into(), false)
            .await;
        // Different utterance while the first is still in flight.
        engine
            .on_user_turn("segunda".into(), "es".into(), false)
            .await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_xp_is_never_double_awarded() {
        let evaluator = ScriptedEvaluator::met();
        let progress = Arc::new(MemoryProgressStore::new());
        // A seeder that always fails keeps the completed goal in place, so a
        // second met evaluation targets the same goal id.
        struct FailingSeeder;
        #[async_trait]
        impl GoalSeeder for FailingSeeder {
            async fn next_goal(
                &self,
                _previous: Option<&Goal>,
                _context: &str,
                _target_lang: &str,
            ) -> Result<Goal> {
                anyhow::bail!("seeder offline")
            }
        }
        let engine = GoalEngine::new(
            evaluator,
            Arc::new(FailingSeeder),
            progress.clone(),
            XpPolicy::default(),
        );
        engine.seed_initial_goal_for_tests().await;
        let goal = engine.active_goal().await.unwrap();

        engine
            .on_user_turn("uno".into(), "es".into(), false)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine
            .on_user_turn("dos".into(), "es".into(), false)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let completions = progress.completions().await;
        assert_eq!(
            completions.iter().filter(|(id, _)| *id == goal.id).count(),
            1,
            "goal id must receive success XP at most once"
        );
    }

    #[tokio::test]
    async fn evaluation_error_is_swallowed_and_busy_released() {
        let evaluator = ScriptedEvaluator::failing();
        let (engine, progress) = engine_with(evaluator);
        engine.seed_initial("es").await.unwrap();

        engine
            .on_user_turn("hola".into(), "es".into(), false)
            .await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Attempt persisted, no XP, busy released for the next turn.
        assert_eq!(progress.saved_count().await, 1);
        assert_eq!(engine.xp_total(), 0);
        assert!(!engine.is_busy().await);
    }

    #[tokio::test]
    async fn clear_releases_busy_and_aborts_task() {
        let evaluator = ScriptedEvaluator::slow_met(10_000);
        let (engine, _progress) = engine_with(evaluator);
        engine.seed_initial("es").await.unwrap();
        engine
            .on_user_turn("hola".into(), "es".into(), false)
            .await;
        assert!(engine.is_busy().await);

        engine.clear().await;
        assert!(!engine.is_busy().await);
        // Goal survives teardown; sessions rebuild around it.
        assert!(engine.active_goal().await.is_some());
    }

    impl GoalEngine {
        /// Seeds a fixed goal without going through a seeder.
        async fn seed_initial_goal_for_tests(&self) {
            let goal = Goal::new("test goal", "say anything");
            let id = goal.id;
            self.state.lock().await.goal = Some(goal);
            self.goal_rev.send_replace(Some(id));
        }
    }
}
