//! Step execution engine: the state machine that drives workflow progress
//!
//! `run_step` captures a value snapshot of everything the provider call
//! needs in one critical section, suspends for the call under a timeout,
//! and merges the outcome back without touching fields it does not own.
//! Operator actions (approve, feedback, model/mode selection, reset) are
//! synchronous transitions over the same store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stepflow_sdk::{
    ExecutionMode, LogLevel, Provider, ProviderError, StepStatus, PROVIDER_TIMEOUT_SECS,
};

use crate::error::EngineError;
use crate::registry::ProviderRegistry;
use crate::state::{StateEvent, StateStore, WorkflowState};

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are an expert assistant executing one step of a \
    multi-step workflow. Produce only the deliverable for the current step. When context from \
    previously approved steps is provided, build on it rather than restating it.";

/// Everything a dispatched run needs, captured before the async boundary.
///
/// The operator may change the model selector or edit feedback while the
/// call is in flight; this snapshot pins the values that were actually sent.
struct RunSnapshot {
    provider: Arc<dyn Provider>,
    title: String,
    prompt: String,
    context: String,
}

/// Concatenate the results of prior approved steps, in step order.
///
/// Only `Completed` steps feed forward; pending, running, paused and errored
/// steps contribute nothing.
fn assemble_context(prior: &[stepflow_sdk::Step]) -> String {
    let blocks: Vec<String> = prior
        .iter()
        .filter(|step| step.status == StepStatus::Completed)
        .filter_map(|step| {
            step.result
                .as_ref()
                .map(|result| format!("[Step: {}]\nResult: {}", step.title, result))
        })
        .collect();
    blocks.join("\n\n")
}

/// Build the final prompt from the immutable template plus optional feedback.
///
/// Deterministic, idempotent concatenation; the stored template is never
/// mutated. Feedback is trimmed and bounded before injection.
fn assemble_prompt(template: &str, feedback: Option<&str>) -> String {
    let feedback = feedback.map(stepflow_sdk::sanitize_feedback).unwrap_or_default();
    if feedback.is_empty() {
        return template.to_string();
    }
    format!(
        "{template}\n\nIMPORTANT USER FEEDBACK\nA human operator reviewed the previous attempt \
         at this step. Revise your output to address the following while still fulfilling the \
         original instructions above:\n{feedback}"
    )
}

pub struct ExecutionEngine {
    store: StateStore,
    registry: Arc<ProviderRegistry>,
    system_instruction: String,
    timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(store: StateStore, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            registry,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            timeout: Duration::from_secs(PROVIDER_TIMEOUT_SECS),
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        if !instruction.trim().is_empty() {
            self.system_instruction = instruction;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Run the step at `index` against the currently selected provider.
    ///
    /// Returns `Ok(())` when a run was dispatched, whether or not the
    /// provider call succeeded; call outcomes land in the step's
    /// `result`/`error` fields and the log. Errors are reserved for
    /// preconditions: out-of-range index, busy engine, unknown provider —
    /// none of which transition any step.
    pub async fn run_step(&self, index: usize) -> Result<(), EngineError> {
        let snapshot: RunSnapshot = self.store.transact(|state| {
            if index >= state.steps.len() {
                return (Vec::new(), Err(EngineError::IndexOutOfRange(index)));
            }
            if state.is_processing {
                // Rejected, not queued: overlapping provider calls would
                // race on the busy flag and the step being written.
                return (Vec::new(), Err(EngineError::Busy));
            }
            // Resolve before any transition so a missing registry entry
            // leaves the target step untouched.
            let model = state.selected_model.clone();
            let provider = match self.registry.resolve(&model) {
                Ok(provider) => provider,
                Err(err) => return (Vec::new(), Err(err)),
            };

            let step = &state.steps[index];
            let run = RunSnapshot {
                provider,
                title: step.title.clone(),
                prompt: assemble_prompt(&step.prompt, step.feedback.as_deref()),
                context: assemble_context(&state.steps[..index]),
            };
            let events = vec![
                StateEvent::StepStarted {
                    index,
                    model: model.clone(),
                },
                StateEvent::LogAppended {
                    level: LogLevel::Info,
                    message: format!("Running step {}: {} ({})", index + 1, run.title, model),
                    details: None,
                },
            ];
            (events, Ok(run))
        })?;

        let started = Instant::now();
        let timeout_secs = self.timeout.as_secs();
        let outcome = match tokio::time::timeout(
            self.timeout,
            snapshot
                .provider
                .generate(&snapshot.prompt, &self.system_instruction, &snapshot.context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout { secs: timeout_secs }),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        // A well-behaved provider never hands back an empty payload, but the
        // engine is the last line of defense for the invariant.
        let outcome = match outcome {
            Ok(text) if text.trim().is_empty() => Err(ProviderError::EmptyResponse),
            other => other,
        };

        match outcome {
            Ok(result) => {
                self.store.transact(|_| {
                    (
                        vec![
                            StateEvent::StepSucceeded {
                                index,
                                result,
                                latency_ms,
                            },
                            StateEvent::LogAppended {
                                level: LogLevel::Success,
                                message: format!(
                                    "Step {} completed in {}ms — awaiting review",
                                    index + 1,
                                    latency_ms
                                ),
                                details: None,
                            },
                        ],
                        (),
                    )
                });
            }
            Err(err) => {
                self.store.transact(|_| {
                    (
                        vec![
                            StateEvent::StepFailed {
                                index,
                                error: err.to_string(),
                            },
                            StateEvent::LogAppended {
                                level: LogLevel::Error,
                                message: format!("Step {} failed: {}", index + 1, snapshot.title),
                                details: Some(err.to_string()),
                            },
                        ],
                        (),
                    )
                });
            }
        }

        Ok(())
    }

    /// Run the current step, failing fast when the workflow is complete.
    pub async fn run_current(&self) -> Result<(), EngineError> {
        let index = {
            let state = self.store.snapshot();
            if state.is_complete() {
                return Err(EngineError::WorkflowComplete);
            }
            state.current_step_index
        };
        self.run_step(index).await
    }

    /// Approve the current paused step and advance the workflow pointer.
    pub fn approve_and_advance(&self) -> Result<(), EngineError> {
        self.store.transact(|state| {
            let index = state.current_step_index;
            let step = match state.steps.get(index) {
                Some(step) => step,
                None => return (Vec::new(), Err(EngineError::WorkflowComplete)),
            };
            if step.status != StepStatus::Paused {
                return (Vec::new(), Err(EngineError::StepNotPaused(step.title.clone())));
            }

            let mut events = vec![
                StateEvent::StepApproved { index },
                StateEvent::LogAppended {
                    level: LogLevel::Success,
                    message: format!("Step {} approved: {}", index + 1, step.title),
                    details: None,
                },
            ];
            if index + 1 == state.steps.len() {
                events.push(StateEvent::LogAppended {
                    level: LogLevel::Success,
                    message: "Workflow complete — all steps approved".to_string(),
                    details: None,
                });
            }
            (events, Ok(()))
        })
    }

    /// Reset all step/progress state; history is preserved.
    ///
    /// Operator confirmation happens in the shell before this is called.
    pub fn reset_workflow(&self) {
        self.store.transact(|_| {
            (
                vec![
                    StateEvent::WorkflowReset,
                    StateEvent::LogAppended {
                        level: LogLevel::Warning,
                        message: "Workflow reset — all step progress cleared".to_string(),
                        details: None,
                    },
                ],
                (),
            )
        });
    }

    /// Attach operator feedback to a step, to be injected on its next run.
    pub fn set_feedback(&self, index: usize, feedback: impl Into<String>) -> Result<(), EngineError> {
        let feedback = feedback.into();
        self.store.transact(|state| {
            if index >= state.steps.len() {
                return (Vec::new(), Err(EngineError::IndexOutOfRange(index)));
            }
            (
                vec![StateEvent::FeedbackEdited { index, feedback }],
                Ok(()),
            )
        })
    }

    /// Select the provider used for subsequent runs; already-run steps keep
    /// their recorded `model_used`.
    pub fn select_model(&self, id: &str) -> Result<(), EngineError> {
        if !self.registry.contains(id) {
            return Err(EngineError::UnknownProvider(id.to_string()));
        }
        self.store.apply(StateEvent::ModelSelected { id: id.to_string() });
        Ok(())
    }

    pub fn set_mode(&self, mode: ExecutionMode) {
        self.store.apply(StateEvent::ModeChanged { mode });
    }

    /// Drive the workflow according to the selected execution mode.
    ///
    /// A policy loop over the same two primitives: each step still lands in
    /// `Paused` first; in batch/all mode the pause is resolved by an
    /// explicit, logged auto-approval. Stops on the first `Error`, at the
    /// mode's window boundary, or at workflow completion. Returns the number
    /// of steps auto-approved.
    pub async fn run_auto(&self) -> Result<usize, EngineError> {
        let mode = self.store.snapshot().execution_mode;
        let limit = match mode {
            ExecutionMode::Step => {
                // Single-step granularity never auto-approves.
                self.run_current().await?;
                return Ok(0);
            }
            ExecutionMode::Batch { size } => size.max(1),
            ExecutionMode::All => usize::MAX,
        };

        let mut approved = 0;
        while approved < limit {
            let state = self.store.snapshot();
            if state.is_complete() {
                break;
            }
            let index = state.current_step_index;
            self.run_step(index).await?;

            let status = self
                .store
                .snapshot()
                .steps
                .get(index)
                .map(|step| step.status);
            match status {
                Some(StepStatus::Paused) => {
                    self.store.log(
                        LogLevel::Info,
                        format!("Auto-approving step {} ({} mode)", index + 1, mode),
                        None,
                    );
                    self.approve_and_advance()?;
                    approved += 1;
                }
                // An errored step needs operator attention; stop the loop.
                _ => break,
            }
        }
        Ok(approved)
    }
}

/// Convenience for tests and the shell: a consistent view of the store.
impl ExecutionEngine {
    pub fn snapshot(&self) -> WorkflowState {
        self.store.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use stepflow_sdk::{async_trait, ProviderMetadata, ProviderResult, Step};

    /// Test double with scripted outcomes; records what it was called with.
    struct ScriptedProvider {
        id: String,
        outcomes: Mutex<VecDeque<ProviderResult<String>>>,
        calls: Mutex<Vec<(String, String, String)>>,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                outcomes: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn with_outcome(self, outcome: ProviderResult<String>) -> Self {
            self.outcomes.lock().unwrap().push_back(outcome);
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn last_call(&self) -> Option<(String, String, String)> {
            self.calls.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn metadata(&self) -> ProviderMetadata {
            ProviderMetadata {
                id: self.id.clone(),
                name: format!("Scripted {}", self.id),
                description: "test double".to_string(),
                local: true,
            }
        }

        async fn generate(
            &self,
            prompt: &str,
            system_instruction: &str,
            context: &str,
        ) -> ProviderResult<String> {
            self.calls.lock().unwrap().push((
                prompt.to_string(),
                system_instruction.to_string(),
                context.to_string(),
            ));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("scripted output".to_string()))
        }
    }

    fn three_step_store() -> StateStore {
        StateStore::new(WorkflowState::new(
            vec![
                Step::new("a", "Step A", "prompt a"),
                Step::new("b", "Step B", "prompt b"),
                Step::new("c", "Step C", "prompt c"),
            ],
            "scripted",
        ))
    }

    fn engine_with(provider: Arc<ScriptedProvider>) -> ExecutionEngine {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        ExecutionEngine::new(three_step_store(), Arc::new(registry))
    }

    #[tokio::test]
    async fn test_successful_run_pauses_for_review() {
        let provider =
            Arc::new(ScriptedProvider::new("scripted").with_outcome(Ok("R0".to_string())));
        let engine = engine_with(provider.clone());

        engine.run_step(0).await.unwrap();

        let state = engine.snapshot();
        assert_eq!(state.steps[0].status, StepStatus::Paused);
        assert_eq!(state.steps[0].result.as_deref(), Some("R0"));
        assert_eq!(state.steps[0].model_used.as_deref(), Some("scripted"));
        assert!(state.steps[0].latency_ms.is_some());
        assert!(!state.is_processing);
        assert!(state
            .history
            .iter()
            .any(|e| e.level == LogLevel::Success && e.message.contains("awaiting review")));
    }

    #[tokio::test]
    async fn test_context_contains_only_completed_results_in_order() {
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_outcome(Ok("R0".to_string()))
                .with_outcome(Ok("R1".to_string())),
        );
        let engine = engine_with(provider.clone());

        engine.run_step(0).await.unwrap();
        engine.approve_and_advance().unwrap();
        assert_eq!(engine.snapshot().current_step_index, 1);

        engine.run_step(1).await.unwrap();
        let (_, _, context) = provider.last_call().unwrap();
        assert_eq!(context, "[Step: Step A]\nResult: R0");
    }

    #[tokio::test]
    async fn test_context_skips_paused_and_errored_steps() {
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_outcome(Ok("R0".to_string()))
                .with_outcome(Err(ProviderError::Upstream("boom".to_string())))
                .with_outcome(Ok("R2".to_string())),
        );
        let engine = engine_with(provider.clone());

        // Step 0 approved, step 1 errored: only step 0 feeds forward.
        engine.run_step(0).await.unwrap();
        engine.approve_and_advance().unwrap();
        engine.run_step(1).await.unwrap();
        assert_eq!(engine.snapshot().steps[1].status, StepStatus::Error);

        engine.run_step(2).await.unwrap();
        let (_, _, context) = provider.last_call().unwrap();
        assert_eq!(context, "[Step: Step A]\nResult: R0");
    }

    #[tokio::test]
    async fn test_feedback_is_injected_on_rerun_without_mutating_template() {
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_outcome(Ok("first draft".to_string()))
                .with_outcome(Ok("second draft".to_string())),
        );
        let engine = engine_with(provider.clone());

        engine.run_step(0).await.unwrap();
        engine.set_feedback(0, "  make it shorter  ").unwrap();
        engine.run_step(0).await.unwrap();

        let (prompt, _, _) = provider.last_call().unwrap();
        assert!(prompt.starts_with("prompt a"));
        assert!(prompt.contains("IMPORTANT USER FEEDBACK"));
        assert!(prompt.ends_with("make it shorter"));
        // The stored template is untouched
        assert_eq!(engine.snapshot().steps[0].prompt, "prompt a");
    }

    #[tokio::test]
    async fn test_auth_failure_marks_step_error_and_clears_processing() {
        let provider = Arc::new(ScriptedProvider::new("scripted").with_outcome(Err(
            ProviderError::Auth("authentication failed — check GEMINI_API_KEY".to_string()),
        )));
        let engine = engine_with(provider);

        engine.run_step(0).await.unwrap();

        let state = engine.snapshot();
        assert_eq!(state.steps[0].status, StepStatus::Error);
        assert!(state.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("authentication"));
        assert!(!state.is_processing);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_good_result_visible() {
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_outcome(Ok("good output".to_string()))
                .with_outcome(Err(ProviderError::Upstream("bad gateway".to_string()))),
        );
        let engine = engine_with(provider);

        engine.run_step(0).await.unwrap();
        engine.run_step(0).await.unwrap();

        let state = engine.snapshot();
        assert_eq!(state.steps[0].status, StepStatus::Error);
        assert_eq!(state.steps[0].result.as_deref(), Some("good output"));
        assert!(state.steps[0].error.as_deref().unwrap().contains("bad gateway"));
    }

    #[tokio::test]
    async fn test_empty_payload_becomes_error() {
        let provider =
            Arc::new(ScriptedProvider::new("scripted").with_outcome(Ok("   \n".to_string())));
        let engine = engine_with(provider);

        engine.run_step(0).await.unwrap();

        let state = engine.snapshot();
        assert_eq!(state.steps[0].status, StepStatus::Error);
        assert!(state.steps[0].error.as_deref().unwrap().contains("no usable text"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_outcome(Ok("too late".to_string()))
                .with_delay(Duration::from_secs(120)),
        );
        let engine = engine_with(provider);

        engine.run_step(0).await.unwrap();

        let state = engine.snapshot();
        assert_eq!(state.steps[0].status, StepStatus::Error);
        assert!(state.steps[0].error.as_deref().unwrap().contains("timed out"));
        assert!(!state.is_processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_run_is_rejected_not_queued() {
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_outcome(Ok("slow output".to_string()))
                .with_delay(Duration::from_secs(5)),
        );
        let engine = Arc::new(engine_with(provider));

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_step(0).await }
        });
        // Let the first run reach its suspension point.
        tokio::task::yield_now().await;
        assert!(engine.snapshot().is_processing);

        let before = engine.snapshot();
        let second = engine.run_step(1).await;
        assert!(matches!(second, Err(EngineError::Busy)));
        // The rejected invocation had no effect on workflow state.
        assert_eq!(engine.snapshot().steps, before.steps);

        first.await.unwrap().unwrap();
        assert_eq!(engine.snapshot().steps[0].status, StepStatus::Paused);
    }

    #[tokio::test]
    async fn test_unknown_provider_leaves_step_untouched() {
        let provider = Arc::new(ScriptedProvider::new("scripted"));
        let engine = engine_with(provider);
        engine
            .store()
            .apply(StateEvent::ModelSelected { id: "ghost".to_string() });

        let err = engine.run_step(0).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownProvider(id) if id == "ghost"));

        let state = engine.snapshot();
        assert_eq!(state.steps[0].status, StepStatus::Pending);
        assert!(!state.is_processing);
    }

    #[tokio::test]
    async fn test_run_step_out_of_range() {
        let engine = engine_with(Arc::new(ScriptedProvider::new("scripted")));
        let err = engine.run_step(9).await.unwrap_err();
        assert!(matches!(err, EngineError::IndexOutOfRange(9)));
    }

    #[tokio::test]
    async fn test_approve_requires_paused_step() {
        let engine = engine_with(Arc::new(ScriptedProvider::new("scripted")));
        let err = engine.approve_and_advance().unwrap_err();
        assert!(matches!(err, EngineError::StepNotPaused(_)));
    }

    #[tokio::test]
    async fn test_model_recorded_at_invocation_time() {
        let slow = Arc::new(
            ScriptedProvider::new("slow-model")
                .with_outcome(Ok("slow output".to_string()))
                .with_delay(Duration::from_millis(50)),
        );
        let other = Arc::new(ScriptedProvider::new("other-model"));
        let mut registry = ProviderRegistry::new();
        registry.register(slow.clone());
        registry.register(other);
        let store = StateStore::new(WorkflowState::new(
            vec![Step::new("a", "Step A", "prompt a")],
            "slow-model",
        ));
        let engine = Arc::new(ExecutionEngine::new(store, Arc::new(registry)));

        let run = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_step(0).await }
        });
        tokio::task::yield_now().await;
        // Operator flips the selector mid-flight; the record must not move.
        engine.select_model("other-model").unwrap();
        run.await.unwrap().unwrap();

        let state = engine.snapshot();
        assert_eq!(state.steps[0].model_used.as_deref(), Some("slow-model"));
        assert_eq!(state.selected_model, "other-model");
    }

    #[tokio::test]
    async fn test_run_auto_all_completes_workflow() {
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_outcome(Ok("R0".to_string()))
                .with_outcome(Ok("R1".to_string()))
                .with_outcome(Ok("R2".to_string())),
        );
        let engine = engine_with(provider);
        engine.set_mode(ExecutionMode::All);

        let approved = engine.run_auto().await.unwrap();
        assert_eq!(approved, 3);

        let state = engine.snapshot();
        assert!(state.is_complete());
        assert!(state
            .steps
            .iter()
            .all(|step| step.status == StepStatus::Completed));
        assert!(state
            .history
            .iter()
            .any(|e| e.message.contains("Workflow complete")));
    }

    #[tokio::test]
    async fn test_run_auto_batch_stops_at_window() {
        let engine = engine_with(Arc::new(ScriptedProvider::new("scripted")));
        engine.set_mode(ExecutionMode::Batch { size: 2 });

        let approved = engine.run_auto().await.unwrap();
        assert_eq!(approved, 2);

        let state = engine.snapshot();
        assert_eq!(state.current_step_index, 2);
        assert_eq!(state.steps[2].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_auto_stops_on_error() {
        let provider = Arc::new(
            ScriptedProvider::new("scripted")
                .with_outcome(Ok("R0".to_string()))
                .with_outcome(Err(ProviderError::RateLimit("quota exhausted".to_string()))),
        );
        let engine = engine_with(provider);
        engine.set_mode(ExecutionMode::All);

        let approved = engine.run_auto().await.unwrap();
        assert_eq!(approved, 1);

        let state = engine.snapshot();
        assert_eq!(state.current_step_index, 1);
        assert_eq!(state.steps[1].status, StepStatus::Error);
        assert_eq!(state.steps[2].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_auto_step_mode_never_auto_approves() {
        let engine = engine_with(Arc::new(ScriptedProvider::new("scripted")));

        let approved = engine.run_auto().await.unwrap();
        assert_eq!(approved, 0);

        let state = engine.snapshot();
        assert_eq!(state.steps[0].status, StepStatus::Paused);
        assert_eq!(state.current_step_index, 0);
    }

    #[test]
    fn test_assemble_prompt_is_idempotent_concatenation() {
        let once = assemble_prompt("template", Some("feedback"));
        let again = assemble_prompt("template", Some("feedback"));
        assert_eq!(once, again);
        assert_eq!(assemble_prompt("template", None), "template");
        assert_eq!(assemble_prompt("template", Some("   ")), "template");
    }
}
