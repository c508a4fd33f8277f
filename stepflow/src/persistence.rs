//! Best-effort session persistence
//!
//! Snapshots are plain JSON under the platform data directory. Loading is
//! defensive: anything malformed or inconsistent with the active workflow
//! definition falls back to a fresh initial state — corrupt persisted data
//! must never crash the session or block progress.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stepflow_sdk::{ExecutionMode, LogEntry, Step, StepStatus, HISTORY_CAP};

use crate::definition::WorkflowDefinition;
use crate::error::PersistenceError;
use crate::registry::ProviderRegistry;
use crate::state::WorkflowState;

pub const SNAPSHOT_VERSION: u32 = 1;

/// The persisted record: live state minus nothing, plus a version tag.
///
/// `is_processing` is recorded for fidelity but always restores to false —
/// an in-flight provider call cannot survive a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub steps: Vec<Step>,
    pub current_step_index: usize,
    pub selected_model: String,
    pub execution_mode: ExecutionMode,
    pub is_processing: bool,
    pub history: Vec<LogEntry>,
}

impl SessionSnapshot {
    pub fn capture(state: &WorkflowState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            steps: state.steps.clone(),
            current_step_index: state.current_step_index,
            selected_model: state.selected_model.clone(),
            execution_mode: state.execution_mode,
            is_processing: state.is_processing,
            history: state.history.clone(),
        }
    }
}

/// Snapshot location under the platform data directory
pub fn default_snapshot_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "stepflow")
        .map(|dirs| dirs.data_dir().join("session.json"))
}

pub fn save_snapshot(path: &Path, state: &WorkflowState) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(&SessionSnapshot::capture(state))?;
    fs::write(path, json).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_snapshot(path: &Path) -> Result<SessionSnapshot, PersistenceError> {
    let json = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&json)?)
}

/// Validate a loaded snapshot against the active definition and registry,
/// and normalize it into live state.
///
/// A step persisted as `Running` restores as `Pending`: the attempt it was
/// part of is gone, and pending makes the step immediately re-runnable.
pub fn restore_state(
    snapshot: SessionSnapshot,
    definition: &WorkflowDefinition,
    registry: &ProviderRegistry,
) -> Result<WorkflowState, PersistenceError> {
    if snapshot.steps.len() != definition.steps.len() {
        return Err(PersistenceError::Invalid(format!(
            "saved session has {} steps but the workflow defines {}",
            snapshot.steps.len(),
            definition.steps.len()
        )));
    }
    for (saved, template) in snapshot.steps.iter().zip(&definition.steps) {
        if saved.id != template.id {
            return Err(PersistenceError::Invalid(format!(
                "saved step `{}` does not match workflow step `{}`",
                saved.id, template.id
            )));
        }
    }
    if snapshot.current_step_index > snapshot.steps.len() {
        return Err(PersistenceError::Invalid(format!(
            "saved step index {} is out of range",
            snapshot.current_step_index
        )));
    }
    if !registry.contains(&snapshot.selected_model) {
        return Err(PersistenceError::Invalid(format!(
            "saved model `{}` is not a registered provider",
            snapshot.selected_model
        )));
    }

    let mut steps = snapshot.steps;
    for step in &mut steps {
        if step.status == StepStatus::Running {
            step.status = StepStatus::Pending;
        }
    }
    let mut history = snapshot.history;
    if history.len() > HISTORY_CAP {
        let excess = history.len() - HISTORY_CAP;
        history.drain(..excess);
    }

    Ok(WorkflowState {
        steps,
        current_step_index: snapshot.current_step_index,
        selected_model: snapshot.selected_model,
        execution_mode: snapshot.execution_mode,
        is_processing: false,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stepflow_sdk::{async_trait, Provider, ProviderMetadata, ProviderResult, StepStatus};

    struct StubProvider;

    #[async_trait]
    impl Provider for StubProvider {
        fn metadata(&self) -> ProviderMetadata {
            ProviderMetadata {
                id: "stub".to_string(),
                name: "Stub".to_string(),
                description: String::new(),
                local: true,
            }
        }

        async fn generate(
            &self,
            _prompt: &str,
            _system_instruction: &str,
            _context: &str,
        ) -> ProviderResult<String> {
            Ok("stub".to_string())
        }
    }

    fn test_registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(StubProvider));
        registry
    }

    fn test_definition() -> WorkflowDefinition {
        WorkflowDefinition::from_yaml(
            r#"
name: Test
steps:
  - id: a
    title: Step A
    prompt: p a
  - id: b
    title: Step B
    prompt: p b
        "#,
        )
        .unwrap()
    }

    fn advanced_state() -> WorkflowState {
        let definition = test_definition();
        let mut state = definition.initial_state("stub");
        state.steps[0].status = StepStatus::Completed;
        state.steps[0].result = Some("R0".to_string());
        state.steps[0].latency_ms = Some(800);
        state.steps[1].status = StepStatus::Paused;
        state.steps[1].result = Some("R1".to_string());
        state.current_step_index = 1;
        state
    }

    #[test]
    fn test_snapshot_round_trip_preserves_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let state = advanced_state();

        save_snapshot(&path, &state).unwrap();
        let snapshot = load_snapshot(&path).unwrap();
        let restored = restore_state(snapshot, &test_definition(), &test_registry()).unwrap();

        assert_eq!(restored.steps, state.steps);
        assert_eq!(restored.current_step_index, 1);
        assert_eq!(restored.selected_model, "stub");
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("session.json");
        save_snapshot(&path, &advanced_state()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_corrupt_json_is_a_recoverable_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_snapshot(&path).unwrap_err();
        assert!(matches!(err, PersistenceError::Serde(_)));
    }

    #[test]
    fn test_unknown_model_rejected_on_restore() {
        let mut state = advanced_state();
        state.selected_model = "retired-model".to_string();
        let snapshot = SessionSnapshot::capture(&state);

        let err = restore_state(snapshot, &test_definition(), &test_registry()).unwrap_err();
        assert!(matches!(err, PersistenceError::Invalid(msg) if msg.contains("retired-model")));
    }

    #[test]
    fn test_mismatched_steps_rejected_on_restore() {
        let state = advanced_state();
        let mut snapshot = SessionSnapshot::capture(&state);
        snapshot.steps[1].id = "renamed".to_string();

        let err = restore_state(snapshot, &test_definition(), &test_registry()).unwrap_err();
        assert!(matches!(err, PersistenceError::Invalid(_)));
    }

    #[test]
    fn test_out_of_range_index_rejected_on_restore() {
        let state = advanced_state();
        let mut snapshot = SessionSnapshot::capture(&state);
        snapshot.current_step_index = 99;

        let err = restore_state(snapshot, &test_definition(), &test_registry()).unwrap_err();
        assert!(matches!(err, PersistenceError::Invalid(_)));
    }

    #[test]
    fn test_interrupted_run_restores_as_pending_and_idle() {
        let mut state = advanced_state();
        state.steps[1].status = StepStatus::Running;
        state.is_processing = true;
        let snapshot = SessionSnapshot::capture(&state);

        let restored = restore_state(snapshot, &test_definition(), &test_registry()).unwrap();
        assert_eq!(restored.steps[1].status, StepStatus::Pending);
        assert!(!restored.is_processing);
    }
}
