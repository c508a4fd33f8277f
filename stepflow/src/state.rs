//! Workflow state store: the single source of truth for a session
//!
//! All mutation goes through [`transition`], a pure function over a closed
//! event set. [`StateStore`] serializes event application under one lock;
//! callers never see partial in-place mutation.

use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::{Deserialize, Serialize};
use stepflow_sdk::{
    sanitize_feedback, ExecutionMode, LogEntry, LogLevel, Step, StepStatus, HISTORY_CAP,
};

/// Aggregate root for one workflow session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Ordered steps; insertion order is execution order, fixed for the session
    pub steps: Vec<Step>,
    /// Index of the next step to run; equals `steps.len()` when complete
    pub current_step_index: usize,
    /// Provider used for the next dispatched run
    pub selected_model: String,
    pub execution_mode: ExecutionMode,
    /// True strictly for the duration of one in-flight provider call
    pub is_processing: bool,
    /// Bounded ring of the most recent log entries
    pub history: Vec<LogEntry>,
}

impl WorkflowState {
    pub fn new(steps: Vec<Step>, selected_model: impl Into<String>) -> Self {
        Self {
            steps,
            current_step_index: 0,
            selected_model: selected_model.into(),
            execution_mode: ExecutionMode::default(),
            is_processing: false,
            history: Vec::new(),
        }
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    pub fn is_complete(&self) -> bool {
        self.current_step_index >= self.steps.len()
    }
}

/// The closed set of state mutations
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// A step began running with the model selected at invocation time
    StepStarted { index: usize, model: String },
    /// A provider call succeeded; the step pauses for review
    StepSucceeded {
        index: usize,
        result: String,
        latency_ms: u64,
    },
    /// A provider call failed; the previous result, if any, is kept
    StepFailed { index: usize, error: String },
    /// The operator approved a paused step
    StepApproved { index: usize },
    /// The operator edited feedback for a step
    FeedbackEdited { index: usize, feedback: String },
    ModelSelected { id: String },
    ModeChanged { mode: ExecutionMode },
    LogAppended {
        level: LogLevel,
        message: String,
        details: Option<String>,
    },
    /// All step/progress state back to initial; history is preserved
    WorkflowReset,
}

/// Pure transition function `(state, event) -> state`
///
/// Events carrying an out-of-range index leave the state unchanged; range
/// checks belong to the engine, which validates before emitting.
pub fn transition(mut state: WorkflowState, event: StateEvent) -> WorkflowState {
    match event {
        StateEvent::StepStarted { index, model } => {
            if let Some(step) = state.steps.get_mut(index) {
                step.status = StepStatus::Running;
                step.model_used = Some(model);
                step.error = None;
                step.timestamp = Some(Local::now());
                state.is_processing = true;
            }
        }
        StateEvent::StepSucceeded {
            index,
            result,
            latency_ms,
        } => {
            // Merge touches only the fields this operation owns; feedback
            // edited while the call was in flight survives.
            if let Some(step) = state.steps.get_mut(index) {
                step.status = StepStatus::Paused;
                step.result = Some(result);
                step.error = None;
                step.latency_ms = Some(latency_ms);
            }
            state.is_processing = false;
        }
        StateEvent::StepFailed { index, error } => {
            if let Some(step) = state.steps.get_mut(index) {
                step.status = StepStatus::Error;
                step.error = Some(error);
            }
            state.is_processing = false;
        }
        StateEvent::StepApproved { index } => {
            if let Some(step) = state.steps.get_mut(index) {
                step.status = StepStatus::Completed;
                state.current_step_index = index + 1;
            }
        }
        StateEvent::FeedbackEdited { index, feedback } => {
            if let Some(step) = state.steps.get_mut(index) {
                let sanitized = sanitize_feedback(&feedback);
                step.feedback = if sanitized.is_empty() {
                    None
                } else {
                    Some(sanitized)
                };
            }
        }
        StateEvent::ModelSelected { id } => {
            state.selected_model = id;
        }
        StateEvent::ModeChanged { mode } => {
            state.execution_mode = mode;
        }
        StateEvent::LogAppended {
            level,
            message,
            details,
        } => {
            push_log(&mut state, LogEntry::new(level, message, details));
        }
        StateEvent::WorkflowReset => {
            for step in &mut state.steps {
                step.status = StepStatus::Pending;
                step.result = None;
                step.error = None;
                step.feedback = None;
                step.model_used = None;
                step.timestamp = None;
                step.latency_ms = None;
            }
            state.current_step_index = 0;
            state.is_processing = false;
        }
    }
    state
}

fn push_log(state: &mut WorkflowState, entry: LogEntry) {
    state.history.push(entry);
    if state.history.len() > HISTORY_CAP {
        let excess = state.history.len() - HISTORY_CAP;
        state.history.drain(..excess);
    }
}

/// Thread-safe wrapper applying events atomically over the aggregate
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<WorkflowState>>,
}

impl StateStore {
    pub fn new(state: WorkflowState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Consistent copy of the current state
    pub fn snapshot(&self) -> WorkflowState {
        self.inner.lock().unwrap().clone()
    }

    pub fn apply(&self, event: StateEvent) {
        let mut state = self.inner.lock().unwrap();
        *state = transition(state.clone(), event);
    }

    /// Read the state and apply follow-up events in one critical section.
    ///
    /// The closure decides which events to emit based on a consistent view;
    /// nothing else can interleave between the read and the writes. The lock
    /// is never held across an await point.
    pub fn transact<R>(&self, f: impl FnOnce(&WorkflowState) -> (Vec<StateEvent>, R)) -> R {
        let mut state = self.inner.lock().unwrap();
        let (events, out) = f(&state);
        for event in events {
            *state = transition(state.clone(), event);
        }
        out
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, details: Option<String>) {
        self.apply(StateEvent::LogAppended {
            level,
            message: message.into(),
            details,
        });
    }
}
