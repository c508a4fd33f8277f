//! Shared data model and provider contract for stepflow workflows
//!
//! This crate holds everything the execution engine and the operator shell
//! need to agree on: the step lifecycle, the workflow log model, execution
//! granularity, and the [`Provider`] trait that pluggable model backends
//! implement.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Re-export async trait for convenience
pub use async_trait::async_trait;

/// Maximum length of operator feedback attached to a step, in characters.
pub const FEEDBACK_MAX_CHARS: usize = 2000;

/// Maximum number of log entries retained in workflow history. Older entries
/// are evicted first; the history is a bounded ring, not an audit trail.
pub const HISTORY_CAP: usize = 500;

/// Timeout for a single provider call, in seconds.
pub const PROVIDER_TIMEOUT_SECS: u64 = 60;

/// Default number of steps auto-approved per batch when no size is given.
pub const DEFAULT_BATCH_SIZE: usize = 3;

/// Lifecycle status of a single workflow step
///
/// `Pending → Running → {Paused | Error}`; a paused step is either approved
/// (`Completed`, terminal) or re-run with feedback. An errored step may be
/// re-run as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Error,
}

/// One prompt/response unit in the linear workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Stable identifier from the workflow definition
    pub id: String,
    pub title: String,
    /// Immutable prompt template set at definition time
    pub prompt: String,
    pub status: StepStatus,
    /// Output of the most recent successful run
    pub result: Option<String>,
    /// Failure message of the most recent run; cleared when the step is re-run
    pub error: Option<String>,
    /// Operator feedback, injected into the prompt on re-run only
    pub feedback: Option<String>,
    /// Provider selected at the time the step last started running
    pub model_used: Option<String>,
    /// When the step last started running
    pub timestamp: Option<DateTime<Local>>,
    /// Wall-clock duration of the last provider call, in milliseconds
    pub latency_ms: Option<u64>,
}

impl Step {
    /// Create a fresh pending step from definition data
    pub fn new(id: impl Into<String>, title: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            prompt: prompt.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            feedback: None,
            model_used: None,
            timestamp: None,
            latency_ms: None,
        }
    }
}

/// Trim operator feedback and bound it to [`FEEDBACK_MAX_CHARS`] characters.
///
/// Truncation counts characters, not bytes, so multi-byte input never splits
/// a code point.
pub fn sanitize_feedback(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(FEEDBACK_MAX_CHARS) {
        Some((byte_idx, _)) => trimmed[..byte_idx].to_string(),
        None => trimmed.to_string(),
    }
}

/// Severity of a workflow log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Immutable entry in the bounded workflow history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
    /// Optional diagnostic detail, e.g. the full provider failure text
    pub details: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Local::now(),
            level,
            message: message.into(),
            details,
        }
    }
}

/// Execution granularity: how many steps run before the workflow forces a
/// pause for operator review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run one step, then pause for review (the default)
    Step,
    /// Auto-approve up to `size` steps, then pause
    Batch { size: usize },
    /// Auto-approve through to the end of the workflow
    All,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Step
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Step => write!(f, "step"),
            ExecutionMode::Batch { size } => write!(f, "batch({})", size),
            ExecutionMode::All => write!(f, "all"),
        }
    }
}

/// Static provider metadata (id, display name, description)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Registry identifier, also recorded as a step's `model_used`
    pub id: String,
    pub name: String,
    pub description: String,
    /// Informational only: true for offline/simulated backends
    pub local: bool,
}

/// Failure taxonomy for provider calls
///
/// Every variant carries a human-actionable message; a provider must fail
/// with one of these rather than return an empty or partial string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limit or quota exceeded: {0}")]
    RateLimit(String),
    #[error("provider call timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("provider returned no usable text")]
    EmptyResponse,
    #[error("provider request failed: {0}")]
    Upstream(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Contract implemented by every pluggable model backend
///
/// `generate` is the only network/external boundary in the system. Context is
/// the concatenated output of previously approved steps; the system
/// instruction applies to the whole workflow.
#[async_trait]
pub trait Provider: Send + Sync {
    fn metadata(&self) -> ProviderMetadata;

    async fn generate(
        &self,
        prompt: &str,
        system_instruction: &str,
        context: &str,
    ) -> ProviderResult<String>;
}

// ============================================================================
// Console Logging Macros (for the CLI operator shell)
// ============================================================================

/// Logs an informational message.
#[macro_export]
macro_rules! log_info {
    ($message:expr) => {
        println!("\x1b[36mℹ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[36mℹ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs a success message.
#[macro_export]
macro_rules! log_success {
    ($message:expr) => {
        println!("\x1b[32m✓ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[32m✓ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs a warning message.
#[macro_export]
macro_rules! log_warning {
    ($message:expr) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs an error message.
#[macro_export]
macro_rules! log_error {
    ($message:expr) => {
        println!("\x1b[31m✗ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[31m✗ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}
