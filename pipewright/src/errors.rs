//! Error types for pipewright.
//!
//! The taxonomy mirrors how failures propagate through the system:
//! definition problems ([`PipelineValidationError`], [`CycleDetectedError`])
//! are always fatal and surfaced synchronously, [`NotFoundError`] is fatal
//! only to the requested operation, [`LockTimeoutError`] leaves the retry
//! decision to the caller, and [`StageFailure`] is subject to the stage's
//! `retries` and `required` settings. Cache-tier errors never appear here;
//! they are absorbed inside the cache.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::lock::LockOwner;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PipewrightError>;

/// Stable error codes attached to [`ErrorInfo`].
pub mod codes {
    /// Structural or semantic schema violation.
    pub const INVALID: &str = "DEFINITION-INVALID";
    /// A stage references an ID that does not exist.
    pub const MISSING_REF: &str = "DEFINITION-MISSING-REF";
    /// Two stages share an ID.
    pub const DUPLICATE_ID: &str = "DEFINITION-DUPLICATE-ID";
    /// The definition has no stages.
    pub const EMPTY: &str = "DEFINITION-EMPTY";
    /// Circular `depends_on` edges or `extends` chain.
    pub const CYCLE: &str = "DEFINITION-CYCLE";
    /// A child redefines a parent stage without `override: true`.
    pub const CONFLICT: &str = "DEFINITION-CONFLICT";
    /// The document could not be parsed.
    pub const PARSE: &str = "DEFINITION-PARSE";
}

/// The main error type for pipewright operations.
#[derive(Debug, Error)]
pub enum PipewrightError {
    /// A definition failed validation.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A dependency cycle was detected.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A named resource (definition, backup) does not exist.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// A lock could not be acquired within its retry budget.
    #[error("{0}")]
    LockTimeout(#[from] LockTimeoutError),

    /// An agent invocation failed after exhausting its retries.
    #[error("{0}")]
    StageFailure(#[from] StageFailure),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Archive creation or extraction failed.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Off-box object storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipewrightError {
    /// Returns a stable, machine-parseable code for this error.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Validation(e) => e
                .error_info
                .as_ref()
                .map_or(codes::INVALID, |info| info.code.as_str()),
            Self::CycleDetected(_) => codes::CYCLE,
            Self::NotFound(_) => "NOT-FOUND",
            Self::LockTimeout(_) => "LOCK-TIMEOUT",
            Self::StageFailure(_) => "STAGE-FAILURE",
            Self::Config(_) => "CONFIG",
            Self::Archive(_) => "ARCHIVE",
            Self::Storage(_) => "STORAGE",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Io(_) => "IO",
        }
    }

    /// Returns true if retrying the whole operation may succeed.
    ///
    /// Definition errors are never retryable: the document has to change.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout(_) | Self::StageFailure(_) | Self::Storage(_) | Self::Io(_)
        )
    }
}

impl From<serde_json::Error> for PipewrightError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Diagnostic metadata attached to definition errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (one of [`codes`]).
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a definition fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Shorthand for an error with a code and no hint.
    #[must_use]
    pub fn coded(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(message.clone()).with_error_info(ErrorInfo::new(code, message))
    }
}

/// Error raised when a cycle is detected, either among stage `depends_on`
/// edges or along an `extends` chain.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in {scope}: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// What the cycle runs through ("pipeline 'x'" or "extends chain").
    pub scope: String,
    /// The path of nodes forming the cycle, first node repeated at the end.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(scope: impl Into<String>, cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            codes::CYCLE,
            format!("Dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            scope: scope.into(),
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a named resource does not exist.
#[derive(Debug, Clone, Error)]
#[error("{kind} '{name}' not found{}", searched_suffix(.searched))]
pub struct NotFoundError {
    /// Kind of resource ("definition", "backup").
    pub kind: String,
    /// Requested name or ID.
    pub name: String,
    /// Locations probed, for diagnostics.
    pub searched: Vec<String>,
}

fn searched_suffix(searched: &[String]) -> String {
    if searched.is_empty() {
        String::new()
    } else {
        format!(" (searched: {})", searched.join(", "))
    }
}

impl NotFoundError {
    /// Creates a new not-found error.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            searched: Vec::new(),
        }
    }

    /// Records the locations that were searched.
    #[must_use]
    pub fn with_searched(mut self, searched: Vec<String>) -> Self {
        self.searched = searched;
        self
    }
}

/// Error raised when lock acquisition exhausts its retries.
#[derive(Debug, Clone, Error)]
#[error(
    "Timed out acquiring lock on '{resource}' after {attempts} attempt(s){}",
    owner_suffix(.owner)
)]
pub struct LockTimeoutError {
    /// The protected resource.
    pub resource: String,
    /// The current (or last-known) holder.
    pub owner: Option<LockOwner>,
    /// Number of acquisition attempts made.
    pub attempts: u32,
}

fn owner_suffix(owner: &Option<LockOwner>) -> String {
    owner
        .as_ref()
        .map(|o| format!("; held by {o}"))
        .unwrap_or_default()
}

/// Error raised when a stage's agent invocation fails for good.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub struct StageFailure {
    /// The stage ID.
    pub stage: String,
    /// The agent identifier.
    pub agent: String,
    /// Attempts made (initial + retries).
    pub attempts: u32,
    /// Failure reason from the last attempt.
    pub reason: String,
    /// Whether the last attempt exceeded the stage timeout.
    pub timed_out: bool,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stage '{}' (agent '{}') failed after {} attempt(s): {}",
            self.stage, self.agent, self.attempts, self.reason
        )?;
        if self.timed_out {
            write!(f, " [timed out]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "my_stage");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"my_stage".to_string()));
    }

    #[test]
    fn test_cycle_detected_error_message() {
        let err = CycleDetectedError::new(
            "pipeline 'book'",
            vec!["a".into(), "b".into(), "c".into(), "a".into()],
        );

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert!(err.to_string().contains("pipeline 'book'"));
        assert_eq!(err.error_info.code, codes::CYCLE);
    }

    #[test]
    fn test_validation_code_passthrough() {
        let err: PipewrightError =
            PipelineValidationError::coded(codes::MISSING_REF, "Stage 'b' depends on 'x'").into();
        assert_eq!(err.code(), codes::MISSING_REF);
        assert!(!err.is_retryable());

        let plain: PipewrightError = PipelineValidationError::new("bad").into();
        assert_eq!(plain.code(), codes::INVALID);
    }

    #[test]
    fn test_not_found_lists_searched_paths() {
        let err = NotFoundError::new("definition", "ebook")
            .with_searched(vec!["/a/ebook.yaml".into(), "/b/ebook.yaml".into()]);
        let msg = err.to_string();
        assert!(msg.starts_with("definition 'ebook' not found"));
        assert!(msg.contains("/b/ebook.yaml"));
    }

    #[test]
    fn test_lock_timeout_reports_owner() {
        let owner = LockOwner {
            pid: 42,
            hostname: "builder".into(),
            token: "abc".into(),
        };
        let err = LockTimeoutError {
            resource: "/data/state.json".into(),
            owner: Some(owner),
            attempts: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("/data/state.json"));
        assert!(msg.contains("pid 42"));
        assert!(PipewrightError::from(err).is_retryable());
    }

    #[test]
    fn test_stage_failure_display() {
        let failure = StageFailure {
            stage: "render".into(),
            agent: "pdf".into(),
            attempts: 3,
            reason: "boom".into(),
            timed_out: true,
        };
        assert_eq!(
            failure.to_string(),
            "Stage 'render' (agent 'pdf') failed after 3 attempt(s): boom [timed out]"
        );
    }
}
