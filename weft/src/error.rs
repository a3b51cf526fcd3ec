//! Engine error types.
//!
//! One taxonomy for the whole engine: parse/validation errors carry paths and
//! suggestions, LLM failures live in [`LlmError`](crate::llm::LlmError) and are
//! wrapped here, and the control-plane maps these kinds onto HTTP statuses and
//! CLI exit codes.

use thiserror::Error;
use uuid::Uuid;

use crate::llm::LlmError;

/// One semantic validation finding: where, what, and (when an identifier was
/// close to a known one) a "did you mean" suggestion.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ValidationIssue {
    /// Dotted/indexed path into the declaration, e.g. `nodes[2].outputs[0]`.
    pub path: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean `{}`?)", s)?;
        }
        Ok(())
    }
}

/// All issues found by one validation pass. Passes are fail-fast per category:
/// every issue within the failing pass is collected before the pass errors.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.issues.as_slice() {
            [] => write!(f, "no issues"),
            [only] => write!(f, "{}", only),
            [first, rest @ ..] => write!(f, "{} (+{} more)", first, rest.len()),
        }
    }
}

/// Engine error. Returned by declaration loading, plan building, node and run
/// execution, the registries, and the stores.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Surface syntax invalid (YAML/JSON did not parse, or a structural field
    /// was missing/unknown/outside its closed enumeration).
    #[error("config parse: {0}")]
    ConfigParse(String),

    /// A semantic rule was violated; carries every issue from the failing pass.
    #[error("config validation: {0}")]
    ConfigValidation(ValidationReport),

    /// A runtime value does not match its declared type.
    #[error("type validation at `{path}`: {message}")]
    TypeValidation { path: String, message: String },

    /// A `{placeholder}` did not resolve against inputs + state.
    #[error("template resolution: {0}")]
    TemplateResolution(String),

    #[error("tool `{0}` is not registered")]
    ToolMissing(String),

    #[error("tool `{name}` failed: {message}")]
    ToolFailure { name: String, message: String },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("node `{node}` timed out after {seconds}s")]
    NodeTimeout { node: String, seconds: u64 },

    /// Retry budget spent on a node; wraps the final cause.
    #[error("node `{node}` exhausted {attempts} attempt(s): {cause}")]
    NodeRetryExhausted {
        node: String,
        attempts: u32,
        cause: String,
    },

    /// A `fail`-action quality gate tripped.
    #[error("gate failed: {metric} = {value} (limit {limit})")]
    GateFailed {
        metric: String,
        value: f64,
        limit: f64,
    },

    #[error("agent `{agent_id}` unreachable: {message}")]
    AgentUnreachable { agent_id: String, message: String },

    /// The remote agent answered with a client error (4xx).
    #[error("agent `{agent_id}` rejected the request: {message}")]
    AgentRejected { agent_id: String, message: String },

    /// An optional collaborator (experiment store, metrics UI) is down.
    /// Degraded, not fatal: read paths present an "unavailable" view.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("agent `{0}` not found")]
    AgentNotFound(String),

    #[error("workflow `{0}` not found")]
    WorkflowNotFound(String),

    /// A supervised child process exited; carries name and exit code.
    #[error("child `{name}` exited (code: {code})")]
    SupervisorChildExited { name: String, code: i32 },
}

impl EngineError {
    /// Builds a single-issue validation error.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::ConfigValidation(ValidationReport {
            issues: vec![ValidationIssue::new(path, message)],
        })
    }

    /// True for errors caused by the caller's input (CLI exit code 1);
    /// everything else is a runtime failure (exit code 2).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            EngineError::ConfigParse(_)
                | EngineError::ConfigValidation(_)
                | EngineError::TypeValidation { .. }
                | EngineError::TemplateResolution(_)
                | EngineError::WorkflowNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_display_includes_suggestion() {
        let issue = ValidationIssue::new("nodes[0].outputs[0]", "unknown state field `artcle`")
            .with_suggestion(Some("article".to_string()));
        let s = issue.to_string();
        assert!(s.contains("nodes[0].outputs[0]"), "path missing: {}", s);
        assert!(s.contains("did you mean `article`"), "suggestion missing: {}", s);
    }

    #[test]
    fn report_display_counts_extra_issues() {
        let report = ValidationReport {
            issues: vec![
                ValidationIssue::new("a", "first"),
                ValidationIssue::new("b", "second"),
                ValidationIssue::new("c", "third"),
            ],
        };
        let s = report.to_string();
        assert!(s.contains("first"), "{}", s);
        assert!(s.contains("+2 more"), "{}", s);
    }

    #[test]
    fn user_errors_map_to_exit_code_one() {
        assert!(EngineError::ConfigParse("bad".into()).is_user_error());
        assert!(EngineError::validation("flow.name", "empty").is_user_error());
        assert!(!EngineError::Storage("disk".into()).is_user_error());
    }
}
