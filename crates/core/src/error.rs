//! Error types for the Nagare engine.

use crate::types::{NodeId, Run, ValueType};
use std::time::Duration;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while building or executing an execution plan.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An ordering edge would close a cycle in the plan.
    #[error("Cyclic dependency: {from} -> {to} closes a cycle")]
    CyclicDependency { from: NodeId, to: NodeId },

    /// A static workflow body read an input whose value only exists at run time.
    #[error("Input '{param}' of '{spec}' is only known at run time; read it inside a dynamic workflow")]
    StaticInputRead { spec: String, param: String },

    /// A promise was read before its producing node ran.
    #[error("Promise produced by {node} is not resolved yet")]
    UnresolvedPromise { node: NodeId },

    /// A promise was resolved twice.
    #[error("Promise produced by {node} is already resolved")]
    AlreadyResolved { node: NodeId },

    /// A conditional without default branch matched no case.
    #[error("Conditional '{conditional}' ({node}) matched no case and has no default branch")]
    NoMatchingBranch { node: NodeId, conditional: String },

    /// A conditional selected a default branch declared with `fail`.
    #[error("Conditional '{conditional}' ({node}) failed: {message}")]
    BranchFailed {
        node: NodeId,
        conditional: String,
        message: String,
    },

    /// A predicate compared values it cannot compare.
    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    /// A dynamic body failed while being replayed.
    #[error("Dynamic workflow '{spec}' ({node}) failed to expand: {source}")]
    DynamicExpansion {
        node: NodeId,
        spec: String,
        #[source]
        source: anyhow::Error,
    },

    /// A task body returned an error.
    #[error("Task '{spec}' ({node}) failed: {source}")]
    TaskExecution {
        node: NodeId,
        spec: String,
        #[source]
        source: anyhow::Error,
    },

    /// A task exceeded its timeout.
    #[error("Task '{spec}' ({node}) timed out after {timeout:?}")]
    Timeout {
        node: NodeId,
        spec: String,
        timeout: Duration,
    },

    /// The plan was cancelled before it finished.
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Type mismatch for {target}: expected {expected}, found {found}")]
    TypeMismatch {
        target: String,
        expected: ValueType,
        found: String,
    },

    #[error("Missing input '{param}' for '{spec}'")]
    MissingInput { spec: String, param: String },

    #[error("Unexpected input '{param}' for '{spec}'")]
    UnexpectedInput { spec: String, param: String },

    /// A promise from a scope the builder cannot see.
    #[error("Promise produced by {node} is not visible in this scope")]
    UnknownPromise { node: NodeId },

    #[error("Unknown {kind} '{name}'")]
    UnknownEntity { kind: &'static str, name: String },

    #[error("'{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("Output of {node} has no field {index}")]
    MissingField { node: NodeId, index: usize },

    #[error("Workflow '{name}' exceeded the nesting limit of {limit}")]
    RecursionLimit { name: String, limit: usize },

    /// A static workflow body failed while recording its graph.
    #[error("Workflow '{workflow}' failed to compile: {source}")]
    WorkflowConstruction {
        workflow: String,
        #[source]
        source: anyhow::Error,
    },

    /// Work remains but nothing can become ready.
    #[error("Execution stalled with {pending} pending nodes")]
    Stalled { pending: usize },

    #[error("Event log error: {0}")]
    EventLog(#[source] anyhow::Error),

    /// Scheduler bookkeeping went wrong.
    #[error("Internal scheduler error: {0}")]
    Internal(String),

    /// A started run ended without completing. Carries the run record.
    #[error("{source} (run {})", .run.id)]
    RunFailed {
        run: Box<Run>,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Record of the run the error ended, if execution had started.
    pub fn run(&self) -> Option<&Run> {
        match self {
            Self::RunFailed { run, .. } => Some(run),
            _ => None,
        }
    }

    /// The underlying error, without the run record.
    pub fn root(&self) -> &EngineError {
        match self {
            Self::RunFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn into_root(self) -> EngineError {
        match self {
            Self::RunFailed { source, .. } => source.into_root(),
            other => other,
        }
    }

    /// Node the error is attached to, if any.
    pub fn node(&self) -> Option<&NodeId> {
        match self.root() {
            Self::CyclicDependency { from, .. } => Some(from),
            Self::UnresolvedPromise { node }
            | Self::AlreadyResolved { node }
            | Self::NoMatchingBranch { node, .. }
            | Self::BranchFailed { node, .. }
            | Self::DynamicExpansion { node, .. }
            | Self::TaskExecution { node, .. }
            | Self::Timeout { node, .. }
            | Self::UnknownPromise { node }
            | Self::MissingField { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Whether the error was raised while recording a graph, before any execution.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self.root(),
            Self::CyclicDependency { .. }
                | Self::StaticInputRead { .. }
                | Self::UnresolvedPromise { .. }
                | Self::TypeMismatch { .. }
                | Self::MissingInput { .. }
                | Self::UnexpectedInput { .. }
                | Self::UnknownPromise { .. }
                | Self::UnknownEntity { .. }
                | Self::RecursionLimit { .. }
                | Self::WorkflowConstruction { .. }
        )
    }

    /// Recover an engine error that travelled through a body's `anyhow::Error`.
    pub(crate) fn from_body(err: anyhow::Error, wrap: impl FnOnce(anyhow::Error) -> Self) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => wrap(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunId, RunStatus};
    use chrono::Utc;

    fn failed_run(source: EngineError) -> EngineError {
        EngineError::RunFailed {
            run: Box::new(Run {
                id: RunId::new(),
                workflow: "wf".to_string(),
                status: RunStatus::Failed,
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
                nodes: Vec::new(),
                output: None,
            }),
            source: Box::new(source),
        }
    }

    #[test]
    fn test_run_failure_unwraps_to_root() {
        let err = failed_run(EngineError::Timeout {
            node: NodeId(4),
            spec: "slow".to_string(),
            timeout: Duration::from_secs(1),
        });

        assert_eq!(err.run().map(|r| r.status), Some(RunStatus::Failed));
        assert!(matches!(err.root(), EngineError::Timeout { .. }));
        assert_eq!(err.node(), Some(&NodeId(4)));
        assert!(!err.is_construction_error());
        assert!(err.to_string().starts_with("Task 'slow' (n4) timed out"));

        let root = err.into_root();
        assert!(root.run().is_none());
        assert!(matches!(root, EngineError::Timeout { .. }));
    }

    #[test]
    fn test_construction_errors() {
        let cycle = EngineError::CyclicDependency {
            from: NodeId(1),
            to: NodeId(2),
        };
        assert!(cycle.is_construction_error());
        assert_eq!(cycle.node(), Some(&NodeId(1)));

        assert!(EngineError::StaticInputRead {
            spec: "wf".to_string(),
            param: "n".to_string(),
        }
        .is_construction_error());
        assert!(!EngineError::Cancelled.is_construction_error());
        assert!(EngineError::Cancelled.node().is_none());
    }

    #[test]
    fn test_engine_error_survives_anyhow() {
        let body: anyhow::Error = EngineError::Cancelled.into();
        let err = EngineError::from_body(body, |source| EngineError::WorkflowConstruction {
            workflow: "wf".to_string(),
            source,
        });
        assert!(matches!(err, EngineError::Cancelled));

        let err = EngineError::from_body(anyhow::anyhow!("boom"), |source| {
            EngineError::WorkflowConstruction {
                workflow: "wf".to_string(),
                source,
            }
        });
        assert!(err.is_construction_error());
    }
}
