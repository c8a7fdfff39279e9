//! Core of the Nagare workflow engine.
//!
//! Workflows are recorded into an [`ExecutionPlan`] by a [`GraphBuilder`],
//! then driven by the [`WorkflowExecutor`]. Conditional and dynamic nodes grow
//! the plan while it runs.

pub mod config;
pub mod demos;
pub mod error;
pub mod events;
pub mod promise;
pub mod registry;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::{Event, EventLog, EventType, MemoryEventLog};
pub use promise::{Arg, Inputs, Promise};
pub use registry::{Registry, TaskDef, TaskFn, WorkflowDef, WorkflowFn};
pub use types::*;
pub use workflow::{
    BuildMode, ConditionalBuilder, ExecutionPlan, GraphBuilder, NodeKind, PlanNode, Predicate,
    WorkflowExecutor,
};
