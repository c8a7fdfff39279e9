pub mod builder;
pub mod conditional;
pub mod dynamic;
pub mod executor;
pub mod plan;
pub mod task_executor;

pub use builder::{BuildMode, GraphBuilder};
pub use conditional::{
    Branch, Case, CaseBuilder, CmpOp, ConditionalBuilder, ConditionalNode, DefaultBranch,
    ElseBuilder, Predicate, Selection,
};
pub use dynamic::{DynamicExpander, Expansion};
pub use executor::WorkflowExecutor;
pub use plan::{DynamicInvocation, ExecutionPlan, NodeKind, PlanNode, TaskInvocation};
pub use task_executor::TaskExecutor;
