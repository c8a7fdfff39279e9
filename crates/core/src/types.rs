use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a node in an execution plan, unique across every sub-plan
/// spliced into the same execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Declared type of a task parameter or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Float,
    Bool,
    Str,
    List(Box<ValueType>),
    Tuple(Vec<ValueType>),
    Any,
}

impl ValueType {
    pub fn list(item: ValueType) -> Self {
        Self::List(Box::new(item))
    }

    /// Check a concrete value against this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Str => value.is_string(),
            Self::List(item) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| item.matches(v))),
            Self::Tuple(fields) => value.as_array().is_some_and(|items| {
                items.len() == fields.len() && fields.iter().zip(items).all(|(t, v)| t.matches(v))
            }),
            Self::Any => true,
        }
    }

    /// Whether a promise declared as `other` may be bound where `self` is expected
    pub fn accepts(&self, other: &ValueType) -> bool {
        match (self, other) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Float, Self::Int) => true,
            (Self::List(a), Self::List(b)) => a.accepts(b),
            (Self::Tuple(a), Self::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.accepts(y))
            }
            (a, b) => a == b,
        }
    }

    /// Type of the element at `index` of a tuple (or list) value
    pub fn element(&self, index: usize) -> ValueType {
        match self {
            Self::Tuple(fields) => fields.get(index).cloned().unwrap_or(Self::Any),
            Self::List(item) => (**item).clone(),
            _ => Self::Any,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Bool => write!(f, "bool"),
            Self::Str => write!(f, "str"),
            Self::List(item) => write!(f, "list[{}]", item),
            Self::Tuple(fields) => {
                write!(f, "tuple[")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, "]")
            }
            Self::Any => write!(f, "any"),
        }
    }
}

/// Short description of a JSON value's shape, used in type errors
pub(crate) fn describe_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(n) if n.is_f64() => "float".to_string(),
        Value::Number(_) => "int".to_string(),
        Value::String(_) => "str".to_string(),
        Value::Array(items) => format!("array of {}", items.len()),
        Value::Object(_) => "object".to_string(),
    }
}

/// A typed parameter of a task or workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: ValueType,
    pub default: Option<Value>,
}

/// Immutable description of a task, workflow or dynamic workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub description: Option<String>,
    pub inputs: Vec<Param>,
    pub output: ValueType,
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: Vec::new(),
            output: ValueType::Any,
            timeout: None,
        }
    }

    pub fn input(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.inputs.push(Param {
            name: name.into(),
            ty,
            default: None,
        });
        self
    }

    pub fn input_with_default(
        mut self,
        name: impl Into<String>,
        ty: ValueType,
        default: Value,
    ) -> Self {
        self.inputs.push(Param {
            name: name.into(),
            ty,
            default: Some(default),
        });
        self
    }

    pub fn output(mut self, ty: ValueType) -> Self {
        self.output = ty;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.inputs.iter().find(|p| p.name == name)
    }
}

/// Kind of a node in an execution plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Input,
    Task,
    Conditional,
    Dynamic,
}

/// Status of a single node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Resolved,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::Cancelled)
    }
}

/// Status of an execution plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Building,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a run may move from this status to `next`
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            Self::Building => matches!(next, Self::Executing | Self::Failed | Self::Cancelled),
            Self::Executing => next.is_terminal(),
            _ => false,
        }
    }
}

/// Execution record of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: NodeId,
    pub name: String,
    pub category: NodeCategory,
    /// Composite node whose expansion produced this node
    pub parent: Option<NodeId>,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Record of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeExecution>,
    pub output: Option<Value>,
}

impl Run {
    /// Executions of nodes with the given spec name
    pub fn executions_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a NodeExecution> {
        self.nodes.iter().filter(move |n| n.name == name)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeExecution> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
