use crate::error::{EngineError, Result};
use crate::promise::{Arg, Inputs};
use crate::types::{describe_value, TaskSpec};
use crate::workflow::GraphBuilder;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Body of a task: a deterministic computation over resolved inputs
pub trait TaskFn: Send + Sync {
    fn call(&self, inputs: &Inputs) -> anyhow::Result<Value>;
}

impl<F> TaskFn for F
where
    F: Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync,
{
    fn call(&self, inputs: &Inputs) -> anyhow::Result<Value> {
        self(inputs)
    }
}

/// Body of a workflow or dynamic workflow: records graph structure and returns its output
pub type WorkflowFn = dyn Fn(&mut GraphBuilder<'_>, &Inputs) -> anyhow::Result<Arg> + Send + Sync;

/// A registered task
#[derive(Clone)]
pub struct TaskDef {
    pub spec: Arc<TaskSpec>,
    pub(crate) body: Arc<dyn TaskFn>,
}

/// A registered workflow or dynamic workflow
#[derive(Clone)]
pub struct WorkflowDef {
    pub spec: Arc<TaskSpec>,
    pub(crate) body: Arc<WorkflowFn>,
}

/// Explicit registry of tasks and workflows handed to the executor.
///
/// Tasks, workflows and dynamic workflows share one namespace.
#[derive(Default)]
pub struct Registry {
    tasks: HashMap<String, TaskDef>,
    workflows: HashMap<String, WorkflowDef>,
    dynamics: HashMap<String, WorkflowDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task<F>(&mut self, spec: TaskSpec, body: F) -> Result<Arc<TaskSpec>>
    where
        F: Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let spec = self.admit(spec)?;
        self.tasks.insert(
            spec.name.clone(),
            TaskDef {
                spec: Arc::clone(&spec),
                body: Arc::new(body),
            },
        );
        tracing::debug!("Registered task {}", spec.name);
        Ok(spec)
    }

    pub fn register_workflow<F>(&mut self, spec: TaskSpec, body: F) -> Result<Arc<TaskSpec>>
    where
        F: Fn(&mut GraphBuilder<'_>, &Inputs) -> anyhow::Result<Arg> + Send + Sync + 'static,
    {
        let spec = self.admit(spec)?;
        self.workflows.insert(
            spec.name.clone(),
            WorkflowDef {
                spec: Arc::clone(&spec),
                body: Arc::new(body),
            },
        );
        tracing::debug!("Registered workflow {}", spec.name);
        Ok(spec)
    }

    pub fn register_dynamic<F>(&mut self, spec: TaskSpec, body: F) -> Result<Arc<TaskSpec>>
    where
        F: Fn(&mut GraphBuilder<'_>, &Inputs) -> anyhow::Result<Arg> + Send + Sync + 'static,
    {
        let spec = self.admit(spec)?;
        self.dynamics.insert(
            spec.name.clone(),
            WorkflowDef {
                spec: Arc::clone(&spec),
                body: Arc::new(body),
            },
        );
        tracing::debug!("Registered dynamic workflow {}", spec.name);
        Ok(spec)
    }

    pub fn task(&self, name: &str) -> Result<&TaskDef> {
        self.tasks.get(name).ok_or_else(|| EngineError::UnknownEntity {
            kind: "task",
            name: name.to_string(),
        })
    }

    pub fn workflow(&self, name: &str) -> Result<&WorkflowDef> {
        self.workflows.get(name).ok_or_else(|| EngineError::UnknownEntity {
            kind: "workflow",
            name: name.to_string(),
        })
    }

    pub fn dynamic(&self, name: &str) -> Result<&WorkflowDef> {
        self.dynamics.get(name).ok_or_else(|| EngineError::UnknownEntity {
            kind: "dynamic workflow",
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
            || self.workflows.contains_key(name)
            || self.dynamics.contains_key(name)
    }

    /// Names of registered workflows, sorted
    pub fn workflow_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Validate a spec before it enters the registry
    fn admit(&self, spec: TaskSpec) -> Result<Arc<TaskSpec>> {
        if self.contains(&spec.name) {
            return Err(EngineError::DuplicateRegistration(spec.name));
        }

        let mut seen = HashSet::new();
        for param in &spec.inputs {
            if !seen.insert(param.name.as_str()) {
                return Err(EngineError::DuplicateRegistration(format!(
                    "{}.{}",
                    spec.name, param.name
                )));
            }
            if let Some(default) = &param.default {
                if !param.ty.matches(default) {
                    return Err(EngineError::TypeMismatch {
                        target: format!("{}.{}", spec.name, param.name),
                        expected: param.ty.clone(),
                        found: describe_value(default),
                    });
                }
            }
        }

        Ok(Arc::new(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;
    use serde_json::json;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        registry
            .register_task(
                TaskSpec::new("double")
                    .input("x", ValueType::Int)
                    .output(ValueType::Int),
                |inputs: &Inputs| Ok(json!(inputs.get::<i64>("x")? * 2)),
            )
            .unwrap();

        let task = registry.task("double").unwrap();
        assert_eq!(task.spec.inputs.len(), 1);
        assert!(matches!(
            registry.workflow("double"),
            Err(EngineError::UnknownEntity { kind: "workflow", .. })
        ));

        for name in ["zeta", "alpha"] {
            registry
                .register_workflow(TaskSpec::new(name), |_, _| Ok(Arg::from(1_i64)))
                .unwrap();
        }
        assert_eq!(registry.workflow_names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_duplicate_names_rejected_across_kinds() {
        let mut registry = Registry::new();
        registry
            .register_task(TaskSpec::new("shared"), |_: &Inputs| Ok(json!(null)))
            .unwrap();

        let err = registry
            .register_workflow(TaskSpec::new("shared"), |_, _| Ok(Arg::from(1_i64)))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRegistration(name) if name == "shared"));
    }

    #[test]
    fn test_bad_default_rejected() {
        let mut registry = Registry::new();
        let err = registry
            .register_workflow(
                TaskSpec::new("wf").input_with_default("n", ValueType::Int, json!("five")),
                |_, _| Ok(Arg::from(1_i64)),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_duplicate_param_rejected() {
        let mut registry = Registry::new();
        let err = registry
            .register_task(
                TaskSpec::new("t")
                    .input("a", ValueType::Int)
                    .input("a", ValueType::Str),
                |_: &Inputs| Ok(json!(null)),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRegistration(name) if name == "t.a"));
    }
}
