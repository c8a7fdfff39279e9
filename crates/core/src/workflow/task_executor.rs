use crate::error::{EngineError, Result};
use crate::promise::Inputs;
use crate::registry::TaskFn;
use crate::types::{describe_value, NodeId, TaskSpec};
use anyhow::anyhow;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Runs task bodies off the async runtime with timeout handling
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskExecutor {
    default_timeout: Option<Duration>,
}

impl TaskExecutor {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    /// Execute one task body against resolved inputs
    pub async fn execute(
        &self,
        node: NodeId,
        spec: Arc<TaskSpec>,
        body: Arc<dyn TaskFn>,
        inputs: Inputs,
    ) -> Result<Value> {
        tracing::info!("Executing task {} ({})", spec.name, node);

        let start = Instant::now();
        let handle = tokio::task::spawn_blocking(move || body.call(&inputs));

        // Execute with timeout if configured
        let joined = match spec.timeout.or(self.default_timeout) {
            Some(limit) => match timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!("Task {} ({}) timed out", spec.name, node);
                    return Err(EngineError::Timeout {
                        node,
                        spec: spec.name.clone(),
                        timeout: limit,
                    });
                }
            },
            None => handle.await,
        };

        let output = match joined {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(EngineError::TaskExecution {
                    node,
                    spec: spec.name.clone(),
                    source,
                })
            }
            Err(join_error) => {
                return Err(EngineError::TaskExecution {
                    node,
                    spec: spec.name.clone(),
                    source: anyhow!("task panicked: {}", join_error),
                })
            }
        };

        if !spec.output.matches(&output) {
            return Err(EngineError::TaskExecution {
                node,
                spec: spec.name.clone(),
                source: anyhow!(
                    "returned {} where {} was declared",
                    describe_value(&output),
                    spec.output
                ),
            });
        }

        tracing::debug!(
            "Task {} ({}) completed in {:?}",
            spec.name,
            node,
            start.elapsed()
        );
        Ok(output)
    }
}
