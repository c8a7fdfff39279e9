use super::builder::GraphBuilder;
use super::dynamic::DynamicExpander;
use super::plan::{ExecutionPlan, NodeKind};
use super::task_executor::TaskExecutor;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventLog, EventType, MemoryEventLog};
use crate::promise::{Arg, Promise};
use crate::registry::Registry;
use crate::types::{NodeCategory, NodeExecution, NodeId, NodeStatus, Run, RunId, RunStatus};
use chrono::{DateTime, Utc};
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Workflow executor that drives execution plans to completion
pub struct WorkflowExecutor {
    registry: Arc<Registry>,
    config: EngineConfig,
    event_log: Arc<dyn EventLog>,
    task_executor: TaskExecutor,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<Registry>, config: EngineConfig) -> Self {
        let task_executor = TaskExecutor::new(config.default_task_timeout());

        Self {
            registry,
            config,
            event_log: Arc::new(MemoryEventLog::new()),
            task_executor,
        }
    }

    pub fn with_event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = event_log;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.event_log)
    }

    /// Compile a registered workflow without running it
    pub fn compile(&self, workflow: &str) -> Result<ExecutionPlan> {
        GraphBuilder::compile(&self.registry, workflow, self.config.max_expansion_depth)
    }

    /// Run a workflow to completion and return its output. Errors come back
    /// without the run record.
    pub async fn execute<'a>(
        &self,
        workflow: &str,
        inputs: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Value> {
        let run = self
            .run(workflow, inputs, CancellationToken::new())
            .await
            .map_err(EngineError::into_root)?;
        Ok(run.output.unwrap_or_default())
    }

    /// Run a workflow and return the full run record
    pub async fn run<'a>(
        &self,
        workflow: &str,
        inputs: impl IntoIterator<Item = (&'a str, Value)>,
        cancel: CancellationToken,
    ) -> Result<Run> {
        let plan = self.compile(workflow)?;
        plan.bind_inputs(inputs)?;
        self.execute_plan(plan, cancel).await
    }

    /// Execute a plan until every node, including nodes added by dynamic
    /// expansion and branch selection, has resolved.
    ///
    /// Once execution has started, a run that does not complete fails with
    /// [`EngineError::RunFailed`], carrying the run record next to the cause.
    pub async fn execute_plan(&self, plan: ExecutionPlan, cancel: CancellationToken) -> Result<Run> {
        plan.validate()?;

        let run_id = RunId::new();
        let started_at = Utc::now();
        let workflow = plan.name().to_string();

        tracing::info!(
            "Starting workflow execution: run_id={}, workflow={}",
            run_id,
            workflow
        );

        // Emit RunStarted event
        self.event_log
            .append(Event::new(
                run_id,
                EventType::RunStarted {
                    workflow,
                    nodes: plan.len(),
                },
            ))
            .await
            .map_err(EngineError::EventLog)?;

        let mut state = PlanRun::new(
            run_id,
            plan,
            &self.registry,
            &self.config,
            self.event_log.as_ref(),
            self.task_executor,
        );
        let result = state.drive(&cancel).await;
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;

        let status = match &result {
            Ok(()) => {
                self.event_log
                    .append(Event::new(run_id, EventType::RunCompleted { duration_ms }))
                    .await
                    .map_err(EngineError::EventLog)?;

                tracing::info!("Workflow execution completed: run_id={}", run_id);
                RunStatus::Completed
            }
            Err(EngineError::Cancelled) => {
                self.event_log
                    .append(Event::new(
                        run_id,
                        EventType::RunCancelled {
                            reason: "Cancellation requested".to_string(),
                        },
                    ))
                    .await
                    .map_err(EngineError::EventLog)?;

                tracing::warn!("Workflow execution cancelled: run_id={}", run_id);
                RunStatus::Cancelled
            }
            Err(e) => {
                self.event_log
                    .append(Event::new(
                        run_id,
                        EventType::RunFailed {
                            error: e.to_string(),
                            duration_ms,
                        },
                    ))
                    .await
                    .map_err(EngineError::EventLog)?;

                tracing::error!("Workflow execution failed: run_id={}, error={}", run_id, e);
                RunStatus::Failed
            }
        };

        state.transition(status)?;
        let run = state.into_run(started_at);
        match result {
            Ok(()) => Ok(run),
            Err(source) => Err(EngineError::RunFailed {
                run: Box::new(run),
                source: Box::new(source),
            }),
        }
    }
}

/// Mutable state of one plan execution
struct PlanRun<'e> {
    run_id: RunId,
    status: RunStatus,
    plan: ExecutionPlan,
    registry: &'e Registry,
    config: &'e EngineConfig,
    event_log: &'e dyn EventLog,
    task_executor: TaskExecutor,
    records: HashMap<NodeIndex, NodeExecution>,
    order: Vec<NodeIndex>,
    /// Unresolved upstream edges per blocked node
    waiting: HashMap<NodeIndex, usize>,
    /// Composite nodes waiting on their spliced sub-plan, with the output to forward
    forwarding: HashMap<NodeIndex, Arg>,
    ready: VecDeque<NodeIndex>,
    running: JoinSet<(NodeIndex, Result<Value>)>,
}

impl<'e> PlanRun<'e> {
    fn new(
        run_id: RunId,
        plan: ExecutionPlan,
        registry: &'e Registry,
        config: &'e EngineConfig,
        event_log: &'e dyn EventLog,
        task_executor: TaskExecutor,
    ) -> Self {
        Self {
            run_id,
            status: RunStatus::Building,
            plan,
            registry,
            config,
            event_log,
            task_executor,
            records: HashMap::new(),
            order: Vec::new(),
            waiting: HashMap::new(),
            forwarding: HashMap::new(),
            ready: VecDeque::new(),
            running: JoinSet::new(),
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<()> {
        let slots = self.config.parallelism();
        let nodes: Vec<NodeIndex> = self.plan.graph().node_indices().collect();
        self.track(&nodes, None).await?;
        self.transition(RunStatus::Executing)?;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            while self.running.len() < slots {
                let Some(idx) = self.ready.pop_front() else {
                    break;
                };
                self.dispatch(idx).await?;
            }

            if self.running.is_empty() {
                if self.ready.is_empty() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                joined = self.running.join_next() => match joined {
                    Some(Ok((idx, result))) => self.complete(idx, result).await?,
                    Some(Err(e)) => return Err(EngineError::Internal(e.to_string())),
                    None => {}
                },
            }
        }

        let pending = self
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .count();
        if pending > 0 {
            return Err(EngineError::Stalled { pending });
        }

        Ok(())
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Internal(format!(
                "run {} cannot move from {:?} to {:?}",
                self.run_id, self.status, next
            )));
        }

        tracing::debug!("Run {} is now {:?}", self.run_id, next);
        self.status = next;
        Ok(())
    }

    /// Register nodes and queue those whose upstream is already resolved
    async fn track(&mut self, nodes: &[NodeIndex], parent: Option<NodeId>) -> Result<()> {
        for &idx in nodes {
            let node = &self.plan.graph()[idx];
            let status = if node.output.is_resolved() {
                NodeStatus::Resolved
            } else {
                NodeStatus::Pending
            };
            let event = EventType::NodeScheduled {
                node: node.id,
                name: node.name().to_string(),
                parent,
            };

            self.records.insert(
                idx,
                NodeExecution {
                    id: node.id,
                    name: node.name().to_string(),
                    category: node.category(),
                    parent,
                    status,
                    started_at: None,
                    completed_at: None,
                    error: None,
                },
            );
            self.order.push(idx);
            self.emit(event).await?;
        }

        for &idx in nodes {
            if self.is_resolved(idx) {
                continue;
            }

            let blocking = self
                .plan
                .graph()
                .neighbors_directed(idx, Direction::Incoming)
                .filter(|&dep| !self.is_resolved(dep))
                .count();

            if blocking == 0 {
                self.make_ready(idx);
            } else {
                self.waiting.insert(idx, blocking);
            }
        }

        Ok(())
    }

    fn is_resolved(&self, idx: NodeIndex) -> bool {
        self.plan.graph()[idx].output.is_resolved()
    }

    fn make_ready(&mut self, idx: NodeIndex) {
        if let Some(record) = self.records.get_mut(&idx) {
            record.status = NodeStatus::Ready;
        }
        self.ready.push_back(idx);
    }

    async fn dispatch(&mut self, idx: NodeIndex) -> Result<()> {
        let result = if let Some(output) = self.forwarding.remove(&idx) {
            match output.concrete() {
                Ok(value) => return self.resolve(idx, value).await,
                Err(e) => Err(e),
            }
        } else {
            match self.plan.graph()[idx].category() {
                NodeCategory::Input => Err(EngineError::MissingInput {
                    spec: self.plan.name().to_string(),
                    param: self.plan.graph()[idx].name().to_string(),
                }),
                NodeCategory::Task => self.start_task(idx).await,
                NodeCategory::Conditional => self.select_branch(idx).await,
                NodeCategory::Dynamic => self.expand(idx).await,
            }
        };

        if let Err(err) = &result {
            self.fail(idx, err).await?;
        }
        result
    }

    async fn start_task(&mut self, idx: NodeIndex) -> Result<()> {
        let node = &self.plan.graph()[idx];
        let NodeKind::Task(invocation) = &node.kind else {
            return Err(EngineError::Internal(format!("{} is not a task", node.id)));
        };

        let id = node.id;
        let spec = Arc::clone(&invocation.spec);
        let inputs = invocation.inputs.resolved()?;
        let body = Arc::clone(&self.registry.task(&spec.name)?.body);

        self.mark_started(idx).await?;

        let executor = self.task_executor;
        self.running
            .spawn(async move { (idx, executor.execute(id, spec, body, inputs).await) });
        Ok(())
    }

    async fn select_branch(&mut self, idx: NodeIndex) -> Result<()> {
        self.mark_started(idx).await?;

        let node = &mut self.plan.graph_mut()[idx];
        let id = node.id;
        let NodeKind::Conditional(conditional) = &mut node.kind else {
            return Err(EngineError::Internal(format!("{} is not a conditional", id)));
        };

        let selection = conditional.evaluate(id)?;
        let name = conditional.name.clone();
        let case = conditional.selection_name(selection).to_string();
        let branch = conditional
            .take_branch(selection)
            .ok_or_else(|| EngineError::Internal(format!("branch of {} already taken", id)))?;

        tracing::info!("Conditional {} ({}) selected {}", name, id, case);

        self.emit(EventType::BranchSelected {
            node: id,
            conditional: name,
            case,
        })
        .await?;

        self.splice(idx, branch.plan, branch.output).await
    }

    async fn expand(&mut self, idx: NodeIndex) -> Result<()> {
        self.mark_started(idx).await?;

        let node = &self.plan.graph()[idx];
        let NodeKind::Dynamic(invocation) = &node.kind else {
            return Err(EngineError::Internal(format!("{} is not dynamic", node.id)));
        };

        let id = node.id;
        let name = invocation.spec.name.clone();
        let expansion = DynamicExpander::new(self.registry, self.config.max_expansion_depth)
            .expand(id, invocation, self.plan.ids())?;

        tracing::info!(
            "Dynamic workflow {} ({}) expanded into {} nodes",
            name,
            id,
            expansion.plan.len()
        );

        self.emit(EventType::DynamicExpanded {
            node: id,
            name,
            invocations: expansion.plan.len(),
            depth: expansion.depth,
        })
        .await?;

        self.splice(idx, expansion.plan, expansion.output).await
    }

    /// Insert a composite node's sub-plan and make the node wait for it.
    ///
    /// The composite resolves with `output` once every sink of the sub-plan
    /// and the output's producer have resolved.
    async fn splice(&mut self, idx: NodeIndex, sub: ExecutionPlan, output: Arg) -> Result<()> {
        let parent = self.plan.graph()[idx].id;

        let mut sources: BTreeSet<NodeId> = sub.sinks().into_iter().collect();
        sources.extend(output.as_promise().map(Promise::node));

        let added = self.plan.splice(sub)?;
        self.track(&added, Some(parent)).await?;

        let mut blocking = 0;
        for source in sources {
            let from = self.plan.index_of(source)?;
            self.plan.graph_mut().update_edge(from, idx, ());
            if !self.is_resolved(from) {
                blocking += 1;
            }
        }

        self.forwarding.insert(idx, output);
        if blocking == 0 {
            self.ready.push_back(idx);
        } else {
            self.waiting.insert(idx, blocking);
        }
        Ok(())
    }

    async fn complete(&mut self, idx: NodeIndex, result: Result<Value>) -> Result<()> {
        match result {
            Ok(value) => self.resolve(idx, value).await,
            Err(err) => {
                self.fail(idx, &err).await?;
                Err(err)
            }
        }
    }

    async fn resolve(&mut self, idx: NodeIndex, value: Value) -> Result<()> {
        let node = &self.plan.graph()[idx];
        let id = node.id;
        let name = node.name().to_string();
        node.output.resolve(value)?;

        if let Some(record) = self.records.get_mut(&idx) {
            record.status = NodeStatus::Resolved;
            record.completed_at = Some(Utc::now());
        }

        self.emit(EventType::NodeResolved { node: id, name }).await?;

        let dependents: Vec<NodeIndex> = self
            .plan
            .graph()
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();

        for dep in dependents {
            let Some(count) = self.waiting.get_mut(&dep) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count > 0 {
                continue;
            }

            self.waiting.remove(&dep);
            if self.forwarding.contains_key(&dep) {
                self.ready.push_back(dep);
            } else {
                self.make_ready(dep);
            }
        }

        Ok(())
    }

    async fn mark_started(&mut self, idx: NodeIndex) -> Result<()> {
        let node = &self.plan.graph()[idx];
        let event = EventType::NodeStarted {
            node: node.id,
            name: node.name().to_string(),
            category: node.category(),
        };

        if let Some(record) = self.records.get_mut(&idx) {
            record.status = NodeStatus::Running;
            record.started_at = Some(Utc::now());
        }

        self.emit(event).await
    }

    async fn fail(&mut self, idx: NodeIndex, err: &EngineError) -> Result<()> {
        let node = &self.plan.graph()[idx];
        let id = node.id;
        let name = node.name().to_string();

        if let Some(record) = self.records.get_mut(&idx) {
            record.status = NodeStatus::Failed;
            record.completed_at = Some(Utc::now());
            record.error = Some(err.to_string());
        }

        tracing::error!("Node {} ({}) failed: {}", name, id, err);

        self.emit(EventType::NodeFailed {
            node: id,
            name,
            error: err.to_string(),
        })
        .await
    }

    async fn emit(&self, event_type: EventType) -> Result<()> {
        self.event_log
            .append(Event::new(self.run_id, event_type))
            .await
            .map_err(EngineError::EventLog)
    }

    fn into_run(mut self, started_at: DateTime<Utc>) -> Run {
        let mut nodes = Vec::with_capacity(self.order.len());
        for idx in &self.order {
            if let Some(mut record) = self.records.remove(idx) {
                if !record.status.is_terminal() {
                    record.status = NodeStatus::Cancelled;
                }
                nodes.push(record);
            }
        }

        Run {
            id: self.run_id,
            workflow: self.plan.name().to_string(),
            status: self.status,
            started_at,
            completed_at: Some(Utc::now()),
            nodes,
            output: self.plan.output().and_then(|o| o.concrete().ok()),
        }
    }
}
