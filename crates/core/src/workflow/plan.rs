use super::conditional::ConditionalNode;
use crate::error::{EngineError, Result};
use crate::promise::{Arg, Inputs, Promise};
use crate::types::{describe_value, NodeCategory, NodeId, Param, TaskSpec, ValueType};
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Allocator of node ids shared by a plan and every sub-plan spliced into it
#[derive(Debug, Clone, Default)]
pub(crate) struct IdGen(Arc<AtomicU64>);

impl IdGen {
    pub(crate) fn next(&self) -> NodeId {
        NodeId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A task instantiated with concrete values or promises
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub spec: Arc<TaskSpec>,
    pub inputs: Inputs,
}

/// A dynamic workflow waiting to be expanded with concrete inputs
#[derive(Debug, Clone)]
pub struct DynamicInvocation {
    pub spec: Arc<TaskSpec>,
    pub inputs: Inputs,
    /// Number of dynamic expansions enclosing this invocation
    pub depth: usize,
}

#[derive(Debug)]
pub enum NodeKind {
    /// Workflow input, resolved when the plan is launched
    Input(Param),
    Task(TaskInvocation),
    Conditional(ConditionalNode),
    Dynamic(DynamicInvocation),
}

impl NodeKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Input(param) => &param.name,
            Self::Task(invocation) => &invocation.spec.name,
            Self::Conditional(conditional) => &conditional.name,
            Self::Dynamic(invocation) => &invocation.spec.name,
        }
    }

    pub fn category(&self) -> NodeCategory {
        match self {
            Self::Input(_) => NodeCategory::Input,
            Self::Task(_) => NodeCategory::Task,
            Self::Conditional(_) => NodeCategory::Conditional,
            Self::Dynamic(_) => NodeCategory::Dynamic,
        }
    }
}

/// A node of an execution plan together with its output promise
#[derive(Debug)]
pub struct PlanNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Nodes this one waits for, deduplicated
    pub upstream: Vec<NodeId>,
    pub output: Promise,
}

impl PlanNode {
    pub fn name(&self) -> &str {
        self.kind.name()
    }

    pub fn category(&self) -> NodeCategory {
        self.kind.category()
    }

    fn label(&self) -> String {
        let kind = match self.category() {
            NodeCategory::Input => "input",
            NodeCategory::Task => "task",
            NodeCategory::Conditional => "conditional",
            NodeCategory::Dynamic => "dynamic",
        };
        format!("{} {}:{}", self.id, kind, self.name())
    }
}

/// The realized DAG of one workflow invocation
#[derive(Debug)]
pub struct ExecutionPlan {
    name: String,
    graph: DiGraph<PlanNode, ()>,
    index: HashMap<NodeId, NodeIndex>,
    ids: IdGen,
    output: Option<Arg>,
}

impl ExecutionPlan {
    pub(crate) fn new(name: impl Into<String>, ids: IdGen) -> Self {
        Self {
            name: name.into(),
            graph: DiGraph::new(),
            index: HashMap::new(),
            ids,
            output: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn ids(&self) -> IdGen {
        self.ids.clone()
    }

    /// Add a node; edges are created for upstream nodes that live in this plan
    pub(crate) fn add_node(
        &mut self,
        kind: NodeKind,
        mut upstream: Vec<NodeId>,
        output_type: ValueType,
    ) -> Promise {
        upstream.sort();
        upstream.dedup();

        let id = self.ids.next();
        let output = Promise::new(id, output_type);
        let local: Vec<NodeIndex> = upstream
            .iter()
            .filter_map(|dep| self.index.get(dep).copied())
            .collect();

        let node = self.graph.add_node(PlanNode {
            id,
            kind,
            upstream,
            output: output.clone(),
        });
        self.index.insert(id, node);

        for dep in local {
            self.graph.add_edge(dep, node, ());
        }

        output
    }

    /// Add an ordering edge between two nodes of this plan
    pub(crate) fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let from_idx = self.index_of(from)?;
        let to_idx = self.index_of(to)?;

        if self.graph[to_idx].upstream.contains(&from) {
            return Ok(());
        }

        // The new edge closes a cycle iff `from` is already reachable from `to`
        if petgraph::algo::has_path_connecting(&self.graph, to_idx, from_idx, None) {
            return Err(EngineError::CyclicDependency { from, to });
        }

        self.graph.add_edge(from_idx, to_idx, ());
        self.graph[to_idx].upstream.push(from);
        Ok(())
    }

    /// Record an ordering dependency on a node outside this plan
    pub(crate) fn add_external_upstream(&mut self, node: NodeId, dep: NodeId) -> Result<()> {
        let idx = self.index_of(node)?;
        let upstream = &mut self.graph[idx].upstream;
        if !upstream.contains(&dep) {
            upstream.push(dep);
        }
        Ok(())
    }

    pub(crate) fn set_output(&mut self, output: Arg) {
        self.output = Some(output);
    }

    /// Designated output of the plan
    pub fn output(&self) -> Option<&Arg> {
        self.output.as_ref()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&PlanNode> {
        self.index.get(&id).map(|&idx| &self.graph[idx])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PlanNode> {
        self.graph.node_weights()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of nodes recorded for the given spec name
    pub fn count_of(&self, name: &str) -> usize {
        self.nodes().filter(|n| n.name() == name).count()
    }

    /// Verify the plan (and every branch sub-plan) is acyclic
    pub fn validate(&self) -> Result<()> {
        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(self.cycle_error());
        }

        for node in self.nodes() {
            if let NodeKind::Conditional(conditional) = &node.kind {
                for plan in conditional.branch_plans() {
                    plan.validate()?;
                }
            }
        }

        Ok(())
    }

    /// Name one edge on a cycle of the graph
    fn cycle_error(&self) -> EngineError {
        let to = match petgraph::algo::toposort(&self.graph, None) {
            Err(cycle) => cycle.node_id(),
            Ok(_) => return EngineError::Internal("cycle vanished".to_string()),
        };
        let from = self
            .graph
            .neighbors_directed(to, Direction::Incoming)
            .find(|&pred| petgraph::algo::has_path_connecting(&self.graph, to, pred, None))
            .unwrap_or(to);

        EngineError::CyclicDependency {
            from: self.graph[from].id,
            to: self.graph[to].id,
        }
    }

    /// Node ids in topological order (dependencies first)
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::new();

        while let Some(node) = topo.next(&self.graph) {
            order.push(self.graph[node].id);
        }

        order
    }

    /// Get dependencies for a node
    pub fn dependencies(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.index_of(id)?;
        Ok(self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|n| self.graph[n].id)
            .collect())
    }

    /// Get nodes that depend on the given node
    pub fn dependents(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.index_of(id)?;
        Ok(self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|n| self.graph[n].id)
            .collect())
    }

    /// Nodes with no dependencies inside this plan (can start immediately)
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.graph
            .externals(Direction::Incoming)
            .map(|n| self.graph[n].id)
            .collect()
    }

    /// Nodes nothing in this plan depends on
    pub fn sinks(&self) -> Vec<NodeId> {
        self.graph
            .externals(Direction::Outgoing)
            .map(|n| self.graph[n].id)
            .collect()
    }

    /// Graphviz rendering of the plan
    pub fn to_dot(&self) -> String {
        let labelled = self.graph.map(|_, node| node.label(), |_, _| "");
        format!("{}", Dot::with_config(&labelled, &[Config::EdgeNoLabel]))
    }

    /// Resolve the plan's input nodes from launch arguments and parameter
    /// defaults. Every argument is checked before any input is resolved, so a
    /// rejected call leaves the plan unbound.
    pub fn bind_inputs<'a>(
        &self,
        inputs: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<()> {
        let mut given: HashMap<&str, Value> = inputs.into_iter().collect();
        let mut bound = Vec::new();

        for node in self.nodes() {
            let NodeKind::Input(param) = &node.kind else {
                continue;
            };

            let value = match given.remove(param.name.as_str()) {
                Some(value) => value,
                None => param.default.clone().ok_or_else(|| EngineError::MissingInput {
                    spec: self.name.clone(),
                    param: param.name.clone(),
                })?,
            };

            if !param.ty.matches(&value) {
                return Err(EngineError::TypeMismatch {
                    target: format!("{}.{}", self.name, param.name),
                    expected: param.ty.clone(),
                    found: describe_value(&value),
                });
            }

            bound.push((&node.output, value));
        }

        if let Some(name) = given.keys().next() {
            return Err(EngineError::UnexpectedInput {
                spec: self.name.clone(),
                param: name.to_string(),
            });
        }

        for (promise, value) in bound {
            promise.resolve(value)?;
        }
        Ok(())
    }

    pub(crate) fn index_of(&self, id: NodeId) -> Result<NodeIndex> {
        self.index
            .get(&id)
            .copied()
            .ok_or(EngineError::UnknownPromise { node: id })
    }

    pub(crate) fn graph(&self) -> &DiGraph<PlanNode, ()> {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut DiGraph<PlanNode, ()> {
        &mut self.graph
    }

    /// Move every node of `sub` into this plan and wire its upstream edges.
    /// Returns the indices of the new nodes.
    pub(crate) fn splice(&mut self, sub: ExecutionPlan) -> Result<Vec<NodeIndex>> {
        let (nodes, _) = sub.graph.into_nodes_edges();
        let mut added = Vec::with_capacity(nodes.len());

        for node in nodes {
            let id = node.weight.id;
            let idx = self.graph.add_node(node.weight);
            self.index.insert(id, idx);
            added.push(idx);
        }

        for &idx in &added {
            for dep in self.graph[idx].upstream.clone() {
                let from = self.index_of(dep)?;
                self.graph.add_edge(from, idx, ());
            }
        }

        Ok(added)
    }
}
