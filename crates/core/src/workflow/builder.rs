use super::conditional::{Branch, ConditionalBuilder, ConditionalNode};
use super::plan::{DynamicInvocation, ExecutionPlan, IdGen, NodeKind, TaskInvocation};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::promise::{Arg, Inputs, Promise};
use crate::registry::Registry;
use crate::types::{describe_value, NodeId, TaskSpec, ValueType};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How a builder sees its inputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildMode {
    /// Workflow compiled ahead of execution; inputs are promises and reading
    /// one fails with `StaticInputRead`
    Static,
    /// Dynamic body replayed at run time; inputs are concrete values
    #[default]
    Replay,
}

/// Records task, workflow, dynamic and conditional invocations into an
/// [`ExecutionPlan`] instead of executing them.
///
/// Workflow bodies receive a builder explicitly; there is no ambient
/// "current graph".
pub struct GraphBuilder<'r> {
    registry: &'r Registry,
    plan: ExecutionPlan,
    /// Nodes of enclosing scopes this builder may reference
    visible: HashSet<NodeId>,
    mode: BuildMode,
    /// Dynamic expansions enclosing this builder
    depth: usize,
    /// Inlined workflows currently being recorded
    nesting: usize,
    max_depth: usize,
}

impl<'r> GraphBuilder<'r> {
    /// Static builder for a fresh plan
    pub fn new(registry: &'r Registry, name: impl Into<String>) -> Self {
        Self {
            registry,
            plan: ExecutionPlan::new(name, IdGen::default()),
            visible: HashSet::new(),
            mode: BuildMode::Static,
            depth: 0,
            nesting: 0,
            max_depth: EngineConfig::default().max_expansion_depth,
        }
    }

    /// Builder used to replay a dynamic body, allocating ids from the running plan
    pub(crate) fn replay(
        registry: &'r Registry,
        name: impl Into<String>,
        ids: IdGen,
        depth: usize,
        max_depth: usize,
    ) -> Self {
        Self {
            registry,
            plan: ExecutionPlan::new(name, ids),
            visible: HashSet::new(),
            mode: BuildMode::Replay,
            depth,
            nesting: 0,
            max_depth,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Compile a registered workflow into a plan whose inputs are input nodes
    pub fn compile(registry: &'r Registry, workflow: &str, max_depth: usize) -> Result<ExecutionPlan> {
        let def = registry.workflow(workflow)?;
        let mut builder = GraphBuilder::new(registry, workflow).with_max_depth(max_depth);

        let mut inputs = Inputs::new(workflow).with_mode(builder.mode);
        for param in &def.spec.inputs {
            let promise =
                builder
                    .plan
                    .add_node(NodeKind::Input(param.clone()), vec![], param.ty.clone());
            inputs.insert(param.name.clone(), param.ty.clone(), Arg::Promise(promise));
        }

        builder.nesting += 1;
        let output = (def.body)(&mut builder, &inputs).map_err(|err| {
            EngineError::from_body(err, |source| EngineError::WorkflowConstruction {
                workflow: workflow.to_string(),
                source,
            })
        })?;
        builder.nesting -= 1;

        check_output(&def.spec, &output)?;
        let plan = builder.finish(output)?;
        tracing::debug!("Compiled workflow {} into {} nodes", workflow, plan.len());
        Ok(plan)
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    /// Plan recorded so far
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Record a task invocation
    pub fn task<'a>(
        &mut self,
        name: &str,
        args: impl IntoIterator<Item = (&'a str, Arg)>,
    ) -> Result<Promise> {
        let registry = self.registry;
        let spec = Arc::clone(&registry.task(name)?.spec);
        self.record(&spec, args, |spec, inputs| {
            NodeKind::Task(TaskInvocation { spec, inputs })
        })
    }

    /// Record a dynamic workflow invocation, expanded once its inputs resolve
    pub fn dynamic<'a>(
        &mut self,
        name: &str,
        args: impl IntoIterator<Item = (&'a str, Arg)>,
    ) -> Result<Promise> {
        let registry = self.registry;
        let spec = Arc::clone(&registry.dynamic(name)?.spec);
        let depth = self.depth;
        self.record(&spec, args, |spec, inputs| {
            NodeKind::Dynamic(DynamicInvocation {
                spec,
                inputs,
                depth,
            })
        })
    }

    /// Inline a static workflow into this builder and return its output
    pub fn workflow<'a>(
        &mut self,
        name: &str,
        args: impl IntoIterator<Item = (&'a str, Arg)>,
    ) -> Result<Arg> {
        let registry = self.registry;
        let def = registry.workflow(name)?;

        if self.nesting >= self.max_depth {
            return Err(EngineError::RecursionLimit {
                name: name.to_string(),
                limit: self.max_depth,
            });
        }

        let inputs = self.bind(&def.spec, args)?;

        self.nesting += 1;
        let result = (def.body)(self, &inputs);
        self.nesting -= 1;

        let output = result.map_err(|err| {
            EngineError::from_body(err, |source| EngineError::WorkflowConstruction {
                workflow: name.to_string(),
                source,
            })
        })?;
        self.check_arg(&output)?;
        check_output(&def.spec, &output)?;
        Ok(output)
    }

    /// Start a conditional node
    pub fn conditional(&mut self, name: impl Into<String>) -> ConditionalBuilder<'_, 'r> {
        ConditionalBuilder::new(self, name)
    }

    /// Order `downstream` after `upstream` without passing data
    pub fn depends_on(&mut self, downstream: &Promise, upstream: &Promise) -> Result<()> {
        let (to, from) = (downstream.node(), upstream.node());

        if !self.plan.contains(to) {
            return Err(EngineError::UnknownPromise { node: to });
        }

        if self.plan.contains(from) {
            self.plan.add_edge(from, to)
        } else if self.visible.contains(&from) {
            self.plan.add_external_upstream(to, from)
        } else {
            Err(EngineError::UnknownPromise { node: from })
        }
    }

    /// Close the builder with the plan's designated output
    pub fn finish(mut self, output: impl Into<Arg>) -> Result<ExecutionPlan> {
        let output = output.into();
        self.check_arg(&output)?;
        self.plan.set_output(output);
        self.plan.validate()?;
        Ok(self.plan)
    }

    pub(crate) fn check_visible(&self, promise: &Promise) -> Result<()> {
        let node = promise.node();
        if self.plan.contains(node) || self.visible.contains(&node) {
            Ok(())
        } else {
            Err(EngineError::UnknownPromise { node })
        }
    }

    fn check_arg(&self, arg: &Arg) -> Result<()> {
        match arg {
            Arg::Promise(promise) => self.check_visible(promise),
            Arg::Value(_) => Ok(()),
        }
    }

    /// Record one branch of a conditional into its own sub-plan
    pub(crate) fn branch<F>(&self, body: F) -> Result<Branch>
    where
        F: FnOnce(&mut GraphBuilder<'r>) -> Result<Arg>,
    {
        let mut child = self.child();
        let output = body(&mut child)?;
        let plan = child.finish(output.clone())?;
        Ok(Branch { plan, output })
    }

    pub(crate) fn record_conditional(
        &mut self,
        node: ConditionalNode,
        upstream: Vec<NodeId>,
        output_type: ValueType,
    ) -> Result<Promise> {
        for &dep in &upstream {
            if !self.plan.contains(dep) && !self.visible.contains(&dep) {
                return Err(EngineError::UnknownPromise { node: dep });
            }
        }

        tracing::trace!("Recorded conditional {} with {} cases", node.name, node.cases.len());
        Ok(self
            .plan
            .add_node(NodeKind::Conditional(node), upstream, output_type))
    }

    /// Builder for a nested scope that can see everything recorded so far
    fn child(&self) -> GraphBuilder<'r> {
        let mut visible = self.visible.clone();
        visible.extend(self.plan.nodes().map(|n| n.id));

        GraphBuilder {
            registry: self.registry,
            plan: ExecutionPlan::new(self.plan.name(), self.plan.ids()),
            visible,
            mode: self.mode,
            depth: self.depth,
            nesting: self.nesting,
            max_depth: self.max_depth,
        }
    }

    fn record<'a>(
        &mut self,
        spec: &Arc<TaskSpec>,
        args: impl IntoIterator<Item = (&'a str, Arg)>,
        kind: impl FnOnce(Arc<TaskSpec>, Inputs) -> NodeKind,
    ) -> Result<Promise> {
        let inputs = self.bind(spec, args)?;
        let upstream = inputs.producers();
        let promise = self
            .plan
            .add_node(kind(Arc::clone(spec), inputs), upstream, spec.output.clone());
        tracing::trace!("Recorded {} as {}", spec.name, promise.node());
        Ok(promise)
    }

    /// Bind call-site arguments to a spec's parameters, filling defaults
    fn bind<'a>(
        &self,
        spec: &TaskSpec,
        args: impl IntoIterator<Item = (&'a str, Arg)>,
    ) -> Result<Inputs> {
        let mut given: HashMap<&str, Arg> = args.into_iter().collect();

        if let Some(name) = given.keys().find(|name| spec.param(name).is_none()) {
            return Err(EngineError::UnexpectedInput {
                spec: spec.name.clone(),
                param: name.to_string(),
            });
        }

        let mut inputs = Inputs::new(&spec.name).with_mode(self.mode);
        for param in &spec.inputs {
            let arg = match given.remove(param.name.as_str()) {
                Some(arg) => arg,
                None => match &param.default {
                    Some(default) => Arg::Value(default.clone()),
                    None => {
                        return Err(EngineError::MissingInput {
                            spec: spec.name.clone(),
                            param: param.name.clone(),
                        })
                    }
                },
            };

            let found = match &arg {
                Arg::Value(value) if !param.ty.matches(value) => Some(describe_value(value)),
                Arg::Promise(promise) => {
                    self.check_visible(promise)?;
                    (!param.ty.accepts(promise.value_type()))
                        .then(|| promise.value_type().to_string())
                }
                Arg::Value(_) => None,
            };
            if let Some(found) = found {
                return Err(EngineError::TypeMismatch {
                    target: format!("{}.{}", spec.name, param.name),
                    expected: param.ty.clone(),
                    found,
                });
            }

            inputs.insert(param.name.clone(), param.ty.clone(), arg);
        }

        Ok(inputs)
    }
}

/// Check a body's output against the declared output type
pub(crate) fn check_output(spec: &TaskSpec, output: &Arg) -> Result<()> {
    let found = match output {
        Arg::Value(value) if !spec.output.matches(value) => Some(describe_value(value)),
        Arg::Promise(promise) if !spec.output.accepts(promise.value_type()) => {
            Some(promise.value_type().to_string())
        }
        _ => None,
    };

    match found {
        Some(found) => Err(EngineError::TypeMismatch {
            target: format!("{} output", spec.name),
            expected: spec.output.clone(),
            found,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::conditional::Predicate;
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_task(
                TaskSpec::new("inc")
                    .input("x", ValueType::Int)
                    .output(ValueType::Int),
                |inputs: &Inputs| Ok(json!(inputs.get::<i64>("x")? + 1)),
            )
            .unwrap();
        registry
            .register_task(
                TaskSpec::new("scale")
                    .input("x", ValueType::Int)
                    .input_with_default("factor", ValueType::Int, json!(2))
                    .output(ValueType::Int),
                |inputs: &Inputs| Ok(json!(inputs.get::<i64>("x")? * inputs.get::<i64>("factor")?)),
            )
            .unwrap();
        registry
            .register_task(
                TaskSpec::new("shout")
                    .input("s", ValueType::Str)
                    .output(ValueType::Str),
                |inputs: &Inputs| Ok(json!(inputs.get::<String>("s")?.to_uppercase())),
            )
            .unwrap();
        registry
            .register_workflow(
                TaskSpec::new("peek")
                    .input("n", ValueType::Int)
                    .output(ValueType::Int),
                |_, inputs| {
                    // Reading a static input as a concrete value must fail
                    let n: i64 = inputs.get("n")?;
                    Ok(Arg::from(n))
                },
            )
            .unwrap();
        registry
            .register_workflow(TaskSpec::new("forever").output(ValueType::Int), |b, _| {
                Ok(b.workflow("forever", [])?)
            })
            .unwrap();
        registry
            .register_workflow(
                TaskSpec::new("double_inc")
                    .input("x", ValueType::Int)
                    .output(ValueType::Int),
                |b, inputs| {
                    let once = b.task("inc", [("x", inputs.arg("x")?)])?;
                    Ok(b.task("inc", [("x", once.into())])?.into())
                },
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_records_without_executing() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");
        let a = b.task("inc", [("x", Arg::from(1_i64))]).unwrap();
        let c = b.task("inc", [("x", Arg::from(&a))]).unwrap();

        assert!(!a.is_resolved());
        assert_eq!(b.mode(), BuildMode::Static);
        assert_eq!(b.plan().len(), 2);
        assert_eq!(b.plan().dependencies(c.node()).unwrap(), vec![a.node()]);
        assert!(matches!(
            c.value(),
            Err(EngineError::UnresolvedPromise { .. })
        ));
    }

    #[test]
    fn test_binding_errors() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");

        assert!(matches!(
            b.task("inc", []),
            Err(EngineError::MissingInput { .. })
        ));
        assert!(matches!(
            b.task("inc", [("x", Arg::from(1_i64)), ("y", Arg::from(2_i64))]),
            Err(EngineError::UnexpectedInput { param, .. }) if param == "y"
        ));
        assert!(matches!(
            b.task("inc", [("x", Arg::from("one"))]),
            Err(EngineError::TypeMismatch { .. })
        ));

        let text = b.task("shout", [("s", Arg::from("hi"))]).unwrap();
        assert!(matches!(
            b.task("inc", [("x", Arg::from(&text))]),
            Err(EngineError::TypeMismatch { found, .. }) if found == "str"
        ));
        assert!(matches!(
            b.task("missing", []),
            Err(EngineError::UnknownEntity { kind: "task", .. })
        ));
        assert_eq!(b.plan().len(), 1);
    }

    #[test]
    fn test_defaults_filled() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");
        let p = b.task("scale", [("x", Arg::from(3_i64))]).unwrap();

        let node = b.plan().node(p.node()).unwrap();
        let NodeKind::Task(invocation) = &node.kind else {
            panic!("expected task node");
        };
        assert_eq!(invocation.inputs.value("factor").unwrap(), json!(2));
    }

    #[test]
    fn test_foreign_promise_rejected() {
        let registry = registry();
        let mut other = GraphBuilder::new(&registry, "other");
        let foreign = other.task("inc", [("x", Arg::from(1_i64))]).unwrap();

        let mut b = GraphBuilder::new(&registry, "test");
        assert!(matches!(
            b.task("inc", [("x", Arg::from(&foreign))]),
            Err(EngineError::UnknownPromise { .. })
        ));
    }

    #[test]
    fn test_depends_on_two_cycle() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");
        let a = b.task("inc", [("x", Arg::from(1_i64))]).unwrap();
        let c = b.task("inc", [("x", Arg::from(2_i64))]).unwrap();

        b.depends_on(&c, &a).unwrap();
        let err = b.depends_on(&a, &c).unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency { from, to } if from == c.node() && to == a.node()));
        assert!(b.finish(&c).is_ok());
    }

    #[test]
    fn test_depends_on_four_cycle() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");
        let nodes: Vec<Promise> = (0..4_i64)
            .map(|i| b.task("inc", [("x", Arg::from(i))]).unwrap())
            .collect();

        for pair in nodes.windows(2) {
            b.depends_on(&pair[1], &pair[0]).unwrap();
        }
        assert!(matches!(
            b.depends_on(&nodes[0], &nodes[3]),
            Err(EngineError::CyclicDependency { .. })
        ));

        // Data edges count too
        let tail = b.task("inc", [("x", Arg::from(&nodes[3]))]).unwrap();
        assert!(matches!(
            b.depends_on(&nodes[1], &tail),
            Err(EngineError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_depends_on_self_loop() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");
        let a = b.task("inc", [("x", Arg::from(1_i64))]).unwrap();
        assert!(matches!(
            b.depends_on(&a, &a),
            Err(EngineError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_static_input_read_fails() {
        let registry = registry();
        let err = GraphBuilder::compile(&registry, "peek", 8).unwrap_err();
        assert!(matches!(
            &err,
            EngineError::StaticInputRead { spec, param } if spec == "peek" && param == "n"
        ));
        assert!(err.is_construction_error());
    }

    #[test]
    fn test_recursive_inlining_limited() {
        let registry = registry();
        let err = GraphBuilder::compile(&registry, "forever", 8).unwrap_err();
        assert!(matches!(err, EngineError::RecursionLimit { limit: 8, .. }));
    }

    #[test]
    fn test_compile_creates_input_nodes() {
        let registry = registry();
        let plan = GraphBuilder::compile(&registry, "double_inc", 8).unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.count_of("x"), 1);
        assert_eq!(plan.count_of("inc"), 2);
        assert!(plan.output().is_some_and(|o| !o.is_concrete()));
    }

    #[test]
    fn test_inlined_workflow_records_into_caller() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "caller");
        let out = b.workflow("double_inc", [("x", Arg::from(5_i64))]).unwrap();

        assert_eq!(b.plan().count_of("inc"), 2);
        assert!(out.as_promise().is_some());
    }

    #[test]
    fn test_branches_recorded_as_sub_plans() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");
        let n = b.task("inc", [("x", Arg::from(1_i64))]).unwrap();

        let out = b
            .conditional("small")
            .if_(Predicate::le(&n, 5_i64))
            .then(|b| Ok(b.task("inc", [("x", Arg::from(&n))])?.into()))
            .unwrap()
            .else_()
            .then(|b| {
                let twice = b.task("scale", [("x", Arg::from(&n))])?;
                Ok(b.task("inc", [("x", twice.into())])?.into())
            })
            .unwrap();

        // Only the conditional itself lands in the enclosing plan
        assert_eq!(b.plan().len(), 2);
        assert_eq!(out.value_type(), &ValueType::Int);
        assert_eq!(b.plan().dependencies(out.node()).unwrap(), vec![n.node()]);

        let node = b.plan().node(out.node()).unwrap();
        let NodeKind::Conditional(conditional) = &node.kind else {
            panic!("expected conditional node");
        };
        let sizes: Vec<usize> = conditional.branch_plans().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[test]
    fn test_branch_cannot_see_sibling_nodes() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");
        let n = b.task("inc", [("x", Arg::from(1_i64))]).unwrap();

        let mut leaked = None;
        let err = b
            .conditional("leak")
            .if_(Predicate::gt(&n, 0_i64))
            .then(|b| {
                let inner = b.task("inc", [("x", Arg::from(&n))])?;
                leaked = Some(inner.clone());
                Ok(inner.into())
            })
            .unwrap()
            .elif_(Predicate::lt(&n, 0_i64))
            .then(|b| Ok(b.task("inc", [("x", Arg::from(leaked.as_ref().unwrap()))])?.into()))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnknownPromise { .. }));
    }

    #[test]
    fn test_conditional_waits_for_branch_reads() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");
        let n = b.task("inc", [("x", Arg::from(1_i64))]).unwrap();
        let x = b.task("inc", [("x", Arg::from(2_i64))]).unwrap();
        let y = b.task("inc", [("x", Arg::from(3_i64))]).unwrap();

        let cond = b
            .conditional("route")
            .if_(Predicate::gt(&n, 0_i64))
            .then(|b| Ok(b.task("inc", [("x", Arg::from(&x))])?.into()))
            .unwrap()
            .elif_(Predicate::lt(&n, -5_i64))
            .then(|_| Ok(Arg::from(&y)))
            .unwrap()
            .else_()
            .then(|b| Ok(b.task("inc", [("x", Arg::from(&x))])?.into()))
            .unwrap();

        let mut deps = b.plan().dependencies(cond.node()).unwrap();
        deps.sort();
        assert_eq!(deps, vec![n.node(), x.node(), y.node()]);

        // x feeds a branch of the conditional, so it cannot also follow it
        assert!(matches!(
            b.depends_on(&x, &cond),
            Err(EngineError::CyclicDependency { from, to }) if from == cond.node() && to == x.node()
        ));
        assert!(matches!(
            b.depends_on(&y, &cond),
            Err(EngineError::CyclicDependency { .. })
        ));
        assert!(b.finish(&cond).is_ok());
    }

    #[test]
    fn test_branch_outputs_must_agree() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "test");
        let n = b.task("inc", [("x", Arg::from(1_i64))]).unwrap();

        let err = b
            .conditional("mixed")
            .if_(Predicate::gt(&n, 0_i64))
            .then(|b| Ok(b.task("inc", [("x", Arg::from(&n))])?.into()))
            .unwrap()
            .else_()
            .then(|b| Ok(b.task("shout", [("s", Arg::from("no"))])?.into()))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TypeMismatch { target, expected: ValueType::Int, found }
                if target == "mixed else output" && found == "str"
        ));

        let err = b
            .conditional("literal")
            .if_(Predicate::gt(&n, 0_i64))
            .then(|b| Ok(b.task("inc", [("x", Arg::from(&n))])?.into()))
            .unwrap()
            .else_()
            .then(|_| Ok(Arg::from("none")))
            .unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));

        // Rejected conditionals leave nothing behind
        assert_eq!(b.plan().len(), 1);

        let agreed = b
            .conditional("same")
            .if_(Predicate::gt(&n, 0_i64))
            .then(|b| Ok(b.task("inc", [("x", Arg::from(&n))])?.into()))
            .unwrap()
            .else_()
            .then(|_| Ok(Arg::from(0_i64)))
            .unwrap();
        assert_eq!(agreed.value_type(), &ValueType::Int);
    }
}
