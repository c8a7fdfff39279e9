use super::builder::{check_output, GraphBuilder};
use super::plan::{DynamicInvocation, ExecutionPlan, IdGen};
use crate::error::{EngineError, Result};
use crate::promise::Arg;
use crate::registry::Registry;
use crate::types::NodeId;

/// Sub-plan produced by replaying a dynamic body
#[derive(Debug)]
pub struct Expansion {
    pub plan: ExecutionPlan,
    pub output: Arg,
    pub depth: usize,
}

/// Turns a dynamic invocation with resolved inputs into a concrete sub-plan
pub struct DynamicExpander<'r> {
    registry: &'r Registry,
    max_depth: usize,
}

impl<'r> DynamicExpander<'r> {
    pub fn new(registry: &'r Registry, max_depth: usize) -> Self {
        Self {
            registry,
            max_depth,
        }
    }

    /// Replay the body against concrete inputs. Any failure of the body is
    /// reported as a [`EngineError::DynamicExpansion`] of `node`.
    pub(crate) fn expand(
        &self,
        node: NodeId,
        invocation: &DynamicInvocation,
        ids: IdGen,
    ) -> Result<Expansion> {
        let spec = &invocation.spec;
        let wrap = |source: anyhow::Error| EngineError::DynamicExpansion {
            node,
            spec: spec.name.clone(),
            source,
        };

        let depth = invocation.depth + 1;
        if depth > self.max_depth {
            return Err(wrap(anyhow::anyhow!(
                "expansion depth {} exceeds the limit of {}",
                depth,
                self.max_depth
            )));
        }

        let def = self.registry.dynamic(&spec.name)?;
        let inputs = invocation.inputs.resolved()?;

        let mut builder =
            GraphBuilder::replay(self.registry, spec.name.as_str(), ids, depth, self.max_depth);
        let output = (def.body)(&mut builder, &inputs).map_err(wrap)?;
        check_output(spec, &output).map_err(|e| wrap(e.into()))?;
        let plan = builder.finish(output.clone()).map_err(|e| wrap(e.into()))?;

        tracing::debug!(
            "Expanded dynamic workflow {} ({}) into {} nodes at depth {}",
            spec.name,
            node,
            plan.len(),
            depth
        );

        Ok(Expansion {
            plan,
            output,
            depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::Inputs;
    use crate::types::{TaskSpec, ValueType};
    use crate::workflow::plan::NodeKind;
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
            .register_dynamic(
                TaskSpec::new("chain")
                    .input("n", ValueType::Int)
                    .output(ValueType::Int),
                |b, inputs| {
                    let n: i64 = inputs.get("n")?;
                    let mut acc = Arg::from(0_i64);
                    for _ in 0..n {
                        acc = b.task("inc", [("x", acc)])?.into();
                    }
                    Ok(acc)
                },
            )
            .unwrap();
        registry
            .register_dynamic(
                TaskSpec::new("broken").output(ValueType::Int),
                |_, _| anyhow::bail!("no shape for this input"),
            )
            .unwrap();
        registry
            .register_dynamic(
                TaskSpec::new("nest")
                    .input("n", ValueType::Int)
                    .output(ValueType::Int),
                |b, inputs| Ok(b.dynamic("nest", [("n", inputs.arg("n")?)])?.into()),
            )
            .unwrap();
        registry
    }

    fn invocation(registry: &Registry, name: &str, inputs: &[(&str, i64)], depth: usize) -> DynamicInvocation {
        let mut b = GraphBuilder::new(registry, "outer");
        let args: Vec<(&str, Arg)> = inputs.iter().map(|&(k, v)| (k, Arg::from(v))).collect();
        let promise = b.dynamic(name, args).unwrap();
        let plan = b.finish(&promise).unwrap();
        match &plan.node(promise.node()).unwrap().kind {
            NodeKind::Dynamic(invocation) => DynamicInvocation {
                depth,
                ..invocation.clone()
            },
            _ => panic!("expected dynamic node"),
        }
    }

    #[test]
    fn test_structure_depends_on_values() {
        let registry = registry();
        let expander = DynamicExpander::new(&registry, 4);

        for n in [0_i64, 1, 5] {
            let inv = invocation(&registry, "chain", &[("n", n)], 0);
            let expansion = expander.expand(NodeId(100), &inv, IdGen::default()).unwrap();
            assert_eq!(expansion.plan.count_of("inc"), n as usize);
            assert_eq!(expansion.depth, 1);
            // A zero-length chain returns its constant directly
            assert_eq!(expansion.output.is_concrete(), n == 0);
        }
    }

    #[test]
    fn test_body_failure_wrapped() {
        let registry = registry();
        let expander = DynamicExpander::new(&registry, 4);
        let inv = invocation(&registry, "broken", &[], 0);

        let err = expander.expand(NodeId(7), &inv, IdGen::default()).unwrap_err();
        assert!(matches!(
            &err,
            EngineError::DynamicExpansion { node, spec, .. } if *node == NodeId(7) && spec == "broken"
        ));
        assert!(err.to_string().contains("no shape for this input"));
    }

    #[test]
    fn test_depth_limit() {
        let registry = registry();
        let expander = DynamicExpander::new(&registry, 2);

        let inv = invocation(&registry, "nest", &[("n", 1)], 1);
        let expansion = expander.expand(NodeId(1), &inv, IdGen::default()).unwrap();
        let NodeKind::Dynamic(child) = &expansion.plan.nodes().next().unwrap().kind else {
            panic!("expected dynamic node");
        };
        assert_eq!(child.depth, 2);

        let err = expander.expand(NodeId(2), child, IdGen::default()).unwrap_err();
        assert!(matches!(err, EngineError::DynamicExpansion { .. }));
        assert!(err.to_string().contains("exceeds the limit"));
    }

    #[test]
    fn test_unresolved_inputs_rejected() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry, "outer");
        let one = b.task("inc", [("x", Arg::from(0_i64))]).unwrap();
        let promise = b.dynamic("chain", [("n", Arg::from(&one))]).unwrap();
        let plan = b.finish(&promise).unwrap();
        let NodeKind::Dynamic(inv) = &plan.node(promise.node()).unwrap().kind else {
            panic!("expected dynamic node");
        };

        let expander = DynamicExpander::new(&registry, 4);
        assert!(matches!(
            expander.expand(promise.node(), inv, IdGen::default()),
            Err(EngineError::UnresolvedPromise { .. })
        ));
    }
}
