//! Conditional nodes: ordered `if`/`elif` cases with an optional default.
//!
//! Every branch is recorded into its own sub-plan when the workflow is built.
//! At execution time the predicates are evaluated against resolved values and
//! only the selected branch's sub-plan is spliced into the running plan.
//!
//! A conditional waits for everything any of its branches reads from the
//! enclosing scope, not just for its predicates, so ordering edges that would
//! loop through a branch are rejected while the workflow is built.

use super::builder::GraphBuilder;
use super::plan::ExecutionPlan;
use crate::error::{EngineError, Result};
use crate::promise::{Arg, Promise};
use crate::types::{describe_value, NodeId, ValueType};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// Boolean expression over promises and constants
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare { left: Arg, op: CmpOp, right: Arg },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn compare(left: impl Into<Arg>, op: CmpOp, right: impl Into<Arg>) -> Self {
        Self::Compare {
            left: left.into(),
            op,
            right: right.into(),
        }
    }

    pub fn eq(left: impl Into<Arg>, right: impl Into<Arg>) -> Self {
        Self::compare(left, CmpOp::Eq, right)
    }

    pub fn ne(left: impl Into<Arg>, right: impl Into<Arg>) -> Self {
        Self::compare(left, CmpOp::Ne, right)
    }

    pub fn lt(left: impl Into<Arg>, right: impl Into<Arg>) -> Self {
        Self::compare(left, CmpOp::Lt, right)
    }

    pub fn le(left: impl Into<Arg>, right: impl Into<Arg>) -> Self {
        Self::compare(left, CmpOp::Le, right)
    }

    pub fn gt(left: impl Into<Arg>, right: impl Into<Arg>) -> Self {
        Self::compare(left, CmpOp::Gt, right)
    }

    pub fn ge(left: impl Into<Arg>, right: impl Into<Arg>) -> Self {
        Self::compare(left, CmpOp::Ge, right)
    }

    pub fn and(self, other: Predicate) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Evaluate against resolved promises. `and`/`or` short-circuit.
    pub fn evaluate(&self) -> Result<bool> {
        match self {
            Self::Compare { left, op, right } => {
                compare(&left.concrete()?, *op, &right.concrete()?)
            }
            Self::And(a, b) => Ok(a.evaluate()? && b.evaluate()?),
            Self::Or(a, b) => Ok(a.evaluate()? || b.evaluate()?),
        }
    }

    /// Promises the predicate reads
    pub fn promises(&self) -> Vec<&Promise> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Promise>) {
        match self {
            Self::Compare { left, right, .. } => {
                out.extend(left.as_promise());
                out.extend(right.as_promise());
            }
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect(out);
                b.collect(out);
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn operand(arg: &Arg) -> String {
            match arg {
                Arg::Value(value) => value.to_string(),
                Arg::Promise(promise) => promise.node().to_string(),
            }
        }

        match self {
            Self::Compare { left, op, right } => {
                write!(f, "{} {} {}", operand(left), op.symbol(), operand(right))
            }
            Self::And(a, b) => write!(f, "({} and {})", a, b),
            Self::Or(a, b) => write!(f, "({} or {})", a, b),
        }
    }
}

/// Compare two scalars. Numbers compare numerically, strings lexically and
/// booleans only for equality.
fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool> {
    let ordering = match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => l.cmp(&r),
            _ => {
                let l = l.as_f64().unwrap_or(f64::NAN);
                let r = r.as_f64().unwrap_or(f64::NAN);
                l.partial_cmp(&r).ok_or_else(|| {
                    EngineError::InvalidPredicate(format!("cannot order {} and {}", l, r))
                })?
            }
        },
        (Value::String(l), Value::String(r)) => l.cmp(r),
        (Value::Bool(l), Value::Bool(r)) if matches!(op, CmpOp::Eq | CmpOp::Ne) => l.cmp(r),
        _ => {
            return Err(EngineError::InvalidPredicate(format!(
                "cannot compare {} {} {}",
                describe_value(left),
                op.symbol(),
                describe_value(right)
            )))
        }
    };

    Ok(op.holds(ordering))
}

/// A sub-plan recorded for one branch, with the branch's output
#[derive(Debug)]
pub struct Branch {
    pub plan: ExecutionPlan,
    pub output: Arg,
}

impl Branch {
    /// Nodes outside the branch's sub-plan that it reads or waits for
    fn external_upstream(&self) -> impl Iterator<Item = NodeId> + '_ {
        let output = self.output.as_promise().map(Promise::node);
        self.plan
            .nodes()
            .flat_map(|node| node.upstream.iter().copied())
            .chain(output)
            .filter(|id| !self.plan.contains(*id))
    }
}

#[derive(Debug)]
pub struct Case {
    pub name: String,
    pub predicate: Predicate,
    branch: Option<Branch>,
}

impl Case {
    /// Recorded branch; `None` once it has been handed to the scheduler
    pub fn branch(&self) -> Option<&Branch> {
        self.branch.as_ref()
    }
}

#[derive(Debug)]
pub enum DefaultBranch {
    Branch(Option<Branch>),
    Fail(String),
}

/// Outcome of evaluating a conditional's predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Case(usize),
    Default,
}

/// A conditional node as stored in an execution plan
#[derive(Debug)]
pub struct ConditionalNode {
    pub name: String,
    pub cases: Vec<Case>,
    pub default: Option<DefaultBranch>,
}

impl ConditionalNode {
    /// Pick the first case whose predicate holds, else the default
    pub fn evaluate(&self, node: NodeId) -> Result<Selection> {
        for (index, case) in self.cases.iter().enumerate() {
            if case.predicate.evaluate()? {
                return Ok(Selection::Case(index));
            }
        }

        match &self.default {
            Some(DefaultBranch::Branch(_)) => Ok(Selection::Default),
            Some(DefaultBranch::Fail(message)) => Err(EngineError::BranchFailed {
                node,
                conditional: self.name.clone(),
                message: message.clone(),
            }),
            None => Err(EngineError::NoMatchingBranch {
                node,
                conditional: self.name.clone(),
            }),
        }
    }

    pub fn selection_name(&self, selection: Selection) -> &str {
        match selection {
            Selection::Case(index) => self
                .cases
                .get(index)
                .map(|c| c.name.as_str())
                .unwrap_or("?"),
            Selection::Default => "else",
        }
    }

    /// Move the selected branch out of the node
    pub(crate) fn take_branch(&mut self, selection: Selection) -> Option<Branch> {
        match selection {
            Selection::Case(index) => self.cases.get_mut(index).and_then(|c| c.branch.take()),
            Selection::Default => match &mut self.default {
                Some(DefaultBranch::Branch(branch)) => branch.take(),
                _ => None,
            },
        }
    }

    /// Sub-plans of every branch still held by the node
    pub fn branch_plans(&self) -> impl Iterator<Item = &ExecutionPlan> {
        self.branches().map(|(_, branch)| &branch.plan)
    }

    fn branches(&self) -> impl Iterator<Item = (&str, &Branch)> {
        let default = match &self.default {
            Some(DefaultBranch::Branch(Some(branch))) => Some(("else", branch)),
            _ => None,
        };
        self.cases
            .iter()
            .filter_map(|c| c.branch.as_ref().map(|b| (c.name.as_str(), b)))
            .chain(default)
    }

    /// Output type shared by every branch. Promise outputs must agree up to
    /// widening (`int` into `float`); literal outputs must match the result.
    fn output_type(&self) -> Result<ValueType> {
        let mut agreed: Option<ValueType> = None;
        for (case, branch) in self.branches() {
            let Some(promise) = branch.output.as_promise() else {
                continue;
            };
            let ty = promise.value_type();
            agreed = match agreed {
                None => Some(ty.clone()),
                Some(current) if current.accepts(ty) => Some(current),
                Some(current) if ty.accepts(&current) => Some(ty.clone()),
                Some(current) => return Err(self.mismatch(case, current, ty.to_string())),
            };
        }

        let agreed = agreed.unwrap_or(ValueType::Any);
        for (case, branch) in self.branches() {
            if let Arg::Value(value) = &branch.output {
                if !agreed.matches(value) {
                    return Err(self.mismatch(case, agreed, describe_value(value)));
                }
            }
        }
        Ok(agreed)
    }

    fn mismatch(&self, case: &str, expected: ValueType, found: String) -> EngineError {
        EngineError::TypeMismatch {
            target: format!("{} {} output", self.name, case),
            expected,
            found,
        }
    }

    /// Upstream node ids: promises read by the predicates and by any branch
    fn producers(&self) -> Vec<NodeId> {
        let predicates = self
            .cases
            .iter()
            .flat_map(|c| c.predicate.promises())
            .map(Promise::node);
        let branches = self
            .branches()
            .flat_map(|(_, branch)| branch.external_upstream());
        predicates.chain(branches).collect()
    }
}

/// Builder returned by [`GraphBuilder::conditional`]
pub struct ConditionalBuilder<'b, 'r> {
    builder: &'b mut GraphBuilder<'r>,
    name: String,
    cases: Vec<Case>,
}

impl<'b, 'r> ConditionalBuilder<'b, 'r> {
    pub(crate) fn new(builder: &'b mut GraphBuilder<'r>, name: impl Into<String>) -> Self {
        Self {
            builder,
            name: name.into(),
            cases: Vec::new(),
        }
    }

    /// First case
    pub fn if_(self, predicate: Predicate) -> CaseBuilder<'b, 'r> {
        self.case(predicate)
    }

    /// Further case, tried only when every earlier predicate was false
    pub fn elif_(self, predicate: Predicate) -> CaseBuilder<'b, 'r> {
        self.case(predicate)
    }

    pub fn else_(self) -> ElseBuilder<'b, 'r> {
        ElseBuilder { parent: self }
    }

    /// Close the conditional without a default branch
    pub fn end(self) -> Result<Promise> {
        self.finish(None)
    }

    fn case(self, predicate: Predicate) -> CaseBuilder<'b, 'r> {
        CaseBuilder {
            parent: self,
            predicate,
        }
    }

    fn finish(self, default: Option<DefaultBranch>) -> Result<Promise> {
        let node = ConditionalNode {
            name: self.name,
            cases: self.cases,
            default,
        };
        let upstream = node.producers();
        let output_type = node.output_type()?;
        self.builder.record_conditional(node, upstream, output_type)
    }
}

pub struct CaseBuilder<'b, 'r> {
    parent: ConditionalBuilder<'b, 'r>,
    predicate: Predicate,
}

impl<'b, 'r> CaseBuilder<'b, 'r> {
    /// Record the branch body into its own sub-plan
    pub fn then<F>(mut self, body: F) -> Result<ConditionalBuilder<'b, 'r>>
    where
        F: FnOnce(&mut GraphBuilder<'r>) -> Result<Arg>,
    {
        for promise in self.predicate.promises() {
            self.parent.builder.check_visible(promise)?;
        }

        let branch = self.parent.builder.branch(body)?;
        let name = format!("case-{}", self.parent.cases.len() + 1);
        self.parent.cases.push(Case {
            name,
            predicate: self.predicate,
            branch: Some(branch),
        });
        Ok(self.parent)
    }
}

pub struct ElseBuilder<'b, 'r> {
    parent: ConditionalBuilder<'b, 'r>,
}

impl<'b, 'r> ElseBuilder<'b, 'r> {
    /// Default branch, taken when no predicate holds
    pub fn then<F>(self, body: F) -> Result<Promise>
    where
        F: FnOnce(&mut GraphBuilder<'r>) -> Result<Arg>,
    {
        let branch = self.parent.builder.branch(body)?;
        self.parent.finish(Some(DefaultBranch::Branch(Some(branch))))
    }

    /// Default branch that fails the conditional with `message`
    pub fn fail(self, message: impl Into<String>) -> Result<Promise> {
        self.parent.finish(Some(DefaultBranch::Fail(message.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolved(node: u64, value: Value) -> Promise {
        let promise = Promise::new(NodeId(node), ValueType::Any);
        promise.resolve(value).unwrap();
        promise
    }

    #[test]
    fn test_numeric_comparisons() {
        let count = resolved(1, json!(5));

        assert!(Predicate::gt(&count, 3_i64).evaluate().unwrap());
        assert!(Predicate::ge(&count, 5_i64).evaluate().unwrap());
        assert!(Predicate::lt(&count, 10_i64).evaluate().unwrap());
        assert!(Predicate::le(&count, 5_i64).evaluate().unwrap());
        assert!(!Predicate::ne(&count, 5_i64).evaluate().unwrap());
        assert!(Predicate::lt(&count, json!(5.5)).evaluate().unwrap());
    }

    #[test]
    fn test_string_and_bool_comparisons() {
        let status = resolved(2, json!("complete"));
        let flag = resolved(3, json!(true));

        assert!(Predicate::eq(&status, "complete").evaluate().unwrap());
        assert!(Predicate::ne(&status, "pending").evaluate().unwrap());
        assert!(Predicate::eq(&flag, true).evaluate().unwrap());
        assert!(matches!(
            Predicate::lt(&flag, false).evaluate(),
            Err(EngineError::InvalidPredicate(_))
        ));
        assert!(matches!(
            Predicate::eq(&status, 3_i64).evaluate(),
            Err(EngineError::InvalidPredicate(_))
        ));
    }

    #[test]
    fn test_and_or_short_circuit() {
        let unresolved = Promise::new(NodeId(9), ValueType::Int);
        let yes = Predicate::eq(1_i64, 1_i64);
        let no = Predicate::eq(1_i64, 2_i64);

        // The unresolved side is never read
        assert!(yes
            .clone()
            .or(Predicate::eq(&unresolved, 1_i64))
            .evaluate()
            .unwrap());
        assert!(!no
            .clone()
            .and(Predicate::eq(&unresolved, 1_i64))
            .evaluate()
            .unwrap());
        assert!(matches!(
            yes.and(Predicate::eq(&unresolved, 1_i64)).evaluate(),
            Err(EngineError::UnresolvedPromise { .. })
        ));
    }

    #[test]
    fn test_display() {
        let n = Promise::new(NodeId(4), ValueType::Int);
        let predicate = Predicate::le(&n, 5_i64).and(Predicate::gt(&n, 0_i64));
        assert_eq!(predicate.to_string(), "(n4 <= 5 and n4 > 0)");
    }
}
