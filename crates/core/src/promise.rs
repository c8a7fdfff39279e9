//! Promises, arguments and bound inputs.
//!
//! A [`Promise`] is a forward reference to the output of a node. Its value is
//! held in a write-once cell shared by every clone, so the producing node is
//! the single writer and any number of dependents can read it once it is set.
//!
//! Bodies never see raw promises directly: they receive [`Inputs`], whose
//! entries are [`Arg`]s. While a workflow is compiled statically its inputs are
//! promises and reading them as concrete values fails with
//! [`EngineError::StaticInputRead`]; when a dynamic body is replayed its inputs
//! are concrete values.

use crate::error::{EngineError, Result};
use crate::types::{describe_value, NodeId, ValueType};
use crate::workflow::BuildMode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Output of a node that may not have been computed yet
#[derive(Clone)]
pub struct Promise {
    node: NodeId,
    path: Vec<usize>,
    ty: ValueType,
    cell: Arc<OnceLock<Value>>,
}

impl Promise {
    pub(crate) fn new(node: NodeId, ty: ValueType) -> Self {
        Self {
            node,
            path: Vec::new(),
            ty,
            cell: Arc::new(OnceLock::new()),
        }
    }

    /// Producing node
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn value_type(&self) -> &ValueType {
        &self.ty
    }

    /// Promise for one element of a tuple output. Shares the producing node.
    pub fn field(&self, index: usize) -> Promise {
        let mut path = self.path.clone();
        path.push(index);
        Promise {
            node: self.node,
            path,
            ty: self.ty.element(index),
            cell: Arc::clone(&self.cell),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Read the resolved value. Every read after resolution returns the same value.
    pub fn value(&self) -> Result<Value> {
        let root = self
            .cell
            .get()
            .ok_or(EngineError::UnresolvedPromise { node: self.node })?;

        let mut current = root;
        for &index in &self.path {
            current = current.get(index).ok_or(EngineError::MissingField {
                node: self.node,
                index,
            })?;
        }
        Ok(current.clone())
    }

    /// Write-once resolution, performed by the scheduler when the producing node completes.
    pub(crate) fn resolve(&self, value: Value) -> Result<()> {
        debug_assert!(self.path.is_empty(), "only root promises are resolved");
        self.cell
            .set(value)
            .map_err(|_| EngineError::AlreadyResolved { node: self.node })
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Promise");
        s.field("node", &self.node);
        if !self.path.is_empty() {
            s.field("path", &self.path);
        }
        s.field("resolved", &self.is_resolved()).finish()
    }
}

/// Argument of an invocation: a concrete value or a promise
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Promise(Promise),
}

impl Arg {
    /// Concrete value of the argument; fails for unresolved promises.
    pub fn concrete(&self) -> Result<Value> {
        match self {
            Self::Value(value) => Ok(value.clone()),
            Self::Promise(promise) => promise.value(),
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Self::Promise(promise) => Some(promise),
            Self::Value(_) => None,
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Promise> for Arg {
    fn from(promise: Promise) -> Self {
        Self::Promise(promise)
    }
}

impl From<&Promise> for Arg {
    fn from(promise: &Promise) -> Self {
        Self::Promise(promise.clone())
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Self::Value(value.into())
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Self::Value(value.into())
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Value(value.into())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Value(value.into())
    }
}

impl From<Vec<i64>> for Arg {
    fn from(value: Vec<i64>) -> Self {
        Self::Value(value.into())
    }
}

/// Named arguments bound to a spec's parameters
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    spec: String,
    args: BTreeMap<String, (ValueType, Arg)>,
    /// Mode of the builder that bound these inputs
    mode: BuildMode,
}

impl Inputs {
    pub(crate) fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            args: BTreeMap::new(),
            mode: BuildMode::default(),
        }
    }

    pub(crate) fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, ty: ValueType, arg: Arg) {
        self.args.insert(name.into(), (ty, arg));
    }

    fn entry(&self, name: &str) -> Result<&(ValueType, Arg)> {
        self.args.get(name).ok_or_else(|| EngineError::MissingInput {
            spec: self.spec.clone(),
            param: name.to_string(),
        })
    }

    /// Argument as bound, concrete or promise
    pub fn arg(&self, name: &str) -> Result<Arg> {
        Ok(self.entry(name)?.1.clone())
    }

    /// Concrete value of an argument
    pub fn value(&self, name: &str) -> Result<Value> {
        self.concrete(name).map(|(_, value)| value)
    }

    /// Concrete value of an argument, deserialized
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let (ty, value) = self.concrete(name)?;
        let found = describe_value(&value);
        serde_json::from_value(value).map_err(|_| EngineError::TypeMismatch {
            target: format!("{}.{}", self.spec, name),
            expected: ty.clone(),
            found,
        })
    }

    fn concrete(&self, name: &str) -> Result<(&ValueType, Value)> {
        let (ty, arg) = self.entry(name)?;
        match arg.concrete() {
            Err(EngineError::UnresolvedPromise { .. }) if self.mode == BuildMode::Static => {
                Err(EngineError::StaticInputRead {
                    spec: self.spec.clone(),
                    param: name.to_string(),
                })
            }
            result => Ok((ty, result?)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arg)> {
        self.args.iter().map(|(name, (_, arg))| (name.as_str(), arg))
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Same inputs with every promise replaced by its resolved value
    pub(crate) fn resolved(&self) -> Result<Inputs> {
        let mut resolved = Inputs::new(self.spec.clone());
        for (name, (ty, arg)) in &self.args {
            resolved.insert(name.clone(), ty.clone(), Arg::Value(arg.concrete()?));
        }
        Ok(resolved)
    }

    /// Nodes that produce the promises among these inputs, deduplicated
    pub(crate) fn producers(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .args
            .values()
            .filter_map(|(_, arg)| arg.as_promise().map(Promise::node))
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}
