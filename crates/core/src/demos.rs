//! Reference workflows: character-frequency counting and a recursive merge sort.
//!
//! Both are ordinary client code. `count_characters` is a dynamic workflow
//! whose graph shape depends on the length of its input strings;
//! `merge_sort` is a static workflow whose conditional either sorts locally or
//! hands off to the dynamic `merge_sort_remotely`, which inlines `merge_sort`
//! again for each half.

use crate::error::Result;
use crate::promise::{Arg, Inputs};
use crate::registry::Registry;
use crate::types::{TaskSpec, ValueType};
use crate::workflow::{GraphBuilder, Predicate};
use anyhow::{bail, Context};
use serde_json::{json, Value};

const ALPHABET: usize = 26;

/// Registry holding every reference task and workflow
pub fn registry() -> Result<Registry> {
    let mut registry = Registry::new();
    register(&mut registry)?;
    Ok(registry)
}

pub fn register(registry: &mut Registry) -> Result<()> {
    register_count_characters(registry)?;
    register_merge_sort(registry)
}

fn int_list() -> ValueType {
    ValueType::list(ValueType::Int)
}

pub fn register_count_characters(registry: &mut Registry) -> Result<()> {
    registry.register_task(
        TaskSpec::new("return_index")
            .description("Alphabet position of a letter, ignoring case")
            .input("character", ValueType::Str)
            .output(ValueType::Int),
        return_index,
    )?;
    registry.register_task(
        TaskSpec::new("update_list")
            .input("freq_list", int_list())
            .input("list_index", ValueType::Int)
            .output(int_list()),
        update_list,
    )?;
    registry.register_task(
        TaskSpec::new("derive_count")
            .input("freq1", int_list())
            .input("freq2", int_list())
            .output(ValueType::Int),
        derive_count,
    )?;
    registry.register_dynamic(
        TaskSpec::new("count_characters")
            .description("Number of letters two strings have in common")
            .input("s1", ValueType::Str)
            .input("s2", ValueType::Str)
            .output(ValueType::Int),
        count_characters,
    )?;
    registry.register_workflow(
        TaskSpec::new("dynamic_wf")
            .input("s1", ValueType::Str)
            .input("s2", ValueType::Str)
            .output(ValueType::Int),
        |b, inputs| {
            let count = b.dynamic(
                "count_characters",
                [("s1", inputs.arg("s1")?), ("s2", inputs.arg("s2")?)],
            )?;
            Ok(count.into())
        },
    )?;
    Ok(())
}

fn return_index(inputs: &Inputs) -> anyhow::Result<Value> {
    let character: String = inputs.get("character")?;
    let mut chars = character.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        bail!("expected a single character, got {:?}", character);
    };
    if !c.is_ascii_alphabetic() {
        bail!("{:?} is not an ASCII letter", c);
    }

    let base = if c.is_ascii_lowercase() { b'a' } else { b'A' };
    Ok(json!(c as u8 - base))
}

fn update_list(inputs: &Inputs) -> anyhow::Result<Value> {
    let mut freq: Vec<i64> = inputs.get("freq_list")?;
    let index: usize = inputs
        .get::<i64>("list_index")?
        .try_into()
        .context("negative list index")?;

    let slot = freq
        .get_mut(index)
        .with_context(|| format!("index {} out of range for {} slots", index, ALPHABET))?;
    *slot += 1;
    Ok(json!(freq))
}

fn derive_count(inputs: &Inputs) -> anyhow::Result<Value> {
    let freq1: Vec<i64> = inputs.get("freq1")?;
    let freq2: Vec<i64> = inputs.get("freq2")?;

    let count: i64 = freq1
        .iter()
        .zip(&freq2)
        .take(ALPHABET)
        .map(|(a, b)| *a.min(b))
        .sum();
    Ok(json!(count))
}

fn count_characters(b: &mut GraphBuilder<'_>, inputs: &Inputs) -> anyhow::Result<Arg> {
    let s1: String = inputs.get("s1")?;
    let s2: String = inputs.get("s2")?;

    let freq1 = tally(b, &s1)?;
    let freq2 = tally(b, &s2)?;
    Ok(b.task("derive_count", [("freq1", freq1), ("freq2", freq2)])?
        .into())
}

/// Chain one `return_index` and one `update_list` per character
fn tally(b: &mut GraphBuilder<'_>, text: &str) -> Result<Arg> {
    let mut freq = Arg::from(vec![0_i64; ALPHABET]);
    for c in text.chars() {
        let index = b.task("return_index", [("character", Arg::from(c.to_string()))])?;
        freq = b
            .task(
                "update_list",
                [("freq_list", freq), ("list_index", index.into())],
            )?
            .into();
    }
    Ok(freq)
}

pub fn register_merge_sort(registry: &mut Registry) -> Result<()> {
    registry.register_task(
        TaskSpec::new("split")
            .input("numbers", int_list())
            .output(ValueType::Tuple(vec![
                int_list(),
                int_list(),
                ValueType::Int,
                ValueType::Int,
            ])),
        split,
    )?;
    registry.register_task(
        TaskSpec::new("merge")
            .input("sorted_list1", int_list())
            .input("sorted_list2", int_list())
            .output(int_list()),
        merge,
    )?;
    registry.register_task(
        TaskSpec::new("sort_locally")
            .input("numbers", int_list())
            .output(int_list()),
        sort_locally,
    )?;
    registry.register_dynamic(
        TaskSpec::new("merge_sort_remotely")
            .input("numbers", int_list())
            .input("run_local_at_count", ValueType::Int)
            .output(int_list()),
        merge_sort_remotely,
    )?;
    registry.register_workflow(
        TaskSpec::new("merge_sort")
            .description("Sort locally below a threshold, otherwise split and recurse")
            .input("numbers", int_list())
            .input("numbers_count", ValueType::Int)
            .input_with_default("run_local_at_count", ValueType::Int, json!(5))
            .output(int_list()),
        merge_sort,
    )?;
    Ok(())
}

fn split(inputs: &Inputs) -> anyhow::Result<Value> {
    let numbers: Vec<i64> = inputs.get("numbers")?;
    let (left, right) = numbers.split_at(numbers.len() / 2);
    Ok(json!([left, right, left.len(), right.len()]))
}

fn merge(inputs: &Inputs) -> anyhow::Result<Value> {
    let left: Vec<i64> = inputs.get("sorted_list1")?;
    let right: Vec<i64> = inputs.get("sorted_list2")?;

    let mut result = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if left[i] < right[j] {
            result.push(left[i]);
            i += 1;
        } else {
            result.push(right[j]);
            j += 1;
        }
    }
    result.extend_from_slice(&left[i..]);
    result.extend_from_slice(&right[j..]);
    Ok(json!(result))
}

fn sort_locally(inputs: &Inputs) -> anyhow::Result<Value> {
    let mut numbers: Vec<i64> = inputs.get("numbers")?;
    numbers.sort_unstable();
    Ok(json!(numbers))
}

fn merge_sort_remotely(b: &mut GraphBuilder<'_>, inputs: &Inputs) -> anyhow::Result<Arg> {
    let run_local = inputs.arg("run_local_at_count")?;
    let parts = b.task("split", [("numbers", inputs.arg("numbers")?)])?;

    let sorted1 = b.workflow(
        "merge_sort",
        [
            ("numbers", parts.field(0).into()),
            ("numbers_count", parts.field(2).into()),
            ("run_local_at_count", run_local.clone()),
        ],
    )?;
    let sorted2 = b.workflow(
        "merge_sort",
        [
            ("numbers", parts.field(1).into()),
            ("numbers_count", parts.field(3).into()),
            ("run_local_at_count", run_local),
        ],
    )?;

    Ok(b.task("merge", [("sorted_list1", sorted1), ("sorted_list2", sorted2)])?
        .into())
}

fn merge_sort(b: &mut GraphBuilder<'_>, inputs: &Inputs) -> anyhow::Result<Arg> {
    let numbers = inputs.arg("numbers")?;
    let count = inputs.arg("numbers_count")?;
    let run_local = inputs.arg("run_local_at_count")?;

    let sorted = b
        .conditional("terminal_case")
        .if_(Predicate::le(count, run_local.clone()))
        .then(|b| Ok(b.task("sort_locally", [("numbers", numbers.clone())])?.into()))?
        .else_()
        .then(|b| {
            let remote = b.dynamic(
                "merge_sort_remotely",
                [("numbers", numbers.clone()), ("run_local_at_count", run_local.clone())],
            )?;
            Ok(remote.into())
        })?;
    Ok(sorted.into())
}
