//! Key condition expressions for index queries.

use crate::entity::Entity;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Equality on the index's partition-key attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionCondition {
  pub attribute: String,
  pub value: Value,
}

impl PartitionCondition {
  pub fn new(attribute: impl Into<String>, value: Value) -> Self {
    Self {
      attribute: attribute.into(),
      value,
    }
  }

  pub fn matches(&self, item: &Entity) -> bool {
    item.get(&self.attribute) == Some(&self.value)
  }
}

/// Comparison applied to the index's sort-key attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum SortKeyOp {
  Eq(Value),
  Lt(Value),
  Le(Value),
  Gt(Value),
  Ge(Value),
  /// Inclusive on both ends.
  Between(Value, Value),
  BeginsWith(String),
}

/// A caller-supplied condition on the sort key of an index.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKeyCondition {
  pub attribute: String,
  pub op: SortKeyOp,
}

impl SortKeyCondition {
  pub fn new(attribute: impl Into<String>, op: SortKeyOp) -> Self {
    Self {
      attribute: attribute.into(),
      op,
    }
  }

  pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(attribute, SortKeyOp::Eq(value.into()))
  }

  pub fn begins_with(attribute: impl Into<String>, prefix: impl Into<String>) -> Self {
    Self::new(attribute, SortKeyOp::BeginsWith(prefix.into()))
  }

  pub fn between(attribute: impl Into<String>, low: impl Into<Value>, high: impl Into<Value>) -> Self {
    Self::new(attribute, SortKeyOp::Between(low.into(), high.into()))
  }

  /// Evaluates the condition. Values of different types never match.
  pub fn matches(&self, item: &Entity) -> bool {
    let Some(value) = item.get(&self.attribute) else {
      return false;
    };
    let is = |target: &Value, accept: fn(Ordering) -> bool| compare(value, target).is_some_and(accept);

    match &self.op {
      SortKeyOp::Eq(v) => is(v, Ordering::is_eq),
      SortKeyOp::Lt(v) => is(v, Ordering::is_lt),
      SortKeyOp::Le(v) => is(v, Ordering::is_le),
      SortKeyOp::Gt(v) => is(v, Ordering::is_gt),
      SortKeyOp::Ge(v) => is(v, Ordering::is_ge),
      SortKeyOp::Between(low, high) => is(low, Ordering::is_ge) && is(high, Ordering::is_le),
      SortKeyOp::BeginsWith(prefix) => value.as_str().is_some_and(|s| s.starts_with(prefix.as_str())),
    }
  }
}

/// Orders two key values of the same type: strings lexically, numbers numerically.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
    (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
    _ => None,
  }
}

/// Partition-key equality ANDed with an optional sort-key condition.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCondition {
  pub partition: PartitionCondition,
  pub sort: Option<SortKeyCondition>,
}

impl KeyCondition {
  pub fn new(partition: PartitionCondition, sort: Option<SortKeyCondition>) -> Self {
    Self { partition, sort }
  }

  pub fn matches(&self, item: &Entity) -> bool {
    self.partition.matches(item) && self.sort.as_ref().is_none_or(|s| s.matches(item))
  }
}

impl fmt::Display for KeyCondition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} = {}", self.partition.attribute, self.partition.value)?;
    if let Some(sort) = &self.sort {
      write!(f, " AND {} {:?}", sort.attribute, sort.op)?;
    }
    Ok(())
  }
}
