//! Shard identifiers and write-time shard assignment.
//!
//! Entities are spread over a small, fixed set of synthetic shards. The shard
//! id is stored on the entity as a string (the secondary-index partition key)
//! and never changes once assigned.

use crate::error::{Error, Result};
use rand::seq::IndexedRandom;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// Identifier of one synthetic shard partition.
pub type ShardId = u16;

/// Ordered, fixed sequence of shard identifiers for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSet {
  ids: Vec<ShardId>,
}

impl ShardSet {
  /// Creates the conventional shard set `0..shard_count`.
  ///
  /// # Errors
  ///
  /// Returns `Error::Config` if `shard_count` is zero.
  pub fn range(shard_count: u16) -> Result<Self> {
    if shard_count == 0 {
      return Err(Error::Config("shard_count must be greater than zero".into()));
    }
    Ok(Self {
      ids: (0..shard_count).collect(),
    })
  }

  /// Creates a shard set from an explicit list of ids, preserving their order.
  ///
  /// # Errors
  ///
  /// Returns `Error::Config` if the list is empty or contains duplicates.
  pub fn from_ids(ids: Vec<ShardId>) -> Result<Self> {
    if ids.is_empty() {
      return Err(Error::Config("shard set cannot be empty".into()));
    }
    let mut seen = HashSet::with_capacity(ids.len());
    for id in &ids {
      if !seen.insert(*id) {
        return Err(Error::Config(format!("duplicate shard id {} in shard set", id)));
      }
    }
    Ok(Self { ids })
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  /// Always false; an empty shard set cannot be constructed.
  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn contains(&self, shard: ShardId) -> bool {
    self.ids.contains(&shard)
  }

  pub fn ids(&self) -> &[ShardId] {
    &self.ids
  }

  pub fn iter(&self) -> impl Iterator<Item = ShardId> + '_ {
    self.ids.iter().copied()
  }

  /// Renders a shard id the way it is stored in the partition-key attribute.
  pub fn shard_value(shard: ShardId) -> Value {
    Value::String(shard.to_string())
  }

  /// Maps a stored partition-key value back to a shard id of this set.
  ///
  /// Accepts both the string form written by [`ShardAssigner`] and plain integers.
  pub fn parse_shard_value(&self, value: &Value) -> Option<ShardId> {
    let shard = match value {
      Value::String(s) => s.parse::<ShardId>().ok()?,
      Value::Number(n) => ShardId::try_from(n.as_u64()?).ok()?,
      _ => return None,
    };
    self.contains(shard).then_some(shard)
  }
}

impl fmt::Display for ShardSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", self.ids)
  }
}

/// Sticky, uniformly random shard assignment over a [`ShardSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssigner {
  shards: ShardSet,
}

impl ShardAssigner {
  pub fn new(shards: ShardSet) -> Self {
    Self { shards }
  }

  /// Returns `existing` unchanged if present, otherwise a random shard id.
  ///
  /// # Determinism
  ///
  /// An entity that already carries a shard id keeps it forever, which keeps
  /// index locality stable across rewrites.
  pub fn assign(&self, existing: Option<&Value>) -> Value {
    match existing {
      Some(value) => value.clone(),
      None => ShardSet::shard_value(self.random_shard()),
    }
  }

  /// Draws a shard id uniformly at random.
  pub fn random_shard(&self) -> ShardId {
    // ShardSet is never empty, the fallback is unreachable
    self.shards.ids().choose(&mut rand::rng()).copied().unwrap_or_default()
  }

  pub fn shards(&self) -> &ShardSet {
    &self.shards
  }
}
