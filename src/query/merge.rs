//! Deterministic ordering of items gathered from several shards.

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::shard::ShardId;
use serde_json::Value;

/// Derives the merge-ordering key of `item` from its `attribute`.
///
/// Strings contribute the substring after the last `separator`
/// (`channel#100#5_2021.08.10` -> `5_2021.08.10`); numbers contribute their
/// decimal text. Any other type, or a missing attribute, yields `None`.
pub fn merge_key(item: &Entity, attribute: &str, separator: char) -> Option<String> {
  match item.get(attribute)? {
    Value::String(s) => Some(s.rsplit(separator).next().unwrap_or(s.as_str()).to_string()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Pairs every item of one shard with its merge key.
///
/// # Errors
///
/// Returns `Error::MissingSortKeyAttribute` if any item has no usable key;
/// the whole shard outcome is then unusable for this page.
pub fn key_items(shard: ShardId, items: Vec<Entity>, attribute: &str, separator: char) -> Result<Vec<(String, Entity)>> {
  items
    .into_iter()
    .map(|item| match merge_key(&item, attribute, separator) {
      Some(key) => Ok((key, item)),
      None => Err(Error::MissingSortKeyAttribute {
        shard,
        attribute: attribute.to_string(),
      }),
    })
    .collect()
}

/// Stable ascending sort by merge key.
///
/// Items with equal keys keep their relative order, which is shard order
/// followed by store order when callers append shards in ascending id order.
pub fn order(mut keyed: Vec<(String, Entity)>) -> Vec<Entity> {
  keyed.sort_by(|a, b| a.0.cmp(&b.0));
  keyed.into_iter().map(|(_, item)| item).collect()
}
