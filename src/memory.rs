//! An in-memory [`IndexStore`] with sparse secondary indexes.
//!
//! Items live in a single table keyed by their primary-key attribute. Each
//! registered index sees only the items carrying its partition attribute and
//! (if it has one) its sort attribute. Within a partition items are ordered
//! by sort key, then by primary key.

use crate::entity::{Cursor, Entity};
use crate::error::{Error, Result};
use crate::query::condition::compare;
use crate::store::{IndexStore, QueryPage, StoreQuery};
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// Extra attribute selecting descending order when `false`.
pub const SCAN_FORWARD: &str = "ScanIndexForward";

#[derive(Debug, Clone)]
struct IndexDef {
  sort_key: Option<String>,
}

/// Thread-safe in-memory table.
#[derive(Debug)]
pub struct MemoryStore {
  primary_key: String,
  page_size: Option<usize>,
  indexes: HashMap<String, IndexDef>,
  items: RwLock<BTreeMap<String, Entity>>,
  queries: AtomicUsize,
}

impl MemoryStore {
  pub fn new(primary_key: impl Into<String>) -> Self {
    Self {
      primary_key: primary_key.into(),
      page_size: None,
      indexes: HashMap::new(),
      items: RwLock::new(BTreeMap::new()),
      queries: AtomicUsize::new(0),
    }
  }

  /// Registers a secondary index. Without a sort key, partitions are ordered
  /// by primary key.
  pub fn with_index(mut self, name: impl Into<String>, sort_key: Option<&str>) -> Self {
    self.indexes.insert(
      name.into(),
      IndexDef {
        sort_key: sort_key.map(str::to_string),
      },
    );
    self
  }

  /// Caps every page at `size` items regardless of the requested limit.
  pub fn with_page_size(mut self, size: usize) -> Self {
    self.page_size = Some(size.max(1));
    self
  }

  /// Inserts or replaces an item.
  ///
  /// # Errors
  ///
  /// Returns `Error::Store` if the item has no usable primary key.
  pub fn put(&self, item: Entity) -> Result<()> {
    let key = self.key_of(&item).ok_or_else(|| {
      Error::Store(format!("item lacks primary key attribute '{}'", self.primary_key))
    })?;
    self.items.write().insert(key, item);
    Ok(())
  }

  pub fn put_all(&self, items: impl IntoIterator<Item = Entity>) -> Result<()> {
    items.into_iter().try_for_each(|item| self.put(item))
  }

  pub fn get(&self, key: &str) -> Option<Entity> {
    self.items.read().get(key).cloned()
  }

  pub fn delete(&self, key: &str) -> Option<Entity> {
    self.items.write().remove(key)
  }

  pub fn len(&self) -> usize {
    self.items.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.read().is_empty()
  }

  /// Number of `query` calls served so far.
  pub fn query_count(&self) -> usize {
    self.queries.load(AtomicOrdering::SeqCst)
  }

  fn key_of(&self, item: &Entity) -> Option<String> {
    match item.get(&self.primary_key)? {
      Value::String(s) if !s.is_empty() => Some(s.clone()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }

  fn position_cmp(&self, sort_key: Option<&str>, a: &Entity, b: &Entity) -> Ordering {
    let by_sort = sort_key
      .and_then(|attr| compare(a.get(attr)?, b.get(attr)?))
      .unwrap_or(Ordering::Equal);
    by_sort.then_with(|| self.key_of(a).cmp(&self.key_of(b)))
  }

  /// The last-evaluated key of `item`: primary, partition and sort attributes.
  fn cursor_for(&self, item: &Entity, partition: &str, sort_key: Option<&str>) -> Cursor {
    [Some(self.primary_key.as_str()), Some(partition), sort_key]
      .into_iter()
      .flatten()
      .filter_map(|attr| item.get(attr).map(|v| (attr.to_string(), v.clone())))
      .collect()
  }
}

impl IndexStore for MemoryStore {
  fn query(&self, request: &StoreQuery) -> Result<QueryPage> {
    self.queries.fetch_add(1, AtomicOrdering::SeqCst);

    let index = self
      .indexes
      .get(&request.index_name)
      .ok_or_else(|| Error::Store(format!("unknown index '{}'", request.index_name)))?;
    let sort_key = index.sort_key.as_deref();
    let partition = request.key_condition.partition.attribute.as_str();

    let forward = request
      .extra
      .get(SCAN_FORWARD)
      .and_then(Value::as_bool)
      .unwrap_or(true);
    let filters: Vec<(&String, &Value)> = request.extra.iter().filter(|(k, _)| *k != SCAN_FORWARD).collect();

    let items = self.items.read();
    let mut matching: Vec<&Entity> = items
      .values()
      .filter(|item| sort_key.is_none_or(|attr| item.contains_key(attr)))
      .filter(|item| request.key_condition.matches(item))
      .filter(|item| filters.iter().all(|(k, v)| item.get(k.as_str()) == Some(*v)))
      .collect();

    matching.sort_by(|a, b| {
      let ord = self.position_cmp(sort_key, a, b);
      if forward { ord } else { ord.reverse() }
    });

    if let Some(start) = &request.exclusive_start_key {
      let past_start = |item: &&Entity| {
        let ord = self.position_cmp(sort_key, item, start);
        if forward { ord.is_gt() } else { ord.is_lt() }
      };
      matching.retain(past_start);
    }

    let take = match (request.limit, self.page_size) {
      (Some(limit), Some(size)) => (limit as usize).min(size),
      (Some(limit), None) => limit as usize,
      (None, Some(size)) => size,
      (None, None) => matching.len(),
    };

    let has_more = matching.len() > take;
    let page: Vec<Entity> = matching.into_iter().take(take).cloned().collect();
    let last_evaluated_key = match page.last() {
      Some(last) if has_more => Some(self.cursor_for(last, partition, sort_key)),
      _ => None,
    };

    Ok(QueryPage::new(page, last_evaluated_key))
  }
}
