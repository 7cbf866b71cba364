use crate::entity::{Attributes, Cursor, Entity};
use crate::error::Error;
use crate::query::condition::SortKeyCondition;
use crate::shard::ShardId;
use crate::store::StoreQuery;
use serde_json::Value;
use std::collections::BTreeMap;

/// One logical, paginated query over every shard of an entity type.
///
/// # Example
///
/// ```
/// use shardscan::{QueryRequest, SortKeyCondition};
///
/// let request = QueryRequest::new("channel-index")
///   .sort_key(SortKeyCondition::begins_with("channel_priority", "channel#web"))
///   .limit(20)
///   .attribute("ScanIndexForward", true);
///
/// assert_eq!(request.limit, Some(20));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
  pub index_name: String,
  pub sort_key_condition: Option<SortKeyCondition>,
  /// Requested page size. Split across shards, see [`crate::FanoutEngine`].
  pub limit: Option<u32>,
  /// Opaque token from a previous page. `None` or empty starts a new scan.
  pub continuation_token: Option<String>,
  /// Store pages each shard may read for this call. Overrides
  /// `EngineOptions::max_pages_per_shard`.
  pub max_pages: Option<usize>,
  /// Passed verbatim to every store request.
  pub extra: Attributes,
}

impl QueryRequest {
  pub fn new(index_name: impl Into<String>) -> Self {
    Self {
      index_name: index_name.into(),
      ..Default::default()
    }
  }

  pub fn sort_key(mut self, condition: SortKeyCondition) -> Self {
    self.sort_key_condition = Some(condition);
    self
  }

  pub fn limit(mut self, limit: u32) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn continuation_token(mut self, token: Option<String>) -> Self {
    self.continuation_token = token;
    self
  }

  pub fn max_pages(mut self, pages: usize) -> Self {
    self.max_pages = Some(pages);
    self
  }

  pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.extra.insert(name.into(), value.into());
    self
  }
}

/// The request issued to a single shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardQueryRequest {
  pub shard: ShardId,
  pub query: StoreQuery,
}

/// What one shard worker gathered.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardOutcome {
  pub shard: ShardId,
  pub items: Vec<Entity>,
  /// Absent once the shard is exhausted.
  pub last_evaluated_key: Option<Cursor>,
  /// Item count of every store page read.
  pub counts: Vec<usize>,
}

impl ShardOutcome {
  pub fn item_count(&self) -> usize {
    self.items.len()
  }

  pub fn pages(&self) -> usize {
    self.counts.len()
  }
}

/// One merged, ordered page of entities, index keys already dropped.
#[derive(Debug, Default)]
pub struct MergedPage {
  pub items: Vec<Entity>,
  /// Present while at least one shard has more items.
  pub continuation_token: Option<String>,
  /// Shards whose contribution is missing from this page.
  pub errors: BTreeMap<ShardId, Error>,
  /// Shards a request was issued to, ascending.
  pub queried_shards: Vec<ShardId>,
  /// Items contributed per successful shard.
  pub item_counts: BTreeMap<ShardId, usize>,
}

impl MergedPage {
  pub fn has_more(&self) -> bool {
    self.continuation_token.is_some()
  }

  /// True if some shard failed and the page is partial.
  pub fn is_degraded(&self) -> bool {
    !self.errors.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}
