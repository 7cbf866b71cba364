use crate::barrier::Barrier;
use crate::config::EngineOptions;
use crate::error::{Error, Result};
use crate::query::condition::{KeyCondition, PartitionCondition};
use crate::query::merge;
use crate::query::request::{MergedPage, QueryRequest, ShardOutcome, ShardQueryRequest};
use crate::schema::EntitySchema;
use crate::shard::{ShardId, ShardSet};
use crate::store::{IndexStore, StoreQuery};
use crate::token::{ContinuationToken, ShardPosition, TokenCodec};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Requests to issue for one call, next to the positions they start from.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
  pub index_name: String,
  /// Decoded positions of every shard.
  pub positions: ContinuationToken,
  /// One request per non-exhausted shard.
  pub requests: BTreeMap<ShardId, ShardQueryRequest>,
  pub per_shard_limit: Option<u32>,
  /// Page budget of every shard worker.
  pub max_pages: usize,
}

/// Fans a logical query out to every shard of one entity type and merges the
/// results into a single ordered page.
///
/// The engine holds no per-call state and can be shared across threads.
#[derive(Debug, Clone)]
pub struct FanoutEngine {
  schema: Arc<EntitySchema>,
  codec: TokenCodec,
  barrier: Barrier,
  options: EngineOptions,
}

impl FanoutEngine {
  /// # Errors
  ///
  /// Returns `Error::Config` if the options are invalid or the schema has
  /// more shards than `max_fanout` allows.
  pub fn new(schema: Arc<EntitySchema>, options: EngineOptions) -> Result<Self> {
    options.validate()?;
    if schema.shards().len() > options.max_fanout {
      return Err(Error::Config(format!(
        "entity '{}' has {} shards, max_fanout is {}",
        schema.name(),
        schema.shards().len(),
        options.max_fanout
      )));
    }

    Ok(Self {
      codec: TokenCodec::new(schema.shards().clone()),
      barrier: Barrier::new(options.barrier_timeout, options.max_fanout),
      schema,
      options,
    })
  }

  pub fn schema(&self) -> &EntitySchema {
    &self.schema
  }

  pub fn codec(&self) -> &TokenCodec {
    &self.codec
  }

  pub fn options(&self) -> &EngineOptions {
    &self.options
  }

  /// Decodes the request's token and builds the per-shard requests.
  ///
  /// # Errors
  ///
  /// - `Error::InvalidQuery` for an empty index name or a zero limit.
  /// - `Error::MalformedToken` if the token does not decode for this shard set.
  pub fn plan(&self, request: &QueryRequest) -> Result<QueryPlan> {
    let positions = match request.continuation_token.as_deref() {
      Some(token) if !token.trim().is_empty() => self.codec.decode(token)?,
      _ => ContinuationToken::fresh(self.schema.shards()),
    };
    self.plan_from(request, positions)
  }

  /// Like [`FanoutEngine::plan`], starting from already decoded positions.
  pub fn plan_from(&self, request: &QueryRequest, positions: ContinuationToken) -> Result<QueryPlan> {
    if request.index_name.is_empty() {
      return Err(Error::InvalidQuery("index name must not be empty".into()));
    }
    if request.limit == Some(0) {
      return Err(Error::InvalidQuery("limit must be greater than zero".into()));
    }
    if request.max_pages == Some(0) {
      return Err(Error::InvalidQuery("max_pages must be greater than zero".into()));
    }
    if !positions.covers(self.schema.shards()) {
      return Err(Error::InvalidQuery(format!(
        "positions must cover shards {}",
        self.schema.shards()
      )));
    }

    let per_shard_limit = request
      .limit
      .map(|limit| per_shard_limit(limit, self.schema.shards()));

    let requests = positions
      .iter()
      .filter(|(_, position)| !position.is_exhausted())
      .map(|(shard, position)| {
        let query = StoreQuery {
          index_name: request.index_name.clone(),
          key_condition: KeyCondition::new(
            PartitionCondition::new(self.schema.partition_key(), ShardSet::shard_value(shard)),
            request.sort_key_condition.clone(),
          ),
          limit: per_shard_limit,
          exclusive_start_key: position.start_key().cloned(),
          extra: request.extra.clone(),
        };
        (shard, ShardQueryRequest { shard, query })
      })
      .collect();

    Ok(QueryPlan {
      index_name: request.index_name.clone(),
      positions,
      requests,
      per_shard_limit,
      max_pages: request.max_pages.unwrap_or(self.options.max_pages_per_shard),
    })
  }

  /// Runs one page of a logical query.
  ///
  /// Shard failures do not fail the call: they are collected in
  /// [`MergedPage::errors`] and the failed shards are retried from their
  /// previous position on the next call.
  ///
  /// # Errors
  ///
  /// Propagates planning errors and token encoding failures.
  pub fn query<S: IndexStore + 'static>(&self, store: Arc<S>, request: &QueryRequest) -> Result<MergedPage> {
    let plan = self.plan(request)?;
    self.execute(store, plan)
  }

  /// Executes a plan produced by [`FanoutEngine::plan`].
  pub fn execute<S: IndexStore + 'static>(&self, store: Arc<S>, plan: QueryPlan) -> Result<MergedPage> {
    let QueryPlan {
      index_name,
      positions,
      requests,
      per_shard_limit,
      max_pages,
    } = plan;

    let queried_shards: Vec<ShardId> = requests.keys().copied().collect();
    tracing::debug!(
      target: "shardscan::query",
      "Querying '{}' on {} of {} shards, per-shard limit {:?}, up to {} pages each",
      index_name,
      queried_shards.len(),
      self.schema.shards().len(),
      per_shard_limit,
      max_pages
    );

    let report = self
      .barrier
      .run(move |request| query_shard(store.as_ref(), request, max_pages), requests)?;

    let mut errors: BTreeMap<ShardId, Error> = report
      .errors
      .into_iter()
      .map(|(shard, source)| {
        (
          shard,
          Error::ShardQuery {
            shard,
            source: Box::new(source),
          },
        )
      })
      .collect();

    let sort_attribute = self.schema.sort_key_for(&index_name);
    let separator = self.options.sort_key_separator;
    let mut next = positions;
    let mut keyed = Vec::new();
    let mut unordered = Vec::new();
    let mut item_counts = BTreeMap::new();

    for (shard, outcome) in report.results {
      let ShardOutcome {
        items,
        last_evaluated_key,
        counts,
        ..
      } = outcome;
      tracing::trace!(
        target: "shardscan::query",
        "Shard {} returned {} items over {} pages",
        shard,
        items.len(),
        counts.len()
      );

      let count = items.len();
      match sort_attribute {
        Some(attribute) => match merge::key_items(shard, items, attribute, separator) {
          Ok(mut shard_keyed) => keyed.append(&mut shard_keyed),
          Err(e) => {
            errors.insert(shard, e);
            continue;
          }
        },
        None => unordered.extend(items),
      }

      item_counts.insert(shard, count);
      next.set(shard, ShardPosition::after(last_evaluated_key));
    }

    if !errors.is_empty() {
      let details = errors
        .iter()
        .map(|(shard, e)| format!("[Shard: {}, Error: {}]", shard, e))
        .collect::<Vec<_>>()
        .join(", ");
      tracing::error!(target: "shardscan::query", "{} errors detected. Details: {}", errors.len(), details);
    }

    let items = match sort_attribute {
      Some(_) => merge::order(keyed),
      None => unordered,
    };

    let encoded = self.codec.encode(&next)?;

    Ok(MergedPage {
      items: self.schema.mapping().drop_many(&items),
      continuation_token: (!encoded.is_empty()).then_some(encoded),
      errors,
      queried_shards,
      item_counts,
    })
  }
}

/// `ceil(limit / shard_count)`; the merged page may hold up to
/// `shard_count` times this many items.
pub fn per_shard_limit(limit: u32, shards: &ShardSet) -> u32 {
  let count = u32::try_from(shards.len()).unwrap_or(u32::MAX);
  limit.div_ceil(count.max(1))
}

/// Reads pages from one shard until it is exhausted, the page budget is spent
/// or the shard's limit is met.
pub fn query_shard<S: IndexStore + ?Sized>(
  store: &S,
  request: ShardQueryRequest,
  max_pages: usize,
) -> Result<ShardOutcome> {
  let ShardQueryRequest { shard, mut query } = request;
  let limit = query.limit.map(|l| l as usize);
  let mut items = Vec::new();
  let mut counts = Vec::new();

  let last_evaluated_key = loop {
    let page = store.query(&query)?;
    counts.push(page.items.len());
    items.extend(page.items);

    let cursor = match page.last_evaluated_key {
      Some(cursor) if !cursor.is_empty() => cursor,
      _ => break None,
    };
    if counts.len() >= max_pages {
      break Some(cursor);
    }
    if let Some(limit) = limit {
      if items.len() >= limit {
        break Some(cursor);
      }
      query.limit = Some((limit - items.len()) as u32);
    }
    query.exclusive_start_key = Some(cursor);
  };

  Ok(ShardOutcome {
    shard,
    items,
    last_evaluated_key,
    counts,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entity::{Cursor, Entity};
  use crate::query::condition::SortKeyCondition;
  use crate::store::QueryPage;
  use parking_lot::Mutex;
  use serde_json::{Value, json};
  use std::collections::HashMap;
  use std::time::Duration;

  fn obj(value: Value) -> Entity {
    value.as_object().cloned().unwrap()
  }

  fn cursor(n: u64) -> Cursor {
    obj(json!({"pos": n}))
  }

  /// Serves a fixed list of pages per shard, in order, and records requests.
  #[derive(Default)]
  struct PagedStore {
    pages: Mutex<HashMap<String, Vec<Result<QueryPage>>>>,
    seen: Mutex<Vec<StoreQuery>>,
  }

  impl PagedStore {
    fn push(&self, shard: ShardId, page: Result<QueryPage>) {
      self.pages.lock().entry(shard.to_string()).or_default().push(page);
    }

    fn seen(&self) -> Vec<StoreQuery> {
      self.seen.lock().clone()
    }
  }

  impl IndexStore for PagedStore {
    fn query(&self, request: &StoreQuery) -> Result<QueryPage> {
      self.seen.lock().push(request.clone());
      let shard = request.key_condition.partition.value.as_str().unwrap_or_default().to_string();
      let mut pages = self.pages.lock();
      match pages.get_mut(&shard) {
        Some(queue) if !queue.is_empty() => queue.remove(0),
        _ => Ok(QueryPage::default()),
      }
    }
  }

  fn item(shard: ShardId, sk: &str) -> Entity {
    obj(json!({"id": sk, "s_id": shard.to_string(), "sk": sk}))
  }

  fn schema(shards: u16) -> Arc<EntitySchema> {
    Arc::new(
      EntitySchema::builder("article", ShardSet::range(shards).unwrap())
        .shard_key("s_id")
        .format_key("sk", "{id}")
        .sort_key("by-sk", "sk")
        .build()
        .unwrap(),
    )
  }

  fn engine(shards: u16) -> FanoutEngine {
    FanoutEngine::new(schema(shards), EngineOptions::default()).unwrap()
  }

  #[test]
  fn test_per_shard_limit() {
    let three = ShardSet::range(3).unwrap();
    assert_eq!(per_shard_limit(10, &three), 4);
    assert_eq!(per_shard_limit(6, &three), 2);
    assert_eq!(per_shard_limit(1, &three), 1);
  }

  #[test]
  fn test_plan_fresh() {
    let engine = engine(3);
    let request = QueryRequest::new("by-sk")
      .sort_key(SortKeyCondition::begins_with("sk", "a"))
      .limit(10)
      .attribute("ScanIndexForward", false);

    let plan = engine.plan(&request).unwrap();
    assert_eq!(plan.requests.len(), 3);
    assert_eq!(plan.per_shard_limit, Some(4));

    let shard_1 = &plan.requests[&1].query;
    assert_eq!(shard_1.key_condition.partition.attribute, "s_id");
    assert_eq!(shard_1.key_condition.partition.value, json!("1"));
    assert!(shard_1.key_condition.sort.is_some());
    assert!(shard_1.exclusive_start_key.is_none());
    assert_eq!(shard_1.extra["ScanIndexForward"], json!(false));
  }

  #[test]
  fn test_plan_skips_exhausted_shards() {
    let engine = engine(3);
    let mut positions = ContinuationToken::fresh(engine.schema().shards());
    positions.set(0, ShardPosition::Resume(cursor(7)));
    positions.set(2, ShardPosition::Exhausted);

    let plan = engine.plan_from(&QueryRequest::new("by-sk"), positions).unwrap();
    assert_eq!(plan.requests.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(plan.requests[&0].query.exclusive_start_key, Some(cursor(7)));
    assert_eq!(plan.requests[&1].query.exclusive_start_key, None);
  }

  #[test]
  fn test_invalid_requests() {
    let engine = engine(2);
    assert!(matches!(engine.plan(&QueryRequest::new("")), Err(Error::InvalidQuery(_))));
    assert!(matches!(
      engine.plan(&QueryRequest::new("by-sk").limit(0)),
      Err(Error::InvalidQuery(_))
    ));
    assert!(matches!(
      engine.plan(&QueryRequest::new("by-sk").continuation_token(Some("@@not-a-token".into()))),
      Err(Error::MalformedToken(_))
    ));
  }

  #[test]
  fn test_rejects_schema_wider_than_fanout() {
    let options = EngineOptions {
      max_fanout: 2,
      ..Default::default()
    };
    assert!(matches!(FanoutEngine::new(schema(3), options), Err(Error::Config(_))));
  }

  #[test]
  fn test_scenario_three_shards() {
    let engine = engine(3);
    let store = Arc::new(PagedStore::default());
    store.push(0, Ok(QueryPage::new(vec![item(0, "b"), item(0, "e")], Some(cursor(2)))));
    store.push(1, Ok(QueryPage::new(vec![item(1, "a")], None)));
    store.push(2, Ok(QueryPage::new(vec![item(2, "c")], None)));

    let page = engine.query(store.clone(), &QueryRequest::new("by-sk").limit(6)).unwrap();

    let seen = store.seen();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|q| q.limit == Some(2)));

    let ids: Vec<_> = page.items.iter().map(|i| i["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "e"]);
    assert!(page.items.iter().all(|i| !i.contains_key("s_id") && !i.contains_key("sk")));
    assert_eq!(page.queried_shards, vec![0, 1, 2]);
    assert_eq!(page.item_counts[&0], 2);

    let token = page.continuation_token.clone().unwrap();
    let decoded = engine.codec().decode(&token).unwrap();
    assert_eq!(decoded.get(0), Some(&ShardPosition::Resume(cursor(2))));
    assert_eq!(decoded.get(1), Some(&ShardPosition::Exhausted));
    assert_eq!(decoded.get(2), Some(&ShardPosition::Exhausted));

    store.push(0, Ok(QueryPage::new(vec![item(0, "f")], None)));
    let next = engine
      .query(store.clone(), &QueryRequest::new("by-sk").limit(6).continuation_token(Some(token)))
      .unwrap();

    let seen = store.seen();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[3].exclusive_start_key, Some(cursor(2)));
    assert_eq!(next.queried_shards, vec![0]);
    assert_eq!(next.len(), 1);
    assert!(!next.has_more());
  }

  #[test]
  fn test_page_loop_stops_at_limit() {
    let store = PagedStore::default();
    store.push(0, Ok(QueryPage::new(vec![item(0, "a")], Some(cursor(1)))));
    store.push(0, Ok(QueryPage::new(vec![item(0, "b"), item(0, "c")], Some(cursor(3)))));
    store.push(0, Ok(QueryPage::new(vec![item(0, "d")], None)));

    let engine = engine(1);
    let plan = engine.plan(&QueryRequest::new("by-sk").limit(3)).unwrap();
    let request = plan.requests[&0].clone();

    let outcome = query_shard(&store, request, 10).unwrap();
    assert_eq!(outcome.item_count(), 3);
    assert_eq!(outcome.counts, vec![1, 2]);
    assert_eq!(outcome.last_evaluated_key, Some(cursor(3)));

    let seen = store.seen();
    assert_eq!(seen[0].limit, Some(3));
    assert_eq!(seen[1].limit, Some(2));
    assert_eq!(seen[1].exclusive_start_key, Some(cursor(1)));
  }

  #[test]
  fn test_page_loop_stops_at_page_budget() {
    let store = PagedStore::default();
    for n in 0..5 {
      store.push(0, Ok(QueryPage::new(vec![item(0, "x")], Some(cursor(n)))));
    }

    let engine = engine(1);
    let plan = engine.plan(&QueryRequest::new("by-sk")).unwrap();
    let outcome = query_shard(&store, plan.requests[&0].clone(), 2).unwrap();

    assert_eq!(outcome.pages(), 2);
    assert_eq!(outcome.last_evaluated_key, Some(cursor(1)));
  }

  #[test]
  fn test_request_overrides_page_budget() {
    let engine = engine(1);
    assert_eq!(engine.plan(&QueryRequest::new("by-sk")).unwrap().max_pages, 10);

    let store = Arc::new(PagedStore::default());
    for n in 0..5 {
      store.push(0, Ok(QueryPage::new(vec![item(0, &format!("k{}", n))], Some(cursor(n)))));
    }

    let page = engine
      .query(store.clone(), &QueryRequest::new("by-sk").max_pages(3))
      .unwrap();
    assert_eq!(page.len(), 3);
    assert_eq!(store.seen().len(), 3);

    let token = page.continuation_token.clone().unwrap();
    let decoded = engine.codec().decode(&token).unwrap();
    assert_eq!(decoded.get(0), Some(&ShardPosition::Resume(cursor(2))));

    assert!(matches!(
      engine.plan(&QueryRequest::new("by-sk").max_pages(0)),
      Err(Error::InvalidQuery(_))
    ));
  }

  #[test]
  fn test_unbounded_barrier_timeout() {
    let options = EngineOptions {
      barrier_timeout: Duration::MAX,
      ..Default::default()
    };
    let engine = FanoutEngine::new(schema(2), options).unwrap();
    let store = Arc::new(PagedStore::default());
    store.push(1, Ok(QueryPage::new(vec![item(1, "a")], None)));

    let page = engine.query(store, &QueryRequest::new("by-sk")).unwrap();
    assert_eq!(page.len(), 1);
    assert!(page.errors.is_empty());
    assert!(page.continuation_token.is_none());
  }

  #[test]
  fn test_failed_shard_keeps_position() {
    let engine = engine(2);
    let store = Arc::new(PagedStore::default());
    store.push(0, Err(Error::Store("throttled".into())));
    store.push(1, Ok(QueryPage::new(vec![item(1, "a")], None)));

    let page = engine.query(store.clone(), &QueryRequest::new("by-sk")).unwrap();
    assert!(page.is_degraded());
    assert_eq!(page.len(), 1);
    assert!(matches!(page.errors[&0], Error::ShardQuery { shard: 0, .. }));

    let token = page.continuation_token.clone().unwrap();
    let decoded = engine.codec().decode(&token).unwrap();
    assert_eq!(decoded.get(0), Some(&ShardPosition::Fresh));
    assert_eq!(decoded.get(1), Some(&ShardPosition::Exhausted));
  }

  #[test]
  fn test_missing_sort_attribute_excludes_shard() {
    let engine = engine(2);
    let store = Arc::new(PagedStore::default());
    store.push(0, Ok(QueryPage::new(vec![obj(json!({"id": "x"}))], None)));
    store.push(1, Ok(QueryPage::new(vec![item(1, "a")], None)));

    let page = engine.query(store, &QueryRequest::new("by-sk")).unwrap();
    assert_eq!(page.len(), 1);
    assert!(matches!(page.errors[&0], Error::MissingSortKeyAttribute { shard: 0, .. }));
    assert!(!page.item_counts.contains_key(&0));
    assert!(page.has_more());
  }

  #[test]
  fn test_unsorted_index_keeps_shard_order() {
    let engine = engine(2);
    let store = Arc::new(PagedStore::default());
    store.push(0, Ok(QueryPage::new(vec![item(0, "z")], None)));
    store.push(1, Ok(QueryPage::new(vec![item(1, "a")], None)));

    let page = engine.query(store, &QueryRequest::new("unsorted-index")).unwrap();
    let ids: Vec<_> = page.items.iter().map(|i| i["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["z", "a"]);
  }

  #[test]
  fn test_exhausted_positions_issue_no_requests() {
    let engine = engine(3);
    let store = Arc::new(PagedStore::default());
    let mut positions = ContinuationToken::fresh(engine.schema().shards());
    for shard in 0..3 {
      positions.set(shard, ShardPosition::Exhausted);
    }

    let plan = engine.plan_from(&QueryRequest::new("by-sk"), positions).unwrap();
    let page = engine.execute(store.clone(), plan).unwrap();

    assert!(page.is_empty());
    assert!(page.continuation_token.is_none());
    assert!(page.queried_shards.is_empty());
    assert!(store.seen().is_empty());
  }
}
