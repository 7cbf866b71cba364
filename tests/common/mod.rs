#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{Value, json};
use shardscan::{
  EngineOptions, Entity, EntitySchema, IndexStore, MemoryStore, MergedPage, QueryPage, QueryRequest, Result,
  ShardSet, ShardedIndex, StoreQuery,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const INDEX: &str = "channel-index";
pub const SORT_KEY: &str = "channel_priority";

/// Misbehaviour injected into requests for one shard.
#[derive(Debug, Clone)]
pub enum Fault {
  Fail(String),
  FailOnce(String),
  Delay(Duration),
  Panic,
}

/// A [`MemoryStore`] that records every request and injects per-shard faults.
pub struct FaultyStore {
  pub inner: MemoryStore,
  faults: Mutex<HashMap<String, Fault>>,
  requests: Mutex<Vec<StoreQuery>>,
}

impl FaultyStore {
  pub fn new(inner: MemoryStore) -> Self {
    Self {
      inner,
      faults: Mutex::new(HashMap::new()),
      requests: Mutex::new(Vec::new()),
    }
  }

  pub fn inject(&self, shard: u16, fault: Fault) {
    self.faults.lock().insert(shard.to_string(), fault);
  }

  pub fn heal(&self, shard: u16) {
    self.faults.lock().remove(&shard.to_string());
  }

  pub fn requests(&self) -> Vec<StoreQuery> {
    self.requests.lock().clone()
  }

  pub fn clear_requests(&self) {
    self.requests.lock().clear();
  }

  /// Shard ids of recorded requests, sorted.
  pub fn queried_shards(&self) -> Vec<u16> {
    let mut shards: Vec<u16> = self
      .requests()
      .iter()
      .filter_map(|q| q.key_condition.partition.value.as_str()?.parse().ok())
      .collect();
    shards.sort();
    shards
  }
}

impl IndexStore for FaultyStore {
  fn query(&self, request: &StoreQuery) -> Result<QueryPage> {
    self.requests.lock().push(request.clone());

    let shard = request
      .key_condition
      .partition
      .value
      .as_str()
      .unwrap_or_default()
      .to_string();

    let fault = {
      let mut faults = self.faults.lock();
      match faults.get(&shard).cloned() {
        Some(Fault::FailOnce(msg)) => {
          faults.remove(&shard);
          Some(Fault::Fail(msg))
        }
        other => other,
      }
    };

    match fault {
      Some(Fault::Fail(msg)) | Some(Fault::FailOnce(msg)) => Err(shardscan::Error::Store(msg)),
      Some(Fault::Delay(d)) => {
        thread::sleep(d);
        self.inner.query(request)
      }
      Some(Fault::Panic) => panic!("store handle poisoned on shard {}", shard),
      None => self.inner.query(request),
    }
  }
}

pub struct TestEnv {
  pub index: ShardedIndex<FaultyStore>,
  pub store: Arc<FaultyStore>,
}

impl TestEnv {
  pub fn new(shards: u16, options: EngineOptions) -> Self {
    let store = Arc::new(FaultyStore::new(
      MemoryStore::new("articleId").with_index(INDEX, Some(SORT_KEY)),
    ));
    let index = ShardedIndex::with_store(article_schema(shards), options, store.clone()).unwrap();
    Self { index, store }
  }

  pub fn with_shards(shards: u16) -> Self {
    Self::new(shards, EngineOptions::default())
  }

  /// Enriches and stores `entity` on a random shard.
  pub fn put(&self, entity: &Entity) -> Entity {
    let enriched = self.index.prepare_for_write(entity);
    self.store.inner.put(enriched.clone()).unwrap();
    enriched
  }

  /// Enriches and stores `entity` on a fixed shard.
  pub fn put_on(&self, shard: u16, entity: &Entity) -> Entity {
    let mut pinned = entity.clone();
    pinned.insert("s_id".into(), Value::String(shard.to_string()));
    self.put(&pinned)
  }

  pub fn query(&self, request: &QueryRequest) -> MergedPage {
    self.index.query(request).unwrap()
  }

  /// Follows continuation tokens until the scan ends, returning every page.
  pub fn scan_all(&self, request: QueryRequest) -> Vec<MergedPage> {
    let mut pages = Vec::new();
    let mut token = None;
    loop {
      let page = self.query(&request.clone().continuation_token(token));
      token = page.continuation_token.clone();
      pages.push(page);
      if token.is_none() || pages.len() > 1_000 {
        return pages;
      }
    }
  }
}

pub fn article_schema(shards: u16) -> EntitySchema {
  EntitySchema::builder("article", ShardSet::range(shards).unwrap())
    .shard_key("s_id")
    .format_key(SORT_KEY, "channel#{channel}#{priority}")
    .sort_key(INDEX, SORT_KEY)
    .build()
    .unwrap()
}

pub fn article(id: &str, channel: &str, priority: &str) -> Entity {
  json!({
    "articleId": id,
    "channel": channel,
    "priority": priority,
    "title": format!("Article {}", id),
  })
  .as_object()
  .cloned()
  .unwrap()
}

pub fn ids(page: &MergedPage) -> Vec<String> {
  page
    .items
    .iter()
    .map(|i| i["articleId"].as_str().unwrap().to_string())
    .collect()
}

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}
