//! Example: paging through a sharded catalog index
//!
//! This example demonstrates:
//! - Loading the index configuration of an entity type
//! - Enriching entities with shard and sort keys before write
//! - Paging through all shards with continuation tokens
//!
//! Run with `RUST_LOG=shardscan=debug` to see the fan-out.

use serde_json::json;
use shardscan::{EngineOptions, IndexConfig, MemoryStore, QueryRequest, ShardedIndex, SortKeyCondition};
use std::sync::Arc;

const CONFIG: &str = r#"{
  "entities": [{
    "name": "article",
    "shard_count": 4,
    "index_keys": [
      {"kind": "shard", "attribute": "s_id"},
      {"kind": "format", "attribute": "channel_priority", "template": "channel#{channel}#{priority}"}
    ],
    "sort_keys": {"channel-index": "channel_priority"}
  }]
}"#;

fn main() -> shardscan::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  println!("=== Shardscan Catalog Example ===\n");

  // 1. Build the index from configuration
  let config = IndexConfig::from_json_str(CONFIG)?;
  let Some(article) = config.entity("article") else {
    return Err(shardscan::Error::Config("entity 'article' missing".into()));
  };
  let store = Arc::new(MemoryStore::new("articleId").with_index("channel-index", Some("channel_priority")));
  let index = ShardedIndex::from_config(article, EngineOptions::default(), store.clone())?;
  println!("✓ Index over {} shards", index.schema().shards().len());

  // 2. Write some articles
  println!("\n--- Writing Data ---");
  for i in 0..25 {
    let channel = if i % 5 == 0 { "app" } else { "web" };
    let entity = json!({
      "articleId": format!("article-{:03}", i),
      "channel": channel,
      "priority": format!("{}_2021.08.{:02}", i % 9, 1 + i % 28),
    });
    let Some(entity) = entity.as_object() else { continue };
    let enriched = index.prepare_for_write(entity);
    if i < 3 {
      println!("  {} -> shard {:?}", entity["articleId"], index.shard_of(&enriched));
    }
    store.put(enriched)?;
  }
  println!("  ... (wrote 25 articles)");

  // 3. Page through the web channel
  println!("\n--- Paging ---");
  let request = QueryRequest::new("channel-index")
    .sort_key(SortKeyCondition::begins_with("channel_priority", "channel#web#"))
    .limit(6);

  let mut token = None;
  let mut page_no = 1;
  loop {
    let page = index.query(&request.clone().continuation_token(token))?;
    let ids: Vec<_> = page.items.iter().filter_map(|i| i["articleId"].as_str()).collect();
    println!("  page {}: {} items {:?}", page_no, page.len(), ids);

    token = page.continuation_token;
    match &token {
      Some(t) => println!("    next token: {} chars", t.len()),
      None => break,
    }
    page_no += 1;
  }

  println!("\n✓ Scan complete after {} pages", page_no);
  Ok(())
}
