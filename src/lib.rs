//! # Shardscan
//!
//! `shardscan` is the read path of a horizontally sharded secondary index over
//! a key-value store with bounded per-partition throughput.
//!
//! Entities are spread across a small, fixed number of synthetic shard
//! partitions to avoid hot partitions. Callers still see one ordered,
//! paginatable collection.
//!
//! ## Key Features
//!
//! * **Sticky Sharding**: A random shard id is assigned once and kept on every rewrite.
//! * **Index Enrichment**: Index keys are computed before write and stripped on read.
//! * **Parallel Fan-out**: One worker per shard, joined at a deadline-bounded barrier.
//! * **Partial Results**: A failing shard is reported and retried, never fatal.
//! * **Opaque Tokens**: Per-shard cursors packed into a checksummed, compressed string.
//!
//! ## Example
//!
//! ```
//! use shardscan::{EngineOptions, EntitySchema, MemoryStore, QueryRequest, ShardSet, ShardedIndex};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> shardscan::Result<()> {
//! let schema = EntitySchema::builder("brand", ShardSet::range(4)?)
//!   .shard_key("s_id")
//!   .format_key("brand_sk", "brand#{brandKey}")
//!   .sort_key("brand-index", "brand_sk")
//!   .build()?;
//!
//! let store = Arc::new(MemoryStore::new("brandKey").with_index("brand-index", Some("brand_sk")));
//! let index = ShardedIndex::with_store(schema, EngineOptions::default(), store.clone())?;
//!
//! let brand = json!({"brandKey": "acme"}).as_object().cloned().unwrap_or_default();
//! store.put(index.prepare_for_write(&brand))?;
//!
//! let page = index.query(&QueryRequest::new("brand-index").limit(10))?;
//! assert_eq!(page.items, vec![brand]);
//! assert!(page.continuation_token.is_none());
//! # Ok(())
//! # }
//! ```

mod barrier;
mod config;
mod entity;
mod error;
mod mapping;
mod memory;
mod model;
mod schema;
mod shard;
mod store;
mod token;

pub mod query;

// Re-exports for the flat public API
pub use barrier::{Barrier, BarrierReport, DEFAULT_MAX_UNITS, DEFAULT_TIMEOUT};
pub use config::{EngineOptions, EntityConfig, IndexConfig, IndexKeySpec};
pub use entity::{Attributes, Cursor, Entity};
pub use error::{Error, Result};
pub use mapping::{ComputedKey, FormatTemplate, IndexKeyTemplate, IndexMapping};
pub use memory::{MemoryStore, SCAN_FORWARD};
pub use model::ShardedIndex;
pub use query::{FanoutEngine, MergedPage, QueryRequest, SortKeyCondition, SortKeyOp};
pub use schema::{EntitySchema, EntitySchemaBuilder};
pub use shard::{ShardAssigner, ShardId, ShardSet};
pub use store::{DEFAULT_HANDLE_TTL, HandleCache, IndexStore, QueryPage, StoreQuery};
pub use token::{ContinuationToken, ShardPosition, TokenCodec};
