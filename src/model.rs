use crate::config::{EngineOptions, EntityConfig};
use crate::entity::Entity;
use crate::error::Result;
use crate::query::{FanoutEngine, MergedPage, QueryRequest};
use crate::schema::EntitySchema;
use crate::shard::ShardId;
use crate::store::{HandleCache, IndexStore};
use std::sync::Arc;

/// The sharded index of one entity type, wired to its store.
///
/// Writes go through [`ShardedIndex::prepare_for_write`], reads come back
/// through [`ShardedIndex::query`] or [`ShardedIndex::present`].
pub struct ShardedIndex<S> {
  schema: Arc<EntitySchema>,
  engine: FanoutEngine,
  handles: HandleCache<S>,
}

impl<S: IndexStore + 'static> ShardedIndex<S> {
  pub fn new(schema: EntitySchema, options: EngineOptions, handles: HandleCache<S>) -> Result<Self> {
    let schema = Arc::new(schema);
    let engine = FanoutEngine::new(schema.clone(), options)?;
    Ok(Self {
      schema,
      engine,
      handles,
    })
  }

  /// Uses one long-lived store handle.
  pub fn with_store(schema: EntitySchema, options: EngineOptions, store: Arc<S>) -> Result<Self> {
    Self::new(schema, options, HandleCache::fixed(store))
  }

  /// Builds store handles on demand, rebuilding them after `options.handle_ttl`.
  pub fn with_factory(
    schema: EntitySchema,
    options: EngineOptions,
    factory: impl Fn() -> Result<S> + Send + Sync + 'static,
  ) -> Result<Self> {
    let handles = HandleCache::new(options.handle_ttl, factory);
    Self::new(schema, options, handles)
  }

  pub fn from_config(config: &EntityConfig, options: EngineOptions, store: Arc<S>) -> Result<Self> {
    Self::with_store(EntitySchema::from_config(config)?, options, store)
  }

  pub fn schema(&self) -> &EntitySchema {
    &self.schema
  }

  pub fn engine(&self) -> &FanoutEngine {
    &self.engine
  }

  pub fn handles(&self) -> &HandleCache<S> {
    &self.handles
  }

  /// Adds every index key to `entity`. Existing shard ids are kept.
  pub fn prepare_for_write(&self, entity: &Entity) -> Entity {
    self.schema.mapping().enrich(entity)
  }

  /// Removes every index key from a stored item.
  pub fn present(&self, item: &Entity) -> Entity {
    self.schema.mapping().drop(item)
  }

  pub fn present_many(&self, items: &[Entity]) -> Vec<Entity> {
    self.schema.mapping().drop_many(items)
  }

  /// Shard an enriched item lives on.
  pub fn shard_of(&self, item: &Entity) -> Option<ShardId> {
    let value = item.get(self.schema.partition_key())?;
    self.schema.shards().parse_shard_value(value)
  }

  pub fn query(&self, request: &QueryRequest) -> Result<MergedPage> {
    self.query_with_refresh(request, false)
  }

  /// Like [`ShardedIndex::query`], optionally rebuilding the store handle first.
  pub fn query_with_refresh(&self, request: &QueryRequest, force_refresh: bool) -> Result<MergedPage> {
    let store = self.handles.get_or_create(force_refresh)?;
    self.engine.query(store, request)
  }
}
