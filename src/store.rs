//! The external key-value store seam and its shared handle cache.

use crate::entity::{Attributes, Cursor, Entity};
use crate::error::Result;
use crate::query::condition::KeyCondition;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default lifetime of a cached store handle.
pub const DEFAULT_HANDLE_TTL: Duration = Duration::from_secs(300);

/// A single-page query against one partition of a secondary index.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreQuery {
  pub index_name: String,
  pub key_condition: KeyCondition,
  pub limit: Option<u32>,
  pub exclusive_start_key: Option<Cursor>,
  pub extra: Attributes,
}

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
  pub items: Vec<Entity>,
  /// Absent once the partition has no further items.
  pub last_evaluated_key: Option<Cursor>,
  pub count: usize,
}

impl QueryPage {
  pub fn new(items: Vec<Entity>, last_evaluated_key: Option<Cursor>) -> Self {
    let count = items.len();
    Self {
      items,
      last_evaluated_key,
      count,
    }
  }
}

/// The query primitive of the underlying key-value store.
///
/// Implementations must tolerate concurrent calls: the fan-out engine invokes
/// `query` from one worker thread per shard.
pub trait IndexStore: Send + Sync {
  fn query(&self, request: &StoreQuery) -> Result<QueryPage>;
}

impl<S: IndexStore + ?Sized> IndexStore for Arc<S> {
  fn query(&self, request: &StoreQuery) -> Result<QueryPage> {
    (**self).query(request)
  }
}

type Factory<H> = Box<dyn Fn() -> Result<Arc<H>> + Send + Sync>;

struct CachedHandle<H> {
  handle: Arc<H>,
  created_at: Instant,
}

/// A store handle that is rebuilt after a fixed lifetime.
///
/// Owned by whichever composition root constructs it; callers ask for
/// `get_or_create` and may force a refresh explicitly.
pub struct HandleCache<H> {
  ttl: Duration,
  factory: Factory<H>,
  slot: Mutex<Option<CachedHandle<H>>>,
}

impl<H: Send + Sync + 'static> HandleCache<H> {
  pub fn new(ttl: Duration, factory: impl Fn() -> Result<H> + Send + Sync + 'static) -> Self {
    Self {
      ttl,
      factory: Box::new(move || factory().map(Arc::new)),
      slot: Mutex::new(None),
    }
  }

  /// Wraps an already constructed handle. Refreshes hand out the same handle.
  pub fn fixed(handle: Arc<H>) -> Self {
    Self {
      ttl: Duration::MAX,
      factory: Box::new(move || Ok(handle.clone())),
      slot: Mutex::new(None),
    }
  }

  /// Returns the cached handle, building a new one if it expired or `force_refresh` is set.
  ///
  /// # Errors
  ///
  /// Propagates the factory's error; the previous handle (if any) is kept.
  pub fn get_or_create(&self, force_refresh: bool) -> Result<Arc<H>> {
    let mut slot = self.slot.lock();

    if let Some(cached) = slot.as_ref() {
      let age = cached.created_at.elapsed();
      if !force_refresh && age < self.ttl {
        tracing::trace!(
          target: "shardscan::store",
          "Shared handle lives further {:.0}s",
          (self.ttl - age).as_secs_f64()
        );
        return Ok(cached.handle.clone());
      }
    }

    let handle = (self.factory)()?;
    tracing::debug!(target: "shardscan::store", "Store handle (re)created, ttl {:?}", self.ttl);
    *slot = Some(CachedHandle {
      handle: handle.clone(),
      created_at: Instant::now(),
    });
    Ok(handle)
  }

  /// Drops the cached handle; the next call rebuilds it.
  pub fn invalidate(&self) {
    *self.slot.lock() = None;
  }

  /// Remaining lifetime of the cached handle, if one is cached.
  pub fn remaining_ttl(&self) -> Option<Duration> {
    self
      .slot
      .lock()
      .as_ref()
      .map(|c| self.ttl.saturating_sub(c.created_at.elapsed()))
  }
}
