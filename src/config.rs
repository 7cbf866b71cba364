use crate::barrier::{DEFAULT_MAX_UNITS, DEFAULT_TIMEOUT};
use crate::error::{Error, Result};
use crate::store::DEFAULT_HANDLE_TTL;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Runtime knobs of the fan-out engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
  /// How long a query waits for all shard workers to check in.
  /// Workers still running afterwards are reported as failed for this call.
  /// Default: 900 s.
  pub barrier_timeout: Duration,

  /// Maximum number of store pages one shard worker reads per query.
  /// Default: 10.
  pub max_pages_per_shard: usize,

  /// Upper bound on concurrent shard workers per query.
  /// Default: 99.
  pub max_fanout: usize,

  /// Separator whose last occurrence splits the merge-ordering suffix
  /// off the sort-key attribute (`channel#100#5_2021.08.10` -> `5_2021.08.10`).
  /// Default: '#'.
  pub sort_key_separator: char,

  /// Lifetime of a cached store handle before it is rebuilt.
  /// Default: 300 s.
  pub handle_ttl: Duration,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      barrier_timeout: DEFAULT_TIMEOUT,
      max_pages_per_shard: 10,
      max_fanout: DEFAULT_MAX_UNITS,
      sort_key_separator: '#',
      handle_ttl: DEFAULT_HANDLE_TTL,
    }
  }
}

impl EngineOptions {
  pub fn validate(&self) -> Result<()> {
    if self.barrier_timeout.is_zero() {
      return Err(Error::Config("barrier_timeout must be greater than zero".into()));
    }
    if self.max_pages_per_shard == 0 {
      return Err(Error::Config("max_pages_per_shard must be greater than zero".into()));
    }
    if self.max_fanout == 0 {
      return Err(Error::Config("max_fanout must be greater than zero".into()));
    }
    Ok(())
  }
}

/// Declarative definition of one index key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexKeySpec {
  /// A sticky random shard id; this attribute is the fan-out partition key.
  Shard { attribute: String },
  /// A format pattern over root-level attributes.
  Format { attribute: String, template: String },
}

impl IndexKeySpec {
  pub fn attribute(&self) -> &str {
    match self {
      IndexKeySpec::Shard { attribute } | IndexKeySpec::Format { attribute, .. } => attribute,
    }
  }
}

/// Sharded-index configuration of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfig {
  pub name: String,
  pub shard_count: u16,
  #[serde(default)]
  pub index_keys: Vec<IndexKeySpec>,
  /// Index name to the attribute whose suffix orders merged results.
  #[serde(default)]
  pub sort_keys: BTreeMap<String, String>,
}

/// Configuration document listing every sharded entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
  pub entities: Vec<EntityConfig>,
}

impl IndexConfig {
  pub fn from_json_str(json: &str) -> Result<Self> {
    let config: Self = serde_json::from_str(json)
      .map_err(|e| Error::Config(format!("invalid index configuration: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    tracing::debug!(target: "shardscan::config", "Loading index configuration from {}", path.display());
    Self::from_json_str(&contents)
  }

  pub fn entity(&self, name: &str) -> Option<&EntityConfig> {
    self.entities.iter().find(|e| e.name == name)
  }

  /// Structural checks. Templates are parsed later when building schemas.
  pub fn validate(&self) -> Result<()> {
    let mut names = HashSet::new();
    for entity in &self.entities {
      if !names.insert(entity.name.as_str()) {
        return Err(Error::Config(format!("entity '{}' is configured twice", entity.name)));
      }
      if entity.shard_count == 0 {
        return Err(Error::Config(format!(
          "entity '{}': shard_count must be greater than zero",
          entity.name
        )));
      }
      let shard_keys = entity
        .index_keys
        .iter()
        .filter(|k| matches!(k, IndexKeySpec::Shard { .. }))
        .count();
      if shard_keys != 1 {
        return Err(Error::Config(format!(
          "entity '{}': exactly one shard index key is required, found {}",
          entity.name, shard_keys
        )));
      }
    }
    Ok(())
  }
}
