//! Validated, immutable per-entity-type index configuration.

use crate::config::{EntityConfig, IndexKeySpec};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::mapping::{ComputedKey, FormatTemplate, IndexKeyTemplate, IndexMapping};
use crate::shard::{ShardAssigner, ShardSet};
use serde_json::Value;
use std::collections::BTreeMap;

/// Everything the engine needs to know about one sharded entity type.
#[derive(Debug, Clone)]
pub struct EntitySchema {
  name: String,
  shards: ShardSet,
  partition_key: String,
  mapping: IndexMapping,
  sort_keys: BTreeMap<String, String>,
}

impl EntitySchema {
  pub fn builder(name: impl Into<String>, shards: ShardSet) -> EntitySchemaBuilder {
    EntitySchemaBuilder {
      name: name.into(),
      shards,
      keys: Vec::new(),
      sort_keys: BTreeMap::new(),
    }
  }

  /// Builds a schema from its declarative configuration.
  pub fn from_config(config: &EntityConfig) -> Result<Self> {
    let mut builder = Self::builder(config.name.clone(), ShardSet::range(config.shard_count)?);
    for spec in &config.index_keys {
      builder = match spec {
        IndexKeySpec::Shard { attribute } => builder.shard_key(attribute.clone()),
        IndexKeySpec::Format { attribute, template } => builder.format_key(attribute.clone(), template.clone()),
      };
    }
    for (index, attribute) in &config.sort_keys {
      builder = builder.sort_key(index.clone(), attribute.clone());
    }
    builder.build()
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn shards(&self) -> &ShardSet {
    &self.shards
  }

  /// Attribute holding the shard id; the partition key of every sharded index.
  pub fn partition_key(&self) -> &str {
    &self.partition_key
  }

  pub fn mapping(&self) -> &IndexMapping {
    &self.mapping
  }

  /// Attribute that orders merged results of `index_name`, if configured.
  pub fn sort_key_for(&self, index_name: &str) -> Option<&str> {
    self.sort_keys.get(index_name).map(String::as_str)
  }
}

enum KeySource {
  Shard,
  Format(String),
  Computed(ComputedKey),
}

/// Collects index keys; all validation happens in [`EntitySchemaBuilder::build`].
pub struct EntitySchemaBuilder {
  name: String,
  shards: ShardSet,
  keys: Vec<(String, KeySource)>,
  sort_keys: BTreeMap<String, String>,
}

impl EntitySchemaBuilder {
  /// Declares the shard-id attribute, used as partition key for fan-out queries.
  pub fn shard_key(mut self, attribute: impl Into<String>) -> Self {
    self.keys.push((attribute.into(), KeySource::Shard));
    self
  }

  pub fn format_key(mut self, attribute: impl Into<String>, template: impl Into<String>) -> Self {
    self.keys.push((attribute.into(), KeySource::Format(template.into())));
    self
  }

  pub fn computed_key(
    mut self,
    attribute: impl Into<String>,
    f: impl Fn(&Entity) -> Option<Value> + Send + Sync + 'static,
  ) -> Self {
    self.keys.push((attribute.into(), KeySource::Computed(ComputedKey::new(f))));
    self
  }

  pub fn sort_key(mut self, index_name: impl Into<String>, attribute: impl Into<String>) -> Self {
    self.sort_keys.insert(index_name.into(), attribute.into());
    self
  }

  /// # Errors
  ///
  /// Returns `Error::Config` if there is not exactly one shard key, a template
  /// does not parse, or an attribute is declared twice.
  pub fn build(self) -> Result<EntitySchema> {
    let mut mapping = IndexMapping::new();
    let mut partition_key = None;

    for (attribute, source) in self.keys {
      let template = match source {
        KeySource::Shard => {
          if let Some(existing) = partition_key.replace(attribute.clone()) {
            return Err(Error::Config(format!(
              "entity '{}': second shard key '{}' (already '{}')",
              self.name, attribute, existing
            )));
          }
          IndexKeyTemplate::Shard(ShardAssigner::new(self.shards.clone()))
        }
        KeySource::Format(template) => IndexKeyTemplate::Format(
          FormatTemplate::parse(&template).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("entity '{}': {}", self.name, msg)),
            other => other,
          })?,
        ),
        KeySource::Computed(key) => IndexKeyTemplate::Computed(key),
      };
      mapping = mapping.with_key(attribute, template)?;
    }

    let partition_key =
      partition_key.ok_or_else(|| Error::Config(format!("entity '{}' has no shard key", self.name)))?;

    tracing::debug!(
      target: "shardscan::config",
      "Schema '{}' built: shards {}, partition key '{}', {} index keys",
      self.name,
      self.shards,
      partition_key,
      mapping.index_keys().count()
    );

    Ok(EntitySchema {
      name: self.name,
      shards: self.shards,
      partition_key,
      mapping,
      sort_keys: self.sort_keys,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::IndexConfig;
  use serde_json::json;

  #[test]
  fn test_builder() {
    let schema = EntitySchema::builder("article", ShardSet::range(10).unwrap())
      .shard_key("s_id")
      .format_key("channel_priority", "channel#{channel}#{priority}")
      .computed_key("gtin_prefix", |e| {
        e.get("gtin")?.as_str().map(|g| Value::String(g.chars().take(3).collect()))
      })
      .sort_key("channel-index", "channel_priority")
      .build()
      .unwrap();

    assert_eq!(schema.partition_key(), "s_id");
    assert_eq!(schema.shards().len(), 10);
    assert_eq!(schema.sort_key_for("channel-index"), Some("channel_priority"));
    assert_eq!(schema.sort_key_for("other"), None);
    assert_eq!(
      schema.mapping().index_keys().collect::<Vec<_>>(),
      vec!["s_id", "channel_priority", "gtin_prefix"]
    );

    let entity = json!({"gtin": "4001234", "channel": "web", "priority": "5_2021.08.10"});
    let enriched = schema.mapping().enrich(entity.as_object().unwrap());
    assert_eq!(enriched["channel_priority"], json!("channel#web#5_2021.08.10"));
    assert_eq!(enriched["gtin_prefix"], json!("400"));
  }

  #[test]
  fn test_missing_shard_key() {
    let res = EntitySchema::builder("a", ShardSet::range(2).unwrap())
      .format_key("k", "{x}")
      .build();
    assert!(matches!(res, Err(Error::Config(msg)) if msg.contains("no shard key")));
  }

  #[test]
  fn test_bad_template() {
    let res = EntitySchema::builder("a", ShardSet::range(2).unwrap())
      .shard_key("s_id")
      .format_key("k", "{a.b}")
      .build();
    assert!(matches!(res, Err(Error::Config(_))));
  }

  #[test]
  fn test_from_config() {
    let config = IndexConfig::from_json_str(
      r#"{"entities": [{"name": "brand", "shard_count": 4,
        "index_keys": [{"kind": "shard", "attribute": "s_id"},
                       {"kind": "format", "attribute": "sk", "template": "{brandKey}"}],
        "sort_keys": {"brand-index": "sk"}}]}"#,
    )
    .unwrap();

    let schema = EntitySchema::from_config(config.entity("brand").unwrap()).unwrap();
    assert_eq!(schema.name(), "brand");
    assert_eq!(schema.shards().ids(), &[0, 1, 2, 3]);
    assert_eq!(schema.sort_key_for("brand-index"), Some("sk"));
  }
}
