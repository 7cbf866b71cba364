//! Attribute-map types shared by every layer.

use serde_json::{Map, Value};

/// One domain record: attribute name to value.
///
/// Logical, enriched and svelte entities all share this representation; they
/// differ only in which index-key attributes are present.
pub type Entity = Map<String, Value>;

/// The store's last-evaluated key for one shard.
pub type Cursor = Map<String, Value>;

/// Pass-through request attributes handed verbatim to the store.
pub type Attributes = Map<String, Value>;
