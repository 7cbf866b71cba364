//! Index-key enrichment and stripping.
//!
//! Attributes of an entity are copied to root level under index-only names so
//! the store's secondary indexes can locate it, producing an "enriched
//! entity". Depending on the index they serve as partition or sort keys.
//! These attributes are dropped again before the entity leaves the crate,
//! producing a "svelte entity".

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::shard::ShardAssigner;
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Computes an index-key value from an entity, or `None` when not computable.
pub type ComputeFn = dyn Fn(&Entity) -> Option<Value> + Send + Sync;

/// Opaque wrapper around a computed index-key function.
///
/// A function that panics is treated as returning `None`: the key is left
/// unset and the remaining keys are still computed.
#[derive(Clone)]
pub struct ComputedKey(Arc<ComputeFn>);

impl ComputedKey {
  pub fn new(f: impl Fn(&Entity) -> Option<Value> + Send + Sync + 'static) -> Self {
    Self(Arc::new(f))
  }

  fn compute(&self, entity: &Entity) -> Option<Value> {
    match panic::catch_unwind(AssertUnwindSafe(|| (self.0)(entity))) {
      Ok(value) => value,
      Err(_) => {
        tracing::warn!(target: "shardscan::mapping", "Computed index key panicked, treating it as not computable");
        None
      }
    }
  }
}

impl fmt::Debug for ComputedKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("ComputedKey(..)")
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
  Literal(String),
  Field(String),
}

/// A format pattern over root-level attributes, e.g. `"{channel}#{priority}"`.
///
/// Placeholders name a root-level attribute; nested or dotted lookups are not
/// supported. Literal braces are written as `{{` and `}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatTemplate {
  source: String,
  segments: Vec<Segment>,
}

impl FormatTemplate {
  /// Parses a template.
  ///
  /// # Errors
  ///
  /// Returns `Error::Config` for unbalanced braces and for placeholders that
  /// are empty, dotted, indexed or carry a format spec.
  pub fn parse(template: &str) -> Result<Self> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
      match c {
        '{' if chars.peek() == Some(&'{') => {
          chars.next();
          literal.push('{');
        }
        '}' if chars.peek() == Some(&'}') => {
          chars.next();
          literal.push('}');
        }
        '{' => {
          let mut field = String::new();
          loop {
            match chars.next() {
              Some('}') => break,
              Some(c) => field.push(c),
              None => {
                return Err(Error::Config(format!("unclosed '{{' in template '{}'", template)));
              }
            }
          }
          validate_field(template, &field)?;
          if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
          }
          segments.push(Segment::Field(field));
        }
        '}' => {
          return Err(Error::Config(format!("single '}}' in template '{}'", template)));
        }
        c => literal.push(c),
      }
    }
    if !literal.is_empty() {
      segments.push(Segment::Literal(literal));
    }

    Ok(Self {
      source: template.to_string(),
      segments,
    })
  }

  /// Renders the template against `entity`.
  ///
  /// Returns `None` if a referenced attribute is missing or the result is empty.
  pub fn render(&self, entity: &Entity) -> Option<String> {
    let mut out = String::new();
    for segment in &self.segments {
      match segment {
        Segment::Literal(s) => out.push_str(s),
        Segment::Field(name) => match entity.get(name)? {
          Value::String(s) => out.push_str(s),
          other => out.push_str(&other.to_string()),
        },
      }
    }
    (!out.is_empty()).then_some(out)
  }

  /// Root-level attributes referenced by this template.
  pub fn fields(&self) -> impl Iterator<Item = &str> {
    self.segments.iter().filter_map(|s| match s {
      Segment::Field(name) => Some(name.as_str()),
      Segment::Literal(_) => None,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.source
  }
}

fn validate_field(template: &str, field: &str) -> Result<()> {
  if field.is_empty() {
    return Err(Error::Config(format!(
      "empty placeholder in template '{}'; placeholders must name an attribute",
      template
    )));
  }
  if let Some(bad) = field.chars().find(|c| matches!(c, '.' | '[' | ']' | ':' | '!' | '{')) {
    return Err(Error::Config(format!(
      "unsupported character '{}' in placeholder '{}' of template '{}'",
      bad, field, template
    )));
  }
  Ok(())
}

/// How the value of one index key is derived.
#[derive(Debug, Clone)]
pub enum IndexKeyTemplate {
  /// A sticky random shard id.
  Shard(ShardAssigner),
  /// A format pattern over root-level attributes.
  Format(FormatTemplate),
  /// An arbitrary function of the entity.
  Computed(ComputedKey),
}

impl IndexKeyTemplate {
  /// Evaluates the template for `attribute` against `entity`.
  fn value_for(&self, attribute: &str, entity: &Entity) -> Option<Value> {
    match self {
      IndexKeyTemplate::Shard(assigner) => Some(assigner.assign(entity.get(attribute))),
      IndexKeyTemplate::Format(template) => template.render(entity).map(Value::String),
      IndexKeyTemplate::Computed(key) => key.compute(entity),
    }
  }
}

/// The ordered set of index keys configured for one entity type.
#[derive(Debug, Clone, Default)]
pub struct IndexMapping {
  keys: Vec<(String, IndexKeyTemplate)>,
}

impl IndexMapping {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds an index key. Keys are evaluated in insertion order, so later
  /// templates may reference keys computed by earlier ones.
  ///
  /// # Errors
  ///
  /// Returns `Error::Config` if the attribute is empty or already mapped.
  pub fn with_key(mut self, attribute: impl Into<String>, template: IndexKeyTemplate) -> Result<Self> {
    let attribute = attribute.into();
    if attribute.is_empty() {
      return Err(Error::Config("index key attribute cannot be empty".into()));
    }
    if self.contains(&attribute) {
      return Err(Error::Config(format!("index key '{}' is defined twice", attribute)));
    }
    self.keys.push((attribute, template));
    Ok(self)
  }

  pub fn contains(&self, attribute: &str) -> bool {
    self.keys.iter().any(|(name, _)| name == attribute)
  }

  /// Names of all index-only attributes.
  pub fn index_keys(&self) -> impl Iterator<Item = &str> {
    self.keys.iter().map(|(name, _)| name.as_str())
  }

  pub fn template(&self, attribute: &str) -> Option<&IndexKeyTemplate> {
    self.keys.iter().find(|(name, _)| name == attribute).map(|(_, t)| t)
  }

  /// Returns a copy of `entity` carrying every computable index key.
  ///
  /// Keys whose value cannot be computed are left untouched: an existing value
  /// stays, a missing one stays missing.
  pub fn enrich(&self, entity: &Entity) -> Entity {
    let mut enriched = entity.clone();
    for (attribute, template) in &self.keys {
      match template.value_for(attribute, &enriched) {
        Some(value) => {
          enriched.insert(attribute.clone(), value);
        }
        None => {
          tracing::debug!(target: "shardscan::mapping", "Index key '{}' not computable, left unset", attribute);
        }
      }
    }
    enriched
  }

  /// Returns a copy of `entity` without any index key.
  pub fn drop(&self, entity: &Entity) -> Entity {
    let mut svelte = entity.clone();
    for (attribute, _) in &self.keys {
      svelte.remove(attribute);
    }
    svelte
  }

  pub fn drop_many(&self, entities: &[Entity]) -> Vec<Entity> {
    entities.iter().map(|e| self.drop(e)).collect()
  }
}
