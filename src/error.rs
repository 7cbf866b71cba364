use crate::shard::ShardId;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("I/O Error: {0}")]
  Io(#[from] io::Error),

  #[error("Configuration Error: {0}")]
  Config(String),

  #[error("Invalid Query: {0}")]
  InvalidQuery(String),

  #[error("Malformed continuation token: {0}")]
  MalformedToken(String),

  #[error("Store Error: {0}")]
  Store(String),

  #[error("Query on shard {shard} failed: {source}")]
  ShardQuery {
    shard: ShardId,
    #[source]
    source: Box<Error>,
  },

  #[error("Barrier timed out after {elapsed:?} waiting for unit {unit}")]
  BarrierTimeout { unit: String, elapsed: Duration },

  #[error("Unit {unit} panicked: {message}")]
  WorkerPanicked { unit: String, message: String },

  #[error("Item on shard {shard} lacks sort key attribute '{attribute}'")]
  MissingSortKeyAttribute { shard: ShardId, attribute: String },

  #[error("Serialization Error: {0}")]
  Serialization(String),
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Serialization(e.to_string())
  }
}

impl Error {
  /// Returns the shard this error is attributed to, if any.
  pub fn shard(&self) -> Option<ShardId> {
    match self {
      Error::ShardQuery { shard, .. } | Error::MissingSortKeyAttribute { shard, .. } => Some(*shard),
      _ => None,
    }
  }

  /// True for errors that were caused by the rendezvous deadline rather than the store.
  pub fn is_timeout(&self) -> bool {
    match self {
      Error::BarrierTimeout { .. } => true,
      Error::ShardQuery { source, .. } => source.is_timeout(),
      _ => false,
    }
  }
}
