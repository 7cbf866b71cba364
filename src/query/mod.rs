//! Fan-out queries over a sharded secondary index.

pub mod condition;
mod engine;
pub mod merge;
mod request;

pub use condition::{KeyCondition, PartitionCondition, SortKeyCondition, SortKeyOp};
pub use engine::{FanoutEngine, QueryPlan, per_shard_limit, query_shard};
pub use request::{MergedPage, QueryRequest, ShardOutcome, ShardQueryRequest};
