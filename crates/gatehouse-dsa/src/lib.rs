//! # gatehouse-dsa: Contention-Aware Foundations
//!
//! Data structures shared by the admission and lifecycle layers. Nothing in
//! here knows about sessions or sockets.

pub mod backoff;
pub mod sharded;

pub use backoff::{BackoffStage, StagedBackoff};
pub use sharded::{AllShardsGuard, ShardedMap};
