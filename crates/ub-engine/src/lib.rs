//! Firewall projection engine.
//!
//! Turns a stream of per-IP ban/unban decisions into a minimal, batched,
//! sharded sequence of idempotent controller mutations:
//! - DecisionFilter: eight-stage gate over raw decisions
//! - WorkerPool: bounded parallelism with inline backoff retry
//! - DecisionHandler: idempotency, rate gating, per-site apply, persistence
//! - ShardManager: capacity-sharded group membership with dirty batching
//! - Legacy/ZoneProvisioner: rules and policies per shard
//! - FirewallManager: orchestration, batch timers, reconcile, tail pruning
//! - Lifecycle: poller, reconciler, janitor, usage reporting
//! - api: local health/metrics listener

pub mod api;
pub mod error;
pub mod filter;
pub mod handler;
pub mod lifecycle;
pub mod manager;
pub mod names;
pub mod pool;
pub mod provision;
pub mod shard;

pub use error::{EngineError, Result};
pub use filter::{DecisionFilter, FilterOutcome};
pub use handler::DecisionHandler;
pub use lifecycle::{Lifecycle, LifecycleConfig};
pub use manager::{FirewallManager, ReconcileResult};
pub use pool::{Job, JobHandler, WorkerPool};
pub use shard::{AddResult, ShardManager, ShardManagerConfig};
