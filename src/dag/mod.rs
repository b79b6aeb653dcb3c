//! Phase graph scheduling.
//!
//! This module drives a graph of phase nodes over a component hierarchy.
//!
//! ## Architecture
//!
//! The scheduler has four parts:
//!
//! 1. **Builder** - Assembles domains of phase nodes and validates them
//! 2. **State** - The per-node state machine and the run report
//! 3. **Scheduler** - Readiness, monotonic transitions and sync groups
//! 4. **Executor** - Runs nodes, spawns task activities, waits on objections
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use phasegraph::component::{Component, Hierarchy};
//! use phasegraph::dag::{GraphBuilder, PhaseExecutor, SchedulerConfig};
//! use phasegraph::phase::PhaseRegistry;
//!
//! struct Top;
//! impl Component for Top {}
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = PhaseRegistry::standard();
//! let graph = GraphBuilder::standard(&registry)?;
//! let hierarchy = Hierarchy::new("tb", Arc::new(Top))?;
//!
//! let report = PhaseExecutor::new(&graph, &hierarchy, SchedulerConfig::default())
//!     .run()
//!     .await?;
//! assert!(report.timeouts.is_empty());
//! # Ok(())
//! # }
//! ```

mod builder;
mod executor;
mod scheduler;
mod state;

pub use builder::{COMMON_DOMAIN, GraphBuilder, NodeId, PhaseGraph, PhaseNode};
pub use executor::{PhaseExecutor, SchedulerEvent};
pub use scheduler::{
    DEFAULT_GLOBAL_TIMEOUT, DEFAULT_MAX_READY_TO_END_ITERATIONS, PhaseScheduler, SchedulerConfig,
    TimeoutPolicy,
};
pub use state::{ExecutionTimer, NodeState, RunReport, TimeoutRecord, Transition};
