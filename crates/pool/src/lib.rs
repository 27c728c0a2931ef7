//! `pool` crate — bounded OS-thread workers and the multi-run engine built
//! on them.
//!
//! [`WorkerPool`] runs tasks with time and memory budgets. [`RuntimeEngine`]
//! uses it to execute many plans at once and fans each run's events out to
//! that run's subscribers.

pub mod alloc;
pub mod error;
pub mod events;
pub mod pool;
pub mod runtime;
pub mod worker;

pub use alloc::{MemoryMeter, TrackingAllocator};
pub use error::PoolError;
pub use events::{EngineEvent, RunChannels, RunFailure, Tagged};
pub use pool::{DispatchOptions, PoolConfig, WorkerPool};
pub use runtime::{EngineConfig, RunHandle, RunOptions, RuntimeEngine, WorkflowState, WorkflowStatus};
pub use worker::WorkerContext;

#[cfg(test)]
#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator;
