//! `queue` crate — the worker's side of the remote run queue.
//!
//! [`WorkerServer`] joins the queue over a Phoenix channel socket, claims as
//! many runs as the engine has room for, and reports each run's steps back
//! as they happen.

pub mod channel;
pub mod convert;
pub mod mock;
pub mod phoenix;
pub mod protocol;
pub mod reasons;
pub mod reporter;
pub mod resolvers;
pub mod server;
pub mod workloop;

pub use channel::{Channel, ChannelError, Socket};
pub use convert::convert_run;
pub use phoenix::PhoenixSocket;
pub use protocol::{ClaimedRun, ExitReason, Reason, RunDescriptor, RunSettings};
pub use reasons::{calculate_job_exit_reason, calculate_run_exit_reason};
pub use reporter::{execute_run, ReportOptions, RunReporter, RunState};
pub use resolvers::ChannelResolvers;
pub use server::{WorkerConfig, WorkerError, WorkerServer};
pub use workloop::{run_workloop, RunLauncher, WorkloopConfig};
