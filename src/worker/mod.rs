//! Task execution: queue, planning, the runner, and its supervisor.
//!
//! Core components:
//! - `queue`: FIFO of queued task ids
//! - `plan`: `StepPlanner` seam and the `DirectPlanner`
//! - `runner`: executes one task at a time against the session slot
//! - `supervisor`: restarts the runner if it dies

pub mod plan;
pub mod queue;
pub mod runner;
pub mod supervisor;

pub use plan::{DirectPlanner, StepPlanner};
pub use queue::ExecutionQueue;
pub use runner::{RunnerSettings, RunnerStats, StatsSnapshot, TaskRunner};
pub use supervisor::{Supervisor, SupervisorHandle};
