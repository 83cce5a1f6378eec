//! Task records, their store, and the reaper that evicts old ones.

pub mod model;
pub mod reaper;
pub mod store;

pub use model::{
    ProgressEntry, StepRecord, TaskEvent, TaskRecord, TaskRequest, TaskResult, TaskSnapshot,
    TaskStatus, TaskSummary,
};
pub use reaper::{ReapReport, Reaper, ReaperHandle};
pub use store::TaskStore;
