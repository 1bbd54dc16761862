//! Task Orchestrator (C6, spec §4.4): owns the task state machine, the
//! per-channel FIFO queues, pending approvals, and session-to-task mapping,
//! driving each task through the Executor to a terminal state.

mod approvals;
mod events;
mod orchestrator;
mod queue;
mod task;

pub use approvals::{ApprovalTable, PendingApproval, SessionTaskMapping};
pub use events::{OrchestratorEvent, OrchestratorEventBus};
pub use orchestrator::{CreateTaskResult, OrchestratorError, TaskCounters, TaskOrchestrator};
pub use queue::PerChannelQueue;
pub use task::{Task, TaskRegistry, TaskRegistryError};
