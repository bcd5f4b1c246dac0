//! Task lifecycle and background coordination for a fixed roster of agents.
//!
//! Tasks are validated on creation, queued per agent in arrival order and
//! handed to idle agents as JSON records. Agents report back with completion
//! markers, which are applied exactly once. Around that core sit the
//! deferred paths into the queue (schedules, conditions, dependencies and
//! batches) and a single tick loop that drives them all.
//!
//! # Main types
//!
//! - [`Conductor`]: every component wired together; owned by the entry point.
//! - [`Orchestrator`]: task registry, dispatch and completion handling.
//! - [`Scheduler`], [`ConditionalMonitor`], [`DependencyResolver`],
//!   [`BatchCoordinator`]: the deferred creation paths.
//! - [`CompletionMonitor`]: reconciles markers from a [`CompletionSource`].
//! - [`Runtime`]: heap-driven loop over every [`Tickable`].

/// Batches of related tasks.
pub mod batch;
/// Archival and retention.
pub mod cleanup;
/// Completion markers and their reconciliation.
pub mod completion;
/// Tasks promoted when a predicate holds.
pub mod conditional;
/// `conductor.toml` configuration.
pub mod config;
/// The wired-up context.
pub mod context;
/// Inter-task dependencies.
pub mod dependency;
/// Task registry, dispatch and completions.
pub mod engine;
/// Hand-off records and instruction text.
pub mod instructions;
/// Agent availability and counters.
pub mod monitor;
/// Background tick loop.
pub mod runtime;
/// One-shot and recurring schedules.
pub mod scheduler;
/// Task registry and per-agent FIFO queues.
pub mod task_queue;
/// Reusable task templates.
pub mod templates;
/// Task, spec and agent state types.
pub mod types;
/// Built-in workflow catalog.
pub mod workflows;

pub use batch::{BatchCoordinator, BatchStatus, BatchStatusReport, ExecutionOrder, TaskBatch};
pub use cleanup::{CleanupReport, CleanupWorker, Retention};
pub use completion::{
    ChannelMarkerSource, CompletionMarker, CompletionMonitor, CompletionReport, CompletionSource,
    FileMarkerSource, MarkerKey, MarkerSender, ReceivedMarker,
};
pub use conditional::{condition_fn, Condition, ConditionalMonitor, ConditionalTaskInfo};
pub use config::OrchestratorConfig;
pub use context::Conductor;
pub use dependency::{DependencyResolver, DependencyType, TaskDependency};
pub use engine::{CompletionEffect, Orchestrator, SystemOverview, TaskFilter};
pub use instructions::{render_instruction, HandoffRecord, HandoffWriter};
pub use monitor::AgentMonitor;
pub use runtime::{Runtime, RuntimeHandle, Tickable};
pub use scheduler::{ScheduledTask, Scheduler};
pub use task_queue::TaskRegistry;
pub use templates::{TaskTemplate, TemplateRegistry};
pub use types::{
    AgentState, AgentStatus, Params, Task, TaskKind, TaskOrigin, TaskPriority, TaskSpec,
    TaskStatus,
};
pub use workflows::{find_workflow, workflow_catalog, Workflow, WorkflowInfo, WorkflowResult};
