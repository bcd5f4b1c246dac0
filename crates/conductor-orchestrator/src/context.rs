use crate::batch::BatchCoordinator;
use crate::cleanup::{CleanupWorker, Retention};
use crate::completion::{CompletionMonitor, CompletionSource, FileMarkerSource};
use crate::conditional::ConditionalMonitor;
use crate::config::OrchestratorConfig;
use crate::dependency::DependencyResolver;
use crate::engine::{Orchestrator, SystemOverview};
use crate::runtime::{Runtime, RuntimeHandle};
use crate::scheduler::Scheduler;
use conductor_bus::{FileMailbox, Mailbox, MemoryMailbox, MessageBus};
use conductor_core::{ConductorResult, SharedClock};
use conductor_locks::{LockManager, SystemLockOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Every long-lived component, wired together once at start-up.
///
/// The entry point owns one of these and passes references to whatever needs
/// them. Nothing in the workspace reaches for global state.
pub struct Conductor {
    config: OrchestratorConfig,
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<Scheduler>,
    conditional: Arc<ConditionalMonitor>,
    dependencies: Arc<DependencyResolver>,
    batches: Arc<BatchCoordinator>,
    completion: Arc<CompletionMonitor>,
    cleanup: Arc<CleanupWorker>,
    locks: Arc<LockManager>,
    bus: Arc<MessageBus>,
}

impl Conductor {
    /// Build the context, reading markers from the completion directory.
    pub async fn new(config: OrchestratorConfig, clock: SharedClock) -> ConductorResult<Self> {
        let source = Arc::new(FileMarkerSource::new(
            config.completed_dir(),
            config.archive_dir(),
        ));
        Self::with_completion_source(config, clock, source).await
    }

    /// Build the context around a caller-supplied marker source.
    pub async fn with_completion_source(
        config: OrchestratorConfig,
        clock: SharedClock,
        source: Arc<dyn CompletionSource>,
    ) -> ConductorResult<Self> {
        config.validate()?;
        for dir in [config.tasks_dir(), config.completed_dir(), config.state_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let orchestrator = Arc::new(Orchestrator::new(&config, clock.clone()));
        let completion = Arc::new(CompletionMonitor::new(
            orchestrator.clone(),
            source,
            config.state_dir(),
        ));
        completion.load_state().await?;

        let locks = Arc::new(
            LockManager::new(config.locks_dir(), clock.clone()).await?.with_options(SystemLockOptions {
                acquire_timeout: Duration::from_secs(config.locks.acquire_timeout_secs),
                stale_after: Duration::from_secs(config.locks.stale_after_secs),
                ..SystemLockOptions::default()
            }),
        );

        let mailbox: Arc<dyn Mailbox> = if config.bus.durable_mailbox {
            Arc::new(FileMailbox::new(config.mailbox_dir()).await?)
        } else {
            Arc::new(MemoryMailbox::new())
        };
        let bus = Arc::new(MessageBus::with_mailbox(
            mailbox,
            config.bus.knowledge_per_topic,
            clock,
        ));

        let limits = &config.limits;
        let cleanup = Arc::new(CleanupWorker::new(
            orchestrator.clone(),
            completion.clone(),
            locks.clone(),
            bus.clone(),
            config.archive_dir(),
            Retention::from_secs(
                limits.task_retention_secs,
                limits.marker_retention_secs,
                limits.knowledge_retention_secs,
            ),
        ));

        info!(data_dir = %config.data_dir.display(), "Conductor initialised");
        Ok(Self {
            scheduler: Arc::new(Scheduler::new(orchestrator.clone())),
            conditional: Arc::new(ConditionalMonitor::new(orchestrator.clone())),
            dependencies: Arc::new(DependencyResolver::new(orchestrator.clone())),
            batches: Arc::new(BatchCoordinator::new(orchestrator.clone(), limits.max_batch_size)),
            config,
            orchestrator,
            completion,
            cleanup,
            locks,
            bus,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn conditional(&self) -> &Arc<ConditionalMonitor> {
        &self.conditional
    }

    pub fn dependencies(&self) -> &Arc<DependencyResolver> {
        &self.dependencies
    }

    pub fn batches(&self) -> &Arc<BatchCoordinator> {
        &self.batches
    }

    pub fn completion(&self) -> &Arc<CompletionMonitor> {
        &self.completion
    }

    pub fn cleanup(&self) -> &Arc<CleanupWorker> {
        &self.cleanup
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// A runtime with every background worker registered at its configured period.
    pub fn runtime(&self) -> Runtime {
        let intervals = &self.config.intervals;
        let mut runtime = Runtime::new();
        runtime
            .register(self.completion.clone(), intervals.completion())
            .register(self.dependencies.clone(), intervals.dependency())
            .register(self.scheduler.clone(), intervals.scheduler())
            .register(self.conditional.clone(), intervals.conditional())
            .register(self.orchestrator.clone(), intervals.dispatch())
            .register(self.cleanup.clone(), intervals.cleanup());
        runtime
    }

    /// Start every background worker.
    pub fn start(&self) -> RuntimeHandle {
        let runtime = self.runtime();
        info!(workers = runtime.len(), "Starting background workers");
        runtime.start()
    }

    /// One pass of every worker in pipeline order, without the runtime.
    ///
    /// Completions land first so dependents and idle agents are visible to
    /// the dispatch step of the same pass.
    pub async fn tick_all(&self) -> ConductorResult<()> {
        let now = self.orchestrator.now();
        self.completion.process_markers().await?;
        self.scheduler.promote_due(now);
        self.conditional.check_conditions(now).await;
        self.dependencies.resolve();
        self.orchestrator.dispatch_once().await?;
        Ok(())
    }

    /// Overview including the counts held outside the orchestrator.
    pub async fn system_overview(&self) -> SystemOverview {
        let mut overview = self.orchestrator.get_system_overview().await;
        overview.scheduled_tasks = self.scheduler.len();
        overview.conditional_tasks = self.conditional.len();
        overview.batches = self.batches.len();
        overview
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{TaskKind, TaskSpec};
    use chrono::Duration as ChronoDuration;
    use conductor_core::{AgentType, Clock, ManualClock};

    #[tokio::test]
    async fn test_overview_counts_every_component() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let conductor = Conductor::new(OrchestratorConfig::with_data_dir(tmp.path()), Arc::new(clock.clone()))
            .await
            .unwrap();

        conductor
            .scheduler()
            .create_scheduled_task(
                TaskSpec::new(AgentType::Email, TaskKind::SendEmail, "later"),
                clock.now() + ChronoDuration::hours(1),
            )
            .unwrap();
        conductor
            .batches()
            .create_task_batch(
                "pair",
                vec![
                    TaskSpec::new(AgentType::Sms, TaskKind::SendSms, "a"),
                    TaskSpec::new(AgentType::Sms, TaskKind::SendSms, "b"),
                ],
                crate::batch::ExecutionOrder::Parallel,
            )
            .unwrap();

        let overview = conductor.system_overview().await;
        assert_eq!(overview.scheduled_tasks, 1);
        assert_eq!(overview.batches, 1);
        assert_eq!(overview.conditional_tasks, 0);
        assert_eq!(overview.queue_depths[&AgentType::Sms], 2);
    }

    #[tokio::test]
    async fn test_runtime_registers_all_workers() {
        let tmp = tempfile::tempdir().unwrap();
        let conductor = Conductor::new(
            OrchestratorConfig::with_data_dir(tmp.path()),
            Arc::new(ManualClock::starting_now()),
        )
        .await
        .unwrap();
        assert_eq!(conductor.runtime().len(), 6);
        let handle = conductor.start();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_durable_mailbox() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = OrchestratorConfig::with_data_dir(tmp.path());
        config.bus.durable_mailbox = true;
        let conductor = Conductor::new(config.clone(), Arc::new(ManualClock::starting_now()))
            .await
            .unwrap();
        conductor
            .bus()
            .send_message(
                conductor_bus::Participant::Orchestrator,
                AgentType::Analysis,
                conductor_bus::MessageType::Info,
                serde_json::json!({"text": "hello"}),
            )
            .await
            .unwrap();
        assert!(config.mailbox_dir().join("analysis").exists());
        assert_eq!(conductor.bus().pending_messages(AgentType::Analysis).await.unwrap(), 1);
    }
}
