use crate::completion::CompletionMonitor;
use crate::engine::Orchestrator;
use crate::runtime::Tickable;
use crate::types::Task;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conductor_bus::MessageBus;
use conductor_core::ConductorResult;
use conductor_locks::LockManager;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// How long each kind of record is kept.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub tasks: Duration,
    pub markers: Duration,
    pub knowledge: Duration,
}

impl Retention {
    pub fn from_secs(tasks: u64, markers: u64, knowledge: u64) -> Self {
        let secs = |s: u64| Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1000));
        Self {
            tasks: secs(tasks),
            markers: secs(markers),
            knowledge: secs(knowledge),
        }
    }
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub tasks_archived: usize,
    pub markers_pruned: usize,
    pub locks_held: usize,
    pub knowledge_pruned: usize,
    pub statuses_pruned: usize,
}

/// Periodic housekeeping across the registry, markers, locks and knowledge.
pub struct CleanupWorker {
    orchestrator: Arc<Orchestrator>,
    completion: Arc<CompletionMonitor>,
    locks: Arc<LockManager>,
    bus: Arc<MessageBus>,
    archive_dir: PathBuf,
    retention: Retention,
}

impl CleanupWorker {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        completion: Arc<CompletionMonitor>,
        locks: Arc<LockManager>,
        bus: Arc<MessageBus>,
        archive_dir: impl Into<PathBuf>,
        retention: Retention,
    ) -> Self {
        Self {
            orchestrator,
            completion,
            locks,
            bus,
            archive_dir: archive_dir.into(),
            retention,
        }
    }

    /// Append `tasks` to one JSONL file per completion day.
    async fn archive_tasks(&self, tasks: &[Task]) -> ConductorResult<Vec<Uuid>> {
        let mut by_day: BTreeMap<String, Vec<&Task>> = BTreeMap::new();
        for task in tasks {
            let day = task.completed_at.unwrap_or(task.updated_at).format("%Y-%m-%d");
            by_day.entry(day.to_string()).or_default().push(task);
        }

        let dir = self.archive_dir.join("tasks");
        tokio::fs::create_dir_all(&dir).await?;
        let mut archived = Vec::with_capacity(tasks.len());
        for (day, tasks) in by_day {
            let mut lines = Vec::new();
            for task in &tasks {
                serde_json::to_writer(&mut lines, task)?;
                lines.push(b'\n');
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(format!("{day}.jsonl")))
                .await?;
            file.write_all(&lines).await?;
            file.flush().await?;
            archived.extend(tasks.iter().map(|t| t.id));
        }
        Ok(archived)
    }

    /// Run every cleanup step once against `now`.
    ///
    /// A failing step is logged and the remaining steps still run.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();

        // Archived statuses outlive the pass that archived them.
        report.statuses_pruned = self.orchestrator.prune_archived();

        let stale = self.orchestrator.terminal_tasks_before(now - self.retention.tasks);
        if !stale.is_empty() {
            match self.archive_tasks(&stale).await {
                Ok(ids) => report.tasks_archived = self.orchestrator.forget_tasks(&ids),
                Err(e) => warn!(error = %e, tasks = stale.len(), "Task archival failed, will retry"),
            }
        }

        report.markers_pruned = self.completion.prune_processed(now - self.retention.markers);

        match self.locks.get_all_locked_files().await {
            Ok(table) => report.locks_held = table.len(),
            Err(e) => warn!(error = %e, "Lock table sweep failed"),
        }

        report.knowledge_pruned = self
            .bus
            .knowledge()
            .prune_before(now - self.retention.knowledge);

        info!(
            tasks_archived = report.tasks_archived,
            markers_pruned = report.markers_pruned,
            locks_held = report.locks_held,
            knowledge_pruned = report.knowledge_pruned,
            statuses_pruned = report.statuses_pruned,
            "Cleanup pass finished"
        );
        report
    }
}

#[async_trait]
impl Tickable for CleanupWorker {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn tick(&self) -> ConductorResult<()> {
        self.run_once(self.orchestrator.now()).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::completion::ChannelMarkerSource;
    use crate::config::OrchestratorConfig;
    use crate::types::{TaskKind, TaskOrigin, TaskSpec, TaskStatus};
    use crate::dependency::{DependencyResolver, DependencyType};
    use conductor_bus::{MemoryMailbox, Participant};
    use conductor_core::{AgentType, Clock, ManualClock};

    #[tokio::test]
    async fn test_archives_old_terminal_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::with_data_dir(tmp.path());
        let clock = ManualClock::starting_now();
        let shared: conductor_core::SharedClock = Arc::new(clock.clone());
        let orch = Arc::new(Orchestrator::new(&config, shared.clone()));
        let (source, _sender) = ChannelMarkerSource::new();
        let completion = Arc::new(CompletionMonitor::new(orch.clone(), Arc::new(source), config.state_dir()));
        let bus = Arc::new(MessageBus::with_mailbox(
            Arc::new(MemoryMailbox::new()),
            10,
            shared.clone(),
        ));
        let locks = Arc::new(LockManager::new(config.locks_dir(), shared).await.unwrap());
        let worker = CleanupWorker::new(
            orch.clone(),
            completion,
            locks.clone(),
            bus.clone(),
            config.archive_dir(),
            Retention::from_secs(3600, 3600, 3600),
        );

        let done = orch
            .submit(TaskSpec::new(AgentType::Sms, TaskKind::SendSms, "done"), TaskOrigin::Direct)
            .unwrap();
        let open = orch
            .submit(TaskSpec::new(AgentType::Sms, TaskKind::SendSms, "open"), TaskOrigin::Direct)
            .unwrap();
        orch.record_completion(AgentType::Sms, done, true, None).await.unwrap();
        locks
            .acquire_lock("src/main.rs", "sms:1", std::time::Duration::from_secs(60))
            .await
            .unwrap();
        bus.share_knowledge(Participant::Agent(AgentType::Sms), "delivery", serde_json::json!({"ok": true}))
            .unwrap();

        // Inside the retention window nothing moves.
        assert_eq!(worker.run_once(clock.now()).await.tasks_archived, 0);

        clock.advance(Duration::hours(2));
        let report = worker.run_once(clock.now()).await;
        assert_eq!(report.tasks_archived, 1);
        assert_eq!(report.locks_held, 0);
        assert_eq!(report.knowledge_pruned, 1);

        assert!(orch.get_task(done).is_none());
        assert_eq!(orch.task_status(done), Some(TaskStatus::Completed));
        assert_eq!(orch.get_task(open).unwrap().status, TaskStatus::Pending);

        let files: Vec<_> = std::fs::read_dir(config.archive_dir().join("tasks"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(&files[0]).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains(&done.to_string()));

        // Nothing refers to the archived task, so the next pass forgets it.
        assert_eq!(worker.run_once(clock.now()).await.statuses_pruned, 1);
        assert_eq!(orch.task_status(done), None);
    }

    #[tokio::test]
    async fn test_archived_status_kept_while_referenced() {
        let tmp = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::with_data_dir(tmp.path());
        let clock = ManualClock::starting_now();
        let shared: conductor_core::SharedClock = Arc::new(clock.clone());
        let orch = Arc::new(Orchestrator::new(&config, shared.clone()));
        let (source, _sender) = ChannelMarkerSource::new();
        let completion = Arc::new(CompletionMonitor::new(orch.clone(), Arc::new(source), config.state_dir()));
        let locks = Arc::new(LockManager::new(config.locks_dir(), shared).await.unwrap());
        let worker = CleanupWorker::new(
            orch.clone(),
            completion,
            locks,
            Arc::new(MessageBus::new()),
            config.archive_dir(),
            Retention::from_secs(60, 3600, 3600),
        );

        let failed = orch
            .submit(TaskSpec::new(AgentType::Deployment, TaskKind::Deploy, "ship"), TaskOrigin::Direct)
            .unwrap();
        let waiting = orch
            .submit(TaskSpec::new(AgentType::Monitoring, TaskKind::HealthCheck, "verify"), TaskOrigin::Direct)
            .unwrap();
        DependencyResolver::new(orch.clone())
            .add_task_dependency(waiting, failed, DependencyType::Completion)
            .unwrap();
        orch.record_completion(AgentType::Deployment, failed, false, None)
            .await
            .unwrap();

        clock.advance(Duration::minutes(5));
        let report = worker.run_once(clock.now()).await;
        assert_eq!(report.tasks_archived, 1);
        assert_eq!(worker.run_once(clock.now()).await.statuses_pruned, 0);
        assert_eq!(orch.task_status(failed), Some(TaskStatus::Failed));
        assert_eq!(orch.task_status(waiting), Some(TaskStatus::Pending));
    }
}
