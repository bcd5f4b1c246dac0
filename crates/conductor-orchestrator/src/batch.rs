use crate::engine::Orchestrator;
use crate::types::{TaskOrigin, TaskSpec, TaskStatus};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// How a batch would like its members run. Recorded, not enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    #[default]
    Parallel,
    Sequential,
    Priority,
}

/// Aggregate status of a batch's members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    PartialFailure,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBatch {
    pub batch_id: Uuid,
    pub name: String,
    pub task_ids: Vec<Uuid>,
    pub execution_order: ExecutionOrder,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusReport {
    pub batch_id: Uuid,
    pub name: String,
    pub status: BatchStatus,
    pub total: usize,
    pub counts: BTreeMap<TaskStatus, usize>,
    pub execution_order: ExecutionOrder,
}

/// Reduce member statuses to one batch status.
///
/// All completed is `completed`. At least one failure next to at least one
/// completion is `partial_failure`. Any member still running, or a mix of
/// finished and unfinished members, is `in_progress`. Once every member has
/// ended, any failure makes it `failed` and otherwise a cancellation makes it
/// `cancelled`. Everything else is `pending`.
pub fn aggregate_status(statuses: &[TaskStatus]) -> BatchStatus {
    let count = |s: TaskStatus| statuses.iter().filter(|x| **x == s).count();
    let total = statuses.len();
    let completed = count(TaskStatus::Completed);
    let failed = count(TaskStatus::Failed);
    let cancelled = count(TaskStatus::Cancelled);
    let in_progress = count(TaskStatus::InProgress);
    let terminal = completed + failed + cancelled;

    if total > 0 && completed == total {
        BatchStatus::Completed
    } else if failed > 0 && completed > 0 {
        BatchStatus::PartialFailure
    } else if in_progress > 0 || (terminal > 0 && terminal < total) {
        BatchStatus::InProgress
    } else if total > 0 && terminal == total && failed > 0 {
        BatchStatus::Failed
    } else if total > 0 && terminal == total && cancelled > 0 {
        BatchStatus::Cancelled
    } else {
        BatchStatus::Pending
    }
}

/// Creates groups of tasks and reports on them as a unit.
pub struct BatchCoordinator {
    orchestrator: Arc<Orchestrator>,
    batches: Mutex<BTreeMap<Uuid, TaskBatch>>,
    max_batch_size: usize,
}

impl BatchCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>, max_batch_size: usize) -> Self {
        Self {
            orchestrator,
            batches: Mutex::new(BTreeMap::new()),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Create every task in `specs` under one batch id.
    ///
    /// Specs beyond the size limit are dropped with a warning. If any
    /// remaining spec is invalid nothing is created.
    pub fn create_task_batch(
        &self,
        name: &str,
        mut specs: Vec<TaskSpec>,
        execution_order: ExecutionOrder,
    ) -> ConductorResult<Uuid> {
        if specs.is_empty() {
            return Err(ConductorError::Validation(format!("batch '{name}' has no tasks")));
        }
        if specs.len() > self.max_batch_size {
            warn!(batch = name, requested = specs.len(), limit = self.max_batch_size, "Batch truncated");
            specs.truncate(self.max_batch_size);
        }

        let batch_id = Uuid::new_v4();
        let tasks = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let mut task = self
                    .orchestrator
                    .new_task(spec, TaskOrigin::Batch)
                    .map_err(|e| ConductorError::Validation(format!("batch '{name}' task {i}: {e}")))?;
                task.batch_id = Some(batch_id);
                Ok(task)
            })
            .collect::<ConductorResult<Vec<_>>>()?;

        let task_ids: Vec<Uuid> = tasks.into_iter().map(|t| self.orchestrator.insert(t)).collect();
        let batch = TaskBatch {
            batch_id,
            name: name.to_string(),
            task_ids,
            execution_order,
            created_at: self.orchestrator.now(),
        };
        info!(batch_id = %batch_id, batch = name, tasks = batch.task_ids.len(), ?execution_order, "Batch created");
        self.batches.lock().insert(batch_id, batch);
        Ok(batch_id)
    }

    pub fn get_task_batch_status(&self, batch_id: Uuid) -> ConductorResult<BatchStatusReport> {
        let batch = self
            .batches
            .lock()
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| ConductorError::NotFound(format!("batch {batch_id}")))?;

        let statuses = self.orchestrator.task_statuses(&batch.task_ids);
        let members: Vec<TaskStatus> = batch
            .task_ids
            .iter()
            .filter_map(|id| statuses.get(id).copied())
            .collect();
        let mut counts = BTreeMap::new();
        for status in &members {
            *counts.entry(*status).or_insert(0) += 1;
        }
        Ok(BatchStatusReport {
            batch_id,
            name: batch.name,
            status: aggregate_status(&members),
            total: batch.task_ids.len(),
            counts,
            execution_order: batch.execution_order,
        })
    }

    pub fn list_batches(&self) -> Vec<TaskBatch> {
        self.batches.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::engine::TaskFilter;
    use crate::types::TaskKind;
    use conductor_core::{AgentType, ManualClock};
    use TaskStatus::*;

    #[test]
    fn test_aggregate_rules() {
        assert_eq!(aggregate_status(&[Completed, Completed]), BatchStatus::Completed);
        assert_eq!(aggregate_status(&[Completed, Failed]), BatchStatus::PartialFailure);
        assert_eq!(aggregate_status(&[Completed, Failed, Pending]), BatchStatus::PartialFailure);
        assert_eq!(aggregate_status(&[InProgress, Pending]), BatchStatus::InProgress);
        assert_eq!(aggregate_status(&[Completed, Pending]), BatchStatus::InProgress);
        assert_eq!(aggregate_status(&[Pending, Pending]), BatchStatus::Pending);
        assert_eq!(aggregate_status(&[Failed, Failed]), BatchStatus::Failed);
        assert_eq!(aggregate_status(&[Cancelled]), BatchStatus::Cancelled);
        assert_eq!(aggregate_status(&[]), BatchStatus::Pending);
    }

    fn coordinator(dir: &std::path::Path, max: usize) -> (Arc<Orchestrator>, BatchCoordinator) {
        let orch = Arc::new(Orchestrator::new(
            &OrchestratorConfig::with_data_dir(dir),
            Arc::new(ManualClock::starting_now()),
        ));
        (orch.clone(), BatchCoordinator::new(orch, max))
    }

    fn spec(n: usize) -> TaskSpec {
        TaskSpec::new(AgentType::Sms, TaskKind::SendSms, format!("reminder {n}"))
    }

    #[test]
    fn test_batch_truncates_to_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let (orch, batches) = coordinator(tmp.path(), 3);
        let id = batches
            .create_task_batch("reminders", (0..5).map(spec).collect(), ExecutionOrder::Sequential)
            .unwrap();

        let report = batches.get_task_batch_status(id).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.status, BatchStatus::Pending);
        assert_eq!(report.execution_order, ExecutionOrder::Sequential);
        let filter = TaskFilter {
            batch_id: Some(id),
            ..TaskFilter::default()
        };
        assert_eq!(orch.list_tasks(&filter).len(), 3);
    }

    #[test]
    fn test_invalid_member_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let (orch, batches) = coordinator(tmp.path(), 50);
        let specs = vec![spec(0), TaskSpec::new(AgentType::Sms, TaskKind::SendSms, "")];
        assert!(batches
            .create_task_batch("bad", specs, ExecutionOrder::Parallel)
            .unwrap_err()
            .is_validation());
        assert!(orch.list_tasks(&TaskFilter::default()).is_empty());
        assert!(batches.is_empty());
    }

    #[test]
    fn test_unknown_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let (_orch, batches) = coordinator(tmp.path(), 50);
        assert!(matches!(
            batches.get_task_batch_status(Uuid::new_v4()).unwrap_err(),
            ConductorError::NotFound(_)
        ));
    }
}
