use crate::engine::Orchestrator;
use crate::runtime::Tickable;
use crate::types::{TaskOrigin, TaskSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use cron::Schedule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A task waiting for its execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub spec: TaskSpec,
    pub execution_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Set for recurring entries, which are re-armed after each promotion.
    #[serde(default)]
    pub cron_expression: Option<String>,
}

/// Parse a cron expression string into a [`cron::Schedule`].
///
/// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
pub fn parse_cron(cron_expr: &str) -> ConductorResult<Schedule> {
    Schedule::from_str(cron_expr).map_err(|e| {
        ConductorError::Validation(format!("Invalid cron expression '{cron_expr}': {e}"))
    })
}

/// First fire time of `cron_expr` strictly after `after`.
pub fn next_fire_time(cron_expr: &str, after: DateTime<Utc>) -> ConductorResult<DateTime<Utc>> {
    let schedule = parse_cron(cron_expr)?;
    schedule.after(&after).next().ok_or_else(|| {
        ConductorError::Validation(format!(
            "Cron expression '{cron_expr}' has no upcoming fire times"
        ))
    })
}

/// Holds tasks until their execution time, then queues them.
///
/// Entries are keyed by insertion sequence so promotion happens in the
/// order they were created.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    entries: Mutex<BTreeMap<u64, ScheduledTask>>,
    next_seq: Mutex<u64>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            entries: Mutex::new(BTreeMap::new()),
            next_seq: Mutex::new(0),
        }
    }

    fn push(&self, entry: ScheduledTask) -> Uuid {
        let id = entry.id;
        let seq = {
            let mut next = self.next_seq.lock();
            *next += 1;
            *next
        };
        self.entries.lock().insert(seq, entry);
        id
    }

    /// Queue `spec` once `execution_time` has passed.
    pub fn create_scheduled_task(
        &self,
        spec: TaskSpec,
        execution_time: DateTime<Utc>,
    ) -> ConductorResult<Uuid> {
        spec.validate()?;
        let id = self.push(ScheduledTask {
            id: Uuid::new_v4(),
            spec,
            execution_time,
            created_at: self.orchestrator.now(),
            cron_expression: None,
        });
        info!(schedule_id = %id, %execution_time, "Task scheduled");
        Ok(id)
    }

    /// Queue `spec` at every fire time of `cron_expression`.
    pub fn create_recurring_task(&self, spec: TaskSpec, cron_expression: &str) -> ConductorResult<Uuid> {
        spec.validate()?;
        let now = self.orchestrator.now();
        let execution_time = next_fire_time(cron_expression, now)?;
        let id = self.push(ScheduledTask {
            id: Uuid::new_v4(),
            spec,
            execution_time,
            created_at: now,
            cron_expression: Some(cron_expression.to_string()),
        });
        info!(schedule_id = %id, cron = cron_expression, %execution_time, "Recurring task scheduled");
        Ok(id)
    }

    /// Remove an entry. Returns whether one was there.
    pub fn cancel_scheduled_task(&self, id: Uuid) -> bool {
        let mut entries = self.entries.lock();
        let seq = entries.iter().find(|(_, e)| e.id == id).map(|(seq, _)| *seq);
        seq.and_then(|seq| entries.remove(&seq)).is_some()
    }

    /// Pending entries in creation order.
    pub fn list_scheduled_tasks(&self) -> Vec<ScheduledTask> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Queue every entry due at `now`. Returns the ids of the created tasks.
    ///
    /// One-shot entries leave the table when selected. Recurring entries stay
    /// and are re-armed under the same lock, so a cancel never races the
    /// promotion.
    pub fn promote_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<ScheduledTask> = {
            let mut entries = self.entries.lock();
            let seqs: Vec<u64> = entries
                .iter()
                .filter(|(_, e)| e.execution_time <= now)
                .map(|(seq, _)| *seq)
                .collect();
            let mut due = Vec::with_capacity(seqs.len());
            for seq in seqs {
                let Some(entry) = entries.get_mut(&seq) else {
                    continue;
                };
                let Some(cron_expr) = entry.cron_expression.clone() else {
                    due.extend(entries.remove(&seq));
                    continue;
                };
                due.push(entry.clone());
                match next_fire_time(&cron_expr, now) {
                    Ok(next) => entry.execution_time = next,
                    Err(e) => {
                        warn!(schedule_id = %entry.id, error = %e, "Recurring task has no further runs");
                        entries.remove(&seq);
                    }
                }
            }
            due
        };

        let mut created = Vec::new();
        for entry in due {
            match self.orchestrator.submit(entry.spec, TaskOrigin::Scheduled) {
                Ok(task_id) => {
                    info!(schedule_id = %entry.id, task_id = %task_id, "Scheduled task promoted");
                    created.push(task_id);
                }
                Err(e) => {
                    warn!(schedule_id = %entry.id, error = %e, "Scheduled task could not be promoted, dropping");
                }
            }
        }
        created
    }
}

#[async_trait]
impl Tickable for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn tick(&self) -> ConductorResult<()> {
        self.promote_due(self.orchestrator.now());
        Ok(())
    }
}
