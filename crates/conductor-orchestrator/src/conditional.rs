use crate::engine::Orchestrator;
use crate::runtime::Tickable;
use crate::types::{TaskOrigin, TaskSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A predicate checked periodically until it holds.
#[async_trait]
pub trait Condition: Send + Sync {
    async fn evaluate(&self) -> ConductorResult<bool>;
}

/// Adapts an async closure into a [`Condition`].
pub struct FnCondition<F>(F);

#[async_trait]
impl<F, Fut> Condition for FnCondition<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConductorResult<bool>> + Send + 'static,
{
    async fn evaluate(&self) -> ConductorResult<bool> {
        (self.0)().await
    }
}

/// Wrap `f` so it can be passed where a [`Condition`] is expected.
pub fn condition_fn<F, Fut>(f: F) -> Arc<dyn Condition>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConductorResult<bool>> + Send + 'static,
{
    Arc::new(FnCondition(f))
}

/// A task waiting for its predicate.
#[derive(Clone)]
pub struct ConditionalTask {
    pub id: Uuid,
    pub spec: TaskSpec,
    pub predicate: Arc<dyn Condition>,
    pub condition_description: String,
    pub check_interval: Duration,
    pub last_check: Option<DateTime<Utc>>,
    pub check_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Serializable view of a [`ConditionalTask`].
#[derive(Debug, Clone, Serialize)]
pub struct ConditionalTaskInfo {
    pub id: Uuid,
    pub spec: TaskSpec,
    pub condition_description: String,
    pub check_interval_secs: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub check_count: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&ConditionalTask> for ConditionalTaskInfo {
    fn from(task: &ConditionalTask) -> Self {
        Self {
            id: task.id,
            spec: task.spec.clone(),
            condition_description: task.condition_description.clone(),
            check_interval_secs: task.check_interval.as_secs(),
            last_check: task.last_check,
            check_count: task.check_count,
            created_at: task.created_at,
        }
    }
}

impl ConditionalTask {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_check {
            None => true,
            Some(last) => (now - last).to_std().is_ok_and(|elapsed| elapsed >= self.check_interval),
        }
    }
}

/// Promotes tasks once their predicate evaluates to true.
pub struct ConditionalMonitor {
    orchestrator: Arc<Orchestrator>,
    entries: Mutex<BTreeMap<Uuid, ConditionalTask>>,
}

impl ConditionalMonitor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Hold `spec` until `predicate` is true, checking every `check_interval`.
    pub fn create_conditional_task(
        &self,
        spec: TaskSpec,
        predicate: Arc<dyn Condition>,
        condition_description: &str,
        check_interval: Duration,
    ) -> ConductorResult<Uuid> {
        spec.validate()?;
        let entry = ConditionalTask {
            id: Uuid::new_v4(),
            spec,
            predicate,
            condition_description: condition_description.to_string(),
            check_interval,
            last_check: None,
            check_count: 0,
            created_at: self.orchestrator.now(),
        };
        let id = entry.id;
        self.entries.lock().insert(id, entry);
        info!(condition_id = %id, condition = condition_description, "Conditional task registered");
        Ok(id)
    }

    /// Remove an entry. Returns whether one was there.
    pub fn cancel_conditional_task(&self, id: Uuid) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    pub fn list_conditional_tasks(&self) -> Vec<ConditionalTaskInfo> {
        self.entries.lock().values().map(ConditionalTaskInfo::from).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Evaluate every entry due at `now`. Returns the ids of created tasks.
    pub async fn check_conditions(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<(Uuid, Arc<dyn Condition>)> = {
            let mut entries = self.entries.lock();
            entries
                .values_mut()
                .filter(|e| e.is_due(now))
                .map(|e| {
                    e.last_check = Some(now);
                    e.check_count += 1;
                    (e.id, Arc::clone(&e.predicate))
                })
                .collect()
        };

        let mut created = Vec::new();
        for (id, predicate) in due {
            match predicate.evaluate().await {
                Ok(true) => {
                    let Some(entry) = self.entries.lock().remove(&id) else {
                        debug!(condition_id = %id, "Entry cancelled during evaluation");
                        continue;
                    };
                    match self.orchestrator.submit(entry.spec, TaskOrigin::Conditional) {
                        Ok(task_id) => {
                            info!(condition_id = %id, task_id = %task_id, checks = entry.check_count, "Condition met, task promoted");
                            created.push(task_id);
                        }
                        Err(e) => warn!(condition_id = %id, error = %e, "Condition met but task could not be created"),
                    }
                }
                Ok(false) => debug!(condition_id = %id, "Condition not met yet"),
                Err(e) => {
                    let e = if matches!(e, ConductorError::Condition(_)) {
                        e
                    } else {
                        ConductorError::Condition(e.to_string())
                    };
                    warn!(condition_id = %id, error = %e, "Condition check failed, will retry");
                }
            }
        }
        created
    }
}

#[async_trait]
impl Tickable for ConditionalMonitor {
    fn name(&self) -> &'static str {
        "conditional"
    }

    async fn tick(&self) -> ConductorResult<()> {
        self.check_conditions(self.orchestrator.now()).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::types::TaskKind;
    use conductor_core::{AgentType, Clock, ManualClock};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn setup(dir: &std::path::Path) -> (Arc<Orchestrator>, ConditionalMonitor, ManualClock) {
        let clock = ManualClock::starting_now();
        let orch = Arc::new(Orchestrator::new(
            &OrchestratorConfig::with_data_dir(dir),
            Arc::new(clock.clone()),
        ));
        (orch.clone(), ConditionalMonitor::new(orch), clock)
    }

    fn spec() -> TaskSpec {
        TaskSpec::new(AgentType::Monitoring, TaskKind::HealthCheck, "Probe after recovery")
    }

    #[tokio::test]
    async fn test_promotes_when_condition_holds() {
        let tmp = tempfile::tempdir().unwrap();
        let (orch, monitor, clock) = setup(tmp.path());
        let flag = Arc::new(AtomicBool::new(false));
        let seen = flag.clone();
        let id = monitor
            .create_conditional_task(
                spec(),
                condition_fn(move || {
                    let seen = seen.clone();
                    async move { Ok(seen.load(Ordering::SeqCst)) }
                }),
                "service recovered",
                Duration::from_secs(60),
            )
            .unwrap();

        assert!(monitor.check_conditions(clock.now()).await.is_empty());
        assert_eq!(monitor.list_conditional_tasks()[0].check_count, 1);

        flag.store(true, Ordering::SeqCst);
        // Not due again until the interval passes.
        clock.advance(chrono::Duration::seconds(30));
        assert!(monitor.check_conditions(clock.now()).await.is_empty());

        clock.advance(chrono::Duration::seconds(30));
        let created = monitor.check_conditions(clock.now()).await;
        assert_eq!(created.len(), 1);
        assert!(!monitor.cancel_conditional_task(id));
        assert_eq!(orch.get_task(created[0]).unwrap().origin, TaskOrigin::Conditional);
    }

    #[tokio::test]
    async fn test_error_keeps_entry_and_updates_last_check() {
        let tmp = tempfile::tempdir().unwrap();
        let (_orch, monitor, clock) = setup(tmp.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        monitor
            .create_conditional_task(
                spec(),
                condition_fn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(ConductorError::Condition("probe timed out".into())) }
                }),
                "probe",
                Duration::from_secs(10),
            )
            .unwrap();

        let now = clock.now();
        assert!(monitor.check_conditions(now).await.is_empty());
        let entries = monitor.list_conditional_tasks();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].last_check, Some(now));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let (_orch, monitor, _clock) = setup(tmp.path());
        let id = monitor
            .create_conditional_task(
                spec(),
                condition_fn(|| async { Ok(true) }),
                "always",
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(monitor.cancel_conditional_task(id));
        assert!(!monitor.cancel_conditional_task(id));
        assert!(monitor.is_empty());
    }
}
