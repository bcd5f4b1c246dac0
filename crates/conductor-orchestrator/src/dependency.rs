use crate::engine::Orchestrator;
use crate::runtime::Tickable;
use crate::types::TaskStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why one task waits on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    Completion,
    Data,
    Approval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
    pub dependency_type: DependencyType,
    pub created_at: DateTime<Utc>,
}

/// Outstanding dependency records, keyed by the waiting task.
///
/// A task with any record here is never dispatched.
#[derive(Default)]
pub struct DependencyTable {
    records: Mutex<HashMap<Uuid, Vec<TaskDependency>>>,
    warned: Mutex<HashSet<Uuid>>,
}

impl DependencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an edge unless it would close a cycle.
    pub fn add(&self, dependency: TaskDependency) -> ConductorResult<()> {
        let mut records = self.records.lock();
        if would_cycle(&records, dependency.task_id, dependency.depends_on) {
            return Err(ConductorError::Validation(format!(
                "dependency {} -> {} would create a cycle",
                dependency.task_id, dependency.depends_on
            )));
        }
        let entry = records.entry(dependency.task_id).or_default();
        if !entry.iter().any(|d| d.depends_on == dependency.depends_on) {
            entry.push(dependency);
        }
        Ok(())
    }

    /// Ids of every task that still has records.
    pub fn blocked_ids(&self) -> HashSet<Uuid> {
        self.records.lock().keys().copied().collect()
    }

    /// Every id that appears in a record, on either side.
    pub fn referenced_ids(&self) -> HashSet<Uuid> {
        let records = self.records.lock();
        records
            .iter()
            .flat_map(|(id, deps)| std::iter::once(*id).chain(deps.iter().map(|d| d.depends_on)))
            .collect()
    }

    pub fn is_blocked(&self, task_id: Uuid) -> bool {
        self.records.lock().contains_key(&task_id)
    }

    pub fn snapshot(&self) -> HashMap<Uuid, Vec<TaskDependency>> {
        self.records.lock().clone()
    }

    pub fn dependencies_of(&self, task_id: Uuid) -> Vec<TaskDependency> {
        self.records.lock().get(&task_id).cloned().unwrap_or_default()
    }

    /// Drop every record for `task_id`.
    pub fn release(&self, task_id: Uuid) -> bool {
        self.warned.lock().remove(&task_id);
        self.records.lock().remove(&task_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// True the first time it is called for `task_id`.
    fn first_warning(&self, task_id: Uuid) -> bool {
        self.warned.lock().insert(task_id)
    }
}

/// Whether adding `task_id -> depends_on` would make `depends_on` reach `task_id`.
fn would_cycle(records: &HashMap<Uuid, Vec<TaskDependency>>, task_id: Uuid, depends_on: Uuid) -> bool {
    let mut visited = HashMap::new();
    dfs_reaches(records, depends_on, task_id, &mut visited)
}

fn dfs_reaches(
    records: &HashMap<Uuid, Vec<TaskDependency>>,
    from: Uuid,
    target: Uuid,
    visited: &mut HashMap<Uuid, u8>,
) -> bool {
    if from == target {
        return true;
    }
    match visited.get(&from) {
        Some(1) | Some(2) => return false,
        _ => {}
    }
    visited.insert(from, 1);
    if let Some(deps) = records.get(&from) {
        for dep in deps {
            if dfs_reaches(records, dep.depends_on, target, visited) {
                return true;
            }
        }
    }
    visited.insert(from, 2);
    false
}

/// Releases blocked tasks once everything they wait on has completed.
pub struct DependencyResolver {
    orchestrator: Arc<Orchestrator>,
}

impl DependencyResolver {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Make `task_id` wait for `depends_on`.
    pub fn add_task_dependency(
        &self,
        task_id: Uuid,
        depends_on: Uuid,
        dependency_type: DependencyType,
    ) -> ConductorResult<()> {
        if task_id == depends_on {
            return Err(ConductorError::Validation(format!(
                "task {task_id} cannot depend on itself"
            )));
        }
        self.orchestrator.add_dependency(TaskDependency {
            task_id,
            depends_on,
            dependency_type,
            created_at: self.orchestrator.now(),
        })?;
        info!(task_id = %task_id, depends_on = %depends_on, ?dependency_type, "Dependency added");
        Ok(())
    }

    pub fn dependencies_of(&self, task_id: Uuid) -> Vec<TaskDependency> {
        self.orchestrator.dependencies().dependencies_of(task_id)
    }

    /// Resolve every blocked task once. Returns the ids released.
    pub fn resolve(&self) -> Vec<Uuid> {
        let table = self.orchestrator.dependencies();
        let snapshot = table.snapshot();
        if snapshot.is_empty() {
            return Vec::new();
        }

        let mut ids: Vec<Uuid> = snapshot.keys().copied().collect();
        ids.extend(snapshot.values().flatten().map(|d| d.depends_on));
        let statuses = self.orchestrator.task_statuses(&ids);

        let mut released = Vec::new();
        for (task_id, deps) in snapshot {
            if statuses.get(&task_id) != Some(&TaskStatus::Pending) {
                debug!(task_id = %task_id, "Dependent no longer pending, dropping records");
                table.release(task_id);
                continue;
            }
            let mut all_done = true;
            for dep in &deps {
                match statuses.get(&dep.depends_on) {
                    Some(TaskStatus::Completed) => {}
                    Some(status) if status.is_terminal() => {
                        all_done = false;
                        if table.first_warning(task_id) {
                            warn!(
                                task_id = %task_id,
                                depends_on = %dep.depends_on,
                                status = %status,
                                "Dependency ended without completing; task stays blocked"
                            );
                        }
                    }
                    _ => all_done = false,
                }
            }
            if all_done && table.release(task_id) {
                info!(task_id = %task_id, "Dependencies satisfied, task released");
                released.push(task_id);
            }
        }
        released
    }
}

#[async_trait]
impl Tickable for DependencyResolver {
    fn name(&self) -> &'static str {
        "dependency"
    }

    async fn tick(&self) -> ConductorResult<()> {
        self.resolve();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{TaskKind, TaskOrigin, TaskSpec};
    use conductor_core::AgentType;

    fn edge(task_id: Uuid, depends_on: Uuid) -> TaskDependency {
        TaskDependency {
            task_id,
            depends_on,
            dependency_type: DependencyType::Completion,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_table_blocks_and_releases() {
        let table = DependencyTable::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        table.add(edge(b, a)).unwrap();
        assert!(table.is_blocked(b));
        assert!(!table.is_blocked(a));
        assert!(table.release(b));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_edge_is_ignored() {
        let table = DependencyTable::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        table.add(edge(b, a)).unwrap();
        table.add(edge(b, a)).unwrap();
        assert_eq!(table.dependencies_of(b).len(), 1);
    }

    #[test]
    fn test_cycle_detection() {
        let table = DependencyTable::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        table.add(edge(b, a)).unwrap();
        table.add(edge(c, b)).unwrap();

        let err = table.add(edge(a, c)).unwrap_err();
        assert!(err.is_validation());
        assert!(!table.is_blocked(a));
    }

    #[test]
    fn test_referenced_ids_cover_both_sides() {
        let table = DependencyTable::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        table.add(edge(b, a)).unwrap();
        let ids = table.referenced_ids();
        assert!(ids.contains(&a) && ids.contains(&b));
        assert!(!ids.contains(&c));
    }

    #[tokio::test]
    async fn test_dispatched_task_cannot_start_waiting() {
        let tmp = tempfile::tempdir().unwrap();
        let config = crate::config::OrchestratorConfig::with_data_dir(tmp.path());
        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            Arc::new(conductor_core::ManualClock::starting_now()),
        ));
        let resolver = DependencyResolver::new(orchestrator.clone());
        let submit = |agent, kind| {
            orchestrator
                .submit(TaskSpec::new(agent, kind, "step"), TaskOrigin::Direct)
                .unwrap()
        };
        let y = submit(AgentType::Email, TaskKind::SendEmail);
        let x = submit(AgentType::Sms, TaskKind::SendSms);
        orchestrator.dispatch_once().await.unwrap();

        let err = resolver
            .add_task_dependency(x, y, DependencyType::Completion)
            .unwrap_err();
        assert!(err.is_validation());
        assert!(resolver.dependencies_of(x).is_empty());
        assert!(resolver
            .add_task_dependency(x, Uuid::new_v4(), DependencyType::Data)
            .is_err());

        let z = submit(AgentType::Sms, TaskKind::SendSms);
        resolver
            .add_task_dependency(z, y, DependencyType::Completion)
            .unwrap();
        orchestrator
            .record_completion(AgentType::Sms, x, true, None)
            .await
            .unwrap();
        assert!(orchestrator.dispatch_once().await.unwrap().is_empty());
        assert_eq!(orchestrator.task_status(z), Some(TaskStatus::Pending));
    }

    #[test]
    fn test_warning_fires_once() {
        let table = DependencyTable::new();
        let id = Uuid::new_v4();
        assert!(table.first_warning(id));
        assert!(!table.first_warning(id));
    }
}
