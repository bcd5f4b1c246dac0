use crate::types::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use conductor_core::{AgentType, ConductorError, ConductorResult};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// All live tasks plus one FIFO queue per agent.
///
/// Queues hold ids only; the task itself lives in `tasks`. Tasks removed by
/// cleanup leave their final status behind in `archived` so dependency
/// checks can still resolve them.
pub struct TaskRegistry {
    tasks: HashMap<Uuid, Task>,
    queues: HashMap<AgentType, VecDeque<Uuid>>,
    archived: HashMap<Uuid, TaskStatus>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            queues: HashMap::new(),
            archived: HashMap::new(),
        }
    }

    /// Store a task and append it to its agent's queue.
    pub fn add(&mut self, task: Task) -> Uuid {
        let id = task.id;
        self.queues.entry(task.agent_type).or_default().push_back(id);
        self.tasks.insert(id, task);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.tasks.contains_key(&id) || self.archived.contains_key(&id)
    }

    /// Current status, including tasks already archived.
    pub fn status_of(&self, id: Uuid) -> Option<TaskStatus> {
        self.tasks
            .get(&id)
            .map(|t| t.status)
            .or_else(|| self.archived.get(&id).copied())
    }

    /// Pop the first pending task for `agent` that is not in `blocked`.
    ///
    /// Blocked tasks keep their position. Ids that are no longer pending
    /// (cancelled, or gone) are dropped from the queue on the way.
    pub fn next_dispatchable(&mut self, agent: AgentType, blocked: &HashSet<Uuid>) -> Option<Uuid> {
        let queue = self.queues.get_mut(&agent)?;
        let tasks = &self.tasks;
        queue.retain(|id| tasks.get(id).is_some_and(|t| t.status == TaskStatus::Pending));
        let pos = queue.iter().position(|id| !blocked.contains(id))?;
        queue.remove(pos)
    }

    /// Put a task back at the head of its agent's queue.
    pub fn requeue_front(&mut self, id: Uuid) {
        if let Some(task) = self.tasks.get(&id) {
            let queue = self.queues.entry(task.agent_type).or_default();
            if !queue.contains(&id) {
                queue.push_front(id);
            }
        }
    }

    /// Apply a forward-only status change.
    pub fn transition(&mut self, id: Uuid, next: TaskStatus, now: DateTime<Utc>) -> ConductorResult<&Task> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| ConductorError::NotFound(format!("task {id}")))?;
        task.transition(next, now)?;
        Ok(task)
    }

    /// Undo a dispatch that never reached the agent.
    pub fn revert_dispatch(&mut self, id: Uuid, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.updated_at = now;
            }
        }
        self.requeue_front(id);
    }

    pub fn remove_from_queue(&mut self, id: Uuid) {
        if let Some(task) = self.tasks.get(&id) {
            if let Some(queue) = self.queues.get_mut(&task.agent_type) {
                queue.retain(|queued| *queued != id);
            }
        }
    }

    /// Queue length per agent, covering the whole roster.
    pub fn queue_depths(&self) -> BTreeMap<AgentType, usize> {
        AgentType::ALL
            .into_iter()
            .map(|agent| (agent, self.queues.get(&agent).map_or(0, VecDeque::len)))
            .collect()
    }

    /// Number of live tasks per status.
    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    /// All live tasks, oldest first.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Terminal tasks last updated before `cutoff`.
    pub fn terminal_tasks_before(&self, cutoff: DateTime<Utc>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Drop terminal tasks from the live set, remembering their status.
    pub fn forget_tasks(&mut self, ids: &[Uuid]) -> usize {
        let mut removed = 0;
        for id in ids {
            let terminal = self.tasks.get(id).is_some_and(|t| t.status.is_terminal());
            if !terminal {
                continue;
            }
            if let Some(task) = self.tasks.remove(id) {
                self.archived.insert(*id, task.status);
                removed += 1;
            }
        }
        removed
    }

    /// Forget archived statuses whose ids are not in `keep`.
    pub fn prune_archived(&mut self, keep: &HashSet<Uuid>) -> usize {
        let before = self.archived.len();
        self.archived.retain(|id, _| keep.contains(id));
        before - self.archived.len()
    }

    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }

    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
