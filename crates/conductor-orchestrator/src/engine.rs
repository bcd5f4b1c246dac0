use crate::config::OrchestratorConfig;
use crate::dependency::{DependencyTable, TaskDependency};
use crate::instructions::HandoffWriter;
use crate::monitor::AgentMonitor;
use crate::runtime::Tickable;
use crate::task_queue::TaskRegistry;
use crate::templates::TemplateRegistry;
use crate::types::{
    AgentState, Params, Task, TaskOrigin, TaskPriority, TaskSpec, TaskStatus,
};
use crate::workflows::{find_workflow, workflow_catalog, WorkflowInfo, WorkflowResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{AgentType, ConductorError, ConductorResult, SharedClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Filter for [`Orchestrator::list_tasks`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub agent_type: Option<AgentType>,
    pub status: Option<TaskStatus>,
    pub batch_id: Option<Uuid>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        self.agent_type.is_none_or(|a| task.agent_type == a)
            && self.status.is_none_or(|s| task.status == s)
            && self.batch_id.is_none_or(|b| task.batch_id == Some(b))
    }
}

/// Aggregate view of the whole system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemOverview {
    pub generated_at: DateTime<Utc>,
    pub agents: Vec<AgentState>,
    pub queue_depths: BTreeMap<AgentType, usize>,
    pub task_counts: BTreeMap<TaskStatus, usize>,
    pub workflows: Vec<WorkflowInfo>,
    pub templates: Vec<String>,
    pub blocked_tasks: usize,
    pub scheduled_tasks: usize,
    pub conditional_tasks: usize,
    pub batches: usize,
}

/// What a completion did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionEffect {
    /// The task moved to this terminal status.
    Applied(TaskStatus),
    /// The task was already terminal; only the agent counters changed.
    AlreadyTerminal(TaskStatus),
    /// The task is not known here.
    UnknownTask,
}

/// Owns every task and hands them to agents.
pub struct Orchestrator {
    registry: Mutex<TaskRegistry>,
    dependencies: DependencyTable,
    monitor: Arc<AgentMonitor>,
    templates: TemplateRegistry,
    handoff: HandoffWriter,
    clock: SharedClock,
    default_max_retries: u32,
}

impl Orchestrator {
    pub fn new(config: &OrchestratorConfig, clock: SharedClock) -> Self {
        Self {
            registry: Mutex::new(TaskRegistry::new()),
            dependencies: DependencyTable::new(),
            monitor: Arc::new(AgentMonitor::new()),
            templates: TemplateRegistry::new(),
            handoff: HandoffWriter::new(config.tasks_dir()),
            clock,
            default_max_retries: config.limits.default_max_retries,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    pub fn dependencies(&self) -> &DependencyTable {
        &self.dependencies
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn handoff_dir(&self) -> &Path {
        self.handoff.dir()
    }

    /// Create a task from untyped names and queue it for its agent.
    pub fn create_task(
        &self,
        agent_type: &str,
        task_type: &str,
        description: &str,
        priority: TaskPriority,
        params: Params,
    ) -> ConductorResult<Uuid> {
        let spec = TaskSpec::parse(agent_type, task_type, description, priority, params)?;
        self.submit(spec, TaskOrigin::Direct)
    }

    /// Validate and queue a spec.
    pub fn submit(&self, spec: TaskSpec, origin: TaskOrigin) -> ConductorResult<Uuid> {
        let task = self.new_task(spec, origin)?;
        Ok(self.insert(task))
    }

    pub(crate) fn new_task(&self, spec: TaskSpec, origin: TaskOrigin) -> ConductorResult<Task> {
        spec.validate()?;
        Ok(Task::from_spec(spec, origin, self.default_max_retries, self.now()))
    }

    pub(crate) fn insert(&self, task: Task) -> Uuid {
        let (id, agent, kind, origin) = (task.id, task.agent_type, task.kind, task.origin);
        self.registry.lock().add(task);
        info!(task_id = %id, agent = %agent, task_type = %kind, ?origin, "Task queued");
        id
    }

    pub fn get_task(&self, id: Uuid) -> Option<Task> {
        self.registry.lock().get(id).cloned()
    }

    /// Matching live tasks, oldest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.registry
            .lock()
            .all_tasks()
            .into_iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    /// Status of a task, including ones already archived.
    pub fn task_status(&self, id: Uuid) -> Option<TaskStatus> {
        self.registry.lock().status_of(id)
    }

    /// Statuses for `ids` under one registry lock. Unknown ids are omitted.
    pub fn task_statuses(&self, ids: &[Uuid]) -> HashMap<Uuid, TaskStatus> {
        let registry = self.registry.lock();
        ids.iter()
            .filter_map(|id| registry.status_of(*id).map(|s| (*id, s)))
            .collect()
    }

    /// Record that `dependency.task_id` waits on `dependency.depends_on`.
    ///
    /// Only a pending dependent can be held back. The status check and the
    /// insert happen under the registry lock, which dispatch also holds while
    /// it reads the blocked set.
    pub fn add_dependency(&self, dependency: TaskDependency) -> ConductorResult<()> {
        let registry = self.registry.lock();
        match registry.status_of(dependency.task_id) {
            None => {
                return Err(ConductorError::NotFound(format!("task {}", dependency.task_id)));
            }
            Some(TaskStatus::Pending) => {}
            Some(status) => {
                return Err(ConductorError::Validation(format!(
                    "task {} is {status}, only pending tasks can wait on others",
                    dependency.task_id
                )));
            }
        }
        if !registry.contains(dependency.depends_on) {
            return Err(ConductorError::NotFound(format!("task {}", dependency.depends_on)));
        }
        self.dependencies.add(dependency)
    }

    /// Hand at most one task to each idle agent. Returns the dispatched ids.
    pub async fn dispatch_once(&self) -> ConductorResult<Vec<Uuid>> {
        let mut dispatched = Vec::new();
        for agent in AgentType::ALL {
            if !self.monitor.is_idle(agent).await {
                continue;
            }
            let now = self.now();
            let task = {
                let mut registry = self.registry.lock();
                let blocked = self.dependencies.blocked_ids();
                let Some(id) = registry.next_dispatchable(agent, &blocked) else {
                    continue;
                };
                registry.transition(id, TaskStatus::InProgress, now)?.clone()
            };

            match self.handoff.write(&task).await {
                Ok(_) => {
                    self.monitor.start_task(agent, task.id, now).await;
                    info!(task_id = %task.id, agent = %agent, "Task dispatched");
                    dispatched.push(task.id);
                }
                Err(e) => {
                    warn!(task_id = %task.id, agent = %agent, error = %e, "Hand-off failed, task requeued");
                    self.registry.lock().revert_dispatch(task.id, self.now());
                }
            }
        }
        Ok(dispatched)
    }

    /// Withdraw a pending or in-progress task.
    ///
    /// A task already handed to its agent is only marked cancelled here; the
    /// agent is freed for new work.
    pub async fn cancel_task(&self, id: Uuid) -> ConductorResult<Task> {
        let now = self.now();
        let (task, was_running) = {
            let mut registry = self.registry.lock();
            let was_running = registry
                .get(id)
                .ok_or_else(|| ConductorError::NotFound(format!("task {id}")))?
                .status
                == TaskStatus::InProgress;
            registry.remove_from_queue(id);
            let task = registry.transition(id, TaskStatus::Cancelled, now)?.clone();
            (task, was_running)
        };
        if was_running {
            self.monitor.release_task(task.agent_type, id).await;
        }
        info!(task_id = %id, agent = %task.agent_type, "Task cancelled");
        Ok(task)
    }

    /// Resubmit a failed task as a new one with its retry count bumped.
    pub fn retry_task(&self, id: Uuid) -> ConductorResult<Uuid> {
        let original = self
            .get_task(id)
            .ok_or_else(|| ConductorError::NotFound(format!("task {id}")))?;
        if original.status != TaskStatus::Failed {
            return Err(ConductorError::Validation(format!(
                "task {id} is {}, only failed tasks can be retried",
                original.status
            )));
        }
        if original.retry_count >= original.max_retries {
            return Err(ConductorError::Validation(format!(
                "task {id} reached its retry limit of {}",
                original.max_retries
            )));
        }
        let mut task = Task::from_spec(
            original.spec(),
            TaskOrigin::Retry,
            original.max_retries,
            self.now(),
        );
        task.retry_count = original.retry_count + 1;
        task.batch_id = original.batch_id;
        info!(task_id = %task.id, retry_of = %id, retry = task.retry_count, "Retrying task");
        Ok(self.insert(task))
    }

    /// Poll until every task in `ids` is terminal or `max_wait` runs out.
    ///
    /// Returns the last seen status of each id; `None` for unknown ids.
    pub async fn wait_for_tasks(
        &self,
        ids: &[Uuid],
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Vec<(Uuid, Option<TaskStatus>)> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let statuses = self.task_statuses(ids);
            let snapshot: Vec<(Uuid, Option<TaskStatus>)> =
                ids.iter().map(|id| (*id, statuses.get(id).copied())).collect();
            let all_done = snapshot
                .iter()
                .all(|(_, s)| s.is_none_or(|s| s.is_terminal()));
            let now = tokio::time::Instant::now();
            if all_done || now >= deadline {
                if !all_done {
                    debug!(tasks = ids.len(), "Wait ended before all tasks finished");
                }
                return snapshot;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Run a catalog workflow, creating one task per step.
    pub fn execute_workflow(&self, name: &str, params: Params) -> ConductorResult<WorkflowResult> {
        let workflow = find_workflow(name)?;
        let specs = workflow.plan(&params)?;
        let started_at = self.now();

        let mut task_ids = Vec::with_capacity(specs.len());
        let mut error = None;
        for spec in specs {
            match self.submit(spec, TaskOrigin::Workflow) {
                Ok(id) => task_ids.push(id),
                Err(e) => {
                    warn!(workflow = name, error = %e, "Workflow step failed");
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let result = WorkflowResult {
            workflow: name.to_string(),
            success: error.is_none(),
            task_ids,
            started_at,
            completed_at: self.now(),
            error,
        };
        info!(workflow = name, tasks = result.task_ids.len(), success = result.success, "Workflow executed");
        Ok(result)
    }

    /// Create a task from a registered template.
    pub fn create_task_from_template(
        &self,
        template: &str,
        agent_type: &str,
        params: Params,
        priority: Option<TaskPriority>,
    ) -> ConductorResult<Uuid> {
        let template = self.templates.get(template)?;
        let agent_type: AgentType = agent_type.parse()?;
        let params = template.merge_params(&params)?;
        let description = template.render_description(&params)?;
        let spec = TaskSpec {
            agent_type,
            kind: template.kind,
            description,
            priority: priority.unwrap_or(template.priority),
            params,
        };
        self.submit(spec, TaskOrigin::Template)
    }

    /// Apply a completion reported by `agent` for `task_id`.
    ///
    /// A task still pending is moved through in_progress first. The agent's
    /// counters change whatever state the task is in.
    pub async fn record_completion(
        &self,
        agent: AgentType,
        task_id: Uuid,
        success: bool,
        result: Option<serde_json::Value>,
    ) -> ConductorResult<CompletionEffect> {
        let now = self.now();
        let target = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let effect = {
            let mut registry = self.registry.lock();
            let current = registry.get(task_id).map(|t| (t.status, t.agent_type));
            match current {
                None => CompletionEffect::UnknownTask,
                Some((_, owner)) if owner != agent => {
                    return Err(ConductorError::Validation(format!(
                        "task {task_id} belongs to {owner}, not {agent}"
                    )));
                }
                Some((status, _)) if status.is_terminal() => {
                    CompletionEffect::AlreadyTerminal(status)
                }
                Some((status, _)) => {
                    if status == TaskStatus::Pending {
                        registry.remove_from_queue(task_id);
                        registry.transition(task_id, TaskStatus::InProgress, now)?;
                    }
                    registry.transition(task_id, target, now)?;
                    if let Some(task) = registry.get_mut(task_id) {
                        task.result = result;
                    }
                    CompletionEffect::Applied(target)
                }
            }
        };
        self.monitor.finish_task(agent, task_id, success, now).await;
        match effect {
            CompletionEffect::Applied(status) => {
                info!(task_id = %task_id, agent = %agent, status = %status, "Task finished")
            }
            other => warn!(task_id = %task_id, agent = %agent, ?other, "Completion for a task not in flight"),
        }
        Ok(effect)
    }

    /// Terminal tasks last touched before `cutoff`.
    pub fn terminal_tasks_before(&self, cutoff: DateTime<Utc>) -> Vec<Task> {
        self.registry.lock().terminal_tasks_before(cutoff)
    }

    /// Remove archived tasks from the live set.
    pub fn forget_tasks(&self, ids: &[Uuid]) -> usize {
        self.registry.lock().forget_tasks(ids)
    }

    /// Drop remembered statuses of archived tasks no dependency refers to.
    pub fn prune_archived(&self) -> usize {
        let mut registry = self.registry.lock();
        let referenced = self.dependencies.referenced_ids();
        registry.prune_archived(&referenced)
    }

    /// Per-agent state, queues, catalog and task totals.
    ///
    /// Counts owned by other components are left at zero; the
    /// [`crate::Conductor`] context fills them in.
    pub async fn get_system_overview(&self) -> SystemOverview {
        let agents = self.monitor.snapshot().await;
        let (queue_depths, task_counts) = {
            let registry = self.registry.lock();
            (registry.queue_depths(), registry.status_counts())
        };
        SystemOverview {
            generated_at: self.now(),
            agents,
            queue_depths,
            task_counts,
            workflows: workflow_catalog(),
            templates: self.templates.names(),
            blocked_tasks: self.dependencies.len(),
            scheduled_tasks: 0,
            conditional_tasks: 0,
            batches: 0,
        }
    }
}

#[async_trait]
impl Tickable for Orchestrator {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn tick(&self) -> ConductorResult<()> {
        self.dispatch_once().await?;
        Ok(())
    }
}
