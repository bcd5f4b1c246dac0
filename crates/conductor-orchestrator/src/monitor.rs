use crate::types::{AgentState, AgentStatus};
use chrono::{DateTime, Utc};
use conductor_core::AgentType;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Tracks availability and counters for every agent on the roster.
pub struct AgentMonitor {
    states: Arc<RwLock<HashMap<AgentType, AgentState>>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        let states = AgentType::ALL
            .into_iter()
            .map(|agent| (agent, AgentState::idle(agent)))
            .collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// Mark an agent as busy with a task.
    pub async fn start_task(&self, agent: AgentType, task_id: Uuid, now: DateTime<Utc>) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&agent) {
            state.current_task = Some(task_id);
            state.status = AgentStatus::Busy;
            state.last_active = Some(now);
        }
    }

    /// Record the outcome of a task and make the agent idle again.
    ///
    /// The agent only goes idle if `task_id` is the task it is busy with; a
    /// late marker for an older task still counts but leaves the current
    /// assignment alone.
    pub async fn finish_task(&self, agent: AgentType, task_id: Uuid, success: bool, now: DateTime<Utc>) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&agent) {
            if success {
                state.tasks_completed += 1;
            } else {
                state.tasks_failed += 1;
            }
            state.last_task = Some(task_id);
            state.last_active = Some(now);
            if state.current_task.is_none() || state.current_task == Some(task_id) {
                state.current_task = None;
                state.status = AgentStatus::Idle;
            }
        }
    }

    /// Release an agent from a task that will never report back.
    pub async fn release_task(&self, agent: AgentType, task_id: Uuid) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&agent) {
            if state.current_task == Some(task_id) {
                state.current_task = None;
                state.status = AgentStatus::Idle;
            }
        }
    }

    pub async fn set_status(&self, agent: AgentType, status: AgentStatus) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&agent) {
            state.status = status;
        }
    }

    pub async fn is_idle(&self, agent: AgentType) -> bool {
        let states = self.states.read().await;
        states
            .get(&agent)
            .is_some_and(|s| s.status == AgentStatus::Idle)
    }

    /// All agent states, in roster order.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        let states = self.states.read().await;
        AgentType::ALL
            .iter()
            .filter_map(|agent| states.get(agent).cloned())
            .collect()
    }

    pub async fn get_state(&self, agent: AgentType) -> Option<AgentState> {
        let states = self.states.read().await;
        states.get(&agent).cloned()
    }

    /// Restore counters and history from a persisted snapshot.
    ///
    /// Assignments are not carried over: every restored agent is idle with
    /// no current task.
    pub async fn restore(&self, saved: Vec<AgentState>) {
        let mut states = self.states.write().await;
        for state in saved {
            states.insert(
                state.agent_type,
                AgentState {
                    status: AgentStatus::Idle,
                    current_task: None,
                    ..state
                },
            );
        }
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let completed: u64 = states.iter().map(|s| s.tasks_completed).sum();
        let failed: u64 = states.iter().map(|s| s.tasks_failed).sum();
        serde_json::json!({
            "agents": states,
            "totals": { "completed": completed, "failed": failed },
        })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}
