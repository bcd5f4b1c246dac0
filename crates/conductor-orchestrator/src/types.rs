use chrono::{DateTime, Utc};
use conductor_core::{AgentType, ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Task parameters, kept sorted so hand-off records are stable.
pub type Params = BTreeMap<String, serde_json::Value>;

/// What a task asks an agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Compose and send an email.
    SendEmail,
    /// Send a text message.
    SendSms,
    /// Place a voice call.
    PlaceCall,
    /// Triage an inbound message.
    AnalyzeMessage,
    /// Produce a report.
    GenerateReport,
    /// Roll out a release.
    Deploy,
    /// Probe a service.
    HealthCheck,
    /// Gather metrics.
    CollectMetrics,
    /// Sequence work with other agents.
    Coordinate,
}

impl TaskKind {
    /// Every kind, in a stable order.
    pub const ALL: [TaskKind; 9] = [
        TaskKind::SendEmail,
        TaskKind::SendSms,
        TaskKind::PlaceCall,
        TaskKind::AnalyzeMessage,
        TaskKind::GenerateReport,
        TaskKind::Deploy,
        TaskKind::HealthCheck,
        TaskKind::CollectMetrics,
        TaskKind::Coordinate,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SendEmail => "send_email",
            TaskKind::SendSms => "send_sms",
            TaskKind::PlaceCall => "place_call",
            TaskKind::AnalyzeMessage => "analyze_message",
            TaskKind::GenerateReport => "generate_report",
            TaskKind::Deploy => "deploy",
            TaskKind::HealthCheck => "health_check",
            TaskKind::CollectMetrics => "collect_metrics",
            TaskKind::Coordinate => "coordinate",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ConductorError;

    fn from_str(s: &str) -> ConductorResult<Self> {
        let name = s.trim().to_ascii_lowercase();
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == name)
            .ok_or_else(|| ConductorError::Validation(format!("unknown task type '{s}'")))
    }
}

/// Task urgency.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl FromStr for TaskPriority {
    type Err = ConductorError;

    fn from_str(s: &str) -> ConductorResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(ConductorError::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// Status of a task. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, not yet handed to an agent.
    Pending,
    /// Handed to an agent.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with a failure result.
    Failed,
    /// Withdrawn before finishing.
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Cancelled)
        )
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOrigin {
    Direct,
    Scheduled,
    Conditional,
    Batch,
    Workflow,
    Template,
    Retry,
}

/// Everything needed to create a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub agent_type: AgentType,
    #[serde(rename = "task_type")]
    pub kind: TaskKind,
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub params: Params,
}

impl TaskSpec {
    pub fn new(agent_type: AgentType, kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            agent_type,
            kind,
            description: description.into(),
            priority: TaskPriority::default(),
            params: Params::new(),
        }
    }

    /// Build a spec from untyped names, as collaborators send them.
    pub fn parse(
        agent_type: &str,
        task_type: &str,
        description: &str,
        priority: TaskPriority,
        params: Params,
    ) -> ConductorResult<Self> {
        let spec = Self {
            agent_type: agent_type.parse()?,
            kind: task_type.parse()?,
            description: description.to_string(),
            priority,
            params,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Reject specs that could never be dispatched.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.description.trim().is_empty() {
            return Err(ConductorError::Validation(
                "task description is empty".to_string(),
            ));
        }
        if self.params.keys().any(|k| k.trim().is_empty()) {
            return Err(ConductorError::Validation(
                "task params contain an empty key".to_string(),
            ));
        }
        Ok(())
    }
}

/// A live task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent_type: AgentType,
    #[serde(rename = "task_type")]
    pub kind: TaskKind,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub params: Params,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Result payload from the completion marker, if any.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Batch this task belongs to.
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    pub origin: TaskOrigin,
}

impl Task {
    pub fn from_spec(spec: TaskSpec, origin: TaskOrigin, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_type: spec.agent_type,
            kind: spec.kind,
            description: spec.description,
            priority: spec.priority,
            status: TaskStatus::Pending,
            params: spec.params,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            result: None,
            batch_id: None,
            origin,
        }
    }

    /// The spec this task was created from.
    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            agent_type: self.agent_type,
            kind: self.kind,
            description: self.description.clone(),
            priority: self.priority,
            params: self.params.clone(),
        }
    }

    /// Move to `next`, or fail without changing anything.
    pub fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> ConductorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ConductorError::InvalidTransition {
                task_id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        match next {
            TaskStatus::InProgress => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        Ok(())
    }
}

/// Availability of an agent for new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

/// Real-time snapshot of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub current_task: Option<Uuid>,
    pub last_task: Option<Uuid>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_active: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn idle(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            status: AgentStatus::Idle,
            current_task: None,
            last_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            last_active: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::from_spec(
            TaskSpec::new(AgentType::Email, TaskKind::SendEmail, "Send welcome email"),
            TaskOrigin::Direct,
            3,
            Utc::now(),
        )
    }

    #[test]
    fn test_task_creation() {
        let task = task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.agent_type, AgentType::Email);
        assert_eq!(task.retry_count, 0);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_forward_transitions() {
        let mut task = task();
        task.transition(TaskStatus::InProgress, Utc::now()).unwrap();
        assert!(task.started_at.is_some());
        task.transition(TaskStatus::Completed, Utc::now()).unwrap();
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut task = task();
        task.transition(TaskStatus::InProgress, Utc::now()).unwrap();
        task.transition(TaskStatus::Failed, Utc::now()).unwrap();
        let err = task.transition(TaskStatus::Pending, Utc::now()).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn test_pending_cannot_skip_to_completed() {
        let mut task = task();
        assert!(task.transition(TaskStatus::Completed, Utc::now()).is_err());
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_cancel_from_pending_and_in_progress() {
        let mut a = task();
        a.transition(TaskStatus::Cancelled, Utc::now()).unwrap();
        let mut b = task();
        b.transition(TaskStatus::InProgress, Utc::now()).unwrap();
        b.transition(TaskStatus::Cancelled, Utc::now()).unwrap();
        assert!(b.transition(TaskStatus::Cancelled, Utc::now()).is_err());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("health_check".parse::<TaskKind>().unwrap(), TaskKind::HealthCheck);
        assert!("make_coffee".parse::<TaskKind>().unwrap_err().is_validation());
    }

    #[test]
    fn test_spec_parse_validates_roster() {
        let err = TaskSpec::parse("fax", "send_email", "x", TaskPriority::Low, Params::new())
            .unwrap_err();
        assert!(err.is_validation());
        let err = TaskSpec::parse("email", "send_email", "  ", TaskPriority::Low, Params::new())
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_task_serializes_task_type() {
        let json = serde_json::to_value(task()).unwrap();
        assert_eq!(json["task_type"], "send_email");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["priority"], "medium");
    }
}
