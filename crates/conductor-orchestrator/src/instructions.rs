use crate::types::{Params, Task, TaskKind, TaskPriority, TaskStatus};
use conductor_core::{AgentType, ConductorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// The task fields an agent sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffTask {
    pub id: Uuid,
    pub agent_type: AgentType,
    pub task_type: TaskKind,
    pub description: String,
    pub priority: TaskPriority,
    pub params: Params,
    pub status: TaskStatus,
    pub retry_count: u32,
}

/// What the dispatcher writes for an agent to pick up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub task: HandoffTask,
    pub instruction: String,
}

impl HandoffRecord {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task: HandoffTask {
                id: task.id,
                agent_type: task.agent_type,
                task_type: task.kind,
                description: task.description.clone(),
                priority: task.priority,
                params: task.params.clone(),
                status: task.status,
                retry_count: task.retry_count,
            },
            instruction: render_instruction(task),
        }
    }
}

fn param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// Free-form instruction text for a task, chosen by its kind.
pub fn render_instruction(task: &Task) -> String {
    let p = &task.params;
    let mut text = match task.kind {
        TaskKind::SendEmail => {
            let to = param(p, "to").unwrap_or("the listed recipients");
            format!("Compose and send an email to {to}: {}", task.description)
        }
        TaskKind::SendSms => {
            let to = param(p, "to").unwrap_or("the listed numbers");
            format!("Send a text message to {to}: {}", task.description)
        }
        TaskKind::PlaceCall => {
            let to = param(p, "to").unwrap_or("the listed contact");
            format!("Place a voice call to {to}. Purpose: {}", task.description)
        }
        TaskKind::AnalyzeMessage => format!(
            "Analyze the inbound message and classify intent and urgency: {}",
            task.description
        ),
        TaskKind::GenerateReport => {
            let period = param(p, "period").unwrap_or("the current period");
            format!("Generate a report covering {period}: {}", task.description)
        }
        TaskKind::Deploy => {
            let service = param(p, "service").unwrap_or("the target service");
            let version = param(p, "version").unwrap_or("latest");
            format!(
                "Deploy {service} at version {version}. Acquire the deployment lock first. {}",
                task.description
            )
        }
        TaskKind::HealthCheck => {
            let service = param(p, "service").unwrap_or("all services");
            format!("Run health checks against {service}: {}", task.description)
        }
        TaskKind::CollectMetrics => format!("Collect and publish metrics: {}", task.description),
        TaskKind::Coordinate => format!(
            "Coordinate with the other agents over the bus: {}",
            task.description
        ),
    };
    if task.priority >= TaskPriority::High {
        text.push_str(" Treat this as urgent.");
    }
    if task.retry_count > 0 {
        text.push_str(&format!(" This is retry {} of {}.", task.retry_count, task.max_retries));
    }
    text.push_str(&format!(
        " When done, write a completion marker named {}_{}.json.",
        task.agent_type, task.id
    ));
    text
}

/// Writes hand-off records to `<dir>/<agent>/<task_id>.json`.
pub struct HandoffWriter {
    dir: PathBuf,
}

impl HandoffWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, agent: AgentType, task_id: Uuid) -> PathBuf {
        self.dir.join(agent.as_str()).join(format!("{task_id}.json"))
    }

    /// Write the record for `task`, replacing any earlier one atomically.
    pub async fn write(&self, task: &Task) -> ConductorResult<PathBuf> {
        let record = HandoffRecord::for_task(task);
        let path = self.path_for(task.agent_type, task.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(task_id = %task.id, agent = %task.agent_type, path = %path.display(), "Hand-off written");
        Ok(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{TaskOrigin, TaskSpec};
    use chrono::Utc;

    fn deploy_task() -> Task {
        let spec = TaskSpec::new(AgentType::Deployment, TaskKind::Deploy, "Roll out billing")
            .with_param("service", serde_json::json!("billing"))
            .with_param("version", serde_json::json!("2.4.1"))
            .with_priority(TaskPriority::Critical);
        Task::from_spec(spec, TaskOrigin::Direct, 3, Utc::now())
    }

    #[test]
    fn test_instruction_uses_params() {
        let text = render_instruction(&deploy_task());
        assert!(text.contains("billing"));
        assert!(text.contains("2.4.1"));
        assert!(text.contains("urgent"));
        assert!(text.contains("deployment_"));
    }

    #[test]
    fn test_every_kind_renders() {
        for kind in TaskKind::ALL {
            let task = Task::from_spec(
                TaskSpec::new(AgentType::Analysis, kind, "something"),
                TaskOrigin::Direct,
                3,
                Utc::now(),
            );
            assert!(render_instruction(&task).contains("something"));
        }
    }

    #[tokio::test]
    async fn test_writer_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = HandoffWriter::new(tmp.path().join("tasks"));
        let task = deploy_task();
        let path = writer.write(&task).await.unwrap();

        assert_eq!(
            path,
            tmp.path()
                .join("tasks")
                .join("deployment")
                .join(format!("{}.json", task.id))
        );
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["task"]["task_type"], "deploy");
        assert_eq!(json["task"]["agent_type"], "deployment");
        assert_eq!(json["task"]["params"]["service"], "billing");
        assert!(json["instruction"].as_str().unwrap().starts_with("Deploy billing"));
    }
}
