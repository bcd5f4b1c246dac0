use crate::templates::render_template;
use crate::types::{Params, TaskKind, TaskPriority, TaskSpec};
use chrono::{DateTime, Utc};
use conductor_core::{AgentType, ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One task a workflow fans out.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowStep {
    pub agent_type: AgentType,
    pub kind: TaskKind,
    pub description: &'static str,
    pub priority: TaskPriority,
}

/// A named multi-agent recipe.
#[derive(Debug, Clone, Copy)]
pub struct Workflow {
    pub name: &'static str,
    pub summary: &'static str,
    pub steps: &'static [WorkflowStep],
}

/// Outcome of [`crate::Orchestrator::execute_workflow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow: String,
    pub success: bool,
    pub task_ids: Vec<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Catalog entry as shown in the system overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub name: String,
    pub summary: String,
    pub agents: Vec<AgentType>,
}

const fn step(
    agent_type: AgentType,
    kind: TaskKind,
    description: &'static str,
    priority: TaskPriority,
) -> WorkflowStep {
    WorkflowStep {
        agent_type,
        kind,
        description,
        priority,
    }
}

pub static WORKFLOWS: &[Workflow] = &[
    Workflow {
        name: "deployment_health_check",
        summary: "Deploy a service, then probe it and collect metrics",
        steps: &[
            step(AgentType::Deployment, TaskKind::Deploy, "Deploy {service}", TaskPriority::High),
            step(AgentType::Deployment, TaskKind::HealthCheck, "Verify {service} after deploy", TaskPriority::High),
            step(AgentType::Monitoring, TaskKind::CollectMetrics, "Collect post-deploy metrics for {service}", TaskPriority::Medium),
        ],
    },
    Workflow {
        name: "incident_response",
        summary: "Alert on-call, notify customers and start an analysis",
        steps: &[
            step(AgentType::Monitoring, TaskKind::HealthCheck, "Assess incident on {service}", TaskPriority::Critical),
            step(AgentType::Voice, TaskKind::PlaceCall, "Page on-call about {service}", TaskPriority::Critical),
            step(AgentType::Email, TaskKind::SendEmail, "Notify customers about {service} incident", TaskPriority::High),
            step(AgentType::Analysis, TaskKind::GenerateReport, "Draft incident timeline for {service}", TaskPriority::Medium),
        ],
    },
    Workflow {
        name: "daily_report",
        summary: "Collect metrics, build the report and email it",
        steps: &[
            step(AgentType::Monitoring, TaskKind::CollectMetrics, "Collect daily metrics", TaskPriority::Low),
            step(AgentType::Analysis, TaskKind::GenerateReport, "Build daily report", TaskPriority::Medium),
            step(AgentType::Email, TaskKind::SendEmail, "Send daily report to {recipients}", TaskPriority::Medium),
        ],
    },
    Workflow {
        name: "customer_followup",
        summary: "Triage a customer message and follow up by email and SMS",
        steps: &[
            step(AgentType::Analysis, TaskKind::AnalyzeMessage, "Triage message from {customer}", TaskPriority::Medium),
            step(AgentType::Email, TaskKind::SendEmail, "Email follow-up to {customer}", TaskPriority::Medium),
            step(AgentType::Sms, TaskKind::SendSms, "SMS follow-up to {customer}", TaskPriority::Low),
        ],
    },
];

pub fn find_workflow(name: &str) -> ConductorResult<&'static Workflow> {
    WORKFLOWS
        .iter()
        .find(|w| w.name == name)
        .ok_or_else(|| ConductorError::Validation(format!("unknown workflow '{name}'")))
}

pub fn workflow_catalog() -> Vec<WorkflowInfo> {
    WORKFLOWS
        .iter()
        .map(|w| WorkflowInfo {
            name: w.name.to_string(),
            summary: w.summary.to_string(),
            agents: w.steps.iter().map(|s| s.agent_type).collect(),
        })
        .collect()
}

impl Workflow {
    /// Render every step against `params` before any task exists.
    pub fn plan(&self, params: &Params) -> ConductorResult<Vec<TaskSpec>> {
        self.steps
            .iter()
            .map(|s| {
                let description = render_template(s.description, params).map_err(|missing| {
                    ConductorError::Validation(format!(
                        "workflow '{}' needs params: {}",
                        self.name,
                        missing.join(", ")
                    ))
                })?;
                let mut spec = TaskSpec::new(s.agent_type, s.kind, description)
                    .with_priority(s.priority);
                spec.params = params.clone();
                Ok(spec)
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_workflow() {
        assert!(find_workflow("make_coffee").unwrap_err().is_validation());
    }

    #[test]
    fn test_catalog_is_well_formed() {
        let catalog = workflow_catalog();
        assert_eq!(catalog.len(), WORKFLOWS.len());
        for info in catalog {
            assert!(!info.agents.is_empty());
        }
    }

    #[test]
    fn test_plan_renders_steps() {
        let workflow = find_workflow("deployment_health_check").unwrap();
        let mut params = Params::new();
        params.insert("service".into(), serde_json::json!("billing"));
        let specs = workflow.plan(&params).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].description, "Deploy billing");
        assert_eq!(specs[2].agent_type, AgentType::Monitoring);
        assert_eq!(specs[1].params["service"], "billing");
    }

    #[test]
    fn test_plan_missing_params() {
        let workflow = find_workflow("customer_followup").unwrap();
        let err = workflow.plan(&Params::new()).unwrap_err();
        assert!(err.to_string().contains("customer"));
    }
}
