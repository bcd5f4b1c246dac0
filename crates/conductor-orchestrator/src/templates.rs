use crate::types::{Params, TaskKind, TaskPriority};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap());

/// A named, reusable task shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    pub kind: TaskKind,
    /// Description with `{param}` placeholders.
    pub description_format: String,
    #[serde(default)]
    pub default_params: Params,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl TaskTemplate {
    /// Defaults overlaid with `params`, after checking required keys.
    pub fn merge_params(&self, params: &Params) -> ConductorResult<Params> {
        let missing: Vec<&str> = self
            .required_params
            .iter()
            .filter(|k| !params.contains_key(*k) && !self.default_params.contains_key(*k))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ConductorError::Validation(format!(
                "template '{}' is missing required params: {}",
                self.name,
                missing.join(", ")
            )));
        }
        let mut merged = self.default_params.clone();
        merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(merged)
    }

    pub fn render_description(&self, params: &Params) -> ConductorResult<String> {
        render_template(&self.description_format, params).map_err(|missing| {
            ConductorError::Validation(format!(
                "template '{}' has unfilled placeholders: {}",
                self.name,
                missing.join(", ")
            ))
        })
    }
}

/// Fill `{name}` placeholders from `params`.
///
/// String values are inserted as-is, anything else as JSON. Returns the
/// names of placeholders with no value.
pub fn render_template(format: &str, params: &Params) -> Result<String, Vec<String>> {
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER.replace_all(format, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match params.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                missing.push(key.to_string());
                String::new()
            }
        }
    });
    let rendered = rendered.into_owned();
    if missing.is_empty() {
        Ok(rendered)
    } else {
        missing.sort();
        missing.dedup();
        Err(missing)
    }
}

/// Named templates, seeded with the built-ins.
pub struct TemplateRegistry {
    templates: Mutex<BTreeMap<String, TaskTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let templates = builtin_templates()
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        Self {
            templates: Mutex::new(templates),
        }
    }

    /// Add or replace a template.
    pub fn register(&self, template: TaskTemplate) -> ConductorResult<()> {
        if template.name.trim().is_empty() {
            return Err(ConductorError::Validation("template name is empty".into()));
        }
        self.templates.lock().insert(template.name.clone(), template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> ConductorResult<TaskTemplate> {
        self.templates
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ConductorError::NotFound(format!("template '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.lock().keys().cloned().collect()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_templates() -> Vec<TaskTemplate> {
    vec![
        TaskTemplate {
            name: "outage_notice".into(),
            kind: TaskKind::SendEmail,
            description_format: "Notify {audience} that {service} is degraded: {summary}".into(),
            default_params: [("audience".to_string(), serde_json::json!("all customers"))]
                .into_iter()
                .collect(),
            required_params: vec!["service".into(), "summary".into()],
            priority: TaskPriority::High,
        },
        TaskTemplate {
            name: "health_probe".into(),
            kind: TaskKind::HealthCheck,
            description_format: "Probe {service} and report latency and error rate".into(),
            default_params: Params::new(),
            required_params: vec!["service".into()],
            priority: TaskPriority::Medium,
        },
    ]
}
