use crate::error::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The static roster of worker agents.
///
/// Every task is owned by exactly one agent type, and every agent type owns
/// exactly one queue and one inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Outbound and inbound email.
    Email,
    /// Text messaging.
    Sms,
    /// Voice calls.
    Voice,
    /// Message triage and reporting.
    Analysis,
    /// Releases and health checks.
    Deployment,
    /// Metrics collection and alerting.
    Monitoring,
}

impl AgentType {
    /// The full roster, in a stable order.
    pub const ALL: [AgentType; 6] = [
        AgentType::Email,
        AgentType::Sms,
        AgentType::Voice,
        AgentType::Analysis,
        AgentType::Deployment,
        AgentType::Monitoring,
    ];

    /// Lowercase name used in file names and wire records.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Email => "email",
            AgentType::Sms => "sms",
            AgentType::Voice => "voice",
            AgentType::Analysis => "analysis",
            AgentType::Deployment => "deployment",
            AgentType::Monitoring => "monitoring",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = ConductorError;

    fn from_str(s: &str) -> ConductorResult<Self> {
        let name = s.trim().to_ascii_lowercase();
        AgentType::ALL
            .into_iter()
            .find(|agent| agent.as_str() == name)
            .ok_or_else(|| ConductorError::Validation(format!("unknown agent type '{s}'")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roster_names() {
        for agent in AgentType::ALL {
            assert_eq!(agent.as_str().parse::<AgentType>().unwrap(), agent);
        }
        assert_eq!(" SMS ".parse::<AgentType>().unwrap(), AgentType::Sms);
    }

    #[test]
    fn test_unknown_agent_is_validation_error() {
        let err = "fax".parse::<AgentType>().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_serde_uses_lowercase() {
        let json = serde_json::to_string(&AgentType::Deployment).unwrap();
        assert_eq!(json, "\"deployment\"");
    }
}
