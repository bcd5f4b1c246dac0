use chrono::{DateTime, Utc};
use conductor_core::AgentType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Participant {
    /// A roster agent.
    Agent(AgentType),
    /// The orchestrator itself, or a collaborator acting through it.
    Orchestrator,
}

impl Participant {
    /// The roster agent behind this participant, if any.
    pub fn agent(&self) -> Option<AgentType> {
        match self {
            Participant::Agent(agent) => Some(*agent),
            Participant::Orchestrator => None,
        }
    }
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Participant::Agent(agent) => write!(f, "{agent}"),
            Participant::Orchestrator => write!(f, "orchestrator"),
        }
    }
}

/// Where a message was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    /// A single agent.
    Agent(AgentType),
    /// Every agent on the roster.
    Broadcast,
}

/// What a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Plain information.
    Info,
    /// A request for the recipient to do something.
    Request,
    /// A reply to an earlier request.
    Response,
    /// Something needs attention.
    Alert,
    /// Stop other work and handle this first.
    Emergency,
    /// Hand-over or sequencing between agents.
    Coordination,
}

/// Delivery priority. Higher priorities are read first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Default.
    Normal,
    /// Read before normal messages.
    High,
    /// Emergency alerts.
    Critical,
}

/// A message sitting in (or drained from) an agent's inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier; also the idempotency key for durable mailboxes.
    pub id: Uuid,
    /// Sender.
    pub from: Participant,
    /// Original addressing.
    pub to: Recipient,
    /// Message kind.
    pub message_type: MessageType,
    /// Arbitrary JSON content.
    pub payload: serde_json::Value,
    /// Delivery priority.
    pub priority: MessagePriority,
    /// When the message was sent.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// A normal-priority message.
    pub fn new(
        from: Participant,
        to: Recipient,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            message_type,
            payload,
            priority: MessagePriority::Normal,
            timestamp: Utc::now(),
        }
    }

    /// Override the priority.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A high-priority broadcast that recipients treat as interrupting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyAlert {
    /// Alert identifier.
    pub id: Uuid,
    /// Who raised it.
    pub from: Participant,
    /// Affected component, e.g. `"smtp-relay"`.
    pub component: String,
    /// Component state, e.g. `"down"`.
    pub status: String,
    /// Free-form detail.
    pub details: serde_json::Value,
    /// What recipients should do, e.g. `"halt outbound email"`.
    pub action_request: String,
    /// When it was raised.
    pub raised_at: DateTime<Utc>,
}

/// The last status an agent published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Reporting agent.
    pub agent: AgentType,
    /// Short state label, e.g. `"sending"`.
    pub state: String,
    /// Percent complete, clamped to 0..=100.
    pub progress: u8,
    /// Free-form detail.
    pub details: serde_json::Value,
    /// When it was published.
    pub updated_at: DateTime<Utc>,
}

/// One item in the shared knowledge store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Topic key.
    pub topic: String,
    /// Publisher.
    pub from: Participant,
    /// Shared payload.
    pub payload: serde_json::Value,
    /// When it was shared.
    pub shared_at: DateTime<Utc>,
}
