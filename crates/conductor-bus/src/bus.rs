use crate::knowledge::KnowledgeStore;
use crate::mailbox::{Mailbox, MemoryMailbox};
use crate::message::{
    EmergencyAlert, KnowledgeEntry, Message, MessagePriority, MessageType, Participant, Recipient,
    StatusReport,
};
use conductor_core::{
    system_clock, AgentType, Clock, ConductorError, ConductorResult, SharedClock,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ALERT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_KNOWLEDGE_PER_TOPIC: usize = 100;

/// Asynchronous agent-to-agent messaging.
///
/// Direct messages and broadcasts land in per-agent inboxes that are drained
/// by their owner. Emergency alerts additionally go out on a broadcast
/// channel so subscribers are woken immediately.
pub struct MessageBus {
    mailbox: Arc<dyn Mailbox>,
    knowledge: KnowledgeStore,
    statuses: RwLock<HashMap<AgentType, StatusReport>>,
    alerts: broadcast::Sender<EmergencyAlert>,
    clock: SharedClock,
}

impl MessageBus {
    /// A bus backed by in-process inboxes and the wall clock.
    pub fn new() -> Self {
        Self::with_mailbox(
            Arc::new(MemoryMailbox::new()),
            DEFAULT_KNOWLEDGE_PER_TOPIC,
            system_clock(),
        )
    }

    /// A bus backed by the given mailbox. Knowledge, alerts and status
    /// reports are stamped with `clock`.
    pub fn with_mailbox(
        mailbox: Arc<dyn Mailbox>,
        knowledge_per_topic: usize,
        clock: SharedClock,
    ) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            mailbox,
            knowledge: KnowledgeStore::new(knowledge_per_topic, clock.clone()),
            statuses: RwLock::new(HashMap::new()),
            alerts,
            clock,
        }
    }

    /// A handle that acts on behalf of `agent`.
    pub fn endpoint(self: &Arc<Self>, agent: AgentType) -> AgentEndpoint {
        AgentEndpoint {
            agent,
            bus: Arc::clone(self),
        }
    }

    /// Deliver a message to one agent's inbox.
    pub async fn send_message(
        &self,
        from: Participant,
        to: AgentType,
        message_type: MessageType,
        content: serde_json::Value,
    ) -> ConductorResult<Uuid> {
        let message = Message::new(from, Recipient::Agent(to), message_type, content);
        let id = message.id;
        self.mailbox.deliver(to, message).await?;
        debug!(from = %from, to = %to, message_id = %id, "Message sent");
        Ok(id)
    }

    /// Deliver a copy of a message to every agent except the sender.
    ///
    /// Errors from individual inboxes are collected and returned together.
    pub async fn broadcast_message(
        &self,
        from: Participant,
        message_type: MessageType,
        content: serde_json::Value,
    ) -> Vec<(AgentType, ConductorError)> {
        let message = Message::new(from, Recipient::Broadcast, message_type, content);
        self.fan_out(from, message).await
    }

    /// Drain `agent`'s inbox. Higher-priority messages come first; within a
    /// priority, oldest first.
    pub async fn read_messages(&self, agent: AgentType) -> ConductorResult<Vec<Message>> {
        let mut messages = self.mailbox.drain(agent).await?;
        messages.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(messages)
    }

    /// Unread message count for `agent`.
    pub async fn pending_messages(&self, agent: AgentType) -> ConductorResult<usize> {
        self.mailbox.pending(agent).await
    }

    /// Publish a learning signal readable by every agent.
    pub fn share_knowledge(
        &self,
        from: Participant,
        topic: &str,
        payload: serde_json::Value,
    ) -> ConductorResult<KnowledgeEntry> {
        if topic.trim().is_empty() {
            return Err(ConductorError::Validation("knowledge topic is empty".into()));
        }
        let entry = self.knowledge.share(from, topic.trim(), payload);
        debug!(from = %from, topic = %entry.topic, "Knowledge shared");
        Ok(entry)
    }

    /// Everything shared under `topic`.
    pub fn get_knowledge(&self, topic: &str) -> Vec<KnowledgeEntry> {
        self.knowledge.get(topic)
    }

    /// The shared knowledge store.
    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    /// Raise an interrupting alert on every inbox and on the alert channel.
    pub async fn broadcast_emergency_alert(
        &self,
        from: Participant,
        component: &str,
        status: &str,
        details: serde_json::Value,
        action_request: &str,
    ) -> ConductorResult<EmergencyAlert> {
        let alert = EmergencyAlert {
            id: Uuid::new_v4(),
            from,
            component: component.to_string(),
            status: status.to_string(),
            details,
            action_request: action_request.to_string(),
            raised_at: self.clock.now(),
        };
        warn!(
            from = %from,
            component = %alert.component,
            status = %alert.status,
            action = %alert.action_request,
            "Emergency alert"
        );

        let message = Message::new(
            from,
            Recipient::Broadcast,
            MessageType::Emergency,
            serde_json::to_value(&alert)?,
        )
        .with_priority(MessagePriority::Critical);
        for (agent, e) in self.fan_out(from, message).await {
            warn!(agent = %agent, error = %e, "Emergency alert not delivered");
        }

        // No subscribers is fine; the inbox copies still stand.
        let _ = self.alerts.send(alert.clone());
        Ok(alert)
    }

    /// Receive emergency alerts as they are raised.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<EmergencyAlert> {
        self.alerts.subscribe()
    }

    /// Publish `agent`'s current state for observability.
    pub fn update_status(
        &self,
        agent: AgentType,
        state: &str,
        progress: u8,
        details: serde_json::Value,
    ) -> StatusReport {
        let report = StatusReport {
            agent,
            state: state.to_string(),
            progress: progress.min(100),
            details,
            updated_at: self.clock.now(),
        };
        self.statuses.write().insert(agent, report.clone());
        debug!(agent = %agent, state = %report.state, progress = report.progress, "Status updated");
        report
    }

    /// Last published status of every agent that has reported.
    pub fn agent_statuses(&self) -> Vec<StatusReport> {
        let mut reports: Vec<StatusReport> = self.statuses.read().values().cloned().collect();
        reports.sort_by_key(|r| r.agent);
        reports
    }

    async fn fan_out(&self, from: Participant, message: Message) -> Vec<(AgentType, ConductorError)> {
        let mut errors = Vec::new();
        let mut delivered = 0;
        for agent in AgentType::ALL {
            if from.agent() == Some(agent) {
                continue;
            }
            let mut copy = message.clone();
            copy.id = Uuid::new_v4();
            match self.mailbox.deliver(agent, copy).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(agent = %agent, error = %e, "Broadcast send failed");
                    errors.push((agent, e));
                }
            }
        }
        info!(from = %from, kind = ?message.message_type, delivered, "Broadcast sent");
        errors
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// The bus as seen by one agent.
#[derive(Clone)]
pub struct AgentEndpoint {
    agent: AgentType,
    bus: Arc<MessageBus>,
}

impl AgentEndpoint {
    /// The agent this endpoint speaks for.
    pub fn agent(&self) -> AgentType {
        self.agent
    }

    fn me(&self) -> Participant {
        Participant::Agent(self.agent)
    }

    /// Send to another agent.
    pub async fn send_message(
        &self,
        to: AgentType,
        message_type: MessageType,
        content: serde_json::Value,
    ) -> ConductorResult<Uuid> {
        self.bus.send_message(self.me(), to, message_type, content).await
    }

    /// Send to every other agent.
    pub async fn broadcast_message(
        &self,
        message_type: MessageType,
        content: serde_json::Value,
    ) -> Vec<(AgentType, ConductorError)> {
        self.bus.broadcast_message(self.me(), message_type, content).await
    }

    /// Drain this agent's inbox.
    pub async fn read_messages(&self) -> ConductorResult<Vec<Message>> {
        self.bus.read_messages(self.agent).await
    }

    /// Publish a learning signal.
    pub fn share_knowledge(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> ConductorResult<KnowledgeEntry> {
        self.bus.share_knowledge(self.me(), topic, payload)
    }

    /// Raise an emergency alert.
    pub async fn broadcast_emergency_alert(
        &self,
        component: &str,
        status: &str,
        details: serde_json::Value,
        action_request: &str,
    ) -> ConductorResult<EmergencyAlert> {
        self.bus
            .broadcast_emergency_alert(self.me(), component, status, details, action_request)
            .await
    }

    /// Publish this agent's status.
    pub fn update_status(&self, state: &str, progress: u8, details: serde_json::Value) -> StatusReport {
        self.bus.update_status(self.agent, state, progress, details)
    }
}
