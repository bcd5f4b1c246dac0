#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_bus::*;
use conductor_core::AgentType;
use std::sync::Arc;

async fn durable_bus(dir: &std::path::Path) -> Arc<MessageBus> {
    let mailbox = FileMailbox::new(dir.join("mailbox")).await.unwrap();
    Arc::new(MessageBus::with_mailbox(Arc::new(mailbox), 10, conductor_core::system_clock()))
}

#[tokio::test]
async fn durable_inbox_survives_a_new_bus() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let bus = durable_bus(tmp.path()).await;
        bus.endpoint(AgentType::Analysis)
            .send_message(
                AgentType::Email,
                MessageType::Request,
                serde_json::json!({"reply_to": "ticket-7"}),
            )
            .await
            .unwrap();
    }

    // A second process opening the same directory sees the message once.
    let bus = durable_bus(tmp.path()).await;
    let email = bus.endpoint(AgentType::Email);
    let inbox = email.read_messages().await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].payload["reply_to"], "ticket-7");
    assert!(email.read_messages().await.unwrap().is_empty());
}

#[tokio::test]
async fn emergency_alert_reaches_every_other_agent() {
    let tmp = tempfile::tempdir().unwrap();
    let bus = durable_bus(tmp.path()).await;
    let monitoring = bus.endpoint(AgentType::Monitoring);

    let alert = monitoring
        .broadcast_emergency_alert(
            "voice-gateway",
            "unreachable",
            serde_json::json!({"since": "5m"}),
            "stop placing calls",
        )
        .await
        .unwrap();

    for agent in AgentType::ALL {
        let inbox = bus.read_messages(agent).await.unwrap();
        if agent == AgentType::Monitoring {
            assert!(inbox.is_empty());
            continue;
        }
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_type, MessageType::Emergency);
        assert_eq!(inbox[0].payload["id"], alert.id.to_string());
    }
}

#[tokio::test]
async fn knowledge_is_shared_across_endpoints() {
    let bus = Arc::new(MessageBus::new());
    bus.endpoint(AgentType::Analysis)
        .share_knowledge("escalation_keywords", serde_json::json!(["urgent", "outage"]))
        .unwrap();

    let seen = bus.get_knowledge("escalation_keywords");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].from, Participant::Agent(AgentType::Analysis));
    assert_eq!(bus.knowledge().topics(), vec!["escalation_keywords".to_string()]);
}
