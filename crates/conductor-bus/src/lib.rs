//! Asynchronous messaging between Conductor agents.
//!
//! Agents talk to each other through per-agent inboxes: direct sends,
//! roster-wide broadcasts and interrupting emergency alerts. A topic-keyed
//! knowledge store carries cross-agent learning signals, and a status board
//! holds the last state each agent published.
//!
//! # Main types
//!
//! - [`MessageBus`]: the bus itself.
//! - [`AgentEndpoint`]: the bus bound to one agent's identity.
//! - [`Mailbox`]: inbox storage, with [`MemoryMailbox`] and [`FileMailbox`].
//! - [`KnowledgeStore`]: shared topic store.

/// The message bus and per-agent endpoints.
pub mod bus;
/// Shared knowledge store.
pub mod knowledge;
/// Inbox storage backends.
pub mod mailbox;
/// Message and report types.
pub mod message;

pub use bus::{AgentEndpoint, MessageBus};
pub use knowledge::KnowledgeStore;
pub use mailbox::{FileMailbox, Mailbox, MemoryMailbox};
pub use message::{
    EmergencyAlert, KnowledgeEntry, Message, MessagePriority, MessageType, Participant, Recipient,
    StatusReport,
};
