use crate::message::Message;
use async_trait::async_trait;
use conductor_core::{AgentType, ConductorResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Per-agent inbox storage.
///
/// `drain` hands each message out at most once: a message returned by one
/// drain is never returned by another.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Append a message to `recipient`'s inbox.
    async fn deliver(&self, recipient: AgentType, message: Message) -> ConductorResult<()>;

    /// Remove and return every message in `agent`'s inbox, oldest first.
    /// Entries that cannot be read are logged and skipped.
    async fn drain(&self, agent: AgentType) -> ConductorResult<Vec<Message>>;

    /// Number of unread messages for `agent`.
    async fn pending(&self, agent: AgentType) -> ConductorResult<usize>;
}

/// In-process inboxes.
#[derive(Default)]
pub struct MemoryMailbox {
    inboxes: Mutex<HashMap<AgentType, VecDeque<Message>>>,
}

impl MemoryMailbox {
    /// Empty inboxes for every agent.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn deliver(&self, recipient: AgentType, message: Message) -> ConductorResult<()> {
        self.inboxes
            .lock()
            .entry(recipient)
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn drain(&self, agent: AgentType) -> ConductorResult<Vec<Message>> {
        let drained = self
            .inboxes
            .lock()
            .get_mut(&agent)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default();
        Ok(drained)
    }

    async fn pending(&self, agent: AgentType) -> ConductorResult<usize> {
        Ok(self.inboxes.lock().get(&agent).map_or(0, VecDeque::len))
    }
}

/// Durable inboxes shared between processes.
///
/// Each message is one JSON file under `<dir>/<agent>/`. A reader claims a
/// file by renaming it before reading it; the rename succeeds for exactly one
/// reader.
pub struct FileMailbox {
    dir: PathBuf,
}

impl FileMailbox {
    /// Use (and create) `dir` as the mailbox root.
    pub async fn new(dir: PathBuf) -> ConductorResult<Self> {
        for agent in AgentType::ALL {
            tokio::fs::create_dir_all(dir.join(agent.as_str())).await?;
        }
        Ok(Self { dir })
    }

    fn inbox_dir(&self, agent: AgentType) -> PathBuf {
        self.dir.join(agent.as_str())
    }

    async fn unread_files(&self, agent: AgentType) -> ConductorResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(self.inbox_dir(agent)).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
            if is_file && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        // File names start with a zero-padded timestamp.
        files.sort();
        Ok(files)
    }

    /// Claim and parse one message file. `None` when another reader got
    /// there first or the content is not a message.
    async fn take(&self, path: &Path) -> ConductorResult<Option<Message>> {
        let claimed = path.with_extension("claimed");
        match tokio::fs::rename(path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let data = match tokio::fs::read(&claimed).await {
            Ok(data) => data,
            Err(e) => {
                set_aside(&claimed, path).await;
                return Err(e.into());
            }
        };
        match serde_json::from_slice::<Message>(&data) {
            Ok(message) => {
                if let Err(e) = tokio::fs::remove_file(&claimed).await {
                    warn!(path = %claimed.display(), error = %e, "Claimed message file not removed");
                }
                Ok(Some(message))
            }
            Err(e) => {
                warn!(path = %claimed.display(), error = %e, "Unreadable message kept aside");
                set_aside(&claimed, path).await;
                Ok(None)
            }
        }
    }
}

async fn set_aside(claimed: &Path, original: &Path) {
    let rejected = original.with_extension("rejected");
    if let Err(e) = tokio::fs::rename(claimed, &rejected).await {
        warn!(path = %claimed.display(), error = %e, "Could not move message file aside");
    }
}

#[async_trait]
impl Mailbox for FileMailbox {
    async fn deliver(&self, recipient: AgentType, message: Message) -> ConductorResult<()> {
        let name = format!(
            "{:020}_{}.json",
            message.timestamp.timestamp_micros(),
            message.id
        );
        let path = self.inbox_dir(recipient).join(name);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&message)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn drain(&self, agent: AgentType) -> ConductorResult<Vec<Message>> {
        let mut messages = Vec::new();
        for path in self.unread_files(agent).await? {
            match self.take(&path).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Message not claimed, skipped"),
            }
        }
        Ok(messages)
    }

    async fn pending(&self, agent: AgentType) -> ConductorResult<usize> {
        Ok(self.unread_files(agent).await?.len())
    }
}
