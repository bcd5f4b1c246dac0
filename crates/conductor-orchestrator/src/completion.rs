use crate::engine::{CompletionEffect, Orchestrator};
use crate::runtime::Tickable;
use crate::types::AgentState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{AgentType, ConductorError, ConductorResult};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[allow(clippy::unwrap_used)]
static MARKER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<agent>[a-z]+)_(?P<task>[0-9a-fA-F-]{36})\.json$").unwrap()
});

const STATE_FILE: &str = "orchestrator_state.json";

/// Task identity as written by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerTask {
    pub id: Uuid,
    #[serde(rename = "type", default)]
    pub task_type: Option<String>,
}

/// What an agent drops when it finishes a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub task: MarkerTask,
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl CompletionMarker {
    pub fn completed(task_id: Uuid, result: serde_json::Value) -> Self {
        Self {
            task: MarkerTask {
                id: task_id,
                task_type: None,
            },
            status: "completed".into(),
            result: Some(result),
        }
    }

    pub fn failed(task_id: Uuid, result: serde_json::Value) -> Self {
        Self {
            status: "failed".into(),
            ..Self::completed(task_id, result)
        }
    }

    /// A marker counts as success when its status says so and its result
    /// does not carry `"success": false`.
    pub fn succeeded(&self) -> bool {
        let result_ok = self
            .result
            .as_ref()
            .and_then(|r| r.get("success"))
            .and_then(|s| s.as_bool())
            .unwrap_or(true);
        self.status.eq_ignore_ascii_case("completed") && result_ok
    }
}

/// Idempotency key of a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkerKey {
    pub agent: AgentType,
    pub task_id: Uuid,
}

/// A marker read from a source, with where it came from.
#[derive(Debug, Clone)]
pub struct ReceivedMarker {
    pub key: MarkerKey,
    pub marker: CompletionMarker,
    pub origin: Option<PathBuf>,
}

/// Where completion markers come from.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Markers available now. Unreadable ones are left for a later call.
    async fn poll(&self) -> ConductorResult<Vec<ReceivedMarker>>;

    /// Move a processed marker out of the way.
    async fn archive(&self, marker: &ReceivedMarker) -> ConductorResult<()>;

    /// Move a marker that can never be applied out of the way.
    async fn reject(&self, marker: &ReceivedMarker) -> ConductorResult<()>;
}

/// Markers as `<agent>_<task_id>.json` files in a drop directory.
pub struct FileMarkerSource {
    dir: PathBuf,
    archive_dir: PathBuf,
}

impl FileMarkerSource {
    pub fn new(dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    /// Where a marker for `agent` and `task_id` is expected.
    pub fn marker_path(&self, agent: AgentType, task_id: Uuid) -> PathBuf {
        self.dir.join(format!("{agent}_{task_id}.json"))
    }

    async fn move_to(&self, from: &Path, sub: &str, name: &str) -> ConductorResult<()> {
        let dir = self.archive_dir.join(sub);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::rename(from, dir.join(name)).await?;
        Ok(())
    }
}

fn parse_marker_name(name: &str) -> Option<MarkerKey> {
    let caps = MARKER_NAME.captures(name)?;
    let agent = caps["agent"].parse().ok()?;
    let task_id = Uuid::parse_str(&caps["task"]).ok()?;
    Some(MarkerKey { agent, task_id })
}

fn stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

#[async_trait]
impl CompletionSource for FileMarkerSource {
    async fn poll(&self) -> ConductorResult<Vec<ReceivedMarker>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut markers = Vec::new();
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(key) = parse_marker_name(&name) else {
                warn!(file = %name, "Marker name not recognised, moving to rejected");
                self.move_to(&path, "rejected", &format!("{}_{name}", stamp(Utc::now())))
                    .await?;
                continue;
            };
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(file = %name, error = %e, "Marker unreadable, will retry");
                    continue;
                }
            };
            match serde_json::from_slice::<CompletionMarker>(&data) {
                Ok(marker) => {
                    if marker.task.id != key.task_id {
                        warn!(file = %name, body_id = %marker.task.id, "Marker body names another task; using file name");
                    }
                    markers.push(ReceivedMarker {
                        key,
                        marker,
                        origin: Some(path),
                    });
                }
                Err(e) => warn!(file = %name, error = %e, "Marker not parseable yet, will retry"),
            }
        }
        Ok(markers)
    }

    async fn archive(&self, marker: &ReceivedMarker) -> ConductorResult<()> {
        if let Some(path) = &marker.origin {
            let name = format!("{}_{}.json", marker.key.task_id, stamp(Utc::now()));
            self.move_to(path, "markers", &name).await?;
        }
        Ok(())
    }

    async fn reject(&self, marker: &ReceivedMarker) -> ConductorResult<()> {
        if let Some(path) = &marker.origin {
            let name = format!(
                "{}_{}_{}.json",
                marker.key.agent,
                marker.key.task_id,
                stamp(Utc::now())
            );
            self.move_to(path, "rejected", &name).await?;
        }
        Ok(())
    }
}

/// Sending half of a [`ChannelMarkerSource`].
#[derive(Clone)]
pub struct MarkerSender {
    tx: mpsc::UnboundedSender<(AgentType, CompletionMarker)>,
}

impl MarkerSender {
    pub fn send(&self, agent: AgentType, marker: CompletionMarker) -> ConductorResult<()> {
        self.tx
            .send((agent, marker))
            .map_err(|_| ConductorError::Orchestrator("completion channel closed".into()))
    }
}

/// In-process markers, for embedding and tests.
pub struct ChannelMarkerSource {
    rx: Mutex<mpsc::UnboundedReceiver<(AgentType, CompletionMarker)>>,
}

impl ChannelMarkerSource {
    pub fn new() -> (Self, MarkerSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx: Mutex::new(rx) }, MarkerSender { tx })
    }
}

#[async_trait]
impl CompletionSource for ChannelMarkerSource {
    async fn poll(&self) -> ConductorResult<Vec<ReceivedMarker>> {
        let mut rx = self.rx.lock();
        let mut markers = Vec::new();
        while let Ok((agent, marker)) = rx.try_recv() {
            markers.push(ReceivedMarker {
                key: MarkerKey {
                    agent,
                    task_id: marker.task.id,
                },
                marker,
                origin: None,
            });
        }
        Ok(markers)
    }

    async fn archive(&self, _marker: &ReceivedMarker) -> ConductorResult<()> {
        Ok(())
    }

    async fn reject(&self, marker: &ReceivedMarker) -> ConductorResult<()> {
        debug!(task_id = %marker.key.task_id, "Dropping rejected in-process marker");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessedMarker {
    agent: AgentType,
    task_id: Uuid,
    processed_at: DateTime<Utc>,
}

/// Aggregate state written after each tick that applied something.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub updated_at: DateTime<Utc>,
    pub agents: Vec<AgentState>,
    #[serde(default)]
    processed: Vec<ProcessedMarker>,
}

/// Counts from one pass over the markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionReport {
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Reconciles completion markers with the registry, once per marker.
pub struct CompletionMonitor {
    orchestrator: Arc<Orchestrator>,
    source: Arc<dyn CompletionSource>,
    processed: Mutex<HashMap<MarkerKey, DateTime<Utc>>>,
    state_path: PathBuf,
}

impl CompletionMonitor {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        source: Arc<dyn CompletionSource>,
        state_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            orchestrator,
            source,
            processed: Mutex::new(HashMap::new()),
            state_path: state_dir.as_ref().join(STATE_FILE),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Restore agent counters and processed keys from the state file, if any.
    pub async fn load_state(&self) -> ConductorResult<bool> {
        let data = match tokio::fs::read(&self.state_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let state: PersistedState = serde_json::from_slice(&data)?;
        self.orchestrator.monitor().restore(state.agents).await;
        let mut processed = self.processed.lock();
        for p in state.processed {
            processed.insert(
                MarkerKey {
                    agent: p.agent,
                    task_id: p.task_id,
                },
                p.processed_at,
            );
        }
        info!(markers = processed.len(), "Completion state restored");
        Ok(true)
    }

    async fn persist_state(&self) -> ConductorResult<()> {
        let agents = self.orchestrator.monitor().snapshot().await;
        let processed = self
            .processed
            .lock()
            .iter()
            .map(|(key, at)| ProcessedMarker {
                agent: key.agent,
                task_id: key.task_id,
                processed_at: *at,
            })
            .collect();
        let state = PersistedState {
            updated_at: self.orchestrator.now(),
            agents,
            processed,
        };
        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.state_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&state)?).await?;
        tokio::fs::rename(&tmp, &self.state_path).await?;
        Ok(())
    }

    pub fn is_processed(&self, key: &MarkerKey) -> bool {
        self.processed.lock().contains_key(key)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().len()
    }

    /// Forget keys processed before `cutoff`.
    pub fn prune_processed(&self, cutoff: DateTime<Utc>) -> usize {
        let mut processed = self.processed.lock();
        let before = processed.len();
        processed.retain(|_, at| *at >= cutoff);
        before - processed.len()
    }

    /// Apply every available marker once.
    ///
    /// A marker that cannot be archived is logged and left where it is; the
    /// rest of the pass goes on. State is persisted whenever something was
    /// applied, even when the pass stops on an error.
    pub async fn process_markers(&self) -> ConductorResult<CompletionReport> {
        let markers = self.source.poll().await?;
        let mut report = CompletionReport::default();
        let mut failure = None;

        for received in markers {
            let key = received.key;
            let now = self.orchestrator.now();
            let first_sight = self.processed.lock().insert(key, now).is_none();
            if !first_sight {
                debug!(task_id = %key.task_id, agent = %key.agent, "Duplicate marker archived");
                self.archive(&received).await;
                report.duplicates += 1;
                continue;
            }

            let success = received.marker.succeeded();
            match self
                .orchestrator
                .record_completion(key.agent, key.task_id, success, received.marker.result.clone())
                .await
            {
                Ok(effect) => {
                    if effect == CompletionEffect::UnknownTask {
                        debug!(task_id = %key.task_id, "Marker for a task this process never saw");
                    }
                    report.applied += 1;
                    self.archive(&received).await;
                }
                Err(e) if e.is_validation() => {
                    warn!(task_id = %key.task_id, agent = %key.agent, error = %e, "Marker rejected");
                    self.processed.lock().remove(&key);
                    if let Err(e) = self.source.reject(&received).await {
                        warn!(task_id = %key.task_id, error = %e, "Rejected marker not moved");
                    }
                    report.rejected += 1;
                }
                Err(e) => {
                    self.processed.lock().remove(&key);
                    failure = Some(e);
                    break;
                }
            }
        }

        if report.applied > 0 {
            self.persist_state().await?;
        }
        if report != CompletionReport::default() {
            info!(applied = report.applied, duplicates = report.duplicates, rejected = report.rejected, "Completion markers processed");
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn archive(&self, received: &ReceivedMarker) {
        if let Err(e) = self.source.archive(received).await {
            warn!(
                task_id = %received.key.task_id,
                agent = %received.key.agent,
                error = %e,
                "Marker not archived, left in place"
            );
        }
    }
}

#[async_trait]
impl Tickable for CompletionMonitor {
    fn name(&self) -> &'static str {
        "completion"
    }

    async fn tick(&self) -> ConductorResult<()> {
        self.process_markers().await?;
        Ok(())
    }
}
