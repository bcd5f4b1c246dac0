use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, usually read from `conductor.toml`.
///
/// Every section is optional; missing values fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub bus: BusConfig,
}

/// Tick period of each background worker, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_dispatch_secs")]
    pub dispatch_secs: u64,
    #[serde(default = "default_scheduler_secs")]
    pub scheduler_secs: u64,
    #[serde(default = "default_conditional_secs")]
    pub conditional_secs: u64,
    #[serde(default = "default_dependency_secs")]
    pub dependency_secs: u64,
    #[serde(default = "default_completion_secs")]
    pub completion_secs: u64,
    #[serde(default = "default_cleanup_secs")]
    pub cleanup_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// How long terminal tasks stay in the registry before archival.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
    /// How long processed completion markers are remembered.
    #[serde(default = "default_marker_retention_secs")]
    pub marker_retention_secs: u64,
    #[serde(default = "default_knowledge_retention_secs")]
    pub knowledge_retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lease_secs")]
    pub default_lease_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Keep inboxes on disk so other processes can read them.
    #[serde(default)]
    pub durable_mailbox: bool,
    #[serde(default = "default_knowledge_per_topic")]
    pub knowledge_per_topic: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_dispatch_secs() -> u64 {
    10
}
fn default_scheduler_secs() -> u64 {
    30
}
fn default_conditional_secs() -> u64 {
    60
}
fn default_dependency_secs() -> u64 {
    30
}
fn default_completion_secs() -> u64 {
    10
}
fn default_cleanup_secs() -> u64 {
    3600
}
fn default_max_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_task_retention_secs() -> u64 {
    86_400
}
fn default_marker_retention_secs() -> u64 {
    7 * 86_400
}
fn default_knowledge_retention_secs() -> u64 {
    7 * 86_400
}
fn default_lease_secs() -> u64 {
    300
}
fn default_acquire_timeout_secs() -> u64 {
    10
}
fn default_stale_after_secs() -> u64 {
    30
}
fn default_knowledge_per_topic() -> usize {
    100
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            dispatch_secs: default_dispatch_secs(),
            scheduler_secs: default_scheduler_secs(),
            conditional_secs: default_conditional_secs(),
            dependency_secs: default_dependency_secs(),
            completion_secs: default_completion_secs(),
            cleanup_secs: default_cleanup_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            default_max_retries: default_max_retries(),
            task_retention_secs: default_task_retention_secs(),
            marker_retention_secs: default_marker_retention_secs(),
            knowledge_retention_secs: default_knowledge_retention_secs(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease_secs: default_lease_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            durable_mailbox: false,
            knowledge_per_topic: default_knowledge_per_topic(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            intervals: IntervalConfig::default(),
            limits: LimitsConfig::default(),
            locks: LockConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConductorError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`; a missing file yields the defaults.
    pub async fn load(path: &Path) -> ConductorResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConductorError::Config(format!(
                "Failed to read config '{}': {e}",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> ConductorResult<()> {
        let intervals = [
            ("dispatch_secs", self.intervals.dispatch_secs),
            ("scheduler_secs", self.intervals.scheduler_secs),
            ("conditional_secs", self.intervals.conditional_secs),
            ("dependency_secs", self.intervals.dependency_secs),
            ("completion_secs", self.intervals.completion_secs),
            ("cleanup_secs", self.intervals.cleanup_secs),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                return Err(ConductorError::Config(format!(
                    "intervals.{name} must be at least 1"
                )));
            }
        }
        if self.limits.max_batch_size == 0 {
            return Err(ConductorError::Config(
                "limits.max_batch_size must be at least 1".into(),
            ));
        }
        if self.locks.default_lease_secs == 0 {
            return Err(ConductorError::Config(
                "locks.default_lease_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Per-agent hand-off records.
    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    /// Completion markers dropped by agents.
    pub fn completed_dir(&self) -> PathBuf {
        self.data_dir.join("completed")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archive")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.data_dir.join("mailbox")
    }
}

impl IntervalConfig {
    /// The same period for every worker.
    pub fn uniform(secs: u64) -> Self {
        Self {
            dispatch_secs: secs,
            scheduler_secs: secs,
            conditional_secs: secs,
            dependency_secs: secs,
            completion_secs: secs,
            cleanup_secs: secs,
        }
    }

    pub fn dispatch(&self) -> Duration {
        Duration::from_secs(self.dispatch_secs)
    }
    pub fn scheduler(&self) -> Duration {
        Duration::from_secs(self.scheduler_secs)
    }
    pub fn conditional(&self) -> Duration {
        Duration::from_secs(self.conditional_secs)
    }
    pub fn dependency(&self) -> Duration {
        Duration::from_secs(self.dependency_secs)
    }
    pub fn completion(&self) -> Duration {
        Duration::from_secs(self.completion_secs)
    }
    pub fn cleanup(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }
}
