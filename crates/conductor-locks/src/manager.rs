use crate::system_lock::{SystemLock, SystemLockOptions};
use crate::table::{normalize_key, purge_expired, LockRecord, LockTable};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, SharedClock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const TABLE_FILE: &str = "locks.json";

/// Result of an [`LockManager::acquire_lock`] call.
///
/// A denied lock is a normal negative result, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOutcome {
    /// Whether the caller now holds the lease.
    pub granted: bool,
    /// Human-readable explanation, including holder and expiry when denied.
    pub message: String,
    /// The lease as it stands after the call.
    pub lock: Option<LockRecord>,
}

/// Result of an [`LockManager::release_lock`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    /// Whether the entry is gone.
    pub released: bool,
    /// Human-readable explanation.
    pub message: String,
}

/// Lease-based mutual exclusion over named resources.
///
/// The table lives in one JSON file shared by every process pointing at the
/// same directory. Each read-modify-write runs under a [`SystemLock`] on a
/// sibling file, so two processes never interleave updates.
pub struct LockManager {
    table_path: PathBuf,
    guard_path: PathBuf,
    clock: SharedClock,
    options: SystemLockOptions,
}

impl LockManager {
    /// Open (and create if needed) the lock table under `dir`.
    pub async fn new(dir: impl AsRef<Path>, clock: SharedClock) -> ConductorResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let table_path = dir.join(TABLE_FILE);
        let guard_path = dir.join(format!("{TABLE_FILE}.lock"));
        Ok(Self {
            table_path,
            guard_path,
            clock,
            options: SystemLockOptions::default(),
        })
    }

    /// Override the system lock timing.
    pub fn with_options(mut self, options: SystemLockOptions) -> Self {
        self.options = options;
        self
    }

    /// Path of the shared table file.
    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    /// Try to take or refresh a lease on `resource_key`.
    pub async fn acquire_lock(
        &self,
        resource_key: &str,
        holder_id: &str,
        lease: Duration,
    ) -> ConductorResult<LockOutcome> {
        let key = validated_key(resource_key)?;
        let holder = validated_holder(holder_id)?;
        let lease = chrono::Duration::from_std(lease)
            .ok()
            .filter(|d| *d > chrono::Duration::zero())
            .ok_or_else(|| ConductorError::Validation("lease must be positive".into()))?;

        let outcome = self
            .with_table(|table, now| {
                let existing = table.get(&key).filter(|r| !r.is_expired(now)).cloned();
                match existing {
                    Some(record) if record.holder_id != holder => {
                        let outcome = LockOutcome {
                            granted: false,
                            message: format!(
                                "{key} is locked by {} until {}",
                                record.holder_id,
                                record.expires_at.to_rfc3339()
                            ),
                            lock: Some(record),
                        };
                        (outcome, false)
                    }
                    Some(mut record) => {
                        record.expires_at = now + lease;
                        table.insert(key.clone(), record.clone());
                        let outcome = LockOutcome {
                            granted: true,
                            message: format!(
                                "Lease on {key} refreshed until {}",
                                record.expires_at.to_rfc3339()
                            ),
                            lock: Some(record),
                        };
                        (outcome, true)
                    }
                    None => {
                        let record = LockRecord {
                            holder_id: holder.clone(),
                            acquired_at: now,
                            expires_at: now + lease,
                        };
                        table.insert(key.clone(), record.clone());
                        let outcome = LockOutcome {
                            granted: true,
                            message: format!(
                                "Lock on {key} acquired until {}",
                                record.expires_at.to_rfc3339()
                            ),
                            lock: Some(record),
                        };
                        (outcome, true)
                    }
                }
            })
            .await?;

        if outcome.granted {
            info!(resource = %key, holder = %holder, "Lock granted");
        } else {
            debug!(resource = %key, holder = %holder, "Lock denied");
        }
        Ok(outcome)
    }

    /// Drop a lease held by `holder_id`.
    ///
    /// Fails without touching the table when another holder's lease is still
    /// valid. An expired lease is removed whoever asks.
    pub async fn release_lock(
        &self,
        resource_key: &str,
        holder_id: &str,
    ) -> ConductorResult<ReleaseOutcome> {
        let key = validated_key(resource_key)?;
        let holder = validated_holder(holder_id)?;

        let outcome = self
            .with_table(|table, now| match table.get(&key).cloned() {
                None => (
                    ReleaseOutcome {
                        released: true,
                        message: format!("{key} was not locked"),
                    },
                    false,
                ),
                Some(record) if record.holder_id == holder => {
                    table.remove(&key);
                    (
                        ReleaseOutcome {
                            released: true,
                            message: format!("Lock on {key} released"),
                        },
                        true,
                    )
                }
                Some(record) if record.is_expired(now) => {
                    table.remove(&key);
                    (
                        ReleaseOutcome {
                            released: true,
                            message: format!(
                                "Lease on {key} held by {} had already expired",
                                record.holder_id
                            ),
                        },
                        true,
                    )
                }
                Some(record) => (
                    ReleaseOutcome {
                        released: false,
                        message: format!(
                            "{key} is held by {} until {}",
                            record.holder_id,
                            record.expires_at.to_rfc3339()
                        ),
                    },
                    false,
                ),
            })
            .await?;

        if outcome.released {
            info!(resource = %key, holder = %holder, "Lock released");
        }
        Ok(outcome)
    }

    /// Current valid lease on `resource_key`, purging expired entries.
    pub async fn get_lock_status(&self, resource_key: &str) -> ConductorResult<Option<LockRecord>> {
        let key = validated_key(resource_key)?;
        self.with_table(|table, now| {
            let purged = purge_expired(table, now);
            (table.get(&key).cloned(), purged > 0)
        })
        .await
    }

    /// Every valid lease, purging expired entries.
    pub async fn get_all_locked_files(&self) -> ConductorResult<LockTable> {
        self.with_table(|table, now| {
            let purged = purge_expired(table, now);
            if purged > 0 {
                debug!(purged, "Expired leases purged");
            }
            (table.clone(), purged > 0)
        })
        .await
    }

    /// Run `f` against the table under the system lock.
    ///
    /// `f` returns its value plus whether it changed the table; only changed
    /// tables are written back.
    async fn with_table<T>(
        &self,
        f: impl FnOnce(&mut LockTable, DateTime<Utc>) -> (T, bool),
    ) -> ConductorResult<T> {
        let _guard = SystemLock::acquire(&self.guard_path, self.options).await?;
        let mut table = self.read_table().await?;
        let (value, dirty) = f(&mut table, self.clock.now());
        if dirty {
            self.write_table(&table).await?;
        }
        Ok(value)
    }

    async fn read_table(&self) -> ConductorResult<LockTable> {
        match tokio::fs::read_to_string(&self.table_path).await {
            Ok(data) if data.trim().is_empty() => Ok(LockTable::new()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LockTable::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_table(&self, table: &LockTable) -> ConductorResult<()> {
        let tmp = self.table_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(table)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.table_path).await?;
        Ok(())
    }
}

fn validated_key(resource_key: &str) -> ConductorResult<String> {
    let key = normalize_key(resource_key);
    if key.is_empty() {
        return Err(ConductorError::Validation("resource key is empty".into()));
    }
    Ok(key)
}

fn validated_holder(holder_id: &str) -> ConductorResult<String> {
    let holder = holder_id.trim();
    if holder.is_empty() {
        return Err(ConductorError::Validation("holder id is empty".into()));
    }
    Ok(holder.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::ManualClock;
    use std::sync::Arc;

    async fn manager() -> (LockManager, ManualClock, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let mgr = LockManager::new(tmp.path().join("locks"), Arc::new(clock.clone()))
            .await
            .unwrap();
        (mgr, clock, tmp)
    }

    #[tokio::test]
    async fn test_acquire_then_deny_other_holder() {
        let (mgr, _clock, _tmp) = manager().await;
        let first = mgr
            .acquire_lock("file.txt", "A", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(first.granted);

        let second = mgr
            .acquire_lock("file.txt", "B", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!second.granted);
        assert!(second.message.contains("locked by A"));
        assert_eq!(second.lock.unwrap().holder_id, "A");
    }

    #[tokio::test]
    async fn test_same_holder_refreshes_lease() {
        let (mgr, clock, _tmp) = manager().await;
        let first = mgr
            .acquire_lock("file.txt", "A", Duration::from_secs(5))
            .await
            .unwrap()
            .lock
            .unwrap();
        clock.advance(chrono::Duration::seconds(3));
        let refreshed = mgr
            .acquire_lock("file.txt", "A", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(refreshed.granted);
        let record = refreshed.lock.unwrap();
        assert_eq!(record.acquired_at, first.acquired_at);
        assert!(record.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (mgr, clock, _tmp) = manager().await;
        mgr.acquire_lock("file.txt", "A", Duration::from_secs(5))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(5));
        let outcome = mgr
            .acquire_lock("file.txt", "B", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.granted);
        assert_eq!(outcome.lock.unwrap().holder_id, "B");
    }

    #[tokio::test]
    async fn test_release_by_other_holder_fails_without_mutation() {
        let (mgr, _clock, _tmp) = manager().await;
        mgr.acquire_lock("file.txt", "A", Duration::from_secs(60))
            .await
            .unwrap();
        let before = tokio::fs::read_to_string(mgr.table_path()).await.unwrap();

        let outcome = mgr.release_lock("file.txt", "B").await.unwrap();
        assert!(!outcome.released);

        let after = tokio::fs::read_to_string(mgr.table_path()).await.unwrap();
        assert_eq!(before, after);
        assert!(mgr.get_lock_status("file.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_expired_by_anyone() {
        let (mgr, clock, _tmp) = manager().await;
        mgr.acquire_lock("file.txt", "A", Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(2));
        let outcome = mgr.release_lock("file.txt", "B").await.unwrap();
        assert!(outcome.released);
        assert!(mgr.get_all_locked_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_normalized() {
        let (mgr, _clock, _tmp) = manager().await;
        mgr.acquire_lock("./src/main.rs", "A", Duration::from_secs(60))
            .await
            .unwrap();
        let denied = mgr
            .acquire_lock("src//main.rs", "B", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!denied.granted);
    }

    #[tokio::test]
    async fn test_status_purges_expired() {
        let (mgr, clock, _tmp) = manager().await;
        mgr.acquire_lock("a", "A", Duration::from_secs(1)).await.unwrap();
        mgr.acquire_lock("b", "B", Duration::from_secs(60)).await.unwrap();
        clock.advance(chrono::Duration::seconds(2));

        assert!(mgr.get_lock_status("a").await.unwrap().is_none());
        let raw = tokio::fs::read_to_string(mgr.table_path()).await.unwrap();
        let table: LockTable = serde_json::from_str(&raw).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains_key("b"));
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (mgr, _clock, _tmp) = manager().await;
        assert!(mgr
            .acquire_lock("  ", "A", Duration::from_secs(1))
            .await
            .unwrap_err()
            .is_validation());
        assert!(mgr
            .acquire_lock("k", "", Duration::from_secs(1))
            .await
            .unwrap_err()
            .is_validation());
        assert!(mgr
            .acquire_lock("k", "A", Duration::ZERO)
            .await
            .unwrap_err()
            .is_validation());
    }
}
