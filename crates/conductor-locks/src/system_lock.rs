use conductor_core::{ConductorError, ConductorResult};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Exclusive, cross-process guard around the lock table.
///
/// The guard is a sibling file created with `create_new`, which the OS grants
/// to exactly one opener. It holds a token unique to this holder; dropping
/// the guard removes the file only while it still carries that token.
#[derive(Debug)]
pub struct SystemLock {
    path: PathBuf,
    token: String,
}

/// Timing knobs for taking the system lock.
#[derive(Debug, Clone, Copy)]
pub struct SystemLockOptions {
    /// Give up after this long.
    pub acquire_timeout: Duration,
    /// Pause between attempts.
    pub retry_interval: Duration,
    /// A guard file older than this is left over from a crashed process.
    pub stale_after: Duration,
}

impl Default for SystemLockOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(25),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Sibling path nobody else will pick.
fn aside_path(path: &Path, tag: &str) -> PathBuf {
    path.with_extension(format!("{tag}-{}", Uuid::new_v4().simple()))
}

impl SystemLock {
    /// Take the guard at `path`, waiting up to `options.acquire_timeout`.
    pub async fn acquire(path: &Path, options: SystemLockOptions) -> ConductorResult<Self> {
        let token = format!("{}-{}\n", std::process::id(), Uuid::new_v4().simple());
        let deadline = Instant::now() + options.acquire_timeout;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let written = async {
                        file.write_all(token.as_bytes()).await?;
                        file.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        if let Err(e) = tokio::fs::remove_file(path).await {
                            warn!(path = %path.display(), error = %e, "Failed to remove unwritten system lock");
                        }
                        return Err(e.into());
                    }
                    debug!(path = %path.display(), "System lock taken");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(stale) = Self::stale_token(path, options.stale_after).await {
                        if Self::break_stale(path, &stale).await {
                            continue;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(ConductorError::Lock(format!(
                    "timed out after {:?} waiting for {}",
                    options.acquire_timeout,
                    path.display()
                )));
            }
            tokio::time::sleep(options.retry_interval).await;
        }
    }

    /// Contents of the guard at `path` if it is older than `stale_after`.
    async fn stale_token(path: &Path, stale_after: Duration) -> Option<String> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        let modified = meta.modified().ok()?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age <= stale_after {
            return None;
        }
        tokio::fs::read_to_string(path).await.ok()
    }

    /// Remove the guard judged stale with contents `stale`.
    ///
    /// The guard is first renamed aside, which only one breaker can do, and
    /// its contents are checked again. A fresh guard that replaced the stale
    /// one in the meantime is linked back into place.
    async fn break_stale(path: &Path, stale: &str) -> bool {
        let aside = aside_path(path, "stale");
        if tokio::fs::rename(path, &aside).await.is_err() {
            return false;
        }
        let taken = tokio::fs::read_to_string(&aside).await.unwrap_or_default();
        if taken == stale {
            warn!(path = %path.display(), holder = %stale.trim(), "Broke stale system lock");
        } else if let Err(e) = tokio::fs::hard_link(&aside, path).await {
            warn!(path = %path.display(), error = %e, "Could not restore a live system lock");
        }
        if let Err(e) = tokio::fs::remove_file(&aside).await {
            warn!(path = %aside.display(), error = %e, "Failed to remove set-aside system lock");
        }
        taken == stale
    }
}

impl Drop for SystemLock {
    fn drop(&mut self) {
        let aside = aside_path(&self.path, "release");
        if let Err(e) = std::fs::rename(&self.path, &aside) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove system lock");
            return;
        }
        let held = std::fs::read_to_string(&aside).unwrap_or_default();
        if held != self.token {
            warn!(path = %self.path.display(), "System lock was taken over, leaving it in place");
            if let Err(e) = std::fs::hard_link(&aside, &self.path) {
                warn!(path = %self.path.display(), error = %e, "Could not restore system lock");
            }
        }
        if let Err(e) = std::fs::remove_file(&aside) {
            warn!(path = %aside.display(), error = %e, "Failed to remove system lock");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn quick() -> SystemLockOptions {
        SystemLockOptions {
            acquire_timeout: Duration::from_millis(100),
            retry_interval: Duration::from_millis(10),
            stale_after: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("table.lock");
        let _held = SystemLock::acquire(&path, quick()).await.unwrap();
        let err = SystemLock::acquire(&path, quick()).await.unwrap_err();
        assert!(matches!(err, ConductorError::Lock(_)));
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("table.lock");
        {
            let _held = SystemLock::acquire(&path, quick()).await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        SystemLock::acquire(&path, quick()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_guard_is_broken() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("table.lock");
        std::fs::write(&path, "999999\n").unwrap();
        let options = SystemLockOptions {
            stale_after: Duration::ZERO,
            ..quick()
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let guard = SystemLock::acquire(&path, options).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), guard.token);
        drop(guard);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_drop_leaves_a_guard_it_no_longer_owns() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("table.lock");
        let stalled = SystemLock::acquire(&path, quick()).await.unwrap();
        // Another holder broke the guard and took it while this one stalled.
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, "4242-newholder\n").unwrap();

        drop(stalled);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242-newholder\n");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_break_keeps_a_guard_that_is_no_longer_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("table.lock");
        std::fs::write(&path, "7-fresh\n").unwrap();

        assert!(!SystemLock::break_stale(&path, "6-crashed\n").await);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7-fresh\n");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);

        assert!(SystemLock::break_stale(&path, "7-fresh\n").await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let first = SystemLock::acquire(&tmp.path().join("a.lock"), quick()).await.unwrap();
        let second = SystemLock::acquire(&tmp.path().join("b.lock"), quick()).await.unwrap();
        assert_ne!(first.token, second.token);
        assert!(first.token.starts_with(&std::process::id().to_string()));
    }
}
