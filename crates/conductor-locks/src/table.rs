use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A lease held on one resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Identity of the holder, usually `<agent>:<task_id>`.
    pub holder_id: String,
    /// When the lease was first granted (kept across refreshes).
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses.
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// An expired record is treated as absent.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The persisted lock table: normalized resource key to lease.
pub type LockTable = BTreeMap<String, LockRecord>;

/// Drop every expired lease. Returns how many were removed.
pub fn purge_expired(table: &mut LockTable, now: DateTime<Utc>) -> usize {
    let before = table.len();
    table.retain(|_, record| !record.is_expired(now));
    before - table.len()
}

/// Canonical form of a resource key.
///
/// `./src\\main.rs`, `src//main.rs` and ` src/main.rs ` all name the same
/// resource.
pub fn normalize_key(key: &str) -> String {
    let unified = key.trim().replace('\\', "/");
    let mut out = String::with_capacity(unified.len());
    let mut prev_slash = false;
    for ch in unified.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }
    let mut trimmed = out.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("file.txt"), "file.txt");
        assert_eq!(normalize_key(" ./src\\main.rs "), "src/main.rs");
        assert_eq!(normalize_key("src//lib//mod.rs"), "src/lib/mod.rs");
        assert_eq!(normalize_key("././a"), "a");
        assert_eq!(normalize_key("/etc/hosts"), "/etc/hosts");
    }

    #[test]
    fn test_purge_expired() {
        let now = Utc::now();
        let mut table = LockTable::new();
        table.insert(
            "old".into(),
            LockRecord {
                holder_id: "a".into(),
                acquired_at: now - Duration::seconds(20),
                expires_at: now - Duration::seconds(10),
            },
        );
        table.insert(
            "live".into(),
            LockRecord {
                holder_id: "b".into(),
                acquired_at: now,
                expires_at: now + Duration::seconds(10),
            },
        );
        assert_eq!(purge_expired(&mut table, now), 1);
        assert!(table.contains_key("live"));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let now = Utc::now();
        let record = LockRecord {
            holder_id: "a".into(),
            acquired_at: now,
            expires_at: now,
        };
        assert!(record.is_expired(now));
    }
}
