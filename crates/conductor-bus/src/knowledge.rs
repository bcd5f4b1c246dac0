use crate::message::{KnowledgeEntry, Participant};
use chrono::{DateTime, Utc};
use conductor_core::{Clock, SharedClock};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Topic-keyed store of cross-agent learning signals.
///
/// Each topic keeps at most `per_topic` entries; the oldest are evicted first.
pub struct KnowledgeStore {
    per_topic: usize,
    clock: SharedClock,
    topics: Mutex<HashMap<String, VecDeque<KnowledgeEntry>>>,
}

impl KnowledgeStore {
    /// Create a store bounded to `per_topic` entries per topic, stamping
    /// entries with `clock`.
    pub fn new(per_topic: usize, clock: SharedClock) -> Self {
        Self {
            per_topic: per_topic.max(1),
            clock,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Publish `payload` under `topic`.
    pub fn share(&self, from: Participant, topic: &str, payload: serde_json::Value) -> KnowledgeEntry {
        let entry = KnowledgeEntry {
            topic: topic.to_string(),
            from,
            payload,
            shared_at: self.clock.now(),
        };
        let mut topics = self.topics.lock();
        let entries = topics.entry(entry.topic.clone()).or_default();
        entries.push_back(entry.clone());
        while entries.len() > self.per_topic {
            entries.pop_front();
        }
        entry
    }

    /// Everything shared under `topic`, oldest first.
    pub fn get(&self, topic: &str) -> Vec<KnowledgeEntry> {
        self.topics
            .lock()
            .get(topic)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Known topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop entries shared before `cutoff`. Returns how many were removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut topics = self.topics.lock();
        let mut removed = 0;
        for entries in topics.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.shared_at >= cutoff);
            removed += before - entries.len();
        }
        topics.retain(|_, entries| !entries.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use conductor_core::{system_clock, AgentType, ManualClock};
    use std::sync::Arc;

    #[test]
    fn test_share_and_get() {
        let store = KnowledgeStore::new(10, system_clock());
        store.share(
            Participant::Agent(AgentType::Analysis),
            "spam_patterns",
            serde_json::json!({"phrase": "act now"}),
        );
        let entries = store.get("spam_patterns");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].from, Participant::Agent(AgentType::Analysis));
        assert!(store.get("other").is_empty());
    }

    #[test]
    fn test_per_topic_cap_evicts_oldest() {
        let store = KnowledgeStore::new(2, system_clock());
        for n in 0..4 {
            store.share(Participant::Orchestrator, "t", serde_json::json!(n));
        }
        let values: Vec<_> = store.get("t").into_iter().map(|e| e.payload).collect();
        assert_eq!(values, vec![serde_json::json!(2), serde_json::json!(3)]);
    }

    #[test]
    fn test_prune_follows_injected_clock() {
        let clock = ManualClock::starting_now();
        let store = KnowledgeStore::new(10, Arc::new(clock.clone()));
        store.share(Participant::Orchestrator, "a", serde_json::json!(1));
        clock.advance(Duration::hours(2));
        store.share(Participant::Orchestrator, "a", serde_json::json!(2));

        assert_eq!(store.get("a")[1].shared_at, clock.now());
        let removed = store.prune_before(clock.now() - Duration::hours(1));
        assert_eq!(removed, 1);
        assert_eq!(store.get("a")[0].payload, serde_json::json!(2));

        assert_eq!(store.prune_before(clock.now() + Duration::seconds(1)), 1);
        assert!(store.topics().is_empty());
    }
}
