//! InMemorySortedSet - プロセス内の sorted-set ストア
//!
//! テストと単一プロセス運用向けに Redis sorted set の意味論をなぞる。
//! member はキーごとに一意、(score, member) 順、add は score を上書き。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{DueAt, QueueItem};
use crate::ports::{SortedSetStore, StoreError};

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, DueAt>,
    ordered: BTreeSet<(DueAt, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: DueAt) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.ordered.remove(&(old, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn rank(&self, member: &str) -> Option<u64> {
        let score = *self.scores.get(member)?;
        let below = self
            .ordered
            .range(..(score, member.to_string()))
            .count();
        Some(below as u64)
    }
}

/// InMemorySortedSet keeps one sorted set per key behind a single async mutex.
///
/// Clones share the same underlying data, so one instance can stand in for a
/// store shared by several simulated processes.
#[derive(Clone, Default)]
pub struct InMemorySortedSet {
    sets: Arc<Mutex<HashMap<String, SortedSet>>>,
}

impl InMemorySortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members under `key`.
    pub async fn len(&self, key: &str) -> usize {
        let sets = self.sets.lock().await;
        sets.get(key).map(|s| s.scores.len()).unwrap_or(0)
    }

    pub async fn is_empty(&self, key: &str) -> bool {
        self.len(key).await == 0
    }
}

#[async_trait]
impl SortedSetStore for InMemorySortedSet {
    async fn add(&self, key: &str, member: &str, score: DueAt) -> Result<(), StoreError> {
        let mut sets = self.sets.lock().await;
        sets.entry(key.to_string()).or_default().insert(member, score);
        Ok(())
    }

    async fn first(&self, key: &str) -> Result<Option<QueueItem>, StoreError> {
        let sets = self.sets.lock().await;
        let item = sets
            .get(key)
            .and_then(|s| s.ordered.first())
            .map(|(score, member)| QueueItem::new(member.clone(), *score));
        Ok(item)
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut sets = self.sets.lock().await;
        let Some(set) = sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        // Redis と同じく空の sorted set は消す
        if set.scores.is_empty() {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<DueAt>, StoreError> {
        let sets = self.sets.lock().await;
        Ok(sets.get(key).and_then(|s| s.scores.get(member).copied()))
    }

    async fn rank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        let sets = self.sets.lock().await;
        Ok(sets.get(key).and_then(|s| s.rank(member)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DueAt {
        DueAt::from_millis(ms)
    }

    #[tokio::test]
    async fn first_returns_lowest_score() {
        let store = InMemorySortedSet::new();
        store.add("email", "late", at(300)).await.unwrap();
        store.add("email", "early", at(100)).await.unwrap();
        store.add("email", "middle", at(200)).await.unwrap();

        let first = store.first("email").await.unwrap();
        assert_eq!(first, Some(QueueItem::new("early", at(100))));
    }

    #[tokio::test]
    async fn add_overwrites_score_of_existing_member() {
        let store = InMemorySortedSet::new();
        store.add("email", "user1", at(100)).await.unwrap();
        store.add("email", "user1", at(900)).await.unwrap();

        assert_eq!(store.len("email").await, 1);
        assert_eq!(store.score("email", "user1").await.unwrap(), Some(at(900)));
    }

    #[tokio::test]
    async fn equal_scores_tie_break_on_member() {
        let store = InMemorySortedSet::new();
        store.add("k", "b", at(10)).await.unwrap();
        store.add("k", "a", at(10)).await.unwrap();

        assert_eq!(store.first("k").await.unwrap().unwrap().member, "a");
        assert_eq!(store.rank("k", "b").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let store = InMemorySortedSet::new();
        store.add("k", "m", at(1)).await.unwrap();

        assert!(store.remove("k", "m").await.unwrap());
        assert!(!store.remove("k", "m").await.unwrap());
        assert!(!store.remove("missing", "m").await.unwrap());
        assert!(store.is_empty("k").await);
    }

    #[tokio::test]
    async fn absent_members_have_no_score_or_rank() {
        let store = InMemorySortedSet::new();
        store.add("k", "present", at(0)).await.unwrap();

        assert_eq!(store.score("k", "absent").await.unwrap(), None);
        assert_eq!(store.rank("k", "absent").await.unwrap(), None);
        assert_eq!(store.rank("other", "present").await.unwrap(), None);
        assert_eq!(store.score("k", "present").await.unwrap(), Some(at(0)));
        assert_eq!(store.rank("k", "present").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = InMemorySortedSet::new();
        store.add("a", "x", at(5)).await.unwrap();
        store.add("b", "y", at(1)).await.unwrap();

        assert_eq!(store.first("a").await.unwrap().unwrap().member, "x");
        assert_eq!(store.first("b").await.unwrap().unwrap().member, "y");
        assert_eq!(store.first("c").await.unwrap(), None);
    }
}
