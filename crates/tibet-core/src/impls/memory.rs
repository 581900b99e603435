//! In-memory document store + change feed.
//!
//! テストと `backend = "memory"` 用。CouchDB と同じ規約で動く:
//! - revision は `"<generation>-<ulid>"`、`_rev` なしの保存は新規作成のみ
//! - すべての変更を log に残すので `since = <seq>` から再生できる
//! - view は `flows` / `tasks` / `active_jobs` を内蔵

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use ulid::Ulid;

use crate::domain::{JobState, definition_key};
use crate::ports::{
    ACTIVE_JOBS_VIEW, Change, ChangeFeed, ChangeSubscription, Document, DocumentStore,
    FLOWS_VIEW, FeedEvent, Revision, Since, StoreError, TASKS_VIEW, document_id,
};

const FEED_CAPACITY: usize = 1024;

struct MemoryState {
    docs: BTreeMap<String, Document>,
    /// `log[n]` has sequence number `n + 1`.
    log: Vec<Change>,
}

impl MemoryState {
    fn seq(&self) -> u64 {
        self.log.len() as u64
    }

    fn changes_after(&self, seq: u64) -> VecDeque<Change> {
        let from = (seq as usize).min(self.log.len());
        self.log[from..].iter().cloned().collect()
    }
}

struct Shared {
    state: Mutex<MemoryState>,
    changes: broadcast::Sender<(u64, Change)>,
}

/// In-process [`DocumentStore`] and [`ChangeFeed`]. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MemoryState {
                    docs: BTreeMap::new(),
                    log: Vec::new(),
                }),
                changes,
            }),
        }
    }

    /// Current sequence number (number of changes so far).
    pub async fn seq(&self) -> u64 {
        self.shared.state.lock().await.seq()
    }

    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every stored document, ordered by `_id`.
    pub async fn documents(&self) -> Vec<Document> {
        self.shared.state.lock().await.docs.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn generation(rev: &Revision) -> u64 {
    rev.as_str()
        .split_once('-')
        .and_then(|(g, _)| g.parse().ok())
        .unwrap_or(0)
}

/// Key a document emits into `view`, if any.
fn emit(view: &str, doc: &Document) -> Option<String> {
    let field = |name: &str| doc.get(name).and_then(Value::as_str);
    let kind = field("type")?;
    match view {
        FLOWS_VIEW | TASKS_VIEW => {
            let wanted = if view == FLOWS_VIEW { "flow" } else { "task" };
            if kind != wanted {
                return None;
            }
            Some(definition_key(field("name")?, field("owner")?))
        }
        ACTIVE_JOBS_VIEW => {
            let state = JobState::from(field("state").map(str::to_string));
            let settled = state.is_terminal() || state.is_held();
            if kind != "job" || settled {
                return None;
            }
            field("_id").map(str::to_string)
        }
        _ => None,
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.shared.state.lock().await.docs.get(id).cloned())
    }

    async fn save(&self, doc: &Document) -> Result<Revision, StoreError> {
        if !doc.is_object() {
            return Err(StoreError::InvalidDocument("document must be an object".into()));
        }
        let id = document_id(doc)?.to_string();
        let supplied = Revision::of(doc);

        let mut state = self.shared.state.lock().await;
        let current = state.docs.get(&id).and_then(Revision::of);
        let next_generation = match (&current, &supplied) {
            (None, None) => 1,
            (Some(current), Some(supplied)) if current == supplied => generation(current) + 1,
            _ => return Err(StoreError::Conflict { id }),
        };

        let rev = Revision::new(format!("{next_generation}-{}", Ulid::new().to_string().to_lowercase()));
        let mut stored = doc.clone();
        stored["_rev"] = Value::String(rev.to_string());
        state.docs.insert(id.clone(), stored.clone());

        let change = Change {
            seq: (state.seq() + 1).to_string(),
            id,
            doc: Some(stored),
            deleted: false,
        };
        state.log.push(change.clone());
        // no subscribers is fine
        let _ = self.shared.changes.send((state.seq(), change));
        Ok(rev)
    }

    async fn view(&self, view: &str, keys: &[String]) -> Result<Vec<Document>, StoreError> {
        if ![FLOWS_VIEW, TASKS_VIEW, ACTIVE_JOBS_VIEW].contains(&view) {
            return Err(StoreError::UnknownView(view.to_string()));
        }
        let state = self.shared.state.lock().await;
        let mut rows: Vec<(String, &Document)> = state
            .docs
            .values()
            .filter_map(|doc| emit(view, doc).map(|key| (key, doc)))
            .collect();

        if keys.is_empty() {
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            return Ok(rows.into_iter().map(|(_, doc)| doc.clone()).collect());
        }
        Ok(keys
            .iter()
            .flat_map(|key| rows.iter().filter(move |(k, _)| k == key))
            .map(|(_, doc)| Value::clone(doc))
            .collect())
    }
}

/// Subscription returned by [`MemoryStore::subscribe`].
pub struct MemorySubscription {
    shared: Arc<Shared>,
    backlog: VecDeque<Change>,
    rx: broadcast::Receiver<(u64, Change)>,
    /// Highest sequence already queued or delivered.
    seen: u64,
    heartbeat: Interval,
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(
        &self,
        since: &Since,
        heartbeat: Duration,
    ) -> Result<Box<dyn ChangeSubscription>, StoreError> {
        let state = self.shared.state.lock().await;
        // subscribe while holding the lock so nothing slips between backlog and rx
        let rx = self.shared.changes.subscribe();
        let from = match since {
            Since::Now => state.seq(),
            Since::Seq(token) => token
                .parse::<u64>()
                .map_err(|_| StoreError::Transport(format!("invalid sequence token '{token}'")))?,
        };
        let backlog = state.changes_after(from);
        let seen = state.seq();
        drop(state);

        let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            backlog,
            rx,
            seen,
            heartbeat,
        }))
    }
}

#[async_trait]
impl ChangeSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<FeedEvent>, StoreError> {
        loop {
            if let Some(change) = self.backlog.pop_front() {
                return Ok(Some(FeedEvent::Change(change)));
            }
            tokio::select! {
                received = self.rx.recv() => match received {
                    Ok((seq, change)) => {
                        if seq <= self.seen {
                            continue;
                        }
                        self.seen = seq;
                        return Ok(Some(FeedEvent::Change(change)));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let state = self.shared.state.lock().await;
                        self.backlog = state.changes_after(self.seen);
                        self.seen = state.seq();
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(None),
                },
                _ = self.heartbeat.tick() => return Ok(Some(FeedEvent::Heartbeat)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d["_id"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn save_requires_matching_revision() {
        let store = MemoryStore::new();
        let rev1 = store.save(&json!({"_id": "a", "n": 1})).await.unwrap();
        assert!(rev1.as_str().starts_with("1-"));

        // create again without _rev
        let err = store.save(&json!({"_id": "a", "n": 2})).await.unwrap_err();
        assert!(err.is_conflict());

        let rev2 = store
            .save(&json!({"_id": "a", "_rev": rev1.as_str(), "n": 2}))
            .await
            .unwrap();
        assert!(rev2.as_str().starts_with("2-"));

        // stale revision
        let err = store
            .save(&json!({"_id": "a", "_rev": rev1.as_str(), "n": 3}))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let doc = store.get("a").await.unwrap().unwrap();
        assert_eq!(doc["n"], 2);
        assert_eq!(Revision::of(&doc), Some(rev2));
    }

    #[tokio::test]
    async fn views_return_rows_in_key_order() {
        let store = MemoryStore::new();
        for (id, owner) in [("t1", "DEFAULT"), ("t2", "acme")] {
            store
                .save(&json!({"_id": id, "type": "task", "name": "build", "owner": owner}))
                .await
                .unwrap();
        }
        store
            .save(&json!({"_id": "f1", "type": "flow", "name": "build", "owner": "acme"}))
            .await
            .unwrap();

        let keys = vec!["build::acme".to_string(), "build::DEFAULT".to_string()];
        let rows = store.view(TASKS_VIEW, &keys).await.unwrap();
        assert_eq!(ids(&rows), vec!["t2", "t1"]);

        let all = store.view(FLOWS_VIEW, &[]).await.unwrap();
        assert_eq!(ids(&all), vec!["f1"]);

        assert!(matches!(
            store.view("nope", &[]).await,
            Err(StoreError::UnknownView(_))
        ));
    }

    #[tokio::test]
    async fn active_jobs_excludes_settled_jobs() {
        let store = MemoryStore::new();
        store.save(&json!({"_id": "j1", "type": "job", "state": "build-0"})).await.unwrap();
        store.save(&json!({"_id": "j2", "type": "job", "state": "$$complete"})).await.unwrap();
        store.save(&json!({"_id": "j3", "type": "job"})).await.unwrap();
        store.save(&json!({"_id": "j4", "type": "job", "state": "$$paused"})).await.unwrap();
        store.save(&json!({"_id": "j5", "type": "job", "state": "$$cancelled"})).await.unwrap();
        store.save(&json!({"_id": "j6", "type": "job", "state": "$$error"})).await.unwrap();

        let rows = store.view(ACTIVE_JOBS_VIEW, &[]).await.unwrap();
        assert_eq!(ids(&rows), vec!["j1", "j3", "j6"]);
    }

    #[tokio::test]
    async fn feed_since_now_only_sees_later_changes() {
        let store = MemoryStore::new();
        store.save(&json!({"_id": "before"})).await.unwrap();

        let mut sub = store.subscribe(&Since::Now, Duration::from_secs(60)).await.unwrap();
        store.save(&json!({"_id": "after"})).await.unwrap();

        let Some(FeedEvent::Change(change)) = sub.next().await.unwrap() else {
            panic!("expected a change");
        };
        assert_eq!(change.id, "after");
        assert_eq!(change.seq, "2");
    }

    #[tokio::test]
    async fn feed_replays_from_sequence() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store.save(&json!({"_id": id})).await.unwrap();
        }

        let mut sub = store
            .subscribe(&Since::Seq("1".into()), Duration::from_secs(60))
            .await
            .unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            if let Some(FeedEvent::Change(c)) = sub.next().await.unwrap() {
                seen.push(c.id);
            }
        }
        assert_eq!(seen, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn idle_feed_emits_heartbeats() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&Since::Now, Duration::from_millis(20)).await.unwrap();
        assert_eq!(sub.next().await.unwrap(), Some(FeedEvent::Heartbeat));
    }
}
