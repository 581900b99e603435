//! FeedWatcher - change feed を購読して Engine に流す
//!
//! - job 文書（`type == "job"`、`_design/` 以外）だけを `on_job_change` に渡す
//! - heartbeat が 2 回ぶん途切れたら接続断とみなして再購読する
//! - 再購読は最後に処理した seq から。backoff は `RetryPolicy`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::backoff::RetryPolicy;
use crate::domain::ErrorKind;
use crate::engine::Engine;
use crate::ports::{Change, ChangeFeed, ChangeSubscription, Document, FeedEvent, Since};

pub struct FeedWatcher {
    engine: Arc<Engine>,
    feed: Arc<dyn ChangeFeed>,
    since: Since,
    heartbeat: Duration,
    backoff: RetryPolicy,
}

/// Why a subscription stopped.
enum Ended {
    Shutdown,
    Lost { reason: String, delivered: bool },
}

impl FeedWatcher {
    pub fn new(engine: Arc<Engine>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            engine,
            feed,
            since: Since::Now,
            heartbeat: Duration::from_secs(10),
            backoff: RetryPolicy::default(),
        }
    }

    pub fn since(mut self, since: Since) -> Self {
        self.since = since;
        self
    }

    pub fn heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let subscribed = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                subscribed = self.feed.subscribe(&self.since, self.heartbeat) => subscribed,
            };

            match subscribed {
                Ok(subscription) => {
                    info!(since = %self.since, "subscribed to change feed");
                    match self.consume(subscription, &mut shutdown).await {
                        Ended::Shutdown => break,
                        Ended::Lost { reason, delivered } => {
                            if delivered {
                                failures = 0;
                            }
                            warn!(since = %self.since, %reason, "change feed lost, reconnecting");
                        }
                    }
                }
                Err(err) => warn!(since = %self.since, error = %err, "cannot subscribe to change feed"),
            }

            failures = failures.saturating_add(1);
            let delay = self.backoff.next_delay(failures);
            debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("feed watcher stopped");
    }

    async fn consume(
        &mut self,
        mut subscription: Box<dyn ChangeSubscription>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Ended {
        let silence = self.heartbeat.saturating_mul(2);
        let mut delivered = false;
        loop {
            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ended::Shutdown;
                    }
                    continue;
                }
                event = tokio::time::timeout(silence, subscription.next()) => event,
            };

            let reason = match event {
                Ok(Ok(Some(FeedEvent::Heartbeat))) => {
                    trace!("feed heartbeat");
                    continue;
                }
                Ok(Ok(Some(FeedEvent::Change(change)))) => {
                    delivered = true;
                    self.since = Since::Seq(change.seq.clone());
                    self.dispatch(change).await;
                    continue;
                }
                Ok(Ok(None)) => "feed closed by the store".to_string(),
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("no heartbeat for {}ms", silence.as_millis()),
            };
            return Ended::Lost { reason, delivered };
        }
    }

    async fn dispatch(&self, change: Change) {
        let seq = change.seq.clone();
        let id = change.id.clone();
        let Some(doc) = job_document(change) else {
            trace!(%seq, doc = %id, "ignoring non-job change");
            return;
        };

        match self.engine.on_job_change(doc).await {
            Ok(transition) => debug!(%seq, job = %id, ?transition, "job change handled"),
            Err(err) => match err.kind() {
                ErrorKind::Infrastructure => {
                    error!(%seq, job = %id, error = %err, "cannot handle job change")
                }
                kind => warn!(%seq, job = %id, %kind, error = %err, "job change failed"),
            },
        }
    }
}

/// The job document carried by `change`, if it is one.
pub fn job_document(change: Change) -> Option<Document> {
    if change.deleted || change.id.starts_with("_design/") {
        return None;
    }
    change
        .doc
        .filter(|doc| doc.get("type").and_then(|t| t.as_str()) == Some("job"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(id: &str, doc: Option<Document>, deleted: bool) -> Change {
        Change {
            seq: "1".into(),
            id: id.into(),
            doc,
            deleted,
        }
    }

    #[test]
    fn only_live_job_documents_are_dispatched() {
        let job = json!({"_id": "j1", "type": "job", "flow": "f", "owner": "o"});
        assert!(job_document(change("j1", Some(job.clone()), false)).is_some());
        assert!(job_document(change("j1", Some(job), true)).is_none());
        assert!(job_document(change("t1", Some(json!({"_id": "t1", "type": "task"})), false)).is_none());
        assert!(
            job_document(change("_design/tibet", Some(json!({"type": "job"})), false)).is_none()
        );
        assert!(job_document(change("j2", None, false)).is_none());
    }
}
