use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Long-lived loops of one worker process (feed watcher, reaper, http).
/// - `request_shutdown()` で全ループに停止を通知
/// - `shutdown_and_join()` で全ループの終了を待つ
///
/// 実行中の runner は止めない。新しいイベントを取らなくなるだけ。
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            joins: Vec::new(),
        }
    }

    /// A receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawns `task(shutdown_rx)` as a member of the group.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let join = tokio::spawn(task(self.shutdown_signal()));
        self.joins.push((name, join));
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for (name, join) in self.joins {
            if let Err(err) = join.await {
                tracing::error!(task = name, error = %err, "worker task panicked");
            }
        }
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn members_stop_on_shutdown() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut group = WorkerGroup::new();
        for name in ["a", "b"] {
            let stopped = Arc::clone(&stopped);
            group.spawn(name, move |mut rx| async move {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(group.len(), 2);

        tokio::time::timeout(std::time::Duration::from_secs(1), group.shutdown_and_join())
            .await
            .unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }
}
