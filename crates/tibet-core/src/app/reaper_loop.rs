//! ReaperLoop - 期限切れ step の回収
//!
//! feed イベントが来ないジョブ（claim した worker が落ちた等）も定期的に
//! `Engine::sweep_timeouts` で `$$timeout` に落とす。書き込みが次の change を生み、
//! retry / cleanup はいつもの経路で進む。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::Engine;

pub struct ReaperLoop {
    engine: Arc<Engine>,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => match self.engine.sweep_timeouts().await {
                    Ok(0) => debug!("timeout sweep found nothing"),
                    Ok(written) => info!(jobs = written, "timeout sweep relabelled overdue steps"),
                    Err(err) => error!(error = %err, "timeout sweep failed"),
                },
            }
        }
        info!("reaper stopped");
    }
}
