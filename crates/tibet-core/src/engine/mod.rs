//! Job state machine.
//!
//! `Engine::on_job_change` が唯一の入口。change feed から届いたジョブ文書を見て
//! 「次の一手」を 1 つだけ打ち、楽観ロック付きで保存する。保存が次の change
//! イベントを生み、それがさらに次の一手を駆動する。
//!
//! - 同じ文書を見た worker は同じ判断をする（`decide` は純粋）
//! - 書き込み競合（409）は勝者に譲り、最新版を読み直して再評価する
//! - step の実行だけは claim した worker（`step.pid`）が行う

mod accept;
pub mod catalog;
pub mod decide;
pub mod error;
mod process;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::domain::{Job, JobState, StepState};
use crate::ports::{ACTIVE_JOBS_VIEW, Clock, Document, DocumentStore, GuardEvaluator};
use crate::runner::RunnerRegistry;

pub use catalog::Catalog;
pub use decide::{Decision, decide};
pub use error::{ConfigurationError, EngineError};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Step timeout when neither the task nor the job sets one.
    pub default_timeout: Duration,
    /// Re-read/re-evaluate rounds after a revision conflict.
    pub max_conflict_retries: u32,
    /// How long flow/task definitions stay cached.
    pub catalog_ttl: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            max_conflict_retries: 5,
            catalog_ttl: Duration::from_secs(30),
        }
    }
}

/// What one evaluation did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do for this worker.
    Unchanged,
    /// A new revision was written.
    Saved,
    /// An owned step was handed to its runner.
    Spawned,
}

type InflightKey = (String, usize);

pub struct Engine {
    store: Arc<dyn DocumentStore>,
    registry: Arc<RunnerRegistry>,
    catalog: Catalog,
    guards: Arc<dyn GuardEvaluator>,
    clock: Arc<dyn Clock>,
    pid: String,
    options: EngineOptions,
    inflight: Mutex<HashSet<InflightKey>>,
}

impl Engine {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<RunnerRegistry>,
        guards: Arc<dyn GuardEvaluator>,
        clock: Arc<dyn Clock>,
        pid: String,
        options: EngineOptions,
    ) -> Self {
        Self {
            catalog: Catalog::new(Arc::clone(&store), options.catalog_ttl),
            store,
            registry,
            guards,
            clock,
            pid,
            options,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    pub fn pid(&self) -> &str {
        &self.pid
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Evaluates one job document and applies at most one transition.
    ///
    /// Revision conflicts are retried against a fresh read up to
    /// `max_conflict_retries` times; after that the job is left for the next
    /// change event.
    pub async fn on_job_change(self: &Arc<Self>, doc: Document) -> Result<Transition, EngineError> {
        let mut job = decode_job(doc)?;
        let mut conflicts = 0u32;
        loop {
            match self.evaluate(&mut job).await {
                Err(err) if err.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.options.max_conflict_retries {
                        warn!(job = %job.id, conflicts, "giving up after repeated revision conflicts");
                        return Ok(Transition::Unchanged);
                    }
                    debug!(job = %job.id, attempt = conflicts, "revision conflict, re-reading job");
                    match self.load(&job.id).await? {
                        Some(fresh) => job = fresh,
                        None => return Ok(Transition::Unchanged),
                    }
                }
                other => return other,
            }
        }
    }

    pub async fn load(&self, id: &str) -> Result<Option<Job>, EngineError> {
        self.store.get(id).await?.map(decode_job).transpose()
    }

    async fn evaluate(self: &Arc<Self>, job: &mut Job) -> Result<Transition, EngineError> {
        match job.state.clone() {
            JobState::Submitted => self.initialize(job).await,
            JobState::Ready => self.accept_next_task(job).await,
            JobState::Timeout | JobState::Error => self.escalate_job(job).await,
            JobState::Active { .. } => {
                if self.refresh_task_state(job) {
                    self.save(job).await?;
                    return Ok(Transition::Saved);
                }
                if job.on_task_boundary() {
                    self.accept_next_task(job).await
                } else {
                    self.process_owned_tasks(job).await
                }
            }
            JobState::Complete | JobState::Failed | JobState::Cancelled | JobState::Paused => {
                Ok(Transition::Unchanged)
            }
            JobState::Unknown(raw) => {
                warn!(job = %job.id, state = %raw, "ignoring job in unknown state");
                Ok(Transition::Unchanged)
            }
        }
    }

    /// Relabels overdue in-flight steps as `$$timeout`. Returns whether
    /// anything changed.
    pub fn refresh_task_state(&self, job: &mut Job) -> bool {
        let now = self.now();
        let default_ms = self.default_timeout_ms();
        let mut changed = false;
        for step in job.steps.iter_mut().filter(|s| s.is_overdue(now, default_ms)) {
            let limit = step.timeout.unwrap_or(default_ms);
            warn!(job = %job.id, step = step.index, task = %step.name, limit_ms = limit, "step overdue");
            step.state = StepState::Timeout;
            step.reason = Some(format!("timed out after {limit}ms"));
            changed = true;
        }
        changed
    }

    /// One pass over in-flight jobs, relabelling overdue steps. Catches steps
    /// whose worker went away. Returns the number of jobs written.
    pub async fn sweep_timeouts(&self) -> Result<usize, EngineError> {
        let mut written = 0;
        for doc in self.store.view(ACTIVE_JOBS_VIEW, &[]).await? {
            let mut job = match decode_job(doc) {
                Ok(job) => job,
                Err(err) => {
                    warn!(error = %err, "skipping undecodable job in sweep");
                    continue;
                }
            };
            if !matches!(job.state, JobState::Active { .. }) || !self.refresh_task_state(&mut job) {
                continue;
            }
            match self.save(&mut job).await {
                Ok(()) => written += 1,
                // someone else moved the job on; their write wins
                Err(err) if err.is_conflict() => debug!(job = %job.id, "sweep lost a conflict"),
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    pub(crate) async fn save(&self, job: &mut Job) -> Result<(), EngineError> {
        let doc = serde_json::to_value(&*job)
            .map_err(|e| EngineError::codec(format!("job {}", job.id), e))?;
        let rev = self.store.save(&doc).await?;
        job.rev = Some(rev.into_string());
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn default_timeout_ms(&self) -> u64 {
        u64::try_from(self.options.default_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn claim_inflight(&self, key: &InflightKey) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone())
    }

    fn release_inflight(&self, key: &InflightKey) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

fn decode_job(doc: Document) -> Result<Job, EngineError> {
    let what = match crate::ports::document_id(&doc) {
        Ok(id) => format!("job {id}"),
        Err(_) => "job".to_string(),
    };
    serde_json::from_value(doc).map_err(|e| EngineError::codec(what, e))
}
