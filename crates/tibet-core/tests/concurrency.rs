mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use tokio::sync::Notify;

use common::{
    Act, Scripted, Worker, engine, flow, init_tracing, job, load_job, options, registry, seed, task,
    wait_for_terminal, with_timeout,
};
use tibet_core::domain::{ExitCode, JobState, StepState};
use tibet_core::engine::{Engine, Transition};
use tibet_core::impls::MemoryStore;
use tibet_core::ports::{DocumentStore, FixedClock};
use tibet_core::runner::{RunContext, RunnerError, TaskRunner};
use tibet_core::EngineBuilder;

/// Blocks until released, then succeeds.
#[derive(Default)]
struct Gated {
    gate: Notify,
    finished: AtomicUsize,
}

impl Gated {
    fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl TaskRunner for Gated {
    async fn run(&self, _ctx: RunContext) -> Result<Option<Value>, RunnerError> {
        self.gate.notified().await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(Some(json!({ "late": true })))
    }
}

async fn current(store: &MemoryStore, id: &str) -> Value {
    store.get(id).await.unwrap().expect("job exists")
}

/// Feeds the job back into `engine` until it settles, waiting out spawned runs.
async fn drive(engine: &Arc<Engine>, store: &MemoryStore, id: &str) {
    with_timeout(async {
        loop {
            let doc = current(store, id).await;
            let job: tibet_core::domain::Job = serde_json::from_value(doc.clone()).unwrap();
            if job.state.is_terminal() {
                return;
            }
            match engine.on_job_change(doc).await.unwrap() {
                Transition::Saved => {}
                Transition::Spawned | Transition::Unchanged => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
    .await;
}

#[tokio::test]
async fn two_workers_run_every_step_exactly_once() {
    init_tracing();
    let store = MemoryStore::new();
    seed(
        &store,
        [
            flow("pipeline", &["fetch", "build", "publish"], json!({})),
            task("fetch", "counted", json!({})),
            task("build", "counted", json!({})),
            task("publish", "counted", json!({})),
        ],
    )
    .await;
    let counted = Scripted::always(Act::Succeed(json!({ "ok": true })));
    let runners = [("counted", counted.clone() as Arc<dyn TaskRunner>)];
    let first = Worker::start(&store, "worker-1", registry(&runners));
    let second = Worker::start(&store, "worker-2", registry(&runners));

    let ids: Vec<String> = (0..6).map(|n| format!("job-{n}")).collect();
    for id in &ids {
        store.save(&job(id, "pipeline", json!({}))).await.unwrap();
    }

    for id in &ids {
        let done = wait_for_terminal(&store, id).await;
        assert_eq!(done.state, JobState::Complete, "{id}");
        assert_eq!(done.steps.len(), 3, "{id}");
        assert!(done.steps.iter().all(|s| s.pid == "worker-1" || s.pid == "worker-2"));
    }

    let per_step = counted.calls_per_step();
    assert_eq!(per_step.len(), ids.len() * 3);
    assert!(per_step.values().all(|&n| n == 1), "{per_step:?}");

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn conflicting_claims_converge_on_the_winner() {
    init_tracing();
    let store = MemoryStore::new();
    seed(
        &store,
        [
            flow("build", &["a"], json!({})),
            task("a", "echo", json!({})),
            job("job-1", "build", json!({})),
        ],
    )
    .await;
    let e1 = engine(&store, "worker-1", registry(&[]));
    let e2 = engine(&store, "worker-2", registry(&[]));

    let submitted = current(&store, "job-1").await;
    assert_eq!(e1.on_job_change(submitted).await.unwrap(), Transition::Saved);

    // both workers observe the same $$ready revision
    let ready = current(&store, "job-1").await;
    assert_eq!(ready["state"], "$$ready");
    assert_eq!(e1.on_job_change(ready.clone()).await.unwrap(), Transition::Saved);
    assert_eq!(e2.on_job_change(ready).await.unwrap(), Transition::Unchanged);

    let claimed = load_job(&store, "job-1").await;
    assert_eq!(claimed.state, JobState::active("a", 0));
    assert_eq!(claimed.steps.len(), 1);
    assert_eq!(claimed.steps[0].pid, "worker-1");

    drive(&e1, &store, "job-1").await;
    let done = load_job(&store, "job-1").await;
    assert_eq!(done.state, JobState::Complete);
    assert_eq!(done.steps.len(), 1);
}

#[tokio::test]
async fn late_completion_after_timeout_is_dropped() {
    init_tracing();
    let store = MemoryStore::new();
    seed(
        &store,
        [
            flow("build", &["slow"], json!({})),
            task("slow", "gated", json!({ "timeout": 60_000 })),
            job("job-late", "build", json!({})),
        ],
    )
    .await;
    let gated = Arc::new(Gated::default());
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
    let engine = EngineBuilder::new()
        .store(Arc::new(store.clone()))
        .registry(registry(&[("gated", gated.clone() as Arc<dyn TaskRunner>)]))
        .clock(clock.clone())
        .pid("worker-1")
        .options(options())
        .build()
        .unwrap();

    for _ in 0..2 {
        let doc = current(&store, "job-late").await;
        assert_eq!(engine.on_job_change(doc).await.unwrap(), Transition::Saved);
    }
    let claimed = current(&store, "job-late").await;
    assert_eq!(engine.on_job_change(claimed.clone()).await.unwrap(), Transition::Spawned);
    // already in flight on this worker
    assert_eq!(engine.on_job_change(claimed).await.unwrap(), Transition::Unchanged);

    clock.advance(chrono::Duration::minutes(2));
    assert_eq!(engine.sweep_timeouts().await.unwrap(), 1);

    gated.release();
    with_timeout(async {
        while gated.finished.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let swept = load_job(&store, "job-late").await;
    assert_eq!(swept.steps[0].state, StepState::Timeout);
    assert!(swept.steps[0].stdout.is_none());
    assert!(swept.steps[0].reason.as_deref().unwrap().contains("60000ms"));

    drive(&engine, &store, "job-late").await;
    let done = load_job(&store, "job-late").await;
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.exit, Some(ExitCode::Timeout));
    assert_eq!(done.steps.len(), 1);
}

#[tokio::test]
async fn settled_and_held_jobs_are_left_alone() {
    init_tracing();
    let store = MemoryStore::new();
    seed(
        &store,
        [
            flow("build", &["a"], json!({})),
            task("a", "echo", json!({})),
            job("job-done", "build", json!({})),
            json!({ "_id": "job-held", "type": "job", "flow": "build", "owner": "acme", "state": "$$paused" }),
        ],
    )
    .await;
    let engine = engine(&store, "worker-1", registry(&[]));
    drive(&engine, &store, "job-done").await;

    let seq = store.seq().await;
    let done = current(&store, "job-done").await;
    assert_eq!(engine.on_job_change(done).await.unwrap(), Transition::Unchanged);
    let held = current(&store, "job-held").await;
    assert_eq!(engine.on_job_change(held).await.unwrap(), Transition::Unchanged);
    assert_eq!(store.seq().await, seq);
}
