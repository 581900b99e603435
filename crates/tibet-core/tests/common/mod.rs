#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt};

use tibet_core::domain::Job;
use tibet_core::engine::{Engine, EngineOptions};
use tibet_core::impls::MemoryStore;
use tibet_core::ports::{DocumentStore, Since};
use tibet_core::runner::{EchoRunner, RunContext, RunnerError, RunnerRegistry, TaskRunner};
use tibet_core::{EngineBuilder, FeedWatcher, WorkerGroup};

static INIT: Once = Once::new();

/// `RUST_LOG=debug cargo test` で詳細ログ
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

// ---------------------------------------------------------------------------
// documents
// ---------------------------------------------------------------------------

/// A flow owned by `DEFAULT` running `tasks` in sequence; `extra` is merged in.
pub fn flow(name: &str, tasks: &[&str], extra: Value) -> Value {
    let sequence: Vec<Value> = tasks.iter().map(|t| json!({ "task": t })).collect();
    let mut doc = json!({
        "_id": format!("flow-{name}"),
        "type": "flow",
        "name": name,
        "owner": "DEFAULT",
        "tasks": { "structure": "sequence", "sequence": sequence },
    });
    merge(&mut doc, extra);
    doc
}

/// A task owned by `DEFAULT`; `extra` is merged in.
pub fn task(name: &str, plugin: &str, extra: Value) -> Value {
    let mut doc = json!({
        "_id": format!("task-{name}"),
        "type": "task",
        "name": name,
        "owner": "DEFAULT",
        "plugin": plugin,
    });
    merge(&mut doc, extra);
    doc
}

pub fn job(id: &str, flow: &str, params: Value) -> Value {
    json!({
        "_id": id,
        "type": "job",
        "flow": flow,
        "owner": "acme",
        "params": params,
    })
}

fn merge(doc: &mut Value, extra: Value) {
    if let (Value::Object(doc), Value::Object(extra)) = (doc, extra) {
        doc.extend(extra);
    }
}

pub async fn seed(store: &MemoryStore, docs: impl IntoIterator<Item = Value>) {
    for doc in docs {
        store.save(&doc).await.unwrap();
    }
}

pub async fn load_job(store: &MemoryStore, id: &str) -> Job {
    let doc = store.get(id).await.unwrap().expect("job exists");
    serde_json::from_value(doc).unwrap()
}

/// Polls until the job is `$$complete` or `$$failed`.
pub async fn wait_for_terminal(store: &MemoryStore, id: &str) -> Job {
    with_timeout(async {
        loop {
            if let Some(doc) = store.get(id).await.unwrap() {
                let job: Job = serde_json::from_value(doc).unwrap();
                if job.state.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

// ---------------------------------------------------------------------------
// workers
// ---------------------------------------------------------------------------

pub fn options() -> EngineOptions {
    EngineOptions {
        default_timeout: Duration::from_secs(5),
        max_conflict_retries: 10,
        catalog_ttl: Duration::from_secs(60),
    }
}

pub fn engine(store: &MemoryStore, pid: &str, registry: RunnerRegistry) -> Arc<Engine> {
    EngineBuilder::new()
        .store(Arc::new(store.clone()))
        .registry(registry)
        .pid(pid)
        .options(options())
        .build()
        .unwrap()
}

/// An engine fed by its own watcher, replaying the store from the start.
pub struct Worker {
    pub engine: Arc<Engine>,
    group: WorkerGroup,
}

impl Worker {
    pub fn start(store: &MemoryStore, pid: &str, registry: RunnerRegistry) -> Self {
        let engine = engine(store, pid, registry);
        let watcher = FeedWatcher::new(Arc::clone(&engine), Arc::new(store.clone()))
            .since(Since::Seq("0".into()))
            .heartbeat(Duration::from_millis(200));
        let mut group = WorkerGroup::new();
        group.spawn("feed-watcher", move |shutdown| watcher.run(shutdown));
        Self { engine, group }
    }

    pub async fn stop(self) {
        self.group.shutdown_and_join().await;
    }
}

pub fn registry(runners: &[(&str, Arc<dyn TaskRunner>)]) -> RunnerRegistry {
    let mut registry = RunnerRegistry::new();
    registry.register("echo", Arc::new(EchoRunner)).unwrap();
    for (name, runner) in runners {
        registry.register(*name, Arc::clone(runner)).unwrap();
    }
    registry
}

// ---------------------------------------------------------------------------
// scripted runners
// ---------------------------------------------------------------------------

/// What a [`Scripted`] runner does on one call.
#[derive(Debug, Clone)]
pub enum Act {
    Succeed(Value),
    Fail(&'static str),
    Hang,
}

/// Plays `script` call by call; the last act repeats. Counts calls per
/// `(job, step index)`.
pub struct Scripted {
    script: Vec<Act>,
    calls: Mutex<Vec<(String, usize)>>,
}

impl Scripted {
    pub fn new(script: Vec<Act>) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn always(act: Act) -> Arc<Self> {
        Self::new(vec![act])
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_per_step(&self) -> HashMap<(String, usize), usize> {
        let mut counts = HashMap::new();
        for key in self.calls.lock().unwrap().iter() {
            *counts.entry(key.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl TaskRunner for Scripted {
    async fn run(&self, ctx: RunContext) -> Result<Option<Value>, RunnerError> {
        let act = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.len();
            calls.push((ctx.job.id.clone(), ctx.step.index));
            self.script
                .get(n)
                .or(self.script.last())
                .cloned()
                .unwrap_or(Act::Succeed(Value::Null))
        };
        match act {
            Act::Succeed(Value::Null) => Ok(None),
            Act::Succeed(value) => Ok(Some(value)),
            Act::Fail(reason) => Err(RunnerError::Failed(reason.to_string())),
            Act::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }
        }
    }
}
