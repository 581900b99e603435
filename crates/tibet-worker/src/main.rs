mod cli;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use tibet_core::app::{self, FeedWatcher, ReaperLoop, WorkerGroup};
use tibet_core::config::{self, ConfigFile};
use tibet_core::impls::open_store;
use tibet_core::ports::{SystemClock, UlidGenerator};
use tibet_core::runner::{FactoryTable, RunnerRegistry, load_plugins};
use tibet_core::EngineBuilder;

use crate::cli::CliArgs;

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("tibet-worker error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}

fn load_config(args: &CliArgs) -> Result<ConfigFile> {
    let mut cfg = match &args.config {
        Some(path) => config::load_and_validate(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => config::load_or_default(config::default_config_path())
            .context("loading default config")?,
    };

    if let Some(since) = &args.since {
        cfg.feed.since = since.clone();
    }
    if let Some(pid) = &args.pid {
        cfg.worker.pid = Some(pid.clone());
    }
    if let Some(bind) = args.bind {
        cfg.http.bind = bind.to_string();
    }
    if args.no_http {
        cfg.http.enabled = false;
    }
    config::validate_config(&cfg).context("validating config after CLI overrides")?;
    Ok(cfg)
}

fn load_registry(plugins: Option<&PathBuf>) -> Result<RunnerRegistry> {
    let factories = FactoryTable::builtin();
    let mut registry = RunnerRegistry::new();
    if let Some(dir) = plugins {
        let loaded = load_plugins(dir, &factories, &mut registry)
            .with_context(|| format!("loading plugins from {}", dir.display()))?;
        info!(dir = %dir.display(), plugins = ?loaded, "loaded plugins");
    }
    let builtins = factories
        .register_defaults(&mut registry)
        .context("registering built-in runners")?;
    info!(runners = ?builtins, "registered built-in runners");
    Ok(registry)
}

async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_config(&args)?;
    let registry = load_registry(cfg.worker.plugins.as_ref())?;

    if args.dry_run {
        let summary = json!({
            "worker": {
                "pid": cfg.worker.pid,
                "default_timeout_ms": cfg.worker.default_timeout_ms,
                "sweep_interval_ms": cfg.worker.sweep_interval_ms,
            },
            "store": {
                "backend": cfg.store.backend.as_str(),
                "url": cfg.store.url,
                "database": cfg.store.database,
            },
            "feed": { "since": cfg.feed.since, "heartbeat_ms": cfg.feed.heartbeat_ms },
            "http": { "enabled": cfg.http.enabled, "bind": cfg.http.bind, "jobs_path": cfg.http.jobs_path },
            "runners": registry.names(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let handles = open_store(&cfg.store)
        .await
        .context("opening document store")?;

    let mut builder = EngineBuilder::new()
        .store(Arc::clone(&handles.store))
        .registry(registry)
        .options(cfg.worker.engine_options());
    if let Some(pid) = &cfg.worker.pid {
        builder = builder.pid(pid.clone());
    }
    let engine = builder.build().context("building engine")?;
    info!(pid = %engine.pid(), runners = ?engine.registry().names(), "engine ready");

    let mut group = WorkerGroup::new();

    let watcher = FeedWatcher::new(Arc::clone(&engine), Arc::clone(&handles.feed))
        .since(cfg.feed.since())
        .heartbeat(cfg.feed.heartbeat())
        .backoff(cfg.feed.backoff());
    group.spawn("feed-watcher", move |shutdown| watcher.run(shutdown));

    match cfg.worker.sweep_interval() {
        Some(interval) => {
            let reaper = ReaperLoop::new(Arc::clone(&engine), interval);
            group.spawn("reaper", move |shutdown| reaper.run(shutdown));
        }
        None => warn!("timeout sweep disabled"),
    }

    if cfg.http.enabled {
        let listener = tokio::net::TcpListener::bind(&cfg.http.bind)
            .await
            .with_context(|| format!("binding http listener on {}", cfg.http.bind))?;
        let ids = Arc::new(UlidGenerator::new(SystemClock));
        let router = app::router(Arc::clone(&handles.store), ids, &cfg.http.jobs_path);
        group.spawn("http", move |shutdown| async move {
            if let Err(err) = app::serve(listener, router, shutdown).await {
                tracing::error!(error = %err, "http server failed");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutdown requested");
    group.shutdown_and_join().await;
    info!("worker stopped");
    Ok(())
}
