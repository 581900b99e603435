//! tibet-core
//!
//! Distributed job engine on top of a document store with a change feed.
//! Workers share nothing but the store: every job transition is a revisioned
//! write of the job document, and every write is a feed event that drives the
//! next transition.
//!
//! # モジュール構成
//! - **domain**: Flow / Task / Job / Step の文書モデル、状態、`blend`、エラー分類
//! - **ports**: 抽象化レイヤー（DocumentStore, ChangeFeed, Clock, IdGenerator, GuardEvaluator）
//! - **params**: stdio remap + template による step params の解決
//! - **guard**: guard 式言語（既定の GuardEvaluator）
//! - **runner**: Task Runner Registry, 組み込み runner, plugin loader
//! - **engine**: ジョブ状態機械（Engine）
//! - **app**: builder, feed watcher, reaper, HTTP, shutdown
//! - **impls**: MemoryStore / CouchStore
//! - **config**: `Tibet.toml`

pub mod app;
pub mod config;
pub mod domain;
pub mod engine;
pub mod guard;
pub mod impls;
pub mod params;
pub mod ports;
pub mod runner;

pub use app::{EngineBuilder, FeedWatcher, ReaperLoop, WorkerGroup};
pub use engine::{Engine, EngineError, EngineOptions, Transition};
