//! App - 長時間動くループとワイヤリング
//!
//! - **EngineBuilder**: Engine の組み立てと起動時検証
//! - **FeedWatcher**: change feed → `Engine::on_job_change`
//! - **ReaperLoop**: 期限切れ step の定期回収
//! - **http**: ジョブ投入エンドポイント
//! - **WorkerGroup**: 上記ループの起動と graceful shutdown

pub mod backoff;
pub mod builder;
pub mod group;
pub mod http;
pub mod reaper_loop;
pub mod watcher;

pub use self::backoff::RetryPolicy;
pub use self::builder::{BuildError, EngineBuilder};
pub use self::group::WorkerGroup;
pub use self::http::{ApiError, router, serve};
pub use self::reaper_loop::ReaperLoop;
pub use self::watcher::FeedWatcher;
