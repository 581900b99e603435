use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::app::RetryPolicy;
use crate::engine::EngineOptions;
use crate::impls::CouchOptions;
use crate::ports::Since;

/// Top-level configuration as read from `Tibet.toml`.
///
/// ```toml
/// [worker]
/// plugins = "plugins"
/// default_timeout_ms = 60000
///
/// [store]
/// backend = "couch"
/// url = "http://localhost:5984"
/// database = "tibet"
///
/// [feed]
/// since = "now"
///
/// [http]
/// bind = "127.0.0.1:8080"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub feed: FeedSection,
    #[serde(default)]
    pub http: HttpSection,
}

/// `[worker]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    /// Fixed worker identity; `worker-<ulid>` is generated when absent.
    pub pid: Option<String>,
    /// Directory scanned for `*.toml` runner plugins at startup.
    pub plugins: Option<PathBuf>,
    pub default_timeout_ms: u64,
    /// 0 disables the timeout sweep.
    pub sweep_interval_ms: u64,
    pub max_conflict_retries: u32,
    pub catalog_ttl_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            pid: None,
            plugins: None,
            default_timeout_ms: 300_000,
            sweep_interval_ms: 30_000,
            max_conflict_retries: 5,
            catalog_ttl_ms: 30_000,
        }
    }
}

impl WorkerSection {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            max_conflict_retries: self.max_conflict_retries,
            catalog_ttl: Duration::from_millis(self.catalog_ttl_ms),
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Couch,
    Memory,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Couch => "couch",
            Self::Memory => "memory",
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub backend: Backend,
    pub url: Option<String>,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: None,
            database: "tibet".to_string(),
            username: None,
            password: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl StoreSection {
    /// Connection options for the couch backend; `None` without a url.
    pub fn couch_options(&self) -> Option<CouchOptions> {
        Some(CouchOptions {
            url: self.url.clone()?,
            database: self.database.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        })
    }
}

/// `[feed]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedSection {
    /// `"now"` or a sequence token.
    pub since: String,
    pub heartbeat_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_max_ms: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            since: "now".to_string(),
            heartbeat_ms: 10_000,
            reconnect_base_ms: 500,
            reconnect_multiplier: 2.0,
            reconnect_max_ms: 30_000,
        }
    }
}

impl FeedSection {
    pub fn since(&self) -> Since {
        match self.since.parse() {
            Ok(since) => since,
            Err(never) => match never {},
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn backoff(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            multiplier: self.reconnect_multiplier,
            max_delay: Duration::from_millis(self.reconnect_max_ms),
        }
    }
}

/// `[http]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSection {
    pub enabled: bool,
    pub bind: String,
    pub jobs_path: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8080".to_string(),
            jobs_path: "/jobs".to_string(),
        }
    }
}
