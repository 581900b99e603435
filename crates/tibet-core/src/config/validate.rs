use std::net::SocketAddr;

use super::ConfigError;
use super::model::{Backend, ConfigFile};

/// Checks what serde cannot:
/// - couch backend has a url
/// - heartbeat is non-zero and backoff grows
/// - http bind address parses and the jobs path is absolute
pub fn validate_config(cfg: &ConfigFile) -> Result<(), ConfigError> {
    validate_store(cfg)?;
    validate_feed(cfg)?;
    validate_http(cfg)?;
    Ok(())
}

fn invalid(section: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section,
        message: message.into(),
    }
}

fn validate_store(cfg: &ConfigFile) -> Result<(), ConfigError> {
    if cfg.store.backend == Backend::Couch && cfg.store.url.as_deref().is_none_or(str::is_empty) {
        return Err(invalid("[store]", "backend \"couch\" requires `url`"));
    }
    if cfg.store.database.is_empty() {
        return Err(invalid("[store]", "`database` must not be empty"));
    }
    Ok(())
}

fn validate_feed(cfg: &ConfigFile) -> Result<(), ConfigError> {
    if cfg.feed.heartbeat_ms == 0 {
        return Err(invalid("[feed]", "`heartbeat_ms` must be >= 1 (got 0)"));
    }
    // NaN も弾く
    if !(cfg.feed.reconnect_multiplier >= 1.0) {
        return Err(invalid(
            "[feed]",
            format!(
                "`reconnect_multiplier` must be >= 1 (got {})",
                cfg.feed.reconnect_multiplier
            ),
        ));
    }
    if cfg.feed.reconnect_max_ms < cfg.feed.reconnect_base_ms {
        return Err(invalid(
            "[feed]",
            "`reconnect_max_ms` must not be below `reconnect_base_ms`",
        ));
    }
    Ok(())
}

fn validate_http(cfg: &ConfigFile) -> Result<(), ConfigError> {
    if !cfg.http.jobs_path.starts_with('/') {
        return Err(invalid(
            "[http]",
            format!("`jobs_path` must start with '/' (got {:?})", cfg.http.jobs_path),
        ));
    }
    if cfg.http.enabled {
        cfg.http.bind.parse::<SocketAddr>().map_err(|e| {
            invalid("[http]", format!("`bind` {:?} is not an address: {e}", cfg.http.bind))
        })?;
    }
    Ok(())
}
