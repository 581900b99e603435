//! Configuration loading and validation for a tibet worker.
//!
//! - TOML-backed data model (`model.rs`); every section is optional.
//! - Loading from disk (`loader.rs`).
//! - Sanity checks that serde alone cannot express (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

use std::path::PathBuf;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_or_default};
pub use model::{Backend, ConfigFile, FeedSection, HttpSection, StoreSection, WorkerSection};
pub use validate::validate_config;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing TOML config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {section}: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}
