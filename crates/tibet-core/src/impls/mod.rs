//! Impls - ports の実装
//!
//! - **MemoryStore**: プロセス内の store + feed（テストと `backend = "memory"`）
//! - **CouchStore**: CouchDB（HTTP）の store + continuous feed

pub mod couch;
pub mod memory;

use std::sync::Arc;

use crate::config::{Backend, StoreSection};
use crate::ports::{ChangeFeed, DocumentStore, StoreError};

pub use self::couch::{CouchOptions, CouchStore, FeedLine, parse_feed_line};
pub use self::memory::{MemoryStore, MemorySubscription};

/// A backend seen through both ports.
#[derive(Clone)]
pub struct StoreHandles {
    pub store: Arc<dyn DocumentStore>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl StoreHandles {
    pub fn from_backend<S>(backend: S) -> Self
    where
        S: DocumentStore + ChangeFeed + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            store: backend.clone(),
            feed: backend,
        }
    }
}

/// Opens the configured backend. For couch, the database and the design
/// document are created when missing.
pub async fn open_store(section: &StoreSection) -> Result<StoreHandles, StoreError> {
    match section.backend {
        Backend::Memory => Ok(StoreHandles::from_backend(MemoryStore::new())),
        Backend::Couch => {
            let options = section
                .couch_options()
                .ok_or_else(|| StoreError::Transport("couch backend needs a url".into()))?;
            let couch = CouchStore::new(&options)?;
            couch.ensure_database().await?;
            couch.ensure_design().await?;
            Ok(StoreHandles::from_backend(couch))
        }
    }
}
