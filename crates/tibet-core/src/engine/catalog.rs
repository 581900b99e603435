//! Flow / task definition lookup.
//!
//! `name::owner` を先に、`name::DEFAULT` を fallback として view を引く。
//! 見つかった definition だけをプロセス内で TTL つきキャッシュする。
//! "not found" は覚えないので、後から作られた flow / task はすぐに見える。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::EngineError;
use crate::domain::{DEFAULT_OWNER, Flow, TaskDef, definition_key};
use crate::ports::{Document, DocumentStore, FLOWS_VIEW, TASKS_VIEW};

type CacheKey = (&'static str, String, String);

pub struct Catalog {
    store: Arc<dyn DocumentStore>,
    ttl: Duration,
    cache: RwLock<HashMap<CacheKey, (Instant, Document)>>,
}

impl Catalog {
    /// `ttl` of zero disables caching.
    pub fn new(store: Arc<dyn DocumentStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn flow(&self, name: &str, owner: &str) -> Result<Option<Flow>, EngineError> {
        self.lookup(FLOWS_VIEW, name, owner).await
    }

    pub async fn task(&self, name: &str, owner: &str) -> Result<Option<TaskDef>, EngineError> {
        self.lookup(TASKS_VIEW, name, owner).await
    }

    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        view: &'static str,
        name: &str,
        owner: &str,
    ) -> Result<Option<T>, EngineError> {
        let Some(doc) = self.cached(view, name, owner).await? else {
            return Ok(None);
        };
        serde_json::from_value(doc)
            .map(Some)
            .map_err(|e| EngineError::codec(format!("{view} definition {name}::{owner}"), e))
    }

    async fn cached(
        &self,
        view: &'static str,
        name: &str,
        owner: &str,
    ) -> Result<Option<Document>, EngineError> {
        let key = (view, name.to_string(), owner.to_string());
        if !self.ttl.is_zero() {
            if let Some((at, doc)) = self.cache.read().await.get(&key) {
                if at.elapsed() < self.ttl {
                    return Ok(Some(doc.clone()));
                }
            }
        }

        let doc = self.fetch(view, name, owner).await?;
        if let Some(found) = doc.as_ref().filter(|_| !self.ttl.is_zero()) {
            self.cache.write().await.insert(key, (Instant::now(), found.clone()));
        }
        Ok(doc)
    }

    async fn fetch(&self, view: &str, name: &str, owner: &str) -> Result<Option<Document>, EngineError> {
        let mut keys = vec![definition_key(name, owner)];
        if owner != DEFAULT_OWNER {
            keys.push(definition_key(name, DEFAULT_OWNER));
        }
        let rows = self.store.view(view, &keys).await?;
        debug!(%view, %name, %owner, rows = rows.len(), "definition lookup");

        let owned_by = |wanted: &str| {
            rows.iter()
                .find(|doc| doc.get("owner").and_then(Value::as_str) == Some(wanted))
                .cloned()
        };
        Ok(owned_by(owner).or_else(|| owned_by(DEFAULT_OWNER)))
    }
}
