//! DocumentStore port - 共有ドキュメントストア（source of truth）
//!
//! Job / Flow / Task はすべてここに置かれる。書き込みはすべて
//! 「最後に読んだ revision を添えた全文置換」で、revision が合わなければ
//! `StoreError::Conflict` になる（上書きはしない）。

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// A stored document: a JSON object carrying `_id` and (once saved) `_rev`.
pub type Document = Value;

/// View of flow definitions keyed by `"<name>::<owner>"`.
pub const FLOWS_VIEW: &str = "flows";
/// View of task definitions keyed by `"<name>::<owner>"`.
pub const TASKS_VIEW: &str = "tasks";
/// View of jobs that are neither terminal nor held, keyed by `_id`.
pub const ACTIVE_JOBS_VIEW: &str = "active_jobs";

/// Optimistic-concurrency token of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    pub fn new(rev: impl Into<String>) -> Self {
        Self(rev.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Revision carried by a document, if any.
    pub fn of(doc: &Document) -> Option<Self> {
        doc.get("_rev").and_then(Value::as_str).map(Self::new)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The supplied `_rev` is not the current revision of `id`.
    #[error("document update conflict: {id}")]
    Conflict { id: String },

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("unknown view: {0}")]
    UnknownView(String),

    #[error("store transport error: {0}")]
    Transport(String),

    #[error("store returned undecodable data: {0}")]
    Decode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Document store adapter.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current version of `id` (with its `_rev`), or `None`.
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Full-document replacement keyed by the `_rev` inside `doc`.
    ///
    /// A document without `_rev` is a create. Returns the new revision.
    async fn save(&self, doc: &Document) -> Result<Revision, StoreError>;

    /// Documents emitted by `view` under any of `keys`, in key order.
    /// Empty `keys` returns every row of the view.
    async fn view(&self, view: &str, keys: &[String]) -> Result<Vec<Document>, StoreError>;
}

/// Reads `_id` out of a document.
pub fn document_id(doc: &Document) -> Result<&str, StoreError> {
    doc.get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidDocument("missing string _id".into()))
}
