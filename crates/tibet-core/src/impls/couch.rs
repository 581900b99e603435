//! CouchDB backend (HTTP).
//!
//! - `GET/PUT /{db}/{id}`、409 は `StoreError::Conflict`
//! - view は `_design/tibet` に入れた 3 つ（`ensure_design` が起動時に入れる）
//! - change feed は `_changes?feed=continuous` を 1 行 1 イベントで読む。
//!   空行は heartbeat

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::ports::{
    ACTIVE_JOBS_VIEW, Change, ChangeFeed, ChangeSubscription, Document, DocumentStore,
    FLOWS_VIEW, FeedEvent, Revision, Since, StoreError, TASKS_VIEW, document_id,
};

const DESIGN_ID: &str = "_design/tibet";

const FLOWS_MAP: &str = "function (doc) { if (doc.type === 'flow' && doc.name && doc.owner) { emit(doc.name + '::' + doc.owner, null); } }";
const TASKS_MAP: &str = "function (doc) { if (doc.type === 'task' && doc.name && doc.owner) { emit(doc.name + '::' + doc.owner, null); } }";
const ACTIVE_JOBS_MAP: &str = "function (doc) { if (doc.type === 'job' && ['$$complete', '$$failed', '$$cancelled', '$$paused'].indexOf(doc.state) < 0) { emit(doc._id, null); } }";

#[derive(Debug, Clone)]
pub struct CouchOptions {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Timeout of ordinary requests; the change feed has none.
    pub request_timeout: Duration,
}

#[derive(Clone)]
pub struct CouchStore {
    client: Client,
    feed_client: Client,
    base: Url,
    database: String,
    credentials: Option<(String, Option<String>)>,
}

#[derive(Deserialize)]
struct SaveResponse {
    rev: String,
}

#[derive(Deserialize)]
struct ViewResponse {
    rows: Vec<ViewRow>,
}

#[derive(Deserialize)]
struct ViewRow {
    #[serde(default)]
    doc: Option<Document>,
}

fn transport(err: reqwest::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

impl CouchStore {
    pub fn new(options: &CouchOptions) -> Result<Self, StoreError> {
        let base = Url::parse(&options.url)
            .map_err(|e| StoreError::Transport(format!("invalid store url '{}': {e}", options.url)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Transport(format!("store url '{}' cannot be a base", options.url)));
        }
        let client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(transport)?;
        let feed_client = Client::builder().build().map_err(transport)?;
        Ok(Self {
            client,
            feed_client,
            base,
            database: options.database.clone(),
            credentials: options
                .username
                .clone()
                .map(|user| (user, options.password.clone())),
        })
    }

    /// `{base}/{db}/{segments...}`. A `_design/x` id stays two segments.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(&self.database);
            for segment in segments {
                match segment.strip_prefix("_design/") {
                    Some(name) => path.push("_design").push(name),
                    None => path.push(segment),
                };
            }
        }
        url
    }

    fn request(&self, client: &Client, method: Method, url: Url) -> RequestBuilder {
        let builder = client.request(method, url);
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, password.as_deref()),
            None => builder,
        }
    }

    async fn failure(response: Response) -> StoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        StoreError::Transport(format!("unexpected status {status}: {}", body.trim()))
    }

    /// Creates the database if it does not exist yet.
    pub async fn ensure_database(&self) -> Result<(), StoreError> {
        let response = self
            .request(&self.client, Method::PUT, self.url(&[]))
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => {
                info!(database = %self.database, "created database");
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED => Ok(()),
            _ => Err(Self::failure(response).await),
        }
    }

    /// Installs (or updates) the design document holding the engine's views.
    pub async fn ensure_design(&self) -> Result<(), StoreError> {
        let views = design_views();
        let mut design = json!({
            "_id": DESIGN_ID,
            "language": "javascript",
            "views": views,
        });
        if let Some(current) = self.get(DESIGN_ID).await? {
            if current.get("views") == Some(&views) {
                debug!("design document up to date");
                return Ok(());
            }
            if let Some(rev) = current.get("_rev") {
                design["_rev"] = rev.clone();
            }
        }
        self.save(&design).await?;
        info!(database = %self.database, "installed design document");
        Ok(())
    }
}

fn design_views() -> Value {
    json!({
        FLOWS_VIEW: { "map": FLOWS_MAP },
        TASKS_VIEW: { "map": TASKS_MAP },
        ACTIVE_JOBS_VIEW: { "map": ACTIVE_JOBS_MAP },
    })
}

#[async_trait]
impl DocumentStore for CouchStore {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let response = self
            .request(&self.client, Method::GET, self.url(&[id]))
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await.map_err(transport)?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::failure(response).await),
        }
    }

    async fn save(&self, doc: &Document) -> Result<Revision, StoreError> {
        let id = document_id(doc)?;
        let response = self
            .request(&self.client, Method::PUT, self.url(&[id]))
            .json(doc)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => {
                let saved: SaveResponse = response.json().await.map_err(transport)?;
                Ok(Revision::new(saved.rev))
            }
            StatusCode::CONFLICT => Err(StoreError::Conflict { id: id.to_string() }),
            _ => Err(Self::failure(response).await),
        }
    }

    async fn view(&self, view: &str, keys: &[String]) -> Result<Vec<Document>, StoreError> {
        if ![FLOWS_VIEW, TASKS_VIEW, ACTIVE_JOBS_VIEW].contains(&view) {
            return Err(StoreError::UnknownView(view.to_string()));
        }
        let mut url = self.url(&[DESIGN_ID, "_view", view]);
        url.query_pairs_mut().append_pair("include_docs", "true");
        let request = if keys.is_empty() {
            self.request(&self.client, Method::GET, url)
        } else {
            self.request(&self.client, Method::POST, url)
                .json(&json!({ "keys": keys }))
        };
        let response = request.send().await.map_err(transport)?;
        match response.status() {
            StatusCode::OK => {
                let rows: ViewResponse = response.json().await.map_err(transport)?;
                Ok(rows.rows.into_iter().filter_map(|row| row.doc).collect())
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(format!("{DESIGN_ID}/_view/{view}"))),
            _ => Err(Self::failure(response).await),
        }
    }
}

#[async_trait]
impl ChangeFeed for CouchStore {
    async fn subscribe(
        &self,
        since: &Since,
        heartbeat: Duration,
    ) -> Result<Box<dyn ChangeSubscription>, StoreError> {
        let mut url = self.url(&["_changes"]);
        url.query_pairs_mut()
            .append_pair("feed", "continuous")
            .append_pair("include_docs", "true")
            .append_pair("heartbeat", &heartbeat.as_millis().to_string())
            .append_pair("since", &since.to_string());
        let response = self
            .request(&self.feed_client, Method::GET, url)
            .send()
            .await
            .map_err(transport)?;
        if response.status() != StatusCode::OK {
            return Err(Self::failure(response).await);
        }
        Ok(Box::new(CouchSubscription {
            response,
            buffer: Vec::new(),
            pending: VecDeque::new(),
        }))
    }
}

struct CouchSubscription {
    response: Response,
    buffer: Vec<u8>,
    pending: VecDeque<FeedEvent>,
}

#[async_trait]
impl ChangeSubscription for CouchSubscription {
    async fn next(&mut self) -> Result<Option<FeedEvent>, StoreError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=end).collect();
                let text = String::from_utf8_lossy(&line);
                match parse_feed_line(&text)? {
                    FeedLine::Event(event) => self.pending.push_back(event),
                    FeedLine::LastSeq(_) => return Ok(None),
                }
            }
            if !self.pending.is_empty() {
                continue;
            }
            match self.response.chunk().await.map_err(transport)? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
    }
}

/// One line of a continuous `_changes` response.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedLine {
    Event(FeedEvent),
    /// The server closed the feed; the token resumes it.
    LastSeq(String),
}

/// Sequence tokens are strings on CouchDB 2+ and integers before that.
fn seq_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn parse_feed_line(line: &str) -> Result<FeedLine, StoreError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(FeedLine::Event(FeedEvent::Heartbeat));
    }
    let value: Value = serde_json::from_str(line)?;
    if let Some(last) = value.get("last_seq") {
        return Ok(FeedLine::LastSeq(seq_token(last)));
    }
    let (Some(seq), Some(id)) = (value.get("seq"), value.get("id").and_then(Value::as_str)) else {
        return Err(StoreError::InvalidDocument(format!("unexpected feed line: {line}")));
    };
    Ok(FeedLine::Event(FeedEvent::Change(Change {
        seq: seq_token(seq),
        id: id.to_string(),
        doc: value.get("doc").filter(|d| d.is_object()).cloned(),
        deleted: value.get("deleted").and_then(Value::as_bool).unwrap_or(false),
    })))
}
