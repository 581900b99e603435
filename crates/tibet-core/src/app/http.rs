//! Job submission endpoint.
//!
//! `POST {jobs_path}` は構造チェックだけして store に保存する。以降は change feed
//! 経由で engine が引き継ぐ。`GET {jobs_path}/:id` は投入者がジョブの終端状態を
//! 読むための窓口。

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::ports::{Document, DocumentStore, IdGenerator, StoreError};

/// Fields the engine owns; a submission never sets them.
const ENGINE_FIELDS: [&str; 7] = ["_rev", "state", "steps", "run_start", "exit", "end", "reason"];

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("cannot save job: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
struct ApiState {
    store: Arc<dyn DocumentStore>,
    ids: Arc<dyn IdGenerator>,
}

pub fn router(store: Arc<dyn DocumentStore>, ids: Arc<dyn IdGenerator>, jobs_path: &str) -> Router {
    let jobs_path = match jobs_path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    let by_id = if jobs_path == "/" {
        "/:id".to_string()
    } else {
        format!("{jobs_path}/:id")
    };
    Router::new()
        .route(jobs_path, post(submit_job))
        .route(&by_id, get(get_job))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { store, ids })
}

/// Serves `router` on `listener` until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

async fn submit_job(State(state): State<ApiState>, body: Bytes) -> Result<StatusCode, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("missing request body".into()));
    }
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?;
    let doc = prepare_job(value, state.ids.as_ref())?;

    if let Err(err) = state.store.save(&doc).await {
        warn!(job = %doc["_id"], error = %err, "job submission failed");
        return Err(err.into());
    }
    info!(job = %doc["_id"], flow = %doc["flow"], owner = %doc["owner"], "job submitted");
    Ok(StatusCode::CREATED)
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    match state.store.get(&id).await? {
        Some(doc) if doc.get("type").and_then(Value::as_str) == Some("job") => Ok(Json(doc)),
        _ => Err(ApiError::NotFound(id)),
    }
}

/// Validates a submitted body and turns it into a fresh job document.
pub fn prepare_job(value: Value, ids: &dyn IdGenerator) -> Result<Document, ApiError> {
    let Value::Object(mut doc) = value else {
        return Err(ApiError::BadRequest("job must be a JSON object".into()));
    };
    if doc.get("type").and_then(Value::as_str) != Some("job") {
        return Err(ApiError::BadRequest(r#"`type` must be "job""#.into()));
    }
    for field in ["flow", "owner"] {
        match doc.get(field).and_then(Value::as_str) {
            Some(s) if !s.is_empty() => {}
            _ => return Err(ApiError::BadRequest(format!("`{field}` must be a non-empty string"))),
        }
    }
    if doc.get("params").is_some_and(|p| !p.is_object()) {
        return Err(ApiError::BadRequest("`params` must be an object".into()));
    }
    match doc.get("_id") {
        None => {
            doc.insert("_id".into(), Value::String(ids.generate_job_id().to_string()));
        }
        Some(Value::String(id)) if id.is_empty() => {
            doc.insert("_id".into(), Value::String(ids.generate_job_id().to_string()));
        }
        Some(Value::String(id)) if id.starts_with('_') => {
            return Err(ApiError::BadRequest("`_id` must not start with `_`".into()));
        }
        Some(Value::String(_)) => {}
        Some(_) => return Err(ApiError::BadRequest("`_id` must be a string".into())),
    }
    for field in ENGINE_FIELDS {
        doc.remove(field);
    }
    Ok(Value::Object(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobId;
    use crate::impls::MemoryStore;
    use crate::ports::{Revision, SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn get(&self, _id: &str) -> Result<Option<Document>, StoreError> {
            Err(StoreError::Transport("connection refused".into()))
        }

        async fn save(&self, _doc: &Document) -> Result<Revision, StoreError> {
            Err(StoreError::Transport("connection refused".into()))
        }

        async fn view(&self, _view: &str, _keys: &[String]) -> Result<Vec<Document>, StoreError> {
            Err(StoreError::Transport("connection refused".into()))
        }
    }

    fn ids() -> Arc<dyn IdGenerator> {
        Arc::new(UlidGenerator::new(SystemClock))
    }

    fn post_job(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/jobs")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn error_message(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        body["error"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn submit_saves_job_and_returns_201() {
        let store = MemoryStore::new();
        let app = router(Arc::new(store.clone()), ids(), "/jobs");
        let body = json!({"type": "job", "flow": "build", "owner": "acme", "params": {"x": 1},
                          "state": "$$complete", "steps": [{"bogus": true}]});

        let resp = app.oneshot(post_job(body.to_string())).await.unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());

        let jobs = store.documents().await;
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert!(job["_id"].as_str().unwrap().parse::<JobId>().is_ok());
        assert_eq!(job["params"], json!({"x": 1}));
        assert!(job.get("state").is_none());
        assert!(job.get("steps").is_none());
    }

    #[tokio::test]
    async fn submitted_job_can_be_read_back() {
        let store = MemoryStore::new();
        let app = router(Arc::new(store), ids(), "/jobs/");
        let body = json!({"_id": "job-1", "type": "job", "flow": "build", "owner": "acme"});

        let resp = app.clone().oneshot(post_job(body.to_string())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/jobs/job-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["flow"], "build");

        let resp = app
            .oneshot(Request::builder().uri("/jobs/job-2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected_with_400() {
        let app = router(Arc::new(MemoryStore::new()), ids(), "/jobs");
        for body in [
            String::new(),
            "{not json".to_string(),
            json!(["job"]).to_string(),
            json!({"type": "task", "flow": "f", "owner": "o"}).to_string(),
            json!({"type": "job", "owner": "o"}).to_string(),
            json!({"type": "job", "flow": "f", "owner": "o", "params": 3}).to_string(),
        ] {
            let resp = app.clone().oneshot(post_job(body.clone())).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body: {body}");
            assert!(!error_message(resp).await.is_empty());
        }
    }

    #[tokio::test]
    async fn store_failure_is_500() {
        let app = router(Arc::new(BrokenStore), ids(), "/jobs");
        let body = json!({"type": "job", "flow": "f", "owner": "o"});

        let resp = app.oneshot(post_job(body.to_string())).await.unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error_message(resp).await.contains("connection refused"));
    }
}
