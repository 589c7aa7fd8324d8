//! Axum JSON API exposing the two batch triggers.
//!
//! `POST /extract` and `POST /materialize` mirror the invocation contracts
//! of the pipeline stages: every outcome, including fatal faults, comes back
//! as a structured JSON payload with an `ok` flag.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use curb_extract::{ExtractJob, ExtractParams};
use curb_materialize::MaterializeJob;
use curb_store::{BlobStore, FsBlobStore};
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "curb-web";

/// Environment-driven service configuration.
///
/// The storage container is the one required setting; both namespace
/// prefixes fall back to their conventional values.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_root: PathBuf,
    pub scrapes_prefix: String,
    pub structured_prefix: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let store_root = std::env::var("CURB_STORE_ROOT")
            .map(PathBuf::from)
            .context("missing CURB_STORE_ROOT env")?;
        Ok(Self {
            store_root,
            scrapes_prefix: std::env::var("SCRAPES_PREFIX")
                .unwrap_or_else(|_| "scrapes".to_string()),
            structured_prefix: std::env::var("STRUCTURED_PREFIX")
                .unwrap_or_else(|_| "structured".to_string()),
            port: std::env::var("CURB_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn BlobStore>,
    scrapes_prefix: String,
    structured_prefix: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn BlobStore>,
        scrapes_prefix: impl Into<String>,
        structured_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            scrapes_prefix: scrapes_prefix.into(),
            structured_prefix: structured_prefix.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(FsBlobStore::new(config.store_root.clone())),
            config.scrapes_prefix.clone(),
            config.structured_prefix.clone(),
        )
    }

    pub fn extract_job(&self) -> ExtractJob {
        ExtractJob::new(
            self.store.clone(),
            self.scrapes_prefix.clone(),
            self.structured_prefix.clone(),
        )
    }

    pub fn materialize_job(&self) -> MaterializeJob {
        MaterializeJob::new(self.store.clone(), self.structured_prefix.clone())
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/extract", post(extract_handler))
        .route("/materialize", post(materialize_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> Result<()> {
    let config = Config::from_env()?;
    let state = AppState::from_config(&config);
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "service": CRATE_NAME }))
}

async fn extract_handler(
    State(state): State<Arc<AppState>>,
    params: Option<Json<ExtractParams>>,
) -> Response {
    let params = params.map(|Json(p)| p).unwrap_or_default();
    match state.extract_job().run(&params).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => fault(err),
    }
}

async fn materialize_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.materialize_job().run().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => fault(err),
    }
}

/// Fatal faults still come back as a structured payload, never a bare 500.
fn fault(err: anyhow::Error) -> Response {
    error!(error = %err, "batch invocation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "ok": false, "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::util::ServiceExt;

    async fn seed(store: &FsBlobStore) {
        store
            .put(
                "scrapes/run_id=20250101000000/txt/post1.txt",
                b"2015 Honda Accord, $12,500, 45,000 miles",
            )
            .await
            .expect("seed");
    }

    fn test_app(store: Arc<FsBlobStore>) -> Router {
        app(AppState::new(store, "scrapes", "structured"))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn extract_without_body_processes_latest_run() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FsBlobStore::new(dir.path()));
        seed(&store).await;

        let response = test_app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/extract")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["run_id"], "20250101000000");
        assert_eq!(payload["written_jsonl"], 1);
        assert_eq!(payload["errors"], 0);
    }

    #[tokio::test]
    async fn extract_accepts_json_parameters() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FsBlobStore::new(dir.path()));
        seed(&store).await;

        let response = test_app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/extract")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"run_id":"20250101000000","max_files":0,"overwrite":true}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["written_jsonl"], 1);
        assert_eq!(payload["skipped_existing"], 0);
    }

    #[tokio::test]
    async fn invalid_run_id_comes_back_as_structured_fault() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FsBlobStore::new(dir.path()));

        let response = test_app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/extract")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"run_id":"yesterday"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let payload = body_json(response).await;
        assert_eq!(payload["ok"], false);
        assert!(payload["error"].as_str().unwrap().contains("run_id"));
    }

    #[tokio::test]
    async fn materialize_reports_counts_and_destination() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FsBlobStore::new(dir.path()));
        seed(&store).await;

        let extract = test_app(store.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/extract")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(extract.status(), StatusCode::OK);

        let response = test_app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/materialize")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["runs_scanned"], 1);
        assert_eq!(payload["unique_listings"], 1);
        assert_eq!(payload["rows_written"], 1);
        assert_eq!(payload["output_csv"], "structured/datasets/listings_master.csv");
    }

    #[tokio::test]
    async fn materialize_with_no_runs_is_empty_success() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FsBlobStore::new(dir.path()));

        let response = test_app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/materialize")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["runs_scanned"], 0);
    }
}
