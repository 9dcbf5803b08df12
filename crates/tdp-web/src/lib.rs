//! Axum HTTP surface for TDP: ingestion trigger, CSV passthrough, read-back and search.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tdp_adapters::CsvSource;
use tdp_core::{TenderPage, TenderQuery, TenderSort};
use tdp_storage::TenderStore;
use tdp_sync::{build_pipeline, build_postgres_store, maybe_build_scheduler, IngestConfig, IngestPipeline};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod error;

pub use error::ApiError;

pub const CRATE_NAME: &str = "tdp-web";

pub const WELCOME_MESSAGE: &str = "Welcome to TDP BACKEND.";

pub const PASSTHROUGH_FILENAME: &str = "newTenderNotice.csv";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    /// Cancelled on shutdown; in-flight ingestion runs observe it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>, shutdown: CancellationToken) -> Self {
        Self { pipeline, shutdown }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(3000),
        }
    }
}

/// Raw search parameters. Paging values that do not parse fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub query: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub status: Option<String>,
    pub deadline_from: Option<String>,
    pub deadline_to: Option<String>,
    pub sort_by: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl SearchParams {
    pub fn into_query(self) -> TenderQuery {
        let number = |raw: Option<String>| {
            raw.and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0)
        };
        TenderQuery {
            sort: TenderSort::parse(self.sort_by.as_deref()),
            page: number(self.page),
            limit: number(self.limit),
            query: self.query,
            category: self.category,
            location: self.location,
            status: self.status,
            deadline_from: self.deadline_from,
            deadline_to: self.deadline_to,
        }
        .normalized()
    }
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/", get(index_handler))
        .route("/getOpenTenderNoticesToDB", post(ingest_handler))
        .route("/getOpenTenderNotices", get(passthrough_handler))
        .route("/getOpenTenderNoticesFromDB", get(read_back_handler))
        .route("/api/v1/tenders/search", get(search_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let web = WebConfig::from_env();

    let store = Arc::new(build_postgres_store(&config)?);
    if let Err(err) = store.migrate().await {
        warn!(error = %err, "migrations not applied; database endpoints will fail until it is reachable");
    }
    let pipeline = Arc::new(build_pipeline(&config, store)?);

    let shutdown = CancellationToken::new();
    let scheduler = maybe_build_scheduler(&config, pipeline.clone(), shutdown.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.ingest_cron, "ingest scheduler started");
    }

    let listener = TcpListener::bind((web.host.as_str(), web.port))
        .await
        .with_context(|| format!("binding {}:{}", web.host, web.port))?;
    info!(address = %listener.local_addr()?, source = %config.source_url, "tdp backend listening");

    axum::serve(listener, app(AppState::new(pipeline, shutdown.clone())))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("serving http")?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested; cancelling in-flight ingestion");
    shutdown.cancel();
}

async fn index_handler() -> Json<Value> {
    Json(json!({ "message": WELCOME_MESSAGE }))
}

async fn ingest_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let summary = state
        .pipeline
        .run_with_cancel(&state.shutdown)
        .await
        .map_err(ApiError::Ingest)?;
    Ok(Json(json!({ "message": summary.message(), "run": summary })))
}

async fn passthrough_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let download = state
        .pipeline
        .source()
        .open()
        .await
        .map_err(ApiError::Upstream)?;

    let disposition = format!("attachment; filename={PASSTHROUGH_FILENAME}");
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(download.body),
    )
        .into_response())
}

async fn read_back_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Value>>, ApiError> {
    let store = state.pipeline.store();
    let rows = store.fetch_all().await?;
    let schema = store.schema();
    Ok(Json(
        rows.iter()
            .map(|stored| stored.notice.to_schema_json(schema))
            .collect(),
    ))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<TenderPage>, ApiError> {
    let page = state.pipeline.store().search(&params.into_query()).await?;
    Ok(Json(page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tdp_adapters::{DecodeMode, StaticCsvSource};
    use tdp_core::{TargetSchema, TenderNotice, REFERENCE_NUMBER_FIELD, TARGET_FIELDS};
    use tdp_storage::{FailurePlan, MemoryTenderStore};
    use tdp_sync::IngestOptions;
    use tower::ServiceExt;

    const CSV: &str = "referenceNumber-numeroReference,title-titre-eng,tenderStatus-appelOffresStatut-eng\nR-1,Road repair,Open\nR-2,,Expired\n";

    fn app_with(source: StaticCsvSource, store: Arc<MemoryTenderStore>) -> Router {
        let pipeline = IngestPipeline::new(
            Arc::new(source),
            store,
            IngestOptions {
                decode_mode: DecodeMode::Auto,
                streaming_threshold_bytes: 1024,
                ..Default::default()
            },
        );
        app(AppState::new(Arc::new(pipeline), CancellationToken::new()))
    }

    fn memory_store() -> Arc<MemoryTenderStore> {
        Arc::new(MemoryTenderStore::new(TargetSchema::canonical()))
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn index_returns_welcome_message() {
        let resp = app_with(StaticCsvSource::new(CSV), memory_store())
            .oneshot(get("/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["message"], WELCOME_MESSAGE);
    }

    #[tokio::test]
    async fn trigger_loads_rows_and_read_back_returns_every_field() {
        let store = memory_store();
        let app = app_with(StaticCsvSource::new(CSV), store.clone());

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/getOpenTenderNoticesToDB")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["run"]["rows_loaded"], 2);
        assert!(body["message"].as_str().unwrap().contains("COPY"));

        let resp = app.oneshot(get("/getOpenTenderNoticesFromDB")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let rows = json_body(resp).await;
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].as_object().unwrap().len(), TARGET_FIELDS.len());
        assert_eq!(rows[0][REFERENCE_NUMBER_FIELD], "R-1");
        assert_eq!(rows[1]["title-titre-eng"], "");
        assert!(rows[1]["gsin-nibs"].is_null());
    }

    #[tokio::test]
    async fn trigger_failure_reports_stage() {
        let store = memory_store();
        store
            .set_failures(FailurePlan {
                fail_clear: Some("relation is locked".into()),
                ..Default::default()
            })
            .await;
        let resp = app_with(StaticCsvSource::new(CSV), store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/getOpenTenderNoticesToDB")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["stage"], "clear");
        assert!(body["error"].as_str().unwrap().contains("relation is locked"));
    }

    #[tokio::test]
    async fn passthrough_streams_source_bytes_with_attachment_headers() {
        let resp = app_with(StaticCsvSource::new(CSV).with_chunk_size(9), memory_store())
            .oneshot(get("/getOpenTenderNotices"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/csv");
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=newTenderNotice.csv"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), CSV.as_bytes());
    }

    #[tokio::test]
    async fn passthrough_upstream_failure_is_bad_gateway() {
        let resp = app_with(StaticCsvSource::failing("http status 500"), memory_store())
            .oneshot(get("/getOpenTenderNotices"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("http status 500"));
    }

    #[tokio::test]
    async fn search_filters_and_paginates() {
        let store = memory_store();
        let mk = |reference: &str, title: &str, status: &str| {
            TenderNotice::from_pairs([
                (REFERENCE_NUMBER_FIELD, reference),
                ("title-titre-eng", title),
                ("tenderStatus-appelOffresStatut-eng", status),
            ])
        };
        store
            .seed(vec![
                mk("R-1", "Road repair", "Open"),
                mk("R-2", "Bridge design", "Open"),
                mk("R-3", "Road paving", "Expired"),
                mk("R-4", "Roadside mowing", "Open"),
            ])
            .await;

        let resp = app_with(StaticCsvSource::new(CSV), store)
            .oneshot(get("/api/v1/tenders/search?query=road&status=Open&limit=1&page=2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["pagination"]["total"], 2);
        assert_eq!(body["pagination"]["totalPages"], 2);
        assert_eq!(body["pagination"]["page"], 2);
        assert_eq!(body["tenders"].as_array().unwrap().len(), 1);
        assert!(body["tenders"][0]["referenceNumber"].is_string());
    }

    #[tokio::test]
    async fn search_with_out_of_range_page_returns_empty_page() {
        let store = memory_store();
        store
            .seed(vec![TenderNotice::from_pairs([(REFERENCE_NUMBER_FIELD, "R-1")])])
            .await;

        let resp = app_with(StaticCsvSource::new(CSV), store)
            .oneshot(get("/api/v1/tenders/search?page=18446744073709551615&limit=10"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["pagination"]["total"], 1);
        assert_eq!(body["pagination"]["page"], tdp_core::MAX_PAGE);
        assert!(body["tenders"].as_array().unwrap().is_empty());
    }

    #[test]
    fn search_params_fall_back_to_default_paging() {
        let query = SearchParams {
            page: Some("abc".into()),
            limit: Some("500".into()),
            sort_by: Some("newest".into()),
            query: Some("  ".into()),
            ..Default::default()
        }
        .into_query();
        assert_eq!(query.page, 1);
        assert_eq!(query.limit, tdp_core::MAX_PAGE_LIMIT);
        assert_eq!(query.sort, TenderSort::Newest);
        assert_eq!(query.query, None);
    }
}
