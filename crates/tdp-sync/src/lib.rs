//! Ingestion orchestration: fetch, decode, remap and replace, one run at a time.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tdp_adapters::{
    collect_body, decode_buffered, decode_streaming, ByteStream, CsvSource, DecodeMode,
    HttpCsvSource, StaticCsvSource, DEFAULT_STREAMING_THRESHOLD_BYTES,
};
use tdp_core::{ColumnPlan, ColumnReport, IngestError, RawRow, TargetSchema, DESTINATION_TABLE};
use tdp_storage::{
    HttpClientConfig, HttpFetcher, LoadStrategy, PgTenderStore, TenderStore,
    DEFAULT_INSERT_BATCH_SIZE,
};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tdp-sync";

pub const DEFAULT_SOURCE_URL: &str =
    "https://canadabuys.canada.ca/opendata/pub/openTenderNotice-ouvertAvisAppelOffres.csv";

/// The open-data endpoint rejects non-browser agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

pub const DEFAULT_INGEST_CRON: &str = "0 0 5 * * *";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub source_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub decode_mode: DecodeMode,
    pub streaming_threshold_bytes: u64,
    pub load_strategy: LoadStrategy,
    pub insert_batch_size: usize,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source. Missing, empty or
    /// unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| database_url_from_parts(&var)),
            source_url: var("OPEN_TENDER_NOTICES_URL")
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            user_agent: var("TDP_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: parsed(&var, "TDP_HTTP_TIMEOUT_SECS").unwrap_or(300),
            decode_mode: parsed(&var, "TDP_DECODE_MODE").unwrap_or_default(),
            streaming_threshold_bytes: parsed(&var, "TDP_STREAMING_THRESHOLD_BYTES")
                .unwrap_or(DEFAULT_STREAMING_THRESHOLD_BYTES),
            load_strategy: parsed(&var, "TDP_LOAD_STRATEGY").unwrap_or_default(),
            insert_batch_size: parsed(&var, "TDP_INSERT_BATCH_SIZE")
                .unwrap_or(DEFAULT_INSERT_BATCH_SIZE),
            scheduler_enabled: var("TDP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: var("TDP_INGEST_CRON").unwrap_or_else(|| DEFAULT_INGEST_CRON.to_string()),
        }
    }

    pub fn options(&self) -> IngestOptions {
        IngestOptions {
            decode_mode: self.decode_mode,
            streaming_threshold_bytes: self.streaming_threshold_bytes,
            load_strategy: self.load_strategy,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting; using default");
            None
        }
    }
}

fn database_url_from_parts(var: &impl Fn(&str) -> Option<String>) -> String {
    let user = var("PG_USER").unwrap_or_else(|| "postgres".to_string());
    let host = var("PG_HOST").unwrap_or_else(|| "localhost".to_string());
    let port = var("PG_PORT").unwrap_or_else(|| "5432".to_string());
    let database = var("PG_DATABASE").unwrap_or_else(|| "postgres".to_string());
    let credentials = match var("PG_PASSWORD") {
        Some(password) => format!("{}:{}", encode_userinfo(&user), encode_userinfo(&password)),
        None => encode_userinfo(&user),
    };
    format!("postgres://{credentials}@{host}:{port}/{database}")
}

fn encode_userinfo(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (b as char).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub decode_mode: DecodeMode,
    pub streaming_threshold_bytes: u64,
    pub load_strategy: LoadStrategy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            decode_mode: DecodeMode::Auto,
            streaming_threshold_bytes: DEFAULT_STREAMING_THRESHOLD_BYTES,
            load_strategy: LoadStrategy::Copy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub decode_mode: DecodeMode,
    pub load_strategy: LoadStrategy,
    pub rows_decoded: u64,
    pub rows_loaded: u64,
    pub rows_cleared: u64,
    pub skipped_records: usize,
    pub source_bytes: u64,
    pub source_sha256: String,
    pub columns: ColumnReport,
}

impl IngestRunSummary {
    pub fn message(&self) -> String {
        let via = match self.load_strategy {
            LoadStrategy::Copy => "COPY",
            LoadStrategy::Insert => "INSERT",
        };
        format!(
            "CSV data imported successfully via {via}! {} rows loaded into {DESTINATION_TABLE}.",
            self.rows_loaded
        )
    }
}

#[derive(Default)]
struct BodyDigest {
    hasher: Sha256,
    bytes: u64,
}

type SharedDigest = Arc<StdMutex<BodyDigest>>;

fn digesting(body: ByteStream, digest: SharedDigest) -> ByteStream {
    body.inspect_ok(move |chunk| {
        let mut state = digest.lock().unwrap_or_else(PoisonError::into_inner);
        state.hasher.update(chunk);
        state.bytes += chunk.len() as u64;
    })
    .boxed()
}

struct DecodedRows {
    columns: Arc<[String]>,
    rows: BoxStream<'static, Result<RawRow, IngestError>>,
    skipped: Arc<AtomicUsize>,
}

/// Runs ingestions against one source and one store.
///
/// Runs are serialized: a caller arriving while another run is in flight
/// waits for it to finish before starting its own.
pub struct IngestPipeline {
    source: Arc<dyn CsvSource>,
    store: Arc<dyn TenderStore>,
    options: IngestOptions,
    run_lock: Mutex<()>,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn CsvSource>,
        store: Arc<dyn TenderStore>,
        options: IngestOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
            run_lock: Mutex::new(()),
        }
    }

    pub fn source(&self) -> &Arc<dyn CsvSource> {
        &self.source
    }

    pub fn store(&self) -> &Arc<dyn TenderStore> {
        &self.store
    }

    pub fn schema(&self) -> &TargetSchema {
        self.store.schema()
    }

    pub async fn run_once(&self) -> Result<IngestRunSummary, IngestError> {
        self.run_with_cancel(&CancellationToken::new()).await
    }

    /// Dropping the in-flight run on cancellation rolls back any open load.
    pub async fn run_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<IngestRunSummary, IngestError> {
        let _running = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            guard = self.run_lock.lock() => guard,
        };

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("ingest_run", %run_id);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            result = self.execute(run_id).instrument(span.clone()) => result,
        };

        span.in_scope(|| match &result {
            Ok(summary) => info!(
                rows_loaded = summary.rows_loaded,
                rows_cleared = summary.rows_cleared,
                skipped = summary.skipped_records,
                "ingest run finished"
            ),
            Err(err) => error!(stage = err.stage().as_str(), error = %err, "ingest run failed"),
        });
        result
    }

    async fn execute(&self, run_id: Uuid) -> Result<IngestRunSummary, IngestError> {
        let started_at = Utc::now();
        let source = self.source.describe();
        info!(%source, "ingest run started");

        let download = self.source.open().await?;
        let decode_mode = self
            .options
            .decode_mode
            .resolve(download.content_length, self.options.streaming_threshold_bytes);
        debug!(content_length = ?download.content_length, %decode_mode, "decode mode resolved");

        let digest = SharedDigest::default();
        let body = digesting(download.body, digest.clone());
        let decoded = match decode_mode {
            DecodeMode::Streaming => {
                let streamed = decode_streaming(body).await?;
                let skipped = streamed.skipped_counter();
                DecodedRows {
                    columns: streamed.columns,
                    rows: streamed.rows,
                    skipped,
                }
            }
            DecodeMode::Buffered | DecodeMode::Auto => {
                let bytes = collect_body(body).await?;
                let buffered = decode_buffered(&bytes)?;
                DecodedRows {
                    columns: buffered.columns,
                    rows: stream::iter(buffered.rows.into_iter().map(Ok)).boxed(),
                    skipped: Arc::new(AtomicUsize::new(buffered.skipped_records)),
                }
            }
        };

        let plan = ColumnPlan::resolve(&decoded.columns, self.store.schema());
        if plan.is_empty() {
            return Err(IngestError::Parse(format!(
                "none of the {} csv columns match a {DESTINATION_TABLE} field",
                decoded.columns.len()
            )));
        }
        log_column_report(plan.report());

        let rows_decoded = AtomicU64::new(0);
        let notices = decoded
            .rows
            .map_ok(|row| {
                rows_decoded.fetch_add(1, Ordering::Relaxed);
                plan.apply(row.values())
            })
            .boxed();
        let outcome = self
            .store
            .replace_all(notices, self.options.load_strategy)
            .await?;

        let (source_bytes, source_sha256) = {
            let state = digest.lock().unwrap_or_else(PoisonError::into_inner);
            (state.bytes, hex::encode(state.hasher.clone().finalize()))
        };

        Ok(IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source,
            decode_mode,
            load_strategy: self.options.load_strategy,
            rows_decoded: rows_decoded.load(Ordering::Relaxed),
            rows_loaded: outcome.loaded,
            rows_cleared: outcome.cleared,
            skipped_records: decoded.skipped.load(Ordering::Relaxed),
            source_bytes,
            source_sha256,
            columns: plan.report().clone(),
        })
    }
}

fn log_column_report(report: &ColumnReport) {
    info!(
        exact = report.exact.len(),
        prefix = report.prefix.len(),
        dropped = report.dropped.len(),
        unmatched_targets = report.unmatched_targets.len(),
        "csv columns mapped onto target schema"
    );
    for m in &report.prefix {
        debug!(source = %m.source, target = %m.target, "prefix column match");
    }
    if !report.dropped.is_empty() {
        warn!(columns = ?report.dropped, "csv columns dropped: no matching target field");
    }
}

pub fn build_postgres_store(config: &IngestConfig) -> Result<PgTenderStore> {
    Ok(
        PgTenderStore::connect_lazy(&config.database_url, TargetSchema::canonical())?
            .with_insert_batch_size(config.insert_batch_size),
    )
}

pub fn http_source(config: &IngestConfig) -> Result<HttpCsvSource> {
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    Ok(HttpCsvSource::new(fetcher, config.source_url.clone()))
}

/// Reads a local CSV snapshot for offline ingestion.
pub async fn file_source(path: &Path) -> Result<StaticCsvSource> {
    let body = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading csv snapshot {}", path.display()))?;
    Ok(StaticCsvSource::new(body).with_label(path.display().to_string()))
}

pub fn build_pipeline(config: &IngestConfig, store: Arc<dyn TenderStore>) -> Result<IngestPipeline> {
    let source = http_source(config)?;
    Ok(IngestPipeline::new(Arc::new(source), store, config.options()))
}

pub async fn maybe_build_scheduler(
    config: &IngestConfig,
    pipeline: Arc<IngestPipeline>,
    shutdown: CancellationToken,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.ingest_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        Box::pin(async move {
            info!("scheduled ingest triggered");
            if let Err(err) = pipeline.run_with_cancel(&shutdown).await {
                warn!(stage = err.stage().as_str(), error = %err, "scheduled ingest failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
