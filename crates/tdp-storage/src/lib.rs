//! Tender store backends + HTTP fetch utilities for TDP.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tdp_core::{IngestError, StoredNotice, TargetSchema, TenderNotice, TenderPage, TenderQuery};
use thiserror::Error;
use tracing::{info, Instrument};

mod memory;
mod postgres;

pub use memory::{FailurePlan, MemoryTenderStore};
pub use postgres::{
    clamp_insert_batch, copy_csv_header, push_copy_record, quote_ident, PgTenderStore,
    CLEAR_SENTINEL, DEFAULT_INSERT_BATCH_SIZE,
};

pub const CRATE_NAME: &str = "tdp-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Successful response whose body has not been read yet.
#[derive(Debug)]
pub struct FetchedStream {
    pub content_length: Option<u64>,
    response: reqwest::Response,
}

impl FetchedStream {
    pub fn into_byte_stream(self) -> BoxStream<'static, Result<Bytes, FetchError>> {
        self.response
            .bytes_stream()
            .map_err(FetchError::Request)
            .boxed()
    }
}

/// Single-shot GET client. Failures are reported, never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn open(&self, url: &str) -> Result<FetchedStream, FetchError> {
        let span = tracing::info_span!("http_fetch", url);
        async {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: response.url().to_string(),
                });
            }

            let content_length = response.content_length();
            info!(status = status.as_u16(), ?content_length, "response headers received");
            Ok(FetchedStream {
                content_length,
                response,
            })
        }
        .instrument(span)
        .await
    }
}

pub type NoticeStream<'a> = BoxStream<'a, Result<TenderNotice, IngestError>>;

/// How remapped rows reach the destination table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Re-encode as CSV and stream through `COPY ... FROM STDIN`.
    #[default]
    Copy,
    /// Batched multi-row `INSERT` statements.
    Insert,
}

impl FromStr for LoadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(LoadStrategy::Copy),
            "insert" => Ok(LoadStrategy::Insert),
            other => Err(format!("unknown load strategy `{other}`")),
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStrategy::Copy => f.write_str("copy"),
            LoadStrategy::Insert => f.write_str("insert"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceOutcome {
    pub cleared: u64,
    pub loaded: u64,
}

/// Destination for tender snapshots.
///
/// `replace_all` is the only mutating operation: it clears the table and loads
/// `rows` as one unit, so any error leaves the previous snapshot in place.
#[async_trait]
pub trait TenderStore: Send + Sync {
    fn schema(&self) -> &TargetSchema;

    async fn replace_all(
        &self,
        rows: NoticeStream<'_>,
        strategy: LoadStrategy,
    ) -> Result<ReplaceOutcome, IngestError>;

    /// Every stored notice in load order.
    async fn fetch_all(&self) -> anyhow::Result<Vec<StoredNotice>>;

    async fn search(&self, query: &TenderQuery) -> anyhow::Result<TenderPage>;
}
