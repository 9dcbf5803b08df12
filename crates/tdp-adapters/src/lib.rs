//! CSV source contracts + buffered and streaming decoders for tender notices.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tdp_core::{IngestError, RawRow};
use tdp_storage::{FetchError, HttpFetcher};
use tokio_util::io::StreamReader;
use tracing::warn;

pub const CRATE_NAME: &str = "tdp-adapters";

/// Bodies up to this size are buffered when the decode mode is `auto`.
pub const DEFAULT_STREAMING_THRESHOLD_BYTES: u64 = 8 * 1024 * 1024;

pub type ByteStream = BoxStream<'static, Result<Bytes, IngestError>>;

/// An opened CSV body, not yet decoded.
pub struct CsvDownload {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl fmt::Debug for CsvDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsvDownload")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CsvSource: Send + Sync {
    /// Human-readable origin used in logs and run summaries.
    fn describe(&self) -> String;

    async fn open(&self) -> Result<CsvDownload, IngestError>;
}

/// Remote tender-notice CSV fetched over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCsvSource {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpCsvSource {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CsvSource for HttpCsvSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn open(&self) -> Result<CsvDownload, IngestError> {
        let fetched = self.fetcher.open(&self.url).await.map_err(download_error)?;
        let content_length = fetched.content_length;
        Ok(CsvDownload {
            content_length,
            body: fetched.into_byte_stream().map_err(download_error).boxed(),
        })
    }
}

fn download_error(err: FetchError) -> IngestError {
    IngestError::Download(err.to_string())
}

/// CSV held in memory: local snapshot files and test fixtures.
#[derive(Debug, Clone)]
pub struct StaticCsvSource {
    label: String,
    body: Result<Bytes, String>,
    chunk_size: usize,
    advertise_length: bool,
    fail_after_bytes: Option<(usize, String)>,
}

impl StaticCsvSource {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            label: "static".to_string(),
            body: Ok(body.into()),
            chunk_size: 64 * 1024,
            advertise_length: true,
            fail_after_bytes: None,
        }
    }

    /// A source whose `open` always fails with a download error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            body: Err(message.into()),
            ..Self::new(Bytes::new())
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Omits the content length, as chunked HTTP responses do.
    pub fn without_length(mut self) -> Self {
        self.advertise_length = false;
        self
    }

    /// Cuts the body after `bytes` and yields a transport error instead.
    pub fn interrupted_after(mut self, bytes: usize, message: impl Into<String>) -> Self {
        self.fail_after_bytes = Some((bytes, message.into()));
        self
    }
}

#[async_trait]
impl CsvSource for StaticCsvSource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn open(&self) -> Result<CsvDownload, IngestError> {
        let body = self.body.clone().map_err(IngestError::Download)?;
        let content_length = self.advertise_length.then_some(body.len() as u64);

        let (body, failure) = match &self.fail_after_bytes {
            Some((limit, message)) => (
                body.slice(..(*limit).min(body.len())),
                Some(IngestError::Download(message.clone())),
            ),
            None => (body, None),
        };

        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + self.chunk_size).min(body.len());
            chunks.push(Ok(body.slice(offset..end)));
            offset = end;
        }
        if let Some(err) = failure {
            chunks.push(Err(err));
        }

        Ok(CsvDownload {
            content_length,
            body: stream::iter(chunks).boxed(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    /// Buffered for small known-length bodies, streaming otherwise.
    #[default]
    Auto,
    Buffered,
    Streaming,
}

impl DecodeMode {
    pub fn resolve(self, content_length: Option<u64>, threshold: u64) -> DecodeMode {
        match self {
            DecodeMode::Auto => match content_length {
                Some(len) if len <= threshold => DecodeMode::Buffered,
                _ => DecodeMode::Streaming,
            },
            other => other,
        }
    }
}

impl FromStr for DecodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DecodeMode::Auto),
            "buffered" => Ok(DecodeMode::Buffered),
            "streaming" => Ok(DecodeMode::Streaming),
            other => Err(format!("unknown decode mode `{other}`")),
        }
    }
}

impl fmt::Display for DecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeMode::Auto => f.write_str("auto"),
            DecodeMode::Buffered => f.write_str("buffered"),
            DecodeMode::Streaming => f.write_str("streaming"),
        }
    }
}

/// Fully materialized decode result.
#[derive(Debug, Clone)]
pub struct DecodedCsv {
    pub columns: Arc<[String]>,
    pub rows: Vec<RawRow>,
    pub skipped_records: usize,
}

/// Incremental decode result; rows are produced as the body arrives.
pub struct RowStream {
    pub columns: Arc<[String]>,
    pub rows: BoxStream<'static, Result<RawRow, IngestError>>,
    skipped: Arc<AtomicUsize>,
}

impl RowStream {
    /// Handle that keeps counting skipped records while `rows` is consumed.
    pub fn skipped_counter(&self) -> Arc<AtomicUsize> {
        self.skipped.clone()
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.columns)
            .field("skipped", &self.skipped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub async fn collect_body(mut body: ByteStream) -> Result<Vec<u8>, IngestError> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

pub fn decode_buffered(bytes: &[u8]) -> Result<DecodedCsv, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let header = reader
        .headers()
        .map_err(|err| IngestError::Parse(err.to_string()))?
        .clone();
    let columns = normalize_header(header.iter())?;

    let mut rows = Vec::new();
    let mut skipped_records = 0usize;
    for (index, record) in reader.records().enumerate() {
        match record {
            Ok(record) if is_blank_line(record.len(), record.iter()) => {}
            Ok(record) => rows.push(RawRow::new(
                columns.clone(),
                record.iter().map(str::to_string).collect(),
            )),
            Err(err) if matches!(err.kind(), csv::ErrorKind::Io(_)) => {
                return Err(IngestError::Download(err.to_string()));
            }
            Err(err) => {
                skipped_records += 1;
                warn!(record = index + 1, error = %err, "skipping unreadable csv record");
            }
        }
    }

    Ok(DecodedCsv {
        columns,
        rows,
        skipped_records,
    })
}

pub async fn decode_streaming(body: ByteStream) -> Result<RowStream, IngestError> {
    let reader = StreamReader::new(body.map_err(io::Error::other));
    let mut csv_reader = csv_async::AsyncReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .create_reader(reader);

    let header = match csv_reader.headers().await {
        Ok(header) => header.clone(),
        Err(err) if is_io_error(&err) => return Err(IngestError::Download(err.to_string())),
        Err(err) => return Err(IngestError::Parse(err.to_string())),
    };
    let columns = normalize_header(header.iter())?;

    let skipped = Arc::new(AtomicUsize::new(0));
    let row_columns = columns.clone();
    let counter = skipped.clone();
    let rows = csv_reader
        .into_records()
        .enumerate()
        .filter_map(move |(index, record)| {
            let columns = row_columns.clone();
            let counter = counter.clone();
            async move {
                match record {
                    Ok(record) if is_blank_line(record.len(), record.iter()) => None,
                    Ok(record) => Some(Ok(RawRow::new(
                        columns,
                        record.iter().map(str::to_string).collect(),
                    ))),
                    Err(err) if is_io_error(&err) => {
                        Some(Err(IngestError::Download(err.to_string())))
                    }
                    Err(err) => {
                        counter.fetch_add(1, Ordering::Relaxed);
                        warn!(record = index + 1, error = %err, "skipping unreadable csv record");
                        None
                    }
                }
            }
        })
        .boxed();

    Ok(RowStream {
        columns,
        rows,
        skipped,
    })
}

fn is_io_error(err: &csv_async::Error) -> bool {
    matches!(err.kind(), csv_async::ErrorKind::Io(_))
}

/// Trims header names and strips a leading byte-order mark.
pub fn normalize_header<'a>(names: impl Iterator<Item = &'a str>) -> Result<Arc<[String]>, IngestError> {
    let columns = names
        .map(|name| name.trim_start_matches('\u{feff}').trim().to_string())
        .collect::<Vec<_>>();
    if columns.iter().all(String::is_empty) {
        return Err(IngestError::Parse("csv has no header row".to_string()));
    }
    Ok(columns.into())
}

fn is_blank_line<'a>(len: usize, mut fields: impl Iterator<Item = &'a str>) -> bool {
    // Whitespace is data: only a lone empty field is a skipped line.
    len <= 1 && fields.all(str::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_buffers_small_known_bodies() {
        assert_eq!(DecodeMode::Auto.resolve(Some(10), 100), DecodeMode::Buffered);
        assert_eq!(DecodeMode::Auto.resolve(Some(101), 100), DecodeMode::Streaming);
        assert_eq!(DecodeMode::Auto.resolve(None, 100), DecodeMode::Streaming);
        assert_eq!(DecodeMode::Buffered.resolve(None, 0), DecodeMode::Buffered);
    }

    #[test]
    fn decode_mode_round_trips_through_strings() {
        assert_eq!("Streaming".parse::<DecodeMode>(), Ok(DecodeMode::Streaming));
        assert_eq!(DecodeMode::Buffered.to_string(), "buffered");
        assert!("lazy".parse::<DecodeMode>().is_err());
    }

    #[test]
    fn buffered_decode_skips_blank_lines_and_keeps_ragged_rows() {
        let csv = "a,b,c\n1,2,3\n\n4,5\n6,7,8,9\n";
        let decoded = decode_buffered(csv.as_bytes()).expect("decode");
        assert_eq!(decoded.rows.len(), 3);
        assert_eq!(decoded.rows[1].get("b"), Some("5"));
        assert_eq!(decoded.rows[1].get("c"), None);
        assert_eq!(decoded.rows[2].values().len(), 3);
        assert_eq!(decoded.skipped_records, 0);
    }

    #[tokio::test]
    async fn whitespace_only_single_column_record_is_kept() {
        let csv = "note\nfirst\n \n\nlast\n";
        let buffered = decode_buffered(csv.as_bytes()).expect("buffered");
        let notes = buffered
            .rows
            .iter()
            .map(|r| r.get("note").unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(notes, ["first", " ", "last"]);

        let download = StaticCsvSource::new(csv).with_chunk_size(2).open().await.expect("open");
        let streamed = decode_streaming(download.body).await.expect("streaming");
        let rows = streamed.rows.try_collect::<Vec<_>>().await.expect("rows");
        assert_eq!(rows, buffered.rows);
    }

    #[test]
    fn buffered_decode_skips_invalid_utf8_record() {
        let mut csv = b"a,b\n1,2\n".to_vec();
        csv.extend_from_slice(b"\xff\xfe,3\n5,6\n");
        let decoded = decode_buffered(&csv).expect("decode");
        assert_eq!(decoded.skipped_records, 1);
        let firsts = decoded
            .rows
            .iter()
            .map(|r| r.get("a").unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(firsts, ["1", "5"]);
    }

    #[test]
    fn header_bom_and_whitespace_are_stripped() {
        let csv = "\u{feff}title-titre-eng , referenceNumber-numeroReference\nX,R\n";
        let decoded = decode_buffered(csv.as_bytes()).expect("decode");
        assert_eq!(
            decoded.columns.as_ref(),
            ["title-titre-eng", "referenceNumber-numeroReference"]
        );
    }

    #[test]
    fn empty_document_is_a_parse_error() {
        let err = decode_buffered(b"").expect_err("empty");
        assert!(matches!(err, IngestError::Parse(_)));
    }

    #[tokio::test]
    async fn streaming_decode_matches_buffered_across_chunk_boundaries() {
        let csv = "a,b\n\"multi\nline\",2\n\n3,\"4,4\"\n";
        let buffered = decode_buffered(csv.as_bytes()).expect("buffered");

        let download = StaticCsvSource::new(csv).with_chunk_size(3).open().await.expect("open");
        let streamed = decode_streaming(download.body).await.expect("streaming");
        assert_eq!(streamed.columns, buffered.columns);
        let rows = streamed.rows.try_collect::<Vec<_>>().await.expect("rows");
        assert_eq!(rows, buffered.rows);
    }

    #[tokio::test]
    async fn streaming_transport_error_surfaces_as_download_error() {
        let csv = "a,b\n1,2\n3,4\n5,6\n";
        let download = StaticCsvSource::new(csv)
            .with_chunk_size(4)
            .interrupted_after(10, "connection reset")
            .open()
            .await
            .expect("open");
        let streamed = decode_streaming(download.body).await.expect("header decodes");
        let results = streamed.rows.collect::<Vec<_>>().await;
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(IngestError::Download(msg)) if msg.contains("connection reset"))));
    }

    #[tokio::test]
    async fn failing_source_reports_download_error() {
        let err = StaticCsvSource::failing("dns").open().await.expect_err("fails");
        assert_eq!(err, IngestError::Download("dns".into()));
    }
}
