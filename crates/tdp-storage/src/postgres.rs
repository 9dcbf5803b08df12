use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{QueryBuilder, Row, Transaction};
use tdp_core::{
    IngestError, Pagination, StoredNotice, TargetSchema, TenderNotice, TenderPage, TenderQuery,
    TenderSort, TenderSummary, CATEGORY_FIELD, CLOSING_DATE_FIELD, DESTINATION_TABLE,
    ORDINAL_COLUMN, PUBLICATION_DATE_FIELD, REFERENCE_NUMBER_FIELD, REGIONS_OF_DELIVERY_FIELD,
    STATUS_FIELD, TITLE_FIELD,
};
use tracing::{info, warn};

use crate::{LoadStrategy, NoticeStream, ReplaceOutcome, TenderStore};

/// Reference number no real notice carries; the clear step deletes every row
/// that is distinct from it.
pub const CLEAR_SENTINEL: &str = "__tdp_no_such_reference__";

pub const DEFAULT_INSERT_BATCH_SIZE: usize = 500;

const POSTGRES_MAX_BINDS: usize = 65_535;
const COPY_CHUNK_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct PgTenderStore {
    pool: PgPool,
    schema: TargetSchema,
    insert_batch_size: usize,
}

impl PgTenderStore {
    pub fn new(pool: PgPool, schema: TargetSchema) -> Self {
        let insert_batch_size = clamp_insert_batch(DEFAULT_INSERT_BATCH_SIZE, schema.len());
        Self {
            pool,
            schema,
            insert_batch_size,
        }
    }

    /// Builds a pool that connects on first use, so a missing database does
    /// not stop the process from starting.
    pub fn connect_lazy(database_url: &str, schema: TargetSchema) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .context("parsing database url")?;
        Ok(Self::new(pool, schema))
    }

    pub fn with_insert_batch_size(mut self, requested: usize) -> Self {
        self.insert_batch_size = clamp_insert_batch(requested, self.schema.len());
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        Ok(())
    }

    fn column_list(&self) -> String {
        std::iter::once(ORDINAL_COLUMN)
            .chain(self.schema.fields().iter().map(String::as_str))
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn copy_rows(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        mut rows: NoticeStream<'_>,
    ) -> Result<u64, IngestError> {
        let statement = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
            quote_ident(DESTINATION_TABLE),
            self.column_list()
        );
        let mut copy = tx.copy_in_raw(&statement).await.map_err(load_error)?;

        let mut buf = copy_csv_header(&self.schema).into_bytes();
        let mut ordinal = 0i64;
        while let Some(row) = rows.next().await {
            let notice = match row {
                Ok(notice) => notice,
                Err(err) => {
                    if let Err(abort_err) = copy.abort(err.to_string()).await {
                        warn!(error = %abort_err, "aborting copy stream");
                    }
                    return Err(err);
                }
            };
            push_copy_record(&mut buf, ordinal, &notice, &self.schema);
            ordinal += 1;
            if buf.len() >= COPY_CHUNK_BYTES {
                copy.send(std::mem::take(&mut buf))
                    .await
                    .map_err(load_error)?;
            }
        }
        if !buf.is_empty() {
            copy.send(buf).await.map_err(load_error)?;
        }
        copy.finish().await.map_err(load_error)
    }

    async fn insert_rows(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        mut rows: NoticeStream<'_>,
    ) -> Result<u64, IngestError> {
        let mut next_ordinal = 0i64;
        let mut batch = Vec::with_capacity(self.insert_batch_size);
        while let Some(row) = rows.next().await {
            batch.push(row?);
            if batch.len() >= self.insert_batch_size {
                self.insert_batch(tx, next_ordinal, &batch).await?;
                next_ordinal += batch.len() as i64;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.insert_batch(tx, next_ordinal, &batch).await?;
            next_ordinal += batch.len() as i64;
        }
        Ok(next_ordinal as u64)
    }

    async fn insert_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        first_ordinal: i64,
        batch: &[TenderNotice],
    ) -> Result<(), IngestError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            quote_ident(DESTINATION_TABLE),
            self.column_list()
        ));
        qb.push_values(batch.iter().enumerate(), |mut row, (idx, notice)| {
            row.push_bind(first_ordinal + idx as i64);
            for value in notice.values_in(&self.schema) {
                row.push_bind(value.map(str::to_string));
            }
        });
        qb.build().execute(&mut **tx).await.map_err(load_error)?;
        Ok(())
    }

    fn decode_row(&self, row: &PgRow) -> anyhow::Result<StoredNotice> {
        let ordinal: i64 = row.try_get(ORDINAL_COLUMN)?;
        let mut notice = TenderNotice::new();
        for field in self.schema.fields() {
            let value: Option<String> = row
                .try_get(field.as_str())
                .with_context(|| format!("reading column {field}"))?;
            if let Some(value) = value {
                notice.insert(field.clone(), value);
            }
        }
        Ok(StoredNotice { ordinal, notice })
    }
}

#[async_trait]
impl TenderStore for PgTenderStore {
    fn schema(&self) -> &TargetSchema {
        &self.schema
    }

    async fn replace_all(
        &self,
        rows: NoticeStream<'_>,
        strategy: LoadStrategy,
    ) -> Result<ReplaceOutcome, IngestError> {
        let mut tx = self.pool.begin().await.map_err(clear_error)?;

        let cleared = sqlx::query(&format!(
            "DELETE FROM {} WHERE {} IS DISTINCT FROM $1",
            quote_ident(DESTINATION_TABLE),
            quote_ident(REFERENCE_NUMBER_FIELD)
        ))
        .bind(CLEAR_SENTINEL)
        .execute(&mut *tx)
        .await
        .map_err(clear_error)?
        .rows_affected();

        let loaded = match strategy {
            LoadStrategy::Copy => self.copy_rows(&mut tx, rows).await?,
            LoadStrategy::Insert => self.insert_rows(&mut tx, rows).await?,
        };

        tx.commit().await.map_err(load_error)?;
        info!(cleared, loaded, %strategy, "destination snapshot replaced");
        Ok(ReplaceOutcome { cleared, loaded })
    }

    async fn fetch_all(&self) -> anyhow::Result<Vec<StoredNotice>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            self.column_list(),
            quote_ident(DESTINATION_TABLE),
            quote_ident(ORDINAL_COLUMN)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("loading open tender notices")?;
        rows.iter().map(|row| self.decode_row(row)).collect()
    }

    async fn search(&self, query: &TenderQuery) -> anyhow::Result<TenderPage> {
        let query = query.clone().normalized();

        let mut count: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT COUNT(*) FROM {} WHERE TRUE",
            quote_ident(DESTINATION_TABLE)
        ));
        push_filters(&mut count, &query);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("counting tender notices")?;

        let mut select: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE TRUE",
            self.column_list(),
            quote_ident(DESTINATION_TABLE)
        ));
        push_filters(&mut select, &query);
        select.push(order_by_clause(query.sort));
        select
            .push(" LIMIT ")
            .push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .context("searching tender notices")?;

        let mut tenders = Vec::with_capacity(rows.len());
        for row in &rows {
            tenders.push(TenderSummary::from(&self.decode_row(row)?.notice));
        }
        Ok(TenderPage {
            tenders,
            pagination: Pagination::new(total.max(0) as u64, query.page, query.limit),
        })
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &TenderQuery) {
    if let Some(q) = &query.query {
        qb.push(format!(" AND {} ILIKE ", quote_ident(TITLE_FIELD)))
            .push_bind(like_pattern(q));
    }
    if let Some(category) = &query.category {
        qb.push(format!(" AND {} = ", quote_ident(CATEGORY_FIELD)))
            .push_bind(category.clone());
    }
    if let Some(location) = &query.location {
        qb.push(format!(" AND {} ILIKE ", quote_ident(REGIONS_OF_DELIVERY_FIELD)))
            .push_bind(like_pattern(location));
    }
    if let Some(status) = &query.status {
        qb.push(format!(" AND {} = ", quote_ident(STATUS_FIELD)))
            .push_bind(status.clone());
    }
    if let Some(from) = &query.deadline_from {
        qb.push(format!(" AND {} >= ", quote_ident(CLOSING_DATE_FIELD)))
            .push_bind(from.clone());
    }
    if let Some(to) = &query.deadline_to {
        qb.push(format!(" AND {} <= ", quote_ident(CLOSING_DATE_FIELD)))
            .push_bind(to.clone());
    }
}

fn order_by_clause(sort: TenderSort) -> String {
    let keys = match sort {
        TenderSort::Newest => vec![(PUBLICATION_DATE_FIELD, "DESC")],
        TenderSort::Oldest => vec![(PUBLICATION_DATE_FIELD, "ASC")],
        TenderSort::Relevance => vec![
            (STATUS_FIELD, "DESC"),
            (CLOSING_DATE_FIELD, "ASC"),
            (CATEGORY_FIELD, "ASC"),
        ],
    };
    let mut parts = keys
        .into_iter()
        .map(|(field, dir)| format!("{} {dir} NULLS LAST", quote_ident(field)))
        .collect::<Vec<_>>();
    parts.push(quote_ident(ORDINAL_COLUMN));
    format!(" ORDER BY {}", parts.join(", "))
}

fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn clear_error(err: sqlx::Error) -> IngestError {
    IngestError::Clear(err.to_string())
}

fn load_error(err: sqlx::Error) -> IngestError {
    IngestError::Load(err.to_string())
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Largest batch that keeps one multi-row insert under the bind limit.
pub fn clamp_insert_batch(requested: usize, field_count: usize) -> usize {
    let max_rows = (POSTGRES_MAX_BINDS / (field_count + 1)).max(1);
    requested.clamp(1, max_rows)
}

/// CSV header for the COPY payload: ordinal column, then schema order.
pub fn copy_csv_header(schema: &TargetSchema) -> String {
    let mut header = std::iter::once(ORDINAL_COLUMN)
        .chain(schema.fields().iter().map(String::as_str))
        .map(quote_csv)
        .collect::<Vec<_>>()
        .join(",");
    header.push('\n');
    header
}

/// Appends one COPY CSV record. Present values are always quoted so an empty
/// string stays empty; absent values are left unquoted and load as NULL.
pub fn push_copy_record(buf: &mut Vec<u8>, ordinal: i64, notice: &TenderNotice, schema: &TargetSchema) {
    buf.extend_from_slice(ordinal.to_string().as_bytes());
    for value in notice.values_in(schema) {
        buf.push(b',');
        if let Some(value) = value {
            buf.extend_from_slice(quote_csv(value).as_bytes());
        }
    }
    buf.push(b'\n');
}

fn quote_csv(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
