use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tdp_core::{
    IngestError, Pagination, StoredNotice, TargetSchema, TenderNotice, TenderPage, TenderQuery,
    TenderSummary,
};
use tokio::sync::Mutex;

use crate::{LoadStrategy, NoticeStream, ReplaceOutcome, TenderStore};

/// Failures to inject into the next `replace_all` calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailurePlan {
    pub fail_clear: Option<String>,
    /// Fail the load once this many rows have been staged.
    pub fail_load_after: Option<usize>,
}

/// In-process store with the same all-or-nothing replace contract as the
/// Postgres store. Used for tests and local runs without a database.
#[derive(Debug)]
pub struct MemoryTenderStore {
    schema: TargetSchema,
    rows: Mutex<Vec<StoredNotice>>,
    failures: Mutex<FailurePlan>,
    load_delay: Option<Duration>,
    replace_calls: AtomicUsize,
    active_writers: AtomicUsize,
    peak_writers: AtomicUsize,
}

impl MemoryTenderStore {
    pub fn new(schema: TargetSchema) -> Self {
        Self {
            schema,
            rows: Mutex::new(Vec::new()),
            failures: Mutex::new(FailurePlan::default()),
            load_delay: None,
            replace_calls: AtomicUsize::new(0),
            active_writers: AtomicUsize::new(0),
            peak_writers: AtomicUsize::new(0),
        }
    }

    /// Holds every load open for `delay` before staging rows.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub async fn seed(&self, notices: Vec<TenderNotice>) {
        *self.rows.lock().await = notices
            .into_iter()
            .enumerate()
            .map(|(idx, notice)| StoredNotice {
                ordinal: idx as i64,
                notice,
            })
            .collect();
    }

    pub async fn set_failures(&self, plan: FailurePlan) {
        *self.failures.lock().await = plan;
    }

    pub async fn snapshot(&self) -> Vec<StoredNotice> {
        self.rows.lock().await.clone()
    }

    pub fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrent_writers(&self) -> usize {
        self.peak_writers.load(Ordering::SeqCst)
    }
}

struct WriterGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> WriterGuard<'a> {
    fn enter(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TenderStore for MemoryTenderStore {
    fn schema(&self) -> &TargetSchema {
        &self.schema
    }

    async fn replace_all(
        &self,
        mut rows: NoticeStream<'_>,
        _strategy: LoadStrategy,
    ) -> Result<ReplaceOutcome, IngestError> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let _writer = WriterGuard::enter(&self.active_writers, &self.peak_writers);
        let plan = self.failures.lock().await.clone();

        if let Some(message) = plan.fail_clear {
            return Err(IngestError::Clear(message));
        }
        let cleared = self.rows.lock().await.len() as u64;

        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }

        let mut staged = Vec::new();
        while let Some(row) = rows.next().await {
            let notice = row?;
            if plan.fail_load_after.is_some_and(|limit| staged.len() >= limit) {
                return Err(IngestError::Load(format!(
                    "injected failure after {} rows",
                    staged.len()
                )));
            }
            staged.push(StoredNotice {
                ordinal: staged.len() as i64,
                notice,
            });
        }

        let loaded = staged.len() as u64;
        *self.rows.lock().await = staged;
        Ok(ReplaceOutcome { cleared, loaded })
    }

    async fn fetch_all(&self) -> anyhow::Result<Vec<StoredNotice>> {
        Ok(self.snapshot().await)
    }

    async fn search(&self, query: &TenderQuery) -> anyhow::Result<TenderPage> {
        let query = query.clone().normalized();
        let rows = self.rows.lock().await;
        let mut matched = rows
            .iter()
            .map(|stored| &stored.notice)
            .filter(|notice| query.matches(notice))
            .collect::<Vec<_>>();
        matched.sort_by(|a, b| query.compare(a, b));

        let total = matched.len() as u64;
        let tenders = matched
            .into_iter()
            .skip(query.offset())
            .take(query.limit)
            .map(TenderSummary::from)
            .collect();
        Ok(TenderPage {
            tenders,
            pagination: Pagination::new(total, query.page, query.limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tdp_core::{CLOSING_DATE_FIELD, REFERENCE_NUMBER_FIELD, STATUS_FIELD, TITLE_FIELD};

    fn notice(reference: &str) -> TenderNotice {
        TenderNotice::from_pairs([(REFERENCE_NUMBER_FIELD, reference)])
    }

    fn rows(refs: &[&str]) -> NoticeStream<'static> {
        let items = refs.iter().map(|r| Ok(notice(r))).collect::<Vec<_>>();
        stream::iter(items).boxed()
    }

    fn refs(snapshot: &[StoredNotice]) -> Vec<String> {
        snapshot
            .iter()
            .map(|s| s.notice.reference_number().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn replace_swaps_whole_snapshot() {
        let store = MemoryTenderStore::new(TargetSchema::canonical());
        store.seed(vec![notice("OLD-1"), notice("OLD-2")]).await;

        let outcome = store
            .replace_all(rows(&["N-1", "N-2", "N-3"]), LoadStrategy::Copy)
            .await
            .expect("replace");
        assert_eq!(outcome, ReplaceOutcome { cleared: 2, loaded: 3 });
        let snapshot = store.snapshot().await;
        assert_eq!(refs(&snapshot), ["N-1", "N-2", "N-3"]);
        assert_eq!(snapshot[2].ordinal, 2);
    }

    #[tokio::test]
    async fn injected_load_failure_keeps_previous_snapshot() {
        let store = MemoryTenderStore::new(TargetSchema::canonical());
        store.seed(vec![notice("OLD-1")]).await;
        store
            .set_failures(FailurePlan {
                fail_load_after: Some(1),
                ..Default::default()
            })
            .await;

        let err = store
            .replace_all(rows(&["N-1", "N-2"]), LoadStrategy::Insert)
            .await
            .expect_err("load must fail");
        assert!(matches!(err, IngestError::Load(_)));
        assert_eq!(refs(&store.snapshot().await), ["OLD-1"]);
    }

    #[tokio::test]
    async fn stream_error_aborts_load() {
        let store = MemoryTenderStore::new(TargetSchema::canonical());
        store.seed(vec![notice("OLD-1")]).await;
        let items = vec![Ok(notice("N-1")), Err(IngestError::Download("reset".into()))];
        let err = store
            .replace_all(stream::iter(items).boxed(), LoadStrategy::Copy)
            .await
            .expect_err("stream error propagates");
        assert_eq!(err, IngestError::Download("reset".into()));
        assert_eq!(refs(&store.snapshot().await), ["OLD-1"]);
    }

    #[tokio::test]
    async fn search_filters_sorts_and_pages() {
        let store = MemoryTenderStore::new(TargetSchema::canonical());
        let mk = |title: &str, status: &str, closing: &str| {
            TenderNotice::from_pairs([
                (TITLE_FIELD, title),
                (STATUS_FIELD, status),
                (CLOSING_DATE_FIELD, closing),
            ])
        };
        store
            .seed(vec![
                mk("Road repair", "Open", "2026-04-01"),
                mk("Bridge design", "Expired", "2026-01-01"),
                mk("Road paving", "Open", "2026-02-01"),
            ])
            .await;

        let page = store
            .search(&TenderQuery {
                query: Some("road".into()),
                limit: 1,
                page: 2,
                ..Default::default()
            })
            .await
            .expect("search");
        assert_eq!(page.pagination.total, 2);
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.tenders.len(), 1);
        assert_eq!(page.tenders[0].title.as_deref(), Some("Road repair"));
    }
}
