//! Cursor pagination over newest-first owner scans.
//!
//! Backends hand out pages with loosely defined cursors: some repeat the
//! boundary record, some return the same cursor twice, and some keep
//! returning the same page forever. [`scan_pages`] turns that into a finite
//! stream of pages that never repeat a record id.
//!
//! Termination, in order of precedence:
//! - cancellation token fired
//! - `max_pages` reached
//! - empty page, short page, or no next cursor
//! - `stall_limit` consecutive pages that added nothing new
//!
//! When a backend returns the cursor it was given, the scan retries once from
//! the first id of the page before giving up on that cursor.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::drivers::{LedgerDriver, Page, RawRecord};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_STALL_LIMIT: usize = 3;

/// Pages fetched ahead of the consumer by [`stream_by_owner`].
const PREFETCH_PAGES: usize = 2;

pub type PageStream<'a> = Pin<Box<dyn Stream<Item = Result<Page>> + Send + 'a>>;
pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = Result<RawRecord>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub page_size: usize,
    pub stall_limit: usize,
    pub max_pages: Option<usize>,
    pub retry: RetryPolicy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            stall_limit: DEFAULT_STALL_LIMIT,
            max_pages: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl ScanOptions {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }
}

/// Lazily walk every page of records owned by `owner`, newest first.
///
/// Each yielded page only holds ids not seen on an earlier page. Page fetch
/// failures are retried per `options.retry` and end the stream when they persist.
pub fn scan_pages<'a>(
    driver: &'a dyn LedgerDriver,
    owner: &'a str,
    options: ScanOptions,
    cancel: CancellationToken,
) -> PageStream<'a> {
    let page_size = options.page_size.max(1);
    let stall_limit = options.stall_limit.max(1);

    let stream = async_stream::try_stream! {
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut stalled = 0usize;
        let mut pages = 0usize;

        loop {
            if cancel.is_cancelled() {
                tracing::debug!("scan of {} cancelled after {} pages", owner, pages);
                break;
            }
            if options.max_pages.is_some_and(|max| pages >= max) {
                break;
            }

            let fetched_page = options
                .retry
                .run_until("page fetch", &cancel, || {
                    driver.fetch_page(owner, page_size, cursor.as_deref())
                })
                .await;
            let page = match fetched_page {
                Err(Error::Cancelled) => {
                    tracing::debug!("scan of {} cancelled during page {}", owner, pages + 1);
                    break;
                }
                other => other?,
            };
            pages += 1;

            let fetched = page.records.len();
            if fetched == 0 {
                break;
            }
            let first_id = page.records.first().map(|r| r.id.clone());
            let next_cursor = page.next_cursor;
            let fresh: Vec<RawRecord> = page
                .records
                .into_iter()
                .filter(|r| seen.insert(r.id.clone()))
                .collect();

            if fresh.is_empty() {
                stalled += 1;
                if stalled >= stall_limit {
                    tracing::warn!(
                        "scan of {} stalled: {} consecutive pages added nothing new",
                        owner,
                        stalled
                    );
                    break;
                }
            } else {
                stalled = 0;
                yield Page {
                    records: fresh,
                    next_cursor: next_cursor.clone(),
                };
            }

            if fetched < page_size {
                break;
            }

            cursor = match next_cursor {
                None => break,
                Some(next) if Some(&next) == cursor.as_ref() => {
                    tracing::debug!("cursor {} did not advance for {}", next, owner);
                    match first_id {
                        Some(first) if Some(&first) != cursor.as_ref() => Some(first),
                        _ => break,
                    }
                }
                Some(next) => Some(next),
            };
        }
    };

    Box::pin(stream)
}

/// Lazily walk every record owned by `owner`, newest first, without duplicates.
pub fn scan_by_owner<'a>(
    driver: &'a dyn LedgerDriver,
    owner: &'a str,
    options: ScanOptions,
    cancel: CancellationToken,
) -> RecordStream<'a> {
    Box::pin(
        scan_pages(driver, owner, options, cancel)
            .map_ok(|page| stream::iter(page.records.into_iter().map(Ok)))
            .try_flatten(),
    )
}

/// Push pages to `on_page` while the next page is already being fetched.
///
/// The scan stops early once `cancel` fires; `on_page` may fire it itself.
/// Returns the number of records delivered.
pub async fn stream_by_owner<F>(
    driver: Arc<dyn LedgerDriver>,
    owner: String,
    options: ScanOptions,
    cancel: CancellationToken,
    mut on_page: F,
) -> Result<u64>
where
    F: FnMut(&[RawRecord]),
{
    let (tx, mut rx) = mpsc::channel::<Result<Page>>(PREFETCH_PAGES);
    let producer_cancel = cancel.child_token();

    let producer = {
        let cancel = producer_cancel.clone();
        tokio::spawn(async move {
            let mut pages = scan_pages(driver.as_ref(), &owner, options, cancel.clone());
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = pages.next() => next,
                };
                let Some(page) = next else { break };
                let failed = page.is_err();
                if tx.send(page).await.is_err() || failed {
                    break;
                }
            }
        })
    };

    let mut total = 0u64;
    let mut outcome = Ok(());
    while let Some(page) = rx.recv().await {
        match page {
            Ok(page) => {
                total += page.records.len() as u64;
                on_page(&page.records);
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    producer_cancel.cancel();
    drop(rx);
    if let Err(e) = producer.await {
        tracing::warn!("page fetcher task failed: {}", e);
    }

    outcome.map(|_| total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MemoryDriver;
    use crate::drivers::{BackendKind, WriteRef, WriteRequest};
    use crate::error::Error;
    use crate::record::CartridgeKey;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options(page_size: usize) -> ScanOptions {
        ScanOptions {
            retry: RetryPolicy::none(),
            ..ScanOptions::default()
        }
        .with_page_size(page_size)
    }

    fn filled(count: usize) -> MemoryDriver {
        let driver = MemoryDriver::new();
        for i in 0..count {
            driver.push("owner", None, &[i as u8]);
        }
        driver
    }

    async fn collect_ids(driver: &dyn LedgerDriver, options: ScanOptions) -> Vec<String> {
        scan_by_owner(driver, "owner", options, CancellationToken::new())
            .map_ok(|r| r.id)
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn walks_every_page_newest_first() {
        let driver = filled(7);
        let ids = collect_ids(&driver, options(3)).await;
        assert_eq!(ids.len(), 7);
        assert_eq!(ids.first().map(String::as_str), Some("tx-7"));
        assert_eq!(ids.last().map(String::as_str), Some("tx-1"));
        // 3 + 3 + 1 (short page ends the scan)
        assert_eq!(driver.page_fetches(), 3);
    }

    #[tokio::test]
    async fn max_pages_bounds_the_scan() {
        let driver = filled(10);
        let ids = collect_ids(&driver, options(2).with_max_pages(2)).await;
        assert_eq!(ids, vec!["tx-10", "tx-9", "tx-8", "tx-7"]);
    }

    #[tokio::test]
    async fn empty_owner_yields_nothing() {
        let driver = MemoryDriver::new();
        assert!(collect_ids(&driver, options(5)).await.is_empty());
        assert_eq!(driver.page_fetches(), 1);
    }

    /// Always returns the same full page with the same cursor.
    struct StuckDriver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LedgerDriver for StuckDriver {
        fn backend(&self) -> BackendKind {
            BackendKind::TxLedger
        }

        fn address_for_key(&self, key: &CartridgeKey) -> String {
            key.to_hex()
        }

        fn writer_address(&self) -> Option<String> {
            None
        }

        async fn current_height(&self) -> Result<u64> {
            Ok(0)
        }

        async fn fetch_page(&self, _: &str, page_size: usize, _: Option<&str>) -> Result<Page> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let records = (0..page_size)
                .map(|i| RawRecord {
                    id: format!("same-{}", i),
                    owner: None,
                    height: 1,
                    payload: Bytes::new(),
                    content_ref: None,
                })
                .collect();
            Ok(Page {
                records,
                next_cursor: Some("stuck".to_string()),
            })
        }

        async fn write(&self, _: WriteRequest) -> Result<WriteRef> {
            Err(Error::NotAuthorized("read only".into()))
        }
    }

    #[tokio::test]
    async fn repeating_backend_terminates() {
        let driver = StuckDriver {
            calls: AtomicUsize::new(0),
        };
        let ids = collect_ids(&driver, options(4)).await;
        assert_eq!(ids.len(), 4);
        // one productive page, then the stall limit
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1 + DEFAULT_STALL_LIMIT);
    }

    /// Fails every fetch with a transient error.
    struct DownDriver;

    #[async_trait]
    impl LedgerDriver for DownDriver {
        fn backend(&self) -> BackendKind {
            BackendKind::TxLedger
        }

        fn address_for_key(&self, key: &CartridgeKey) -> String {
            key.to_hex()
        }

        fn writer_address(&self) -> Option<String> {
            None
        }

        async fn current_height(&self) -> Result<u64> {
            Ok(0)
        }

        async fn fetch_page(&self, _: &str, _: usize, _: Option<&str>) -> Result<Page> {
            Err(Error::Transient("503".into()))
        }

        async fn write(&self, _: WriteRequest) -> Result<WriteRef> {
            Err(Error::NotAuthorized("read only".into()))
        }
    }

    #[tokio::test]
    async fn persistent_fetch_failure_surfaces() {
        let result: Result<Vec<RawRecord>> =
            scan_by_owner(&DownDriver, "owner", options(4), CancellationToken::new())
                .try_collect()
                .await;
        assert!(result.unwrap_err().is_transient());
    }

    /// Never answers a page request.
    struct HangingDriver;

    #[async_trait]
    impl LedgerDriver for HangingDriver {
        fn backend(&self) -> BackendKind {
            BackendKind::TxLedger
        }

        fn address_for_key(&self, key: &CartridgeKey) -> String {
            key.to_hex()
        }

        fn writer_address(&self) -> Option<String> {
            None
        }

        async fn current_height(&self) -> Result<u64> {
            Ok(0)
        }

        async fn fetch_page(&self, _: &str, _: usize, _: Option<&str>) -> Result<Page> {
            std::future::pending().await
        }

        async fn write(&self, _: WriteRequest) -> Result<WriteRef> {
            Err(Error::NotAuthorized("read only".into()))
        }
    }

    #[tokio::test]
    async fn cancel_ends_a_scan_waiting_on_the_backend() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let records: Vec<RawRecord> = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            scan_by_owner(&HangingDriver, "owner", options(4), cancel).try_collect(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn stream_delivers_all_pages() {
        let driver: Arc<dyn LedgerDriver> = Arc::new(filled(9));
        let mut seen = Vec::new();
        let total = stream_by_owner(
            driver,
            "owner".into(),
            options(4),
            CancellationToken::new(),
            |records| seen.extend(records.iter().map(|r| r.id.clone())),
        )
        .await
        .unwrap();
        assert_eq!(total, 9);
        assert_eq!(seen.len(), 9);
    }

    #[tokio::test]
    async fn stream_stops_when_consumer_cancels() {
        let memory = Arc::new(filled(40));
        let driver: Arc<dyn LedgerDriver> = memory.clone();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let mut pages = 0;
        let total = stream_by_owner(driver, "owner".into(), options(5), cancel, |_| {
            pages += 1;
            stop.cancel();
        })
        .await
        .unwrap();
        assert_eq!(pages, 1);
        assert_eq!(total, 5);
        // at most the prefetch window beyond the first page
        assert!(memory.page_fetches() <= 2 + PREFETCH_PAGES);
    }

    #[tokio::test]
    async fn stream_propagates_fetch_errors() {
        let driver: Arc<dyn LedgerDriver> = Arc::new(DownDriver);
        let result = stream_by_owner(
            driver,
            "owner".into(),
            options(4),
            CancellationToken::new(),
            |_| {},
        )
        .await;
        assert!(result.is_err());
    }
}
