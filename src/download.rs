//! Cartridge download and reconstruction.
//!
//! ```text
//! address ──scan ≤ N pages──▶ header ──▶ cache probe ──hit──▶ done
//!                                            │ miss
//!                                            ▼
//!                        stream chunks (page N+1 in flight while N parses)
//!                                            │
//!                         assemble ──▶ verify checksum ──▶ cache put ──▶ done
//! ```
//!
//! Headers are written after every chunk, so the newest header at an address
//! describes a complete cartridge. A header missing from the newest pages
//! means the upload has not finished yet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;

use crate::cache::CartridgeCache;
use crate::catalog::GameVersion;
use crate::drivers::{LedgerDriver, RawRecord};
use crate::error::{Error, Result};
use crate::pagination::{scan_pages, stream_by_owner, ScanOptions};
use crate::progress::{
    NoopReporter, Phase, ProgressEvent, ProgressReporter, ProgressTracker,
    DEFAULT_REPORT_INTERVAL,
};
use crate::record::{Checksum, Chunk, Header, RecordKind};
use crate::retry::cancellable;

/// Newest pages searched for a header before the upload is considered incomplete.
pub const DEFAULT_HEADER_SEARCH_PAGES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub address: String,
    /// Only trust headers and chunks written by this identity.
    pub publisher: Option<String>,
}

impl FetchRequest {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Option<String>) -> Self {
        self.publisher = publisher;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub scan: ScanOptions,
    pub header_search_pages: usize,
    pub report_interval: Duration,
    pub cancel: CancellationToken,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            header_search_pages: DEFAULT_HEADER_SEARCH_PAGES,
            report_interval: DEFAULT_REPORT_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub header_pages: u64,
    pub chunk_pages: u64,
    pub records_seen: u64,
    /// Payloads skipped by the 4-byte magic check without a full decode.
    pub magic_rejected: u64,
    pub chunks_decoded: u64,
    pub malformed: u64,
    pub foreign_chunks: u64,
    pub duplicate_chunks: u64,
    pub publisher_filtered: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub header: Header,
    pub bytes: Vec<u8>,
    pub verified: bool,
    pub from_cache: bool,
    pub stats: DownloadStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Accepted,
    Duplicate,
    /// Another cartridge's chunk, or an index past the expected count.
    Foreign,
}

/// Collects chunks of one cartridge. The first copy of each index wins.
#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    cartridge_id: u32,
    expected: u64,
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl ChunkAssembler {
    pub fn new(cartridge_id: u32, expected: u64) -> Self {
        Self {
            cartridge_id,
            expected,
            chunks: BTreeMap::new(),
        }
    }

    pub fn for_header(header: &Header) -> Self {
        Self::new(header.cartridge_id, header.expected_chunks())
    }

    pub fn insert(&mut self, chunk: Chunk) -> Inserted {
        if chunk.cartridge_id != self.cartridge_id || u64::from(chunk.index) >= self.expected {
            return Inserted::Foreign;
        }
        if self.chunks.contains_key(&chunk.index) {
            return Inserted::Duplicate;
        }
        self.chunks.insert(chunk.index, chunk.data);
        Inserted::Accepted
    }

    pub fn len(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.len() >= self.expected
    }

    pub fn missing_count(&self) -> u64 {
        self.expected.saturating_sub(self.len())
    }

    /// The first `limit` indices not received yet, found from the gaps
    /// between received indices.
    pub fn missing(&self, limit: usize) -> Vec<u32> {
        let mut gaps = Vec::new();
        let mut next = 0u64;
        let received = self.chunks.keys().map(|&i| u64::from(i));
        for bound in received.chain(std::iter::once(self.expected)) {
            while next < bound && gaps.len() < limit {
                let Ok(index) = u32::try_from(next) else {
                    return gaps;
                };
                gaps.push(index);
                next += 1;
            }
            if gaps.len() >= limit {
                break;
            }
            next = bound.saturating_add(1);
        }
        gaps
    }

    /// Concatenate chunks in index order into exactly `total_size` bytes.
    pub fn assemble(&self, total_size: u64) -> Result<Vec<u8>> {
        if self.missing_count() > 0 {
            return Err(Error::IncompleteUpload(format!(
                "cartridge {} has {} of {} chunks (first missing: {:?})",
                self.cartridge_id,
                self.len(),
                self.expected,
                self.missing(10)
            )));
        }

        let held: usize = self.chunks.values().map(Vec::len).sum();
        let mut buffer = Vec::with_capacity(held);
        for data in self.chunks.values() {
            buffer.extend_from_slice(data);
        }
        if (buffer.len() as u64) < total_size {
            return Err(Error::IncompleteUpload(format!(
                "cartridge {} chunks hold {} bytes, header declares {}",
                self.cartridge_id,
                buffer.len(),
                total_size
            )));
        }
        buffer.truncate(total_size as usize);
        Ok(buffer)
    }
}

pub struct Downloader {
    driver: Arc<dyn LedgerDriver>,
    cache: Option<Arc<CartridgeCache>>,
    reporter: Arc<dyn ProgressReporter>,
    options: DownloadOptions,
}

impl Downloader {
    pub fn new(driver: Arc<dyn LedgerDriver>) -> Self {
        Self {
            driver,
            cache: None,
            reporter: Arc::new(NoopReporter),
            options: DownloadOptions::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<CartridgeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    /// Newest header at `address`, searching at most `header_search_pages` pages.
    pub async fn find_header(
        &self,
        address: &str,
        publisher: Option<&str>,
        stats: &mut DownloadStats,
    ) -> Result<(Header, RawRecord)> {
        let scan = self
            .options
            .scan
            .with_max_pages(self.options.header_search_pages.max(1));
        let cancel = self.options.cancel.child_token();
        let mut pages = scan_pages(self.driver.as_ref(), address, scan, cancel);

        while let Some(page) = pages.try_next().await? {
            stats.header_pages += 1;
            for record in page.records {
                if RecordKind::sniff(&record.payload) != Some(RecordKind::Header) {
                    continue;
                }
                if let Some(publisher) = publisher {
                    if !record.is_from(publisher) {
                        stats.publisher_filtered += 1;
                        continue;
                    }
                }
                match Header::decode(&record.payload) {
                    Some(header) => return Ok((header, record)),
                    None => {
                        tracing::debug!("skipping malformed header {} at {}", record.id, address);
                        stats.malformed += 1;
                    }
                }
            }
        }

        if self.options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Err(Error::IncompleteUpload(format!(
            "no header in the newest {} pages of {}",
            stats.header_pages, address
        )))
    }

    /// Download the cartridge a catalog version points at.
    pub async fn fetch_from_catalog(
        &self,
        version: &GameVersion,
        publisher: Option<String>,
    ) -> Result<DownloadResult> {
        let address = self.driver.address_for_key(&version.cartridge_ref);
        self.fetch(&FetchRequest::new(address).with_publisher(publisher))
            .await
    }

    pub async fn fetch(&self, request: &FetchRequest) -> Result<DownloadResult> {
        if self.options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut stats = DownloadStats::default();
        let mut tracker = ProgressTracker::new(self.reporter.clone(), self.options.report_interval);
        let publisher = request.publisher.as_deref();

        tracker.report(ProgressEvent::new(Phase::Fetching));
        let (header, header_record) = self
            .find_header(&request.address, publisher, &mut stats)
            .await?;
        tracing::info!(
            "found header for cartridge {} at {}: {} bytes in {} chunks",
            header.cartridge_id,
            request.address,
            header.total_size,
            header.expected_chunks()
        );

        if let Some(bytes) = self.probe_cache(&header).await {
            stats.bytes = bytes.len() as u64;
            tracker.finish(ProgressEvent {
                bytes: stats.bytes,
                pages: stats.header_pages,
                ..ProgressEvent::new(Phase::Done)
            });
            return Ok(DownloadResult {
                header,
                bytes,
                verified: true,
                from_cache: true,
                stats,
            });
        }

        let bytes = match header_record.content_ref.as_deref() {
            Some(blob_id) => {
                tracing::debug!("cartridge {} stored as blob {}", header.cartridge_id, blob_id);
                let blob =
                    cancellable(&self.options.cancel, self.driver.fetch_by_id(blob_id)).await?;
                stats.bytes = blob.len() as u64;
                blob.to_vec()
            }
            None => {
                self.fetch_chunks(&request.address, publisher, &header, &mut stats, &mut tracker)
                    .await?
            }
        };

        tracker.report(ProgressEvent {
            bytes: bytes.len() as u64,
            ..ProgressEvent::new(Phase::Verifying)
        });
        let actual = Checksum::compute(&bytes);
        if actual != header.checksum {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.invalidate(header.cartridge_id, &header.checksum).await {
                    tracing::warn!("failed to invalidate cache entry: {}", e);
                }
            }
            return Err(Error::IntegrityFailure {
                cartridge_id: header.cartridge_id,
                expected: header.checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(header.cartridge_id, &header.checksum, &bytes).await {
                tracing::warn!("failed to cache cartridge {}: {}", header.cartridge_id, e);
            }
        }

        stats.bytes = bytes.len() as u64;
        tracker.finish(ProgressEvent {
            chunks_found: header.expected_chunks(),
            chunks_expected: header.expected_chunks(),
            bytes: stats.bytes,
            pages: stats.header_pages + stats.chunk_pages,
            ..ProgressEvent::new(Phase::Done)
        });
        tracing::info!(
            "cartridge {} verified ({} bytes, {} pages, {} records)",
            header.cartridge_id,
            stats.bytes,
            stats.header_pages + stats.chunk_pages,
            stats.records_seen
        );

        Ok(DownloadResult {
            header,
            bytes,
            verified: true,
            from_cache: false,
            stats,
        })
    }

    async fn probe_cache(&self, header: &Header) -> Option<Vec<u8>> {
        let cache = self.cache.as_ref()?;
        match cache.get(header.cartridge_id, &header.checksum).await {
            Ok(Some(bytes)) => {
                tracing::info!("cartridge {} served from cache", header.cartridge_id);
                Some(bytes)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("cache lookup for cartridge {} failed: {}", header.cartridge_id, e);
                None
            }
        }
    }

    async fn fetch_chunks(
        &self,
        address: &str,
        publisher: Option<&str>,
        header: &Header,
        stats: &mut DownloadStats,
        tracker: &mut ProgressTracker,
    ) -> Result<Vec<u8>> {
        let mut assembler = ChunkAssembler::for_header(header);
        let expected = assembler.expected();

        if !assembler.is_complete() {
            let stop = self.options.cancel.child_token();
            let done = stop.clone();
            stream_by_owner(
                Arc::clone(&self.driver),
                address.to_string(),
                self.options.scan,
                stop,
                |records| {
                    stats.chunk_pages += 1;
                    for record in records {
                        stats.records_seen += 1;
                        if RecordKind::sniff(&record.payload) != Some(RecordKind::Chunk) {
                            stats.magic_rejected += 1;
                            continue;
                        }
                        if let Some(publisher) = publisher {
                            if !record.is_from(publisher) {
                                stats.publisher_filtered += 1;
                                continue;
                            }
                        }
                        let Some(chunk) = Chunk::decode(&record.payload) else {
                            stats.malformed += 1;
                            continue;
                        };
                        stats.chunks_decoded += 1;
                        match assembler.insert(chunk) {
                            Inserted::Accepted => {}
                            Inserted::Duplicate => stats.duplicate_chunks += 1,
                            Inserted::Foreign => stats.foreign_chunks += 1,
                        }
                    }
                    tracker.report(ProgressEvent {
                        chunks_found: assembler.len(),
                        chunks_expected: expected,
                        pages: stats.header_pages + stats.chunk_pages,
                        ..ProgressEvent::new(Phase::Fetching)
                    });
                    if assembler.is_complete() {
                        done.cancel();
                    }
                },
            )
            .await?;

            if self.options.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }

        tracing::debug!(
            "collected {} / {} chunks of cartridge {} ({} duplicates, {} foreign)",
            assembler.len(),
            expected,
            header.cartridge_id,
            stats.duplicate_chunks,
            stats.foreign_chunks
        );
        tracker.report(ProgressEvent {
            chunks_found: assembler.len(),
            chunks_expected: expected,
            pages: stats.header_pages + stats.chunk_pages,
            ..ProgressEvent::new(Phase::Reconstructing)
        });
        assembler.assemble(header.total_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::{MemoryDriver, WRITER};
    use crate::progress::CollectingReporter;
    use crate::record::{split_chunks, CatalogEntry, CartridgeKey, Semver, SCHEMA_VERSION};
    use crate::retry::RetryPolicy;

    const ADDR: &str = "cart-addr";

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 256) as u8).collect()
    }

    fn header_for(cartridge_id: u32, data: &[u8], chunk_size: u8) -> Header {
        Header {
            schema: SCHEMA_VERSION,
            platform: 1,
            chunk_size,
            flags: 0,
            cartridge_id,
            total_size: data.len() as u64,
            checksum: Checksum::compute(data),
        }
    }

    fn chunk_payloads(cartridge_id: u32, data: &[u8], chunk_size: u8) -> Vec<[u8; 64]> {
        split_chunks(cartridge_id, data, chunk_size)
            .unwrap()
            .iter()
            .map(|c| c.encode().unwrap())
            .collect()
    }

    /// Chunks in the given order, then the header.
    fn store(driver: &MemoryDriver, cartridge_id: u32, data: &[u8], order: &[usize]) {
        let payloads = chunk_payloads(cartridge_id, data, 10);
        for &i in order {
            driver.push(ADDR, Some(WRITER), &payloads[i]);
        }
        driver.push(ADDR, Some(WRITER), &header_for(cartridge_id, data, 10).encode().unwrap());
    }

    fn options(page_size: usize) -> DownloadOptions {
        DownloadOptions {
            scan: ScanOptions {
                retry: RetryPolicy::none(),
                ..ScanOptions::default()
            }
            .with_page_size(page_size),
            report_interval: Duration::ZERO,
            ..DownloadOptions::default()
        }
    }

    fn downloader(driver: &Arc<MemoryDriver>, page_size: usize) -> Downloader {
        let driver: Arc<dyn LedgerDriver> = driver.clone();
        Downloader::new(driver).with_options(options(page_size))
    }

    #[test]
    fn assembly_is_order_independent() {
        let data = sample(95);
        let chunks = split_chunks(4, &data, 10).unwrap();

        let mut forward = ChunkAssembler::new(4, 10);
        for chunk in chunks.iter().cloned() {
            assert_eq!(forward.insert(chunk), Inserted::Accepted);
        }

        let mut shuffled = ChunkAssembler::new(4, 10);
        for i in [7, 3, 9, 0, 3, 1, 8, 2, 6, 5, 4, 7, 0] {
            shuffled.insert(chunks[i].clone());
        }
        assert_eq!(
            shuffled.insert(Chunk {
                cartridge_id: 5,
                index: 1,
                data: vec![0; 10],
            }),
            Inserted::Foreign
        );

        assert_eq!(forward.assemble(95).unwrap(), data);
        assert_eq!(shuffled.assemble(95).unwrap(), data);
    }

    #[test]
    fn first_copy_of_an_index_wins() {
        let mut assembler = ChunkAssembler::new(1, 1);
        let first = Chunk {
            cartridge_id: 1,
            index: 0,
            data: vec![1, 2, 3],
        };
        let second = Chunk {
            data: vec![9, 9, 9],
            ..first.clone()
        };
        assert_eq!(assembler.insert(first), Inserted::Accepted);
        assert_eq!(assembler.insert(second), Inserted::Duplicate);
        assert_eq!(assembler.assemble(3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn missing_chunks_are_reported() {
        let mut assembler = ChunkAssembler::new(1, 3);
        assembler.insert(Chunk {
            cartridge_id: 1,
            index: 1,
            data: vec![0; 10],
        });
        assert_eq!(assembler.missing(10), vec![0, 2]);
        assert_eq!(assembler.missing(1), vec![0]);
        assert_eq!(assembler.missing_count(), 2);
        assert!(matches!(assembler.assemble(30), Err(Error::IncompleteUpload(_))));
    }

    #[test]
    fn missing_stays_cheap_for_huge_expected_counts() {
        let mut assembler = ChunkAssembler::new(1, u64::MAX);
        for index in [1, 2, 6] {
            assembler.insert(Chunk {
                cartridge_id: 1,
                index,
                data: vec![0; 4],
            });
        }
        assert_eq!(assembler.missing(5), vec![0, 3, 4, 5, 7]);
        assert_eq!(assembler.missing_count(), u64::MAX - 3);
        assert!(matches!(assembler.assemble(u64::MAX), Err(Error::IncompleteUpload(_))));
    }

    #[tokio::test]
    async fn header_declaring_absurd_size_is_skipped() {
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(40);
        store(&driver, 6, &data, &[0, 1, 2, 3]);
        let forged = Header {
            total_size: u64::MAX,
            ..header_for(6, &data, 51)
        };
        driver.push(ADDR, Some("forger"), &forged.encode().unwrap());

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            downloader(&driver, 100).fetch(&FetchRequest::new(ADDR)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.bytes, data);
        assert_eq!(result.header.total_size, 40);
        assert_eq!(result.stats.malformed, 1);
    }

    #[tokio::test]
    async fn downloads_shuffled_and_duplicated_chunks() {
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(95);
        store(&driver, 11, &data, &[9, 4, 0, 4, 2, 1, 3, 5, 7, 6, 8, 0]);

        let result = downloader(&driver, 4)
            .fetch(&FetchRequest::new(ADDR))
            .await
            .unwrap();
        assert!(result.verified);
        assert!(!result.from_cache);
        assert_eq!(result.bytes, data);
        assert_eq!(result.header.cartridge_id, 11);
        assert_eq!(result.stats.duplicate_chunks, 2);
    }

    #[tokio::test]
    async fn magic_check_skips_full_decode_of_other_payloads() {
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(30);
        for i in 0..7u8 {
            driver.push(ADDR, Some("spam"), &[i; 64]);
        }
        let entry = CatalogEntry {
            schema: SCHEMA_VERSION,
            platform: 1,
            flags: 0,
            app_id: 1,
            version: Semver::new(1, 0, 0),
            cartridge_ref: CartridgeKey::derive(1, 3),
            title: "noise".into(),
        };
        driver.push(ADDR, Some("spam"), &entry.encode().unwrap());
        store(&driver, 3, &data, &[0, 1, 2]);

        let result = downloader(&driver, 100)
            .fetch(&FetchRequest::new(ADDR))
            .await
            .unwrap();
        assert_eq!(result.bytes, data);
        assert_eq!(result.stats.chunks_decoded, 3);
        // the header and the eight noise records
        assert_eq!(result.stats.magic_rejected, 9);
    }

    #[tokio::test]
    async fn header_outside_search_window_is_incomplete() {
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(20);
        store(&driver, 2, &data, &[0, 1]);
        for i in 0..12u8 {
            driver.push(ADDR, None, &[i; 8]);
        }

        let err = downloader(&driver, 2)
            .fetch(&FetchRequest::new(ADDR))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IncompleteUpload(_)));
        assert!(err.is_retryable_by_caller());
        assert_eq!(driver.page_fetches(), DEFAULT_HEADER_SEARCH_PAGES);
    }

    #[tokio::test]
    async fn missing_chunk_is_incomplete() {
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(40);
        store(&driver, 6, &data, &[0, 1, 3]);

        let err = downloader(&driver, 10)
            .fetch(&FetchRequest::new(ADDR))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IncompleteUpload(_)));
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_and_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CartridgeCache::open(dir.path(), 1 << 20).await.unwrap());
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(30);
        for payload in chunk_payloads(8, &data, 10) {
            driver.push(ADDR, Some(WRITER), &payload);
        }
        let mut header = header_for(8, &data, 10);
        header.checksum = Checksum::compute(b"something else");
        driver.push(ADDR, Some(WRITER), &header.encode().unwrap());

        let err = downloader(&driver, 10)
            .with_cache(cache.clone())
            .fetch(&FetchRequest::new(ADDR))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityFailure { cartridge_id: 8, .. }));
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn second_download_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CartridgeCache::open(dir.path(), 1 << 20).await.unwrap());
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(50);
        store(&driver, 21, &data, &[0, 1, 2, 3, 4]);

        let downloader = downloader(&driver, 100).with_cache(cache.clone());
        let first = downloader.fetch(&FetchRequest::new(ADDR)).await.unwrap();
        assert!(!first.from_cache);

        let fetches = driver.page_fetches();
        let second = downloader.fetch(&FetchRequest::new(ADDR)).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.bytes, data);
        // only the header search touched the backend
        assert_eq!(driver.page_fetches(), fetches + 1);
    }

    #[tokio::test]
    async fn tampered_cache_entry_falls_back_to_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CartridgeCache::open(dir.path(), 1 << 20).await.unwrap());
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(30);
        store(&driver, 4, &data, &[0, 1, 2]);
        cache
            .put(4, &Checksum::compute(&data), b"not the cartridge")
            .await
            .unwrap();

        let result = downloader(&driver, 100)
            .with_cache(cache.clone())
            .fetch(&FetchRequest::new(ADDR))
            .await
            .unwrap();
        assert!(!result.from_cache);
        assert_eq!(result.bytes, data);
        assert_eq!(cache.stats().await.invalidations, 1);
        assert_eq!(
            cache.get(4, &Checksum::compute(&data)).await.unwrap(),
            Some(data)
        );
    }

    #[tokio::test]
    async fn headers_from_other_writers_are_ignored() {
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(30);
        store(&driver, 5, &data, &[0, 1, 2]);
        let forged = header_for(5, b"evil", 10);
        driver.push(ADDR, Some("mallory"), &forged.encode().unwrap());

        let request = FetchRequest::new(ADDR).with_publisher(Some(WRITER.to_string()));
        let result = downloader(&driver, 100).fetch(&request).await.unwrap();
        assert_eq!(result.bytes, data);
        assert_eq!(result.stats.publisher_filtered, 1);
    }

    #[tokio::test]
    async fn stops_streaming_once_all_chunks_are_found() {
        let driver = Arc::new(MemoryDriver::new());
        for i in 0..200u32 {
            driver.push(ADDR, None, &i.to_le_bytes());
        }
        let data = sample(30);
        store(&driver, 9, &data, &[0, 1, 2]);

        let result = downloader(&driver, 5)
            .fetch(&FetchRequest::new(ADDR))
            .await
            .unwrap();
        assert_eq!(result.bytes, data);
        assert!(driver.page_fetches() < 10, "fetched {} pages", driver.page_fetches());
    }

    #[tokio::test]
    async fn blob_cartridges_are_fetched_by_id() {
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(4000);
        driver.put_blob("blob-1", &data);
        driver.push_with_ref(
            ADDR,
            Some(WRITER),
            &header_for(30, &data, 51).encode().unwrap(),
            Some("blob-1"),
        );

        let result = downloader(&driver, 10)
            .fetch(&FetchRequest::new(ADDR))
            .await
            .unwrap();
        assert_eq!(result.bytes, data);
        assert_eq!(result.stats.chunk_pages, 0);
    }

    #[tokio::test]
    async fn reports_every_phase_in_order() {
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(30);
        store(&driver, 1, &data, &[2, 1, 0]);
        let collector = Arc::new(CollectingReporter::new());

        downloader(&driver, 100)
            .with_reporter(collector.clone())
            .fetch(&FetchRequest::new(ADDR))
            .await
            .unwrap();
        assert_eq!(
            collector.phases(),
            vec![Phase::Fetching, Phase::Reconstructing, Phase::Verifying, Phase::Done]
        );
        let last = collector.events().last().cloned().unwrap();
        assert_eq!(last.bytes, 30);
    }

    #[tokio::test]
    async fn catalog_versions_resolve_to_driver_addresses() {
        let driver = Arc::new(MemoryDriver::new());
        let data = sample(25);
        let address = driver.cartridge_address(1, 40);
        for payload in chunk_payloads(40, &data, 10) {
            driver.push(&address, Some(WRITER), &payload);
        }
        driver.push(&address, Some(WRITER), &header_for(40, &data, 10).encode().unwrap());

        let version = GameVersion {
            version: Semver::new(1, 0, 0),
            cartridge_ref: CartridgeKey::derive(1, 40),
            platform: 1,
            title: "Test".into(),
            flags: 0,
            height: 1,
            record_id: "tx-1".into(),
            owner: Some(WRITER.into()),
        };
        let result = downloader(&driver, 10)
            .fetch_from_catalog(&version, None)
            .await
            .unwrap();
        assert_eq!(result.bytes, data);
    }
}
