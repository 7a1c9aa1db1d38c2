//! Chunked upload pipeline.
//!
//! ```text
//! file ──split──▶ chunk jobs ──workers (rate limited)──▶ ledger
//!                     │                                   │
//!                     └──── progress file ◀── receipts ───┘
//!
//! all chunks sent ──▶ header ──▶ catalog entry
//! ```
//!
//! The header is written only once every chunk is recorded as sent, and the
//! catalog entry only after the header write succeeded. A newest-first reader
//! that finds a header can therefore rely on every chunk already being there.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogIndexer;
use crate::drivers::{LedgerDriver, StorageMode, WriteRequest};
use crate::error::{Error, Result};
use crate::ratelimit::UploadRateLimiter;
use crate::record::{
    chunk_count, split_chunks, CartridgeKey, CatalogEntry, Checksum, Header, Semver,
    MAX_CARTRIDGE_CHUNKS, MAX_CHUNK_DATA,
};
use crate::retry::cancellable;
use crate::upload_state::{ProgressStore, UploadProgress};

pub const MAX_CONCURRENCY: usize = 10;

/// What to upload and where it shows up in the catalog.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub data: Vec<u8>,
    pub app_id: u32,
    pub platform: u8,
    pub schema: u8,
    pub version: Semver,
    pub title: String,
    pub chunk_size: u8,
    /// Reuse an existing cartridge id. A random one is generated otherwise.
    pub cartridge_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub ops_per_sec: u32,
    pub concurrency: usize,
    /// Persist progress every N successful chunk writes.
    pub persist_every: u64,
    /// Log progress every N successful chunk writes.
    pub log_every: u64,
    pub cancel: CancellationToken,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            ops_per_sec: 5,
            concurrency: 4,
            persist_every: 10,
            log_every: 50,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub cartridge_id: u32,
    pub address: String,
    pub checksum: Checksum,
    pub total_chunks: u64,
    /// Chunks written by this invocation.
    pub written_now: u64,
    /// Chunks already recorded by an earlier invocation.
    pub skipped: u64,
    pub failed: Vec<u32>,
    pub header_ref: Option<String>,
    pub catalog_ref: Option<String>,
    pub resumed: bool,
}

pub struct Uploader {
    driver: Arc<dyn LedgerDriver>,
    store: ProgressStore,
    catalog: CatalogIndexer,
    options: UploadOptions,
}

/// Random non-zero cartridge id.
pub fn fresh_cartridge_id() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

fn is_fatal(err: &Error) -> bool {
    matches!(
        err,
        Error::NotAuthorized(_) | Error::WriterLocked(_) | Error::Unavailable(_)
    )
}

impl Uploader {
    pub fn new(
        driver: Arc<dyn LedgerDriver>,
        store: ProgressStore,
        catalog_address: impl Into<String>,
    ) -> Self {
        let catalog = CatalogIndexer::new(Arc::clone(&driver), catalog_address);
        Self {
            driver,
            store,
            catalog,
            options: UploadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: UploadOptions) -> Self {
        self.catalog = self.catalog.with_cancel(options.cancel.clone());
        self.options = options;
        self
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub async fn run(&self, request: UploadRequest) -> Result<UploadReport> {
        self.validate(&request)?;
        if self.options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let checksum = Checksum::compute(&request.data);
        let mode = self.driver.storage_mode();
        let total_chunks = match mode {
            StorageMode::Chunked => chunk_count(request.data.len() as u64, request.chunk_size),
            StorageMode::Blob => 1,
        };

        let (progress, resumed) = self.load_or_create(&request, checksum, total_chunks).await?;
        let skipped = progress.sent_chunks;
        if progress.is_completed() {
            tracing::info!(
                "upload of app {} cartridge {} already completed",
                progress.app_id,
                progress.cartridge_id
            );
            return Ok(Self::report(&progress, 0, skipped, resumed));
        }

        let (mut progress, written_now) = match mode {
            StorageMode::Chunked => self.write_chunks(&request, progress).await?,
            StorageMode::Blob => self.write_blob(&request, progress).await?,
        };

        if !progress.all_chunks_sent() {
            self.store.save(&progress).await?;
            return Err(Error::IncompleteUpload(format!(
                "{} of {} chunks of cartridge {} not written (failed: {:?}); run the upload again to retry",
                progress.total_chunks - progress.sent_chunks,
                progress.total_chunks,
                progress.cartridge_id,
                progress.failed_chunks
            )));
        }

        if progress.header_ref.is_none() {
            let header = Header {
                schema: request.schema,
                platform: request.platform,
                chunk_size: request.chunk_size,
                flags: 0,
                cartridge_id: progress.cartridge_id,
                total_size: request.data.len() as u64,
                checksum,
            };
            let mut write = WriteRequest::record(progress.address.clone(), header.encode()?);
            if mode == StorageMode::Blob {
                if let Some(receipt) = progress.chunks.get(&0) {
                    write = write.with_content_ref(receipt.write_reference.clone());
                }
            }
            let reference = match cancellable(&self.options.cancel, self.driver.write(write)).await {
                Ok(reference) => reference,
                Err(e) => {
                    self.store.save(&progress).await?;
                    return Err(e);
                }
            };
            tracing::info!("header for cartridge {} written in {}", progress.cartridge_id, reference);
            progress.header_ref = Some(reference.0);
            self.store.save(&progress).await?;
        }

        if progress.catalog_ref.is_none() {
            let entry = CatalogEntry {
                schema: request.schema,
                platform: request.platform,
                flags: 0,
                app_id: request.app_id,
                version: request.version,
                cartridge_ref: CartridgeKey::derive(request.platform, progress.cartridge_id),
                title: request.title.clone(),
            };
            let reference = match self.catalog.publish_entry(&entry).await {
                Ok(reference) => reference,
                Err(e) => {
                    self.store.save(&progress).await?;
                    return Err(e);
                }
            };
            tracing::info!(
                "catalog entry for app {} v{} written in {}",
                request.app_id,
                request.version,
                reference
            );
            progress.catalog_ref = Some(reference.0);
        }

        progress.complete();
        self.store.save(&progress).await?;
        Ok(Self::report(&progress, written_now, skipped, resumed))
    }

    fn validate(&self, request: &UploadRequest) -> Result<()> {
        if request.chunk_size == 0 || request.chunk_size as usize > MAX_CHUNK_DATA {
            return Err(Error::InvalidInput(format!(
                "chunk size {} must be between 1 and {}",
                request.chunk_size, MAX_CHUNK_DATA
            )));
        }
        let needed = chunk_count(request.data.len() as u64, request.chunk_size);
        if needed > MAX_CARTRIDGE_CHUNKS {
            return Err(Error::InvalidInput(format!(
                "{} bytes need {} chunks of {} bytes, at most {} are allowed",
                request.data.len(),
                needed,
                request.chunk_size,
                MAX_CARTRIDGE_CHUNKS
            )));
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.options.concurrency) {
            return Err(Error::InvalidInput(format!(
                "concurrency {} must be between 1 and {}",
                self.options.concurrency, MAX_CONCURRENCY
            )));
        }
        // Catch an oversized title before anything is written.
        CatalogEntry {
            schema: request.schema,
            platform: request.platform,
            flags: 0,
            app_id: request.app_id,
            version: request.version,
            cartridge_ref: CartridgeKey::default(),
            title: request.title.clone(),
        }
        .encode()?;
        Ok(())
    }

    async fn load_or_create(
        &self,
        request: &UploadRequest,
        checksum: Checksum,
        total_chunks: u64,
    ) -> Result<(UploadProgress, bool)> {
        let existing = match request.cartridge_id {
            Some(cartridge_id) => self.store.load(request.app_id, cartridge_id).await?,
            None => {
                self.store
                    .find_resumable(request.app_id, &checksum, request.chunk_size)
                    .await?
            }
        };

        if let Some(mut progress) = existing {
            if progress.checksum != checksum {
                return Err(Error::InvalidInput(format!(
                    "cartridge {} was started with checksum {}, file has {}",
                    progress.cartridge_id, progress.checksum, checksum
                )));
            }
            if !progress.matches_chunk_size(request.chunk_size) {
                return Err(Error::InvalidInput(format!(
                    "cartridge {} was started with chunk size {}, now {}",
                    progress.cartridge_id,
                    progress
                        .chunk_size
                        .map_or_else(|| "unknown".to_string(), |size| size.to_string()),
                    request.chunk_size
                )));
            }
            progress.chunk_size = Some(request.chunk_size);
            if progress.total_chunks != total_chunks {
                return Err(Error::InvalidInput(format!(
                    "cartridge {} was started with {} chunks, now {}",
                    progress.cartridge_id, progress.total_chunks, total_chunks
                )));
            }
            tracing::info!(
                "resuming cartridge {}: {} / {} chunks already sent",
                progress.cartridge_id,
                progress.sent_chunks,
                progress.total_chunks
            );
            return Ok((progress, true));
        }

        let cartridge_id = request.cartridge_id.unwrap_or_else(fresh_cartridge_id);
        let address = self.driver.cartridge_address(request.platform, cartridge_id);
        let progress = UploadProgress::new(
            request.app_id,
            cartridge_id,
            request.platform,
            address,
            checksum,
            request.chunk_size,
            total_chunks,
        );
        self.store.save(&progress).await?;
        tracing::info!(
            "starting upload of app {} as cartridge {} ({} chunks) to {}",
            request.app_id,
            cartridge_id,
            total_chunks,
            progress.address
        );
        Ok((progress, false))
    }

    async fn write_chunks(
        &self,
        request: &UploadRequest,
        progress: UploadProgress,
    ) -> Result<(UploadProgress, u64)> {
        let chunks: Vec<_> = split_chunks(progress.cartridge_id, &request.data, request.chunk_size)?
            .into_iter()
            .filter(|chunk| !progress.is_chunk_sent(chunk.index))
            .collect();
        let pending = chunks.len();
        let total = progress.total_chunks;
        let address = progress.address.clone();

        let concurrency = self.options.concurrency;
        let limiter = UploadRateLimiter::new(self.options.ops_per_sec, concurrency as u32)?;
        let abort = self.options.cancel.child_token();
        let shared = Mutex::new(progress);
        // sent count of the newest snapshot on disk
        let persisted = Mutex::new(0u64);
        let fatal: Mutex<Option<Error>> = Mutex::new(None);
        let written = AtomicU64::new(0);
        let persist_every = self.options.persist_every.max(1);
        let log_every = self.options.log_every.max(1);
        let start_time = Instant::now();

        tracing::info!(
            "writing {} chunks to {} with {} workers at {} ops/s",
            pending,
            address,
            concurrency,
            limiter.ops_per_sec()
        );

        let limiter = &limiter;
        let abort = &abort;
        let shared = &shared;
        let persisted = &persisted;
        let fatal = &fatal;
        let written = &written;
        let address = address.as_str();

        stream::iter(chunks)
            .for_each_concurrent(concurrency, |chunk| async move {
                let index = chunk.index;
                if limiter.acquire(abort).await.is_err() {
                    return;
                }
                let payload = match chunk.encode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("chunk {} could not be encoded: {}", index, e);
                        shared.lock().await.mark_failed(index);
                        return;
                    }
                };

                let write = self.driver.write(WriteRequest::record(address, payload));
                match cancellable(abort, write).await {
                    Ok(reference) => {
                        let done = written.fetch_add(1, Ordering::Relaxed) + 1;
                        let (sent, snapshot) = {
                            let mut progress = shared.lock().await;
                            progress.mark_sent(index, hex::encode(payload), reference.0);
                            let snapshot = (done % persist_every == 0).then(|| progress.clone());
                            (progress.sent_chunks, snapshot)
                        };

                        if let Some(snapshot) = snapshot {
                            let mut persisted = persisted.lock().await;
                            if snapshot.sent_chunks > *persisted {
                                match self.store.save(&snapshot).await {
                                    Ok(()) => *persisted = snapshot.sent_chunks,
                                    Err(e) => {
                                        tracing::warn!("failed to persist upload progress: {}", e)
                                    }
                                }
                            }
                        }
                        if done % log_every == 0 {
                            let elapsed = start_time.elapsed().as_secs_f64();
                            tracing::info!(
                                "progress: {} / {} ({:.1}%), {:.1} chunks/s",
                                sent,
                                total,
                                sent as f64 / total.max(1) as f64 * 100.0,
                                done as f64 / elapsed.max(f64::EPSILON)
                            );
                        }
                    }
                    Err(Error::Cancelled) => {
                        tracing::debug!("chunk {} abandoned on cancel", index);
                    }
                    Err(e) if is_fatal(&e) => {
                        tracing::error!("chunk {} rejected, stopping upload: {}", index, e);
                        shared.lock().await.mark_failed(index);
                        abort.cancel();
                        let mut fatal = fatal.lock().await;
                        if fatal.is_none() {
                            *fatal = Some(e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("chunk {} failed: {}", index, e);
                        shared.lock().await.mark_failed(index);
                    }
                }
            })
            .await;

        let progress = shared.lock().await.clone();
        self.store.save(&progress).await?;

        if let Some(e) = fatal.lock().await.take() {
            return Err(e);
        }
        if self.options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let written_now = written.load(Ordering::Relaxed);
        tracing::info!(
            "wrote {} chunks in {:.2}s ({} failed)",
            written_now,
            start_time.elapsed().as_secs_f64(),
            progress.failed_chunks.len()
        );
        Ok((progress, written_now))
    }

    async fn write_blob(
        &self,
        request: &UploadRequest,
        mut progress: UploadProgress,
    ) -> Result<(UploadProgress, u64)> {
        if progress.is_chunk_sent(0) {
            return Ok((progress, 0));
        }

        match cancellable(&self.options.cancel, self.driver.store_blob(&request.data)).await {
            Ok(blob_id) => {
                tracing::info!("stored cartridge {} as blob {}", progress.cartridge_id, blob_id);
                progress.mark_sent(0, String::new(), blob_id);
                self.store.save(&progress).await?;
                Ok((progress, 1))
            }
            Err(Error::Cancelled) => {
                self.store.save(&progress).await?;
                Err(Error::Cancelled)
            }
            Err(e) if is_fatal(&e) => {
                progress.mark_failed(0);
                self.store.save(&progress).await?;
                Err(e)
            }
            Err(e) => {
                tracing::warn!("blob upload for cartridge {} failed: {}", progress.cartridge_id, e);
                progress.mark_failed(0);
                Ok((progress, 0))
            }
        }
    }

    fn report(progress: &UploadProgress, written_now: u64, skipped: u64, resumed: bool) -> UploadReport {
        UploadReport {
            cartridge_id: progress.cartridge_id,
            address: progress.address.clone(),
            checksum: progress.checksum,
            total_chunks: progress.total_chunks,
            written_now,
            skipped,
            failed: progress.failed_chunks.clone(),
            header_ref: progress.header_ref.clone(),
            catalog_ref: progress.catalog_ref.clone(),
            resumed,
        }
    }
}
