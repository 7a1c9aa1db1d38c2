//! Configuration for cartridge storage and discovery.
//!
//! Every setting is available as a `--long` flag and a `CARTRIDGE_*`
//! environment variable. Library users build the same struct with
//! [`Config::builder`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::download::{DownloadOptions, DEFAULT_HEADER_SEARCH_PAGES};
use crate::drivers::BackendKind;
use crate::pagination::{ScanOptions, DEFAULT_PAGE_SIZE, DEFAULT_STALL_LIMIT};
use crate::progress::DEFAULT_REPORT_INTERVAL;
use crate::record::MAX_CHUNK_DATA;
use crate::retry::RetryPolicy;
use crate::upload::{UploadOptions, MAX_CONCURRENCY};

pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8648";
pub const DEFAULT_BLOB_EPOCHS: u32 = 5;
pub const DEFAULT_UPLOAD_RATE: u32 = 5;
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;
pub const DEFAULT_CHUNK_SIZE: u8 = MAX_CHUNK_DATA as u8;
pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_CACHE_DIR: &str = ".cartridge-cache";
pub const DEFAULT_PROGRESS_DIR: &str = ".cartridge-progress";

#[derive(Parser, Debug, Clone)]
#[command(name = "cartridge-ledger")]
#[command(about = "Store and discover cartridges on public ledgers")]
pub struct Config {
    // === Backend ===
    /// Backend the cartridges live on
    #[arg(long, env = "CARTRIDGE_BACKEND", value_enum, default_value_t = BackendKind::TxLedger)]
    pub backend: BackendKind,

    /// JSON-RPC endpoint of the ledger node
    #[arg(long, env = "CARTRIDGE_RPC_URL", default_value = DEFAULT_RPC_URL)]
    pub rpc_url: String,

    /// Blob aggregator used to read blob-stored cartridges (object ledger)
    #[arg(long, env = "CARTRIDGE_AGGREGATOR_URL")]
    pub aggregator_url: Option<String>,

    /// Blob publisher used to store cartridges (object ledger)
    #[arg(long, env = "CARTRIDGE_PUBLISHER_URL")]
    pub publisher_url: Option<String>,

    /// Storage epochs requested for new blobs
    #[arg(long, env = "CARTRIDGE_BLOB_EPOCHS", default_value_t = DEFAULT_BLOB_EPOCHS)]
    pub blob_epochs: u32,

    /// Address collecting catalog entries
    #[arg(long, env = "CARTRIDGE_CATALOG_ADDRESS")]
    pub catalog_address: Option<String>,

    /// Base58 program id (account ledger)
    #[arg(long, env = "CARTRIDGE_PROGRAM_ID")]
    pub program_id: Option<String>,

    /// Package id of the cartridge module (object ledger)
    #[arg(long, env = "CARTRIDGE_PACKAGE_ID")]
    pub package_id: Option<String>,

    /// Node wallet address used for writes (transaction ledger)
    #[arg(long, env = "CARTRIDGE_WRITER_ADDRESS")]
    pub writer_address: Option<String>,

    /// Only trust records written by this identity
    #[arg(long, env = "CARTRIDGE_PUBLISHER")]
    pub publisher: Option<String>,

    // === Scanning ===
    /// Records requested per page
    #[arg(long, env = "CARTRIDGE_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Newest pages searched for a cartridge header
    #[arg(long, env = "CARTRIDGE_HEADER_SEARCH_PAGES", default_value_t = DEFAULT_HEADER_SEARCH_PAGES)]
    pub header_search_pages: usize,

    /// Consecutive pages without new records before a scan gives up
    #[arg(long, env = "CARTRIDGE_STALL_LIMIT", default_value_t = DEFAULT_STALL_LIMIT)]
    pub stall_limit: usize,

    // === Uploads ===
    /// Writes per second shared by all upload workers
    #[arg(long, env = "CARTRIDGE_UPLOAD_RATE", default_value_t = DEFAULT_UPLOAD_RATE)]
    pub upload_rate: u32,

    /// Number of upload workers (1-10)
    #[arg(long, env = "CARTRIDGE_UPLOAD_CONCURRENCY", default_value_t = DEFAULT_UPLOAD_CONCURRENCY)]
    pub upload_concurrency: usize,

    /// File bytes per chunk record (1-51)
    #[arg(long, env = "CARTRIDGE_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u8,

    /// Directory holding resumable upload progress files
    #[arg(long, env = "CARTRIDGE_PROGRESS_DIR", default_value = DEFAULT_PROGRESS_DIR)]
    pub progress_dir: PathBuf,

    // === Timeouts & Retries ===
    /// Attempts per backend call before giving up
    #[arg(long, env = "CARTRIDGE_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: usize,

    /// First retry delay in milliseconds, doubled on every attempt
    #[arg(long, env = "CARTRIDGE_RETRY_BASE_DELAY_MS", default_value_t = DEFAULT_RETRY_BASE_DELAY_MS)]
    pub retry_base_delay_ms: u64,

    /// HTTP timeout in seconds
    #[arg(long, env = "CARTRIDGE_HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_HTTP_TIMEOUT_SECS)]
    pub http_timeout_secs: u64,

    // === Caching ===
    /// Directory for verified cartridge files
    #[arg(long, env = "CARTRIDGE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Maximum bytes kept in the cache
    #[arg(long, env = "CARTRIDGE_CACHE_BUDGET_BYTES", default_value_t = DEFAULT_CACHE_BUDGET_BYTES)]
    pub cache_budget_bytes: u64,

    /// Cache verified downloads locally
    #[arg(long, env = "CARTRIDGE_CACHE_ENABLED", default_value = "false")]
    pub cache_enabled: bool,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            page_size: self.page_size,
            stall_limit: self.stall_limit,
            max_pages: None,
            retry: self.retry_policy(),
        }
    }

    pub fn download_options(&self, cancel: CancellationToken) -> DownloadOptions {
        DownloadOptions {
            scan: self.scan_options(),
            header_search_pages: self.header_search_pages,
            report_interval: DEFAULT_REPORT_INTERVAL,
            cancel,
        }
    }

    pub fn upload_options(&self, cancel: CancellationToken) -> UploadOptions {
        UploadOptions {
            ops_per_sec: self.upload_rate,
            concurrency: self.upload_concurrency,
            cancel,
            ..UploadOptions::default()
        }
    }

    /// Cache directory, if caching is enabled.
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        self.cache_enabled.then(|| {
            self.cache_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
        })
    }

    /// Check that the settings are consistent with each other and the backend.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            (1..=MAX_CONCURRENCY).contains(&self.upload_concurrency),
            "upload concurrency must be between 1 and {}, got {}",
            MAX_CONCURRENCY,
            self.upload_concurrency
        );
        ensure!(self.upload_rate > 0, "upload rate must be positive");
        ensure!(
            self.chunk_size >= 1 && self.chunk_size as usize <= MAX_CHUNK_DATA,
            "chunk size must be between 1 and {}, got {}",
            MAX_CHUNK_DATA,
            self.chunk_size
        );
        ensure!(self.page_size > 0, "page size must be positive");
        ensure!(self.header_search_pages > 0, "header search pages must be positive");
        ensure!(self.stall_limit > 0, "stall limit must be positive");
        ensure!(self.max_retries > 0, "max retries must be at least 1");

        match self.backend {
            BackendKind::TxLedger => {}
            BackendKind::AccountLedger => {
                if self.program_id.is_none() {
                    bail!("the account ledger backend needs --program-id");
                }
            }
            BackendKind::ObjectLedger => {
                if self.aggregator_url.is_none() {
                    bail!("the object ledger backend needs --aggregator-url");
                }
                if self.package_id.is_none() {
                    bail!("the object ledger backend needs --package-id");
                }
            }
        }

        if self.cache_enabled {
            ensure!(self.cache_budget_bytes > 0, "cache budget must be positive");
        }
        Ok(())
    }

    /// Writes without a [`TransactionSigner`](crate::drivers::TransactionSigner)
    /// only work on the tx ledger, whose node wallet signs for us.
    pub fn ensure_signerless_writes(&self) -> anyhow::Result<()> {
        if self.backend != BackendKind::TxLedger {
            bail!(
                "the {} backend signs writes with a transaction signer, which the command line does not provide; only reads are available here",
                self.backend
            );
        }
        Ok(())
    }
}

/// Builder for Config.
#[derive(Default)]
pub struct ConfigBuilder {
    backend: Option<BackendKind>,
    rpc_url: Option<String>,
    aggregator_url: Option<String>,
    publisher_url: Option<String>,
    blob_epochs: Option<u32>,
    catalog_address: Option<String>,
    program_id: Option<String>,
    package_id: Option<String>,
    writer_address: Option<String>,
    publisher: Option<String>,
    page_size: Option<usize>,
    header_search_pages: Option<usize>,
    stall_limit: Option<usize>,
    upload_rate: Option<u32>,
    upload_concurrency: Option<usize>,
    chunk_size: Option<u8>,
    progress_dir: Option<PathBuf>,
    max_retries: Option<usize>,
    retry_base_delay_ms: Option<u64>,
    http_timeout_secs: Option<u64>,
    cache_dir: Option<PathBuf>,
    cache_budget_bytes: Option<u64>,
    cache_enabled: Option<bool>,
}

impl ConfigBuilder {
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn aggregator_url(mut self, url: impl Into<String>) -> Self {
        self.aggregator_url = Some(url.into());
        self
    }

    pub fn publisher_url(mut self, url: impl Into<String>) -> Self {
        self.publisher_url = Some(url.into());
        self
    }

    pub fn blob_epochs(mut self, epochs: u32) -> Self {
        self.blob_epochs = Some(epochs);
        self
    }

    pub fn catalog_address(mut self, address: impl Into<String>) -> Self {
        self.catalog_address = Some(address.into());
        self
    }

    pub fn program_id(mut self, program_id: impl Into<String>) -> Self {
        self.program_id = Some(program_id.into());
        self
    }

    pub fn package_id(mut self, package_id: impl Into<String>) -> Self {
        self.package_id = Some(package_id.into());
        self
    }

    pub fn writer_address(mut self, address: impl Into<String>) -> Self {
        self.writer_address = Some(address.into());
        self
    }

    pub fn publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn header_search_pages(mut self, pages: usize) -> Self {
        self.header_search_pages = Some(pages);
        self
    }

    pub fn stall_limit(mut self, limit: usize) -> Self {
        self.stall_limit = Some(limit);
        self
    }

    pub fn upload_rate(mut self, ops_per_sec: u32) -> Self {
        self.upload_rate = Some(ops_per_sec);
        self
    }

    pub fn upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = Some(concurrency);
        self
    }

    pub fn chunk_size(mut self, chunk_size: u8) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn progress_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.progress_dir = Some(dir.into());
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_base_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_base_delay_ms = Some(delay_ms);
        self
    }

    pub fn http_timeout_secs(mut self, secs: u64) -> Self {
        self.http_timeout_secs = Some(secs);
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn cache_budget_bytes(mut self, budget: u64) -> Self {
        self.cache_budget_bytes = Some(budget);
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = Some(enabled);
        self
    }

    pub fn build(self) -> anyhow::Result<Config> {
        let config = Config {
            backend: self.backend.unwrap_or(BackendKind::TxLedger),
            rpc_url: self.rpc_url.unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            aggregator_url: self.aggregator_url,
            publisher_url: self.publisher_url,
            blob_epochs: self.blob_epochs.unwrap_or(DEFAULT_BLOB_EPOCHS),
            catalog_address: self.catalog_address,
            program_id: self.program_id,
            package_id: self.package_id,
            writer_address: self.writer_address,
            publisher: self.publisher,
            page_size: self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            header_search_pages: self
                .header_search_pages
                .unwrap_or(DEFAULT_HEADER_SEARCH_PAGES),
            stall_limit: self.stall_limit.unwrap_or(DEFAULT_STALL_LIMIT),
            upload_rate: self.upload_rate.unwrap_or(DEFAULT_UPLOAD_RATE),
            upload_concurrency: self
                .upload_concurrency
                .unwrap_or(DEFAULT_UPLOAD_CONCURRENCY),
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            progress_dir: self
                .progress_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRESS_DIR)),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_base_delay_ms: self
                .retry_base_delay_ms
                .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            http_timeout_secs: self.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            cache_dir: self.cache_dir,
            cache_budget_bytes: self
                .cache_budget_bytes
                .unwrap_or(DEFAULT_CACHE_BUDGET_BYTES),
            cache_enabled: self.cache_enabled.unwrap_or(false),
        };

        config.validate()?;

        Ok(config)
    }
}
