//! # Cartridge Ledger
//!
//! Store files ("cartridges") on public ledgers as fixed-size records and
//! discover them through an on-ledger catalog.
//!
//! A cartridge is split into 64-byte chunk records, followed by one header
//! record carrying its size and SHA-256 checksum. A catalog address collects
//! entries pointing applications and versions at cartridges.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cartridge_ledger::{drivers, CatalogIndexer, Config, Downloader, ListOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::builder()
//!         .rpc_url("http://127.0.0.1:8648")
//!         .catalog_address("NQ07 0000 0000 0000 0000 0000 0000 0000 0000")
//!         .build()?;
//!
//!     let driver = drivers::connect(&config, None)?;
//!     let catalog = CatalogIndexer::new(driver.clone(), "NQ07 0000 0000 0000 0000 0000 0000 0000 0000");
//!     let downloader = Downloader::new(driver);
//!
//!     for game in catalog.list(&ListOptions::default()).await? {
//!         if let Some(latest) = game.latest() {
//!             let cartridge = downloader.fetch_from_catalog(latest, None).await?;
//!             println!("{}: {} bytes", game.title, cartridge.bytes.len());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`record`]: binary record layouts and checksums
//! - [`address`]: ledger address and base58 codecs
//! - [`drivers`]: one driver per backend behind [`drivers::LedgerDriver`]
//! - [`pagination`]: deduplicating, stall-safe page streams
//! - [`catalog`]: catalog listing and publishing
//! - [`upload`] / [`upload_state`]: resumable, rate-limited uploads
//! - [`download`] / [`cache`]: verified reconstruction and local caching
//! - [`config`]: configuration and CLI argument handling

pub mod address;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod download;
pub mod drivers;
pub mod error;
pub mod pagination;
pub mod progress;
pub mod ratelimit;
pub mod record;
pub mod retry;
pub mod upload;
pub mod upload_state;

// Re-exports for convenience
pub use cache::CartridgeCache;
pub use catalog::{CatalogIndexer, Game, GameVersion, ListOptions};
pub use config::Config;
pub use download::{DownloadResult, Downloader, FetchRequest};
pub use drivers::{LedgerDriver, TransactionSigner};
pub use error::{Error, Result};
pub use upload::{UploadReport, UploadRequest, Uploader};
pub use upload_state::{ProgressStore, UploadProgress};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::catalog::{CatalogIndexer, ListOptions};
    pub use crate::config::Config;
    pub use crate::download::{Downloader, FetchRequest};
    pub use crate::drivers::LedgerDriver;
    pub use crate::record::{CatalogEntry, Checksum, Chunk, Header, Semver};
    pub use crate::upload::{UploadRequest, Uploader};
}
