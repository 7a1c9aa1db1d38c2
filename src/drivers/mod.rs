//! Backend drivers.
//!
//! Every backend is reduced to the same small capability set: fetch one page
//! of records owned by an address, fetch content by id, store a blob, and
//! write a record payload. Pagination, header discovery and chunk streaming
//! are built on top of [`LedgerDriver::fetch_page`] in [`crate::pagination`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    dyn LedgerDriver                       │
//! │                                                           │
//! │  ┌──────────────┐  ┌────────────────┐  ┌───────────────┐ │
//! │  │  TxLedger    │  │ AccountLedger  │  │ ObjectLedger  │ │
//! │  │ (tx scan)    │  │ (signatures)   │  │ (+ blob store)│ │
//! │  └──────┬───────┘  └───────┬────────┘  └───────┬───────┘ │
//! │         └──────────────────┼───────────────────┘         │
//! │                    ┌───────▼────────┐                     │
//! │                    │ JsonRpcClient  │                     │
//! │                    └────────────────┘                     │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::record::{CartridgeKey, RECORD_SIZE};
use crate::retry::RetryPolicy;

pub mod account_ledger;
pub mod object_ledger;
pub mod rpc;
pub mod tx_ledger;

#[cfg(test)]
pub(crate) mod memory;

pub use account_ledger::AccountLedgerDriver;
pub use object_ledger::ObjectLedgerDriver;
pub use tx_ledger::TxLedgerDriver;

/// Which backend a driver talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Ledger whose transactions carry record payloads.
    TxLedger,
    /// Ledger addressed by derived program accounts.
    AccountLedger,
    /// Object ledger with file contents in a separate blob store.
    ObjectLedger,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::TxLedger => "tx-ledger",
            BackendKind::AccountLedger => "account-ledger",
            BackendKind::ObjectLedger => "object-ledger",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How file bytes are laid out on a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// File split into chunk records next to the header.
    Chunked,
    /// Whole file in a blob store; the header points at the blob id.
    Blob,
}

/// One raw record as returned by a backend scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Transaction hash, signature or object id. Unique per backend.
    pub id: String,
    /// Address that submitted the record, when the backend exposes it.
    pub owner: Option<String>,
    /// Block height, slot or object version.
    pub height: u64,
    /// Record payload. Empty when the backend entry carries no record.
    pub payload: Bytes,
    /// Out-of-band content id attached to the record (blob backends).
    pub content_ref: Option<String>,
}

impl RawRecord {
    /// Stand-in for a backend entry that could not be parsed. It keeps its
    /// slot on the page so short-page detection still sees a full page.
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: None,
            height: 0,
            payload: Bytes::new(),
            content_ref: None,
        }
    }

    /// Id for an unparsable entry that carried no usable id of its own.
    pub fn anonymous_id(owner: &str, cursor: Option<&str>, position: usize) -> String {
        format!("unparsable:{}:{}:{}", owner, cursor.unwrap_or("head"), position)
    }

    pub fn is_from(&self, publisher: &str) -> bool {
        self.owner
            .as_deref()
            .map(|owner| same_identity(owner, publisher))
            .unwrap_or(false)
    }
}

/// Compare two addresses ignoring whitespace and case.
pub fn same_identity(a: &str, b: &str) -> bool {
    let normalize = |s: &str| {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_lowercase())
            .collect::<String>()
    };
    normalize(a) == normalize(b)
}

/// One page of a newest-first owner scan.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Cursor for the next (older) page; `None` when the backend says there is none.
    pub next_cursor: Option<String>,
}

/// A record payload to submit to an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub address: String,
    pub payload: Vec<u8>,
    pub content_ref: Option<String>,
}

impl WriteRequest {
    pub fn record(address: impl Into<String>, payload: [u8; RECORD_SIZE]) -> Self {
        Self {
            address: address.into(),
            payload: payload.to_vec(),
            content_ref: None,
        }
    }

    pub fn with_content_ref(mut self, content_ref: impl Into<String>) -> Self {
        self.content_ref = Some(content_ref.into());
        self
    }
}

/// Reference to a completed write (transaction hash, signature or digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriteRef(pub String);

impl fmt::Display for WriteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Data handed to a [`TransactionSigner`].
#[derive(Debug, Clone, Copy)]
pub struct SignRequest<'a> {
    pub destination: &'a str,
    pub payload: &'a [u8],
    /// Recent block hash or height the transaction is anchored to.
    pub anchor: &'a str,
    pub content_ref: Option<&'a str>,
}

/// A transaction ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// Encoded transaction (base64 or base58, backend specific).
    pub transaction: String,
    /// Detached signatures, for backends that submit them separately.
    pub signatures: Vec<String>,
}

/// Signing collaborator for backends that need client-side signatures.
///
/// Key loading and unlocking happen outside this crate.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn writer_address(&self) -> String;

    async fn is_unlocked(&self) -> bool;

    async fn sign(&self, request: SignRequest<'_>) -> Result<SignedTransaction>;
}

/// Uniform read/write surface over one backend.
#[async_trait]
pub trait LedgerDriver: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn storage_mode(&self) -> StorageMode {
        StorageMode::Chunked
    }

    /// Map a cartridge key onto this backend's address space. Pure.
    fn address_for_key(&self, key: &CartridgeKey) -> String;

    fn cartridge_address(&self, platform: u8, cartridge_id: u32) -> String {
        self.address_for_key(&CartridgeKey::derive(platform, cartridge_id))
    }

    /// Address of the configured writer identity, if any.
    fn writer_address(&self) -> Option<String>;

    /// Current height/sequence, used as a write-ordering anchor.
    async fn current_height(&self) -> Result<u64>;

    /// Fetch one newest-first page of records owned by `owner`.
    async fn fetch_page(&self, owner: &str, page_size: usize, cursor: Option<&str>)
        -> Result<Page>;

    /// Fetch out-of-band content by id.
    async fn fetch_by_id(&self, _id: &str) -> Result<Bytes> {
        Err(Error::Unsupported {
            backend: self.backend().as_str(),
            operation: "fetch_by_id",
        })
    }

    /// Store a whole file out-of-band and return its content id.
    async fn store_blob(&self, _data: &[u8]) -> Result<String> {
        Err(Error::Unsupported {
            backend: self.backend().as_str(),
            operation: "store_blob",
        })
    }

    /// Submit a record after checking the writer is ready.
    async fn write(&self, request: WriteRequest) -> Result<WriteRef>;
}

/// Build the driver selected by `config`.
pub fn connect(
    config: &Config,
    signer: Option<Arc<dyn TransactionSigner>>,
) -> Result<Arc<dyn LedgerDriver>> {
    let retry = RetryPolicy::new(
        config.max_retries,
        Duration::from_millis(config.retry_base_delay_ms),
    );
    let rpc = rpc::JsonRpcClient::new(
        &config.rpc_url,
        Duration::from_secs(config.http_timeout_secs),
        retry,
    )?;

    tracing::info!("connecting {} driver at {}", config.backend, config.rpc_url);

    let driver: Arc<dyn LedgerDriver> = match config.backend {
        BackendKind::TxLedger => Arc::new(TxLedgerDriver::new(rpc, config.writer_address.as_deref())?),
        BackendKind::AccountLedger => {
            let program_id = config.program_id.as_deref().ok_or_else(|| {
                Error::InvalidInput("account ledger requires a program id".to_string())
            })?;
            Arc::new(AccountLedgerDriver::new(rpc, program_id, signer)?)
        }
        BackendKind::ObjectLedger => {
            let aggregator_url = config.aggregator_url.as_deref().ok_or_else(|| {
                Error::InvalidInput("object ledger requires an aggregator url".to_string())
            })?;
            let package_id = config.package_id.as_deref().ok_or_else(|| {
                Error::InvalidInput("object ledger requires a package id".to_string())
            })?;
            Arc::new(
                ObjectLedgerDriver::new(rpc, aggregator_url, package_id, signer)
                    .with_publisher(config.publisher_url.clone(), config.blob_epochs),
            )
        }
    };

    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_comparison_ignores_spacing_and_case() {
        assert!(same_identity(
            "NQ07 0000 0000 0000 0000 0000 0000 0000 0000",
            "nq0700000000000000000000000000000000"
        ));
        assert!(!same_identity("0xabc", "0xabd"));
    }

    #[test]
    fn records_without_owner_never_match_a_publisher() {
        let record = RawRecord {
            id: "a".into(),
            owner: None,
            height: 1,
            payload: Bytes::new(),
            content_ref: None,
        };
        assert!(!record.is_from("0xabc"));
    }

    #[test]
    fn backend_names() {
        assert_eq!(BackendKind::ObjectLedger.to_string(), "object-ledger");
        assert_eq!(
            serde_json::to_string(&BackendKind::TxLedger).unwrap(),
            "\"tx-ledger\""
        );
    }
}
