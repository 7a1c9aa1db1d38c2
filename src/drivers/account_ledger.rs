//! Driver for account-model ledgers with program-derived addresses.
//!
//! Each cartridge gets a derived account under the configured program. Reads
//! list signatures touching that account newest-first (`before` cursor) and
//! fetch the transactions behind them; the record rides as base58 instruction
//! data. Writes are signed client-side by a [`TransactionSigner`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::rpc::{
    parse_with, JsonRpcClient, ParseStrategy, HEIGHT_STRATEGIES, LIST_STRATEGIES,
    REFERENCE_STRATEGIES,
};
use super::{
    BackendKind, LedgerDriver, Page, RawRecord, SignRequest, TransactionSigner, WriteRef,
    WriteRequest,
};
use crate::address::base58;
use crate::error::{Error, Result};
use crate::record::{CartridgeKey, RecordKind};

/// Transactions fetched in parallel per page.
const DEFAULT_FETCH_CONCURRENCY: usize = 8;

pub struct AccountLedgerDriver {
    rpc: JsonRpcClient,
    program_id: Vec<u8>,
    signer: Option<Arc<dyn TransactionSigner>>,
    fetch_concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct SignatureInfo {
    signature: String,
    #[serde(default)]
    slot: u64,
    #[serde(default)]
    err: Option<Value>,
}

/// One entry of a signature listing.
enum Listed {
    Signature(SignatureInfo),
    Unreadable(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionEnvelope {
    #[serde(default)]
    slot: u64,
    transaction: TransactionBody,
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    message: Message,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Message {
    #[serde(default)]
    account_keys: Vec<String>,
    #[serde(default)]
    instructions: Vec<Instruction>,
}

#[derive(Debug, Deserialize)]
struct Instruction {
    #[serde(default)]
    data: String,
}

fn blockhash_value(value: &Value) -> Option<String> {
    value.get("value")?.get("blockhash")?.as_str().map(str::to_string)
}

fn blockhash_bare(value: &Value) -> Option<String> {
    value.get("blockhash")?.as_str().map(str::to_string)
}

const BLOCKHASH_STRATEGIES: &[ParseStrategy<String>] = &[
    ParseStrategy::new("context wrapper", blockhash_value),
    ParseStrategy::new("bare object", blockhash_bare),
];

impl AccountLedgerDriver {
    pub fn new(
        rpc: JsonRpcClient,
        program_id: &str,
        signer: Option<Arc<dyn TransactionSigner>>,
    ) -> Result<Self> {
        let program_id = base58::decode(program_id)?;
        if program_id.len() != 32 {
            return Err(Error::InvalidAddress(format!(
                "program id decodes to {} bytes (expected 32)",
                program_id.len()
            )));
        }
        Ok(Self {
            rpc,
            program_id,
            signer,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        })
    }

    pub fn with_fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch_concurrency = concurrency.max(1);
        self
    }

    async fn fetch_transaction(&self, info: SignatureInfo) -> Result<RawRecord> {
        let mut record = RawRecord {
            id: info.signature,
            owner: None,
            height: info.slot,
            payload: Bytes::new(),
            content_ref: None,
        };
        if info.err.as_ref().is_some_and(|e| !e.is_null()) {
            return Ok(record);
        }

        let result = self
            .rpc
            .call(
                "getTransaction",
                json!([record.id, {"encoding": "json", "maxSupportedTransactionVersion": 0}]),
            )
            .await?;
        if result.is_null() {
            return Ok(record);
        }

        let envelope: TransactionEnvelope = match serde_json::from_value(result) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("unparsable transaction {}: {}", record.id, e);
                return Ok(record);
            }
        };
        if envelope.slot > 0 {
            record.height = envelope.slot;
        }
        let message = envelope.transaction.message;
        record.owner = message.account_keys.first().cloned();
        record.payload = message
            .instructions
            .iter()
            .filter_map(|ix| base58::decode(&ix.data).ok())
            .find(|data| RecordKind::sniff(data).is_some())
            .map(Bytes::from)
            .unwrap_or_default();
        Ok(record)
    }

    async fn resolve(&self, listed: Listed) -> Result<RawRecord> {
        match listed {
            Listed::Signature(info) => self.fetch_transaction(info).await,
            Listed::Unreadable(id) => Ok(RawRecord::placeholder(id)),
        }
    }

    async fn ensure_writer_ready(&self) -> Result<&Arc<dyn TransactionSigner>> {
        match self.rpc.call("getHealth", json!([])).await {
            Ok(Value::String(status)) if status == "ok" => {}
            Ok(other) => {
                return Err(Error::Unavailable(format!("node health is {}", other)));
            }
            Err(Error::Rejected(reason)) => return Err(Error::Unavailable(reason)),
            Err(e) => return Err(e),
        }

        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| Error::NotAuthorized("no signer configured".to_string()))?;
        if !signer.is_unlocked().await {
            return Err(Error::WriterLocked(signer.writer_address()));
        }
        Ok(signer)
    }
}

#[async_trait]
impl LedgerDriver for AccountLedgerDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::AccountLedger
    }

    fn address_for_key(&self, key: &CartridgeKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.program_id);
        hasher.update(b"cartridge");
        hasher.update(key.as_bytes());
        base58::encode(&hasher.finalize())
    }

    fn writer_address(&self) -> Option<String> {
        self.signer.as_ref().map(|s| s.writer_address())
    }

    async fn current_height(&self) -> Result<u64> {
        let result = self.rpc.call("getSlot", json!([])).await?;
        Ok(parse_with(&result, HEIGHT_STRATEGIES, "slot")?.value)
    }

    async fn fetch_page(
        &self,
        owner: &str,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let mut options = json!({ "limit": page_size });
        if let Some(before) = cursor {
            options["before"] = json!(before);
        }
        let result = self
            .rpc
            .call("getSignaturesForAddress", json!([owner, options]))
            .await?;
        let items = parse_with(&result, LIST_STRATEGIES, "signature list")?.value;

        let mut listed = Vec::with_capacity(items.len());
        let mut next_cursor = None;
        for (position, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<SignatureInfo>(item) {
                Ok(info) => {
                    next_cursor = Some(info.signature.clone());
                    listed.push(Listed::Signature(info));
                }
                Err(e) => {
                    let id = RawRecord::anonymous_id(owner, cursor, position);
                    tracing::warn!("unparsable signature entry {} for {}: {}", id, owner, e);
                    listed.push(Listed::Unreadable(id));
                }
            }
        }

        // buffered keeps newest-first order
        let records: Vec<RawRecord> = stream::iter(listed)
            .map(|entry| self.resolve(entry))
            .buffered(self.fetch_concurrency)
            .try_collect()
            .await?;

        Ok(Page {
            records,
            next_cursor,
        })
    }

    async fn write(&self, request: WriteRequest) -> Result<WriteRef> {
        if request.content_ref.is_some() {
            return Err(Error::Unsupported {
                backend: self.backend().as_str(),
                operation: "content references",
            });
        }

        let signer = self.ensure_writer_ready().await?;
        let latest = self
            .rpc
            .call("getLatestBlockhash", json!([{"commitment": "confirmed"}]))
            .await?;
        let blockhash = parse_with(&latest, BLOCKHASH_STRATEGIES, "latest blockhash")?.value;

        let signed = signer
            .sign(SignRequest {
                destination: &request.address,
                payload: &request.payload,
                anchor: &blockhash,
                content_ref: None,
            })
            .await?;

        let result = self
            .rpc
            .call(
                "sendTransaction",
                json!([signed.transaction, {"encoding": "base64"}]),
            )
            .await?;
        let signature = parse_with(&result, REFERENCE_STRATEGIES, "transaction signature")?.value;

        tracing::debug!("wrote record to {} in {}", request.address, signature);
        Ok(WriteRef(signature))
    }
}
