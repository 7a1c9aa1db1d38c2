//! Driver for ledgers where every record is a transaction data field.
//!
//! Reads walk `getTransactionsByAddress` newest-first, using the hash of the
//! last transaction on a page as the cursor for the next one. Writes are
//! plain value-free transactions from the node's unlocked writer account to
//! the cartridge address, with the record as the data field.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use super::rpc::{
    parse_with, JsonRpcClient, FLAG_STRATEGIES, HEIGHT_STRATEGIES, LIST_STRATEGIES,
    REFERENCE_STRATEGIES,
};
use super::{BackendKind, LedgerDriver, Page, RawRecord, WriteRef, WriteRequest};
use crate::address::LedgerAddress;
use crate::error::{Error, Result};
use crate::record::{CartridgeKey, RecordKind};

/// Fee attached to record transactions, in the ledger's smallest unit.
const DEFAULT_FEE: u64 = 0;

pub struct TxLedgerDriver {
    rpc: JsonRpcClient,
    writer: Option<LedgerAddress>,
    fee: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerTransaction {
    hash: String,
    #[serde(default, alias = "fromAddress")]
    from: Option<String>,
    #[serde(default, alias = "height")]
    block_number: Option<u64>,
    #[serde(default, alias = "recipientData")]
    data: Option<String>,
}

impl TxLedgerDriver {
    pub fn new(rpc: JsonRpcClient, writer: Option<&str>) -> Result<Self> {
        let writer = writer
            .map(LedgerAddress::from_user_friendly_checked)
            .transpose()?;
        Ok(Self {
            rpc,
            writer,
            fee: DEFAULT_FEE,
        })
    }

    pub fn with_fee(mut self, fee: u64) -> Self {
        self.fee = fee;
        self
    }

    fn to_record(tx: LedgerTransaction) -> RawRecord {
        // Only decode data fields that already look like one of our records.
        let payload = tx
            .data
            .as_deref()
            .map(|data| data.trim_start_matches("0x"))
            .filter(|data| RecordKind::sniff_hex(data).is_some())
            .and_then(|data| hex::decode(data).ok())
            .map(Bytes::from)
            .unwrap_or_default();

        RawRecord {
            id: tx.hash,
            owner: tx.from,
            height: tx.block_number.unwrap_or_default(),
            payload,
            content_ref: None,
        }
    }

    async fn ensure_writer_ready(&self) -> Result<LedgerAddress> {
        let writer = self
            .writer
            .ok_or_else(|| Error::NotAuthorized("no writer address configured".to_string()))?;

        let consensus = self.rpc.call("isConsensusEstablished", json!([])).await?;
        let established = parse_with(&consensus, FLAG_STRATEGIES, "consensus state")?.value;
        if !established {
            return Err(Error::Unavailable("consensus not established".to_string()));
        }

        let friendly = writer.to_user_friendly();
        let unlocked = self
            .rpc
            .call("isAccountUnlocked", json!([friendly]))
            .await?;
        if !parse_with(&unlocked, FLAG_STRATEGIES, "account lock state")?.value {
            return Err(Error::WriterLocked(friendly));
        }

        Ok(writer)
    }
}

#[async_trait]
impl LedgerDriver for TxLedgerDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::TxLedger
    }

    fn address_for_key(&self, key: &CartridgeKey) -> String {
        LedgerAddress::from_bytes(*key.as_bytes()).to_user_friendly()
    }

    fn writer_address(&self) -> Option<String> {
        self.writer.map(|w| w.to_user_friendly())
    }

    async fn current_height(&self) -> Result<u64> {
        let result = self.rpc.call("getBlockNumber", json!([])).await?;
        Ok(parse_with(&result, HEIGHT_STRATEGIES, "block number")?.value)
    }

    async fn fetch_page(
        &self,
        owner: &str,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let params = match cursor {
            Some(start_at) => json!([owner, page_size, start_at]),
            None => json!([owner, page_size]),
        };
        let result = self.rpc.call("getTransactionsByAddress", params).await?;
        let items = parse_with(&result, LIST_STRATEGIES, "transaction list")?.value;

        let mut records = Vec::with_capacity(items.len());
        let mut next_cursor = None;
        for (position, item) in items.into_iter().enumerate() {
            let hash = item.get("hash").and_then(Value::as_str).map(str::to_string);
            if hash.is_some() {
                next_cursor.clone_from(&hash);
            }
            match serde_json::from_value::<LedgerTransaction>(item) {
                Ok(tx) => records.push(Self::to_record(tx)),
                Err(e) => {
                    let id = hash
                        .unwrap_or_else(|| RawRecord::anonymous_id(owner, cursor, position));
                    tracing::warn!("unparsable transaction {} for {}: {}", id, owner, e);
                    records.push(RawRecord::placeholder(id));
                }
            }
        }

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

        let writer = self.ensure_writer_ready().await?;
        let height = self.current_height().await?;

        let params: Value = json!([
            writer.to_user_friendly(),
            request.address,
            0,
            self.fee,
            hex::encode(&request.payload),
            height,
        ]);
        let result = self
            .rpc
            .call("sendBasicTransactionWithData", params)
            .await?;
        let hash = parse_with(&result, REFERENCE_STRATEGIES, "transaction hash")?.value;

        tracing::debug!("wrote record to {} in {}", request.address, hash);
        Ok(WriteRef(hash))
    }
}
