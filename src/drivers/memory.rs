//! In-memory backend for pipeline tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use super::{BackendKind, LedgerDriver, Page, RawRecord, StorageMode, WriteRef, WriteRequest};
use crate::error::{Error, Result};
use crate::record::{CartridgeKey, Chunk, RecordKind};

pub(crate) const WRITER: &str = "writer-1";

#[derive(Default)]
struct State {
    /// Oldest first, per owner.
    records: HashMap<String, Vec<RawRecord>>,
    blobs: HashMap<String, Vec<u8>>,
    writes: Vec<(String, Option<RecordKind>, Vec<u8>)>,
    failing_chunks: HashSet<u32>,
    hanging_chunks: HashSet<u32>,
    height: u64,
}

pub(crate) struct MemoryDriver {
    state: Mutex<State>,
    mode: StorageMode,
    locked: AtomicBool,
    page_fetches: AtomicUsize,
}

impl MemoryDriver {
    pub(crate) fn new() -> Self {
        Self::with_mode(StorageMode::Chunked)
    }

    pub(crate) fn with_mode(mode: StorageMode) -> Self {
        Self {
            state: Mutex::new(State::default()),
            mode,
            locked: AtomicBool::new(false),
            page_fetches: AtomicUsize::new(0),
        }
    }

    /// Append a record from `owner_field` to `address`, bypassing writer checks.
    pub(crate) fn push(&self, address: &str, owner_field: Option<&str>, payload: &[u8]) -> String {
        self.push_with_ref(address, owner_field, payload, None)
    }

    pub(crate) fn push_with_ref(
        &self,
        address: &str,
        owner_field: Option<&str>,
        payload: &[u8],
        content_ref: Option<&str>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.height += 1;
        let id = format!("tx-{}", state.height);
        let record = RawRecord {
            id: id.clone(),
            owner: owner_field.map(str::to_string),
            height: state.height,
            payload: Bytes::copy_from_slice(payload),
            content_ref: content_ref.map(str::to_string),
        };
        state
            .records
            .entry(address.to_string())
            .or_default()
            .push(record);
        id
    }

    pub(crate) fn put_blob(&self, id: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(id.to_string(), data.to_vec());
    }

    pub(crate) fn fail_chunks(&self, indices: impl IntoIterator<Item = u32>) {
        let mut state = self.state.lock().unwrap();
        state.failing_chunks = indices.into_iter().collect();
    }

    pub(crate) fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    /// Writes of these chunk indices never complete.
    pub(crate) fn hang_chunks(&self, indices: impl IntoIterator<Item = u32>) {
        let mut state = self.state.lock().unwrap();
        state.hanging_chunks = indices.into_iter().collect();
    }

    /// Kinds of every accepted write, in submission order.
    pub(crate) fn write_kinds(&self) -> Vec<Option<RecordKind>> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .map(|(_, kind, _)| *kind)
            .collect()
    }

    pub(crate) fn written_chunk_indices(&self) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter_map(|(_, _, payload)| Chunk::decode(payload))
            .map(|c| c.index)
            .collect()
    }

    pub(crate) fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerDriver for MemoryDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::TxLedger
    }

    fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    fn address_for_key(&self, key: &CartridgeKey) -> String {
        format!("mem-{}", key.to_hex())
    }

    fn writer_address(&self) -> Option<String> {
        Some(WRITER.to_string())
    }

    async fn current_height(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn fetch_page(
        &self,
        owner: &str,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let newest_first: Vec<&RawRecord> = state
            .records
            .get(owner)
            .map(|records| records.iter().rev().collect())
            .unwrap_or_default();
        let start = match cursor {
            Some(cursor) => newest_first
                .iter()
                .position(|r| r.id == cursor)
                .map(|p| p + 1)
                .unwrap_or(newest_first.len()),
            None => 0,
        };
        let records: Vec<RawRecord> = newest_first
            .into_iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect();
        let next_cursor = records.last().map(|r| r.id.clone());
        Ok(Page {
            records,
            next_cursor,
        })
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Bytes> {
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(id)
            .map(|data| Bytes::copy_from_slice(data))
            .ok_or_else(|| Error::Rejected(format!("blob {} not found", id)))
    }

    async fn store_blob(&self, data: &[u8]) -> Result<String> {
        let id = format!("blob-{}", hex::encode(&crate::record::Checksum::compute(data).as_bytes()[..8]));
        self.put_blob(&id, data);
        Ok(id)
    }

    async fn write(&self, request: WriteRequest) -> Result<WriteRef> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(Error::WriterLocked(WRITER.to_string()));
        }
        let kind = RecordKind::sniff(&request.payload);
        if let Some(chunk) = Chunk::decode(&request.payload) {
            let (failing, hanging) = {
                let state = self.state.lock().unwrap();
                (
                    state.failing_chunks.contains(&chunk.index),
                    state.hanging_chunks.contains(&chunk.index),
                )
            };
            if hanging {
                std::future::pending::<()>().await;
            }
            if failing {
                return Err(Error::Rejected(format!("chunk {} refused", chunk.index)));
            }
        }
        let id = self.push_with_ref(
            &request.address,
            Some(WRITER),
            &request.payload,
            request.content_ref.as_deref(),
        );
        self.state
            .lock()
            .unwrap()
            .writes
            .push((request.address, kind, request.payload));
        Ok(WriteRef(id))
    }
}
