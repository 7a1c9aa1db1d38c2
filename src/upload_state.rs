//! Resumable upload progress.
//!
//! Every upload keeps a JSON document at `upload-{app_id}-{cartridge_id}.json`
//! recording which chunks reached the ledger and with which write reference.
//! Re-running an upload with the same identity skips those chunks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::Checksum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    InProgress,
    Completed,
}

/// A chunk that reached the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub index: u32,
    pub payload_hex: String,
    pub write_reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub app_id: u32,
    pub cartridge_id: u32,
    pub platform: u8,
    /// Cartridge address the chunks and header are written to.
    pub address: String,
    pub checksum: Checksum,
    /// Bytes per chunk the file was split with. Absent in files written
    /// before it was recorded.
    #[serde(default)]
    pub chunk_size: Option<u8>,
    pub total_chunks: u64,
    pub sent_chunks: u64,
    #[serde(default)]
    pub failed_chunks: Vec<u32>,
    #[serde(default, with = "receipts")]
    pub chunks: BTreeMap<u32, ChunkReceipt>,
    #[serde(default)]
    pub header_ref: Option<String>,
    #[serde(default)]
    pub catalog_ref: Option<String>,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadProgress {
    pub fn new(
        app_id: u32,
        cartridge_id: u32,
        platform: u8,
        address: impl Into<String>,
        checksum: Checksum,
        chunk_size: u8,
        total_chunks: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            app_id,
            cartridge_id,
            platform,
            address: address.into(),
            checksum,
            chunk_size: Some(chunk_size),
            total_chunks,
            sent_chunks: 0,
            failed_chunks: Vec::new(),
            chunks: BTreeMap::new(),
            header_ref: None,
            catalog_ref: None,
            status: UploadStatus::InProgress,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether chunks already sent were cut with `chunk_size`. A record
    /// without a stored size only matches while nothing has been sent.
    pub fn matches_chunk_size(&self, chunk_size: u8) -> bool {
        match self.chunk_size {
            Some(stored) => stored == chunk_size,
            None => self.chunks.is_empty(),
        }
    }

    pub fn is_chunk_sent(&self, index: u32) -> bool {
        self.chunks.contains_key(&index)
    }

    pub fn mark_sent(&mut self, index: u32, payload_hex: String, write_reference: String) {
        self.chunks.insert(
            index,
            ChunkReceipt {
                index,
                payload_hex,
                write_reference,
            },
        );
        self.failed_chunks.retain(|i| *i != index);
        self.sent_chunks = self.chunks.len() as u64;
        self.touch();
    }

    pub fn mark_failed(&mut self, index: u32) {
        if !self.failed_chunks.contains(&index) {
            self.failed_chunks.push(index);
            self.failed_chunks.sort_unstable();
        }
        self.touch();
    }

    pub fn pending_indices(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter_map(|i| u32::try_from(i).ok())
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    pub fn all_chunks_sent(&self) -> bool {
        self.sent_chunks >= self.total_chunks
    }

    pub fn is_completed(&self) -> bool {
        self.status == UploadStatus::Completed
    }

    pub fn complete(&mut self) {
        self.status = UploadStatus::Completed;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Receipts are stored as a list but indexed by chunk in memory.
mod receipts {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::ChunkReceipt;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<u32, ChunkReceipt>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&ChunkReceipt> = map.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u32, ChunkReceipt>, D::Error> {
        let list = Vec::<ChunkReceipt>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|r| (r.index, r)).collect())
    }
}

/// Directory of upload progress files.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, app_id: u32, cartridge_id: u32) -> PathBuf {
        self.dir
            .join(format!("upload-{}-{}.json", app_id, cartridge_id))
    }

    pub async fn load(&self, app_id: u32, cartridge_id: u32) -> Result<Option<UploadProgress>> {
        let path = self.path_for(app_id, cartridge_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, progress: &UploadProgress) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(progress.app_id, progress.cartridge_id);
        let json = serde_json::to_vec_pretty(progress)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    pub async fn remove(&self, app_id: u32, cartridge_id: u32) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(app_id, cartridge_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable progress file, oldest first.
    pub async fn list(&self) -> Result<Vec<UploadProgress>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut uploads = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("upload-") || !name.ends_with(".json") {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            match serde_json::from_slice::<UploadProgress>(&bytes) {
                Ok(progress) => uploads.push(progress),
                Err(e) => tracing::warn!("ignoring unreadable progress file {}: {}", name, e),
            }
        }
        uploads.sort_by_key(|p| p.created_at);
        Ok(uploads)
    }

    /// Most recent unfinished upload of `app_id` for the same file contents
    /// split with the same chunk size.
    pub async fn find_resumable(
        &self,
        app_id: u32,
        checksum: &Checksum,
        chunk_size: u8,
    ) -> Result<Option<UploadProgress>> {
        Ok(self.list().await?.into_iter().rev().find(|p| {
            p.app_id == app_id
                && !p.is_completed()
                && p.checksum == *checksum
                && p.matches_chunk_size(chunk_size)
        }))
    }
}
