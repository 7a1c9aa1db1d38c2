//! On-disk cache of verified cartridge files.
//!
//! Entries are keyed by `(cartridge_id, checksum)` and stored as
//! `{cartridge_id:08x}-{checksum}.bin` next to an `index.json` that tracks
//! sizes and last access. The cache is an explicit value: the caller opens it
//! once, hands it to the download pipeline and closes it on shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::record::Checksum;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    cartridge_id: u32,
    checksum: Checksum,
    size: u64,
    last_access: DateTime<Utc>,
    /// Tie breaker for entries touched within the same clock tick.
    seq: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    next_seq: u64,
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheIndex {
    fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    fn touch(&mut self, key: &str) {
        let seq = self.next_seq;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_access = Utc::now();
            entry.seq = seq;
            self.next_seq += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub budget: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct State {
    index: CacheIndex,
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
}

pub struct CartridgeCache {
    dir: PathBuf,
    budget: u64,
    state: Mutex<State>,
    closed: AtomicBool,
}

fn file_name(cartridge_id: u32, checksum: &Checksum) -> String {
    format!("{:08x}-{}.bin", cartridge_id, checksum.to_hex())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl CartridgeCache {
    /// Open (or create) the cache in `dir`, limited to `budget` bytes of file data.
    pub async fn open(dir: impl Into<PathBuf>, budget: u64) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = match tokio::fs::read(dir.join(INDEX_FILE)).await {
            Ok(bytes) => match serde_json::from_slice::<CacheIndex>(&bytes) {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!("cache index in {} is unreadable, starting empty: {}", dir.display(), e);
                    CacheIndex::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheIndex::default(),
            Err(e) => return Err(e.into()),
        };

        let mut missing = Vec::new();
        for key in index.entries.keys() {
            if tokio::fs::metadata(dir.join(key)).await.is_err() {
                missing.push(key.clone());
            }
        }
        for key in missing {
            index.entries.remove(&key);
        }

        tracing::debug!(
            "opened cartridge cache at {} ({} entries, {} bytes)",
            dir.display(),
            index.entries.len(),
            index.total_size()
        );

        Ok(Self {
            dir,
            budget,
            state: Mutex::new(State {
                index,
                ..State::default()
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("cartridge cache is closed".to_string()));
        }
        Ok(())
    }

    /// Cached bytes for the cartridge, re-verified against `checksum`.
    ///
    /// A file whose contents no longer hash to `checksum` is removed and
    /// reported as a miss.
    pub async fn get(&self, cartridge_id: u32, checksum: &Checksum) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let key = file_name(cartridge_id, checksum);
        let mut state = self.state.lock().await;

        if !state.index.entries.contains_key(&key) {
            state.misses += 1;
            return Ok(None);
        }

        let path = self.dir.join(&key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                state.index.entries.remove(&key);
                state.misses += 1;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let actual = Checksum::compute(&bytes);
        if actual != *checksum {
            tracing::warn!(
                "cached cartridge {} failed verification (expected {}, got {}), discarding",
                cartridge_id,
                checksum,
                actual
            );
            state.index.entries.remove(&key);
            state.invalidations += 1;
            state.misses += 1;
            remove_if_exists(&path).await?;
            self.write_index(&state.index).await?;
            return Ok(None);
        }

        state.index.touch(&key);
        state.hits += 1;
        Ok(Some(bytes))
    }

    /// Store verified bytes, then evict oldest entries until within budget.
    pub async fn put(&self, cartridge_id: u32, checksum: &Checksum, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let size = data.len() as u64;
        if size > self.budget {
            tracing::debug!(
                "cartridge {} ({} bytes) exceeds cache budget of {} bytes, not caching",
                cartridge_id,
                size,
                self.budget
            );
            return Ok(());
        }

        let key = file_name(cartridge_id, checksum);
        let path = self.dir.join(&key);
        let mut state = self.state.lock().await;

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, data).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        let seq = state.index.next_seq;
        state.index.next_seq += 1;
        state.index.entries.insert(
            key,
            CacheEntry {
                cartridge_id,
                checksum: *checksum,
                size,
                last_access: Utc::now(),
                seq,
            },
        );

        self.evict(&mut state).await?;
        self.write_index(&state.index).await
    }

    /// Drop one entry. Returns whether it was present.
    pub async fn invalidate(&self, cartridge_id: u32, checksum: &Checksum) -> Result<bool> {
        self.ensure_open()?;
        let key = file_name(cartridge_id, checksum);
        let mut state = self.state.lock().await;
        let removed = state.index.entries.remove(&key).is_some();
        remove_if_exists(&self.dir.join(&key)).await?;
        if removed {
            state.invalidations += 1;
            self.write_index(&state.index).await?;
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.index.entries.len(),
            bytes: state.index.total_size(),
            budget: self.budget,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            invalidations: state.invalidations,
        }
    }

    /// Persist the index. Later calls on this cache fail with `Unavailable`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.state.lock().await;
        self.write_index(&state.index).await
    }

    async fn evict(&self, state: &mut State) -> Result<()> {
        let mut total = state.index.total_size();
        if total <= self.budget {
            return Ok(());
        }

        let mut ranked: Vec<(String, DateTime<Utc>, u64, u64)> = state
            .index
            .entries
            .iter()
            .map(|(key, e)| (key.clone(), e.last_access, e.seq, e.size))
            .collect();
        ranked.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

        for (key, _, _, size) in ranked {
            if total <= self.budget {
                break;
            }
            state.index.entries.remove(&key);
            remove_if_exists(&self.dir.join(&key)).await?;
            total = total.saturating_sub(size);
            state.evictions += 1;
            tracing::info!("evicted {} from cartridge cache", key);
        }
        Ok(())
    }

    async fn write_index(&self, index: &CacheIndex) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, serde_json::to_vec_pretty(index)?).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}
