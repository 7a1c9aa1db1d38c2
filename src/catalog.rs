//! Catalog discovery.
//!
//! The catalog is every `CENT` record written to one well-known address.
//! Listing scans that address, keeps only catalog entries (optionally from a
//! single publisher), and groups them into games with versions ordered
//! newest first. Any retired entry retires the whole application.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;

use crate::drivers::{LedgerDriver, RawRecord, WriteRef, WriteRequest};
use crate::error::{Error, Result};
use crate::pagination::{scan_by_owner, ScanOptions};
use crate::retry::cancellable;
use crate::record::{CartridgeKey, CatalogEntry, RecordKind, Semver, FLAG_RETIRED, SCHEMA_VERSION};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub include_retired: bool,
    /// Only accept entries written by this address.
    pub publisher: Option<String>,
}

/// One published version of an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameVersion {
    pub version: Semver,
    pub cartridge_ref: CartridgeKey,
    pub platform: u8,
    pub title: String,
    pub flags: u8,
    pub height: u64,
    pub record_id: String,
    pub owner: Option<String>,
}

impl GameVersion {
    pub fn is_retired(&self) -> bool {
        self.flags & FLAG_RETIRED != 0
    }
}

/// An application with every version seen in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Game {
    pub app_id: u32,
    /// Title and platform of the newest version.
    pub title: String,
    pub platform: u8,
    pub retired: bool,
    /// Newest first by (version, height).
    pub versions: Vec<GameVersion>,
}

impl Game {
    pub fn latest(&self) -> Option<&GameVersion> {
        self.versions.first()
    }

    pub fn version(&self, version: Semver) -> Option<&GameVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// Counters describing one catalog scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub records_seen: u64,
    /// Payloads rejected by the magic check without a full decode.
    pub magic_rejected: u64,
    pub decoded: u64,
    pub malformed: u64,
    pub publisher_filtered: u64,
}

/// A decoded catalog entry with its ledger position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEntry {
    pub entry: CatalogEntry,
    pub record_id: String,
    pub owner: Option<String>,
    pub height: u64,
}

/// Decode the catalog entries among `records`, skipping everything else.
pub fn decode_entries(
    records: impl IntoIterator<Item = RawRecord>,
    publisher: Option<&str>,
    stats: &mut ScanStats,
) -> Vec<IndexedEntry> {
    let mut entries = Vec::new();
    for record in records {
        stats.records_seen += 1;
        if RecordKind::sniff(&record.payload) != Some(RecordKind::CatalogEntry) {
            stats.magic_rejected += 1;
            continue;
        }
        stats.decoded += 1;
        let Some(entry) = CatalogEntry::decode(&record.payload) else {
            tracing::debug!("malformed catalog entry in {}", record.id);
            stats.malformed += 1;
            continue;
        };
        if let Some(publisher) = publisher {
            if !record.is_from(publisher) {
                stats.publisher_filtered += 1;
                continue;
            }
        }
        entries.push(IndexedEntry {
            entry,
            record_id: record.id,
            owner: record.owner,
            height: record.height,
        });
    }
    entries
}

/// Group entries by application. Games come back newest app id first.
pub fn build_games(entries: Vec<IndexedEntry>, include_retired: bool) -> Vec<Game> {
    let retired: HashSet<u32> = entries
        .iter()
        .filter(|e| e.entry.is_retired())
        .map(|e| e.entry.app_id)
        .collect();

    let mut by_app: BTreeMap<u32, Vec<GameVersion>> = BTreeMap::new();
    for indexed in entries {
        let entry = indexed.entry;
        by_app.entry(entry.app_id).or_default().push(GameVersion {
            version: entry.version,
            cartridge_ref: entry.cartridge_ref,
            platform: entry.platform,
            title: entry.title,
            flags: entry.flags,
            height: indexed.height,
            record_id: indexed.record_id,
            owner: indexed.owner,
        });
    }

    by_app
        .into_iter()
        .rev()
        .filter(|(app_id, _)| include_retired || !retired.contains(app_id))
        .filter_map(|(app_id, mut versions)| {
            versions.sort_by(|a, b| (b.version, b.height).cmp(&(a.version, a.height)));
            let newest = versions.first()?;
            Some(Game {
                app_id,
                title: newest.title.clone(),
                platform: newest.platform,
                retired: retired.contains(&app_id),
                versions,
            })
        })
        .collect()
}

/// Reads and writes the catalog at one address.
pub struct CatalogIndexer {
    driver: Arc<dyn LedgerDriver>,
    catalog_address: String,
    scan: ScanOptions,
    cancel: CancellationToken,
}

impl CatalogIndexer {
    pub fn new(driver: Arc<dyn LedgerDriver>, catalog_address: impl Into<String>) -> Self {
        Self {
            driver,
            catalog_address: catalog_address.into(),
            scan: ScanOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_scan_options(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    /// Stop scans and writes once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn catalog_address(&self) -> &str {
        &self.catalog_address
    }

    pub async fn list(&self, options: &ListOptions) -> Result<Vec<Game>> {
        self.list_with_stats(options).await.map(|(games, _)| games)
    }

    pub async fn list_with_stats(&self, options: &ListOptions) -> Result<(Vec<Game>, ScanStats)> {
        let records: Vec<RawRecord> = scan_by_owner(
            self.driver.as_ref(),
            &self.catalog_address,
            self.scan,
            self.cancel.child_token(),
        )
        .try_collect()
        .await?;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut stats = ScanStats::default();
        let entries = decode_entries(records, options.publisher.as_deref(), &mut stats);
        let games = build_games(entries, options.include_retired);

        tracing::info!(
            "catalog {}: {} games from {} records ({} entries, {} malformed, {} filtered)",
            self.catalog_address,
            games.len(),
            stats.records_seen,
            stats.decoded,
            stats.malformed,
            stats.publisher_filtered
        );
        Ok((games, stats))
    }

    pub async fn find(&self, app_id: u32, options: &ListOptions) -> Result<Option<Game>> {
        Ok(self
            .list(options)
            .await?
            .into_iter()
            .find(|g| g.app_id == app_id))
    }

    pub async fn publish_entry(&self, entry: &CatalogEntry) -> Result<WriteRef> {
        let payload = entry.encode()?;
        let write = self
            .driver
            .write(WriteRequest::record(&self.catalog_address, payload));
        cancellable(&self.cancel, write).await
    }

    /// Publish a retired entry for `app_id`, hiding it from default listings.
    pub async fn retire_app(&self, app_id: u32) -> Result<WriteRef> {
        let options = ListOptions {
            include_retired: true,
            publisher: None,
        };
        let game = self
            .find(app_id, &options)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("app {} is not in the catalog", app_id)))?;
        let newest = game
            .latest()
            .ok_or_else(|| Error::InvalidInput(format!("app {} has no versions", app_id)))?;
        self.retire_version(app_id, newest).await
    }

    pub async fn retire_version(&self, app_id: u32, version: &GameVersion) -> Result<WriteRef> {
        let entry = CatalogEntry {
            schema: SCHEMA_VERSION,
            platform: version.platform,
            flags: version.flags | FLAG_RETIRED,
            app_id,
            version: version.version,
            cartridge_ref: version.cartridge_ref,
            title: version.title.clone(),
        };
        tracing::info!("retiring app {} at version {}", app_id, version.version);
        self.publish_entry(&entry).await
    }
}
