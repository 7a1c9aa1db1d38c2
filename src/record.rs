//! Fixed-layout binary records stored in ledger payloads.
//!
//! Every record is exactly [`RECORD_SIZE`] bytes and starts with a 4-byte
//! magic that identifies its kind. All multi-byte integers are little-endian.
//!
//! ```text
//! Header        CART | schema | platform | chunk size | flags | cartridge id (u32)
//!                    | total size (u64) | checksum (32) | reserved (12)
//! Chunk         DATA | cartridge id (u32) | chunk index (u32) | length (1) | data (51)
//! CatalogEntry  CENT | schema | platform | flags | app id (u32) | semver (3)
//!                    | cartridge ref (20) | title (16) | reserved (14)
//! ```
//!
//! Decoding never fails loudly: a payload that is not the requested kind, or
//! whose fields are out of range, decodes to `None` so scanners can probe a
//! payload against every kind cheaply.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Size of every encoded record.
pub const RECORD_SIZE: usize = 64;

/// Maximum number of file bytes carried by one chunk record.
pub const MAX_CHUNK_DATA: usize = 51;

/// Most chunks a single cartridge may span. Headers declaring more are
/// treated as malformed.
pub const MAX_CARTRIDGE_CHUNKS: u64 = 1 << 20;

/// Width of the zero-padded title field.
pub const TITLE_FIELD_LEN: usize = 16;

/// Longest title that still leaves a terminating zero byte.
pub const MAX_TITLE_BYTES: usize = TITLE_FIELD_LEN - 1;

/// Current schema version written by this crate.
pub const SCHEMA_VERSION: u8 = 1;

/// Catalog entry flag bit marking the application as retired.
pub const FLAG_RETIRED: u8 = 0x01;

/// Record discriminator carried in the first four payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Header,
    Chunk,
    CatalogEntry,
}

impl RecordKind {
    pub const fn magic(self) -> &'static [u8; 4] {
        match self {
            RecordKind::Header => b"CART",
            RecordKind::Chunk => b"DATA",
            RecordKind::CatalogEntry => b"CENT",
        }
    }

    /// Identify a payload by its first four bytes without decoding it.
    pub fn sniff(payload: &[u8]) -> Option<Self> {
        match payload.get(..4)? {
            b"CART" => Some(RecordKind::Header),
            b"DATA" => Some(RecordKind::Chunk),
            b"CENT" => Some(RecordKind::CatalogEntry),
            _ => None,
        }
    }

    /// Same as [`RecordKind::sniff`] for hex encoded payloads (either case).
    pub fn sniff_hex(payload_hex: &str) -> Option<Self> {
        let prefix = payload_hex.get(..8)?;
        let mut magic = [0u8; 4];
        hex::decode_to_slice(prefix, &mut magic).ok()?;
        Self::sniff(&magic)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Header => write!(f, "header"),
            RecordKind::Chunk => write!(f, "chunk"),
            RecordKind::CatalogEntry => write!(f, "catalog entry"),
        }
    }
}

/// SHA-256 digest of a whole cartridge file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::InvalidInput(format!("invalid checksum {:?}: {}", s, e)))?;
        Ok(Self(bytes))
    }

    /// Lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Case-insensitive comparison against a hex digest.
    pub fn matches_hex(&self, other: &str) -> bool {
        self.to_hex().eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for Checksum {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Checksum::from_hex(&value)
    }
}

/// 20-byte reference from a catalog entry to a cartridge location.
///
/// Derived from `(platform, cartridge_id)`; each backend driver maps it onto
/// its own address space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CartridgeKey([u8; 20]);

impl CartridgeKey {
    pub fn derive(platform: u8, cartridge_id: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"cartridge");
        hasher.update([platform]);
        hasher.update(cartridge_id.to_le_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 20];
        key.copy_from_slice(&digest[..20]);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CartridgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CartridgeKey({})", self.to_hex())
    }
}

/// Three-component application version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Semver {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Semver {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Semver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() != 3 {
            return Err(Error::InvalidInput(format!(
                "version {:?} must be major.minor.patch",
                s
            )));
        }
        let component = |part: &str| {
            part.parse::<u8>().map_err(|e| {
                Error::InvalidInput(format!("invalid version component {:?}: {}", part, e))
            })
        };
        Ok(Self {
            major: component(parts[0])?,
            minor: component(parts[1])?,
            patch: component(parts[2])?,
        })
    }
}

/// Number of chunks needed for `total_size` bytes.
pub fn chunk_count(total_size: u64, chunk_size: u8) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size as u64)
}

fn validate_chunk_size(chunk_size: u8) -> Result<()> {
    if chunk_size == 0 || chunk_size as usize > MAX_CHUNK_DATA {
        return Err(Error::InvalidInput(format!(
            "chunk size {} must be between 1 and {}",
            chunk_size, MAX_CHUNK_DATA
        )));
    }
    Ok(())
}

/// Split file bytes into ordered chunk records.
pub fn split_chunks(cartridge_id: u32, data: &[u8], chunk_size: u8) -> Result<Vec<Chunk>> {
    validate_chunk_size(chunk_size)?;
    let needed = chunk_count(data.len() as u64, chunk_size);
    if needed > MAX_CARTRIDGE_CHUNKS {
        return Err(Error::InvalidInput(format!(
            "file needs {} chunks, at most {} are allowed",
            needed, MAX_CARTRIDGE_CHUNKS
        )));
    }
    Ok(data
        .chunks(chunk_size as usize)
        .zip(0u32..)
        .map(|(slice, index)| Chunk {
            cartridge_id,
            index,
            data: slice.to_vec(),
        })
        .collect())
}

fn check_layout(payload: &[u8], kind: RecordKind) -> bool {
    payload.len() == RECORD_SIZE && RecordKind::sniff(payload) == Some(kind)
}

/// Cartridge description. Written once, after every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub schema: u8,
    pub platform: u8,
    pub chunk_size: u8,
    pub flags: u8,
    pub cartridge_id: u32,
    pub total_size: u64,
    pub checksum: Checksum,
}

impl Header {
    pub fn expected_chunks(&self) -> u64 {
        chunk_count(self.total_size, self.chunk_size)
    }

    pub fn encode(&self) -> Result<[u8; RECORD_SIZE]> {
        validate_chunk_size(self.chunk_size)?;
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(RecordKind::Header.magic());
        buf[4] = self.schema;
        buf[5] = self.platform;
        buf[6] = self.chunk_size;
        buf[7] = self.flags;
        LittleEndian::write_u32(&mut buf[8..12], self.cartridge_id);
        LittleEndian::write_u64(&mut buf[12..20], self.total_size);
        buf[20..52].copy_from_slice(self.checksum.as_bytes());
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if !check_layout(payload, RecordKind::Header) {
            return None;
        }
        let chunk_size = payload[6];
        if chunk_size == 0 || chunk_size as usize > MAX_CHUNK_DATA {
            return None;
        }
        let total_size = LittleEndian::read_u64(&payload[12..20]);
        if chunk_count(total_size, chunk_size) > MAX_CARTRIDGE_CHUNKS {
            return None;
        }
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&payload[20..52]);
        Some(Self {
            schema: payload[4],
            platform: payload[5],
            chunk_size,
            flags: payload[7],
            cartridge_id: LittleEndian::read_u32(&payload[8..12]),
            total_size,
            checksum: Checksum::from_bytes(checksum),
        })
    }
}

/// One ordered slice of a cartridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub cartridge_id: u32,
    pub index: u32,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn encode(&self) -> Result<[u8; RECORD_SIZE]> {
        if self.data.len() > MAX_CHUNK_DATA {
            return Err(Error::InvalidInput(format!(
                "chunk {} carries {} bytes (max {})",
                self.index,
                self.data.len(),
                MAX_CHUNK_DATA
            )));
        }
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(RecordKind::Chunk.magic());
        LittleEndian::write_u32(&mut buf[4..8], self.cartridge_id);
        LittleEndian::write_u32(&mut buf[8..12], self.index);
        buf[12] = self.data.len() as u8;
        buf[13..13 + self.data.len()].copy_from_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if !check_layout(payload, RecordKind::Chunk) {
            return None;
        }
        let length = payload[12] as usize;
        if length > MAX_CHUNK_DATA {
            return None;
        }
        Some(Self {
            cartridge_id: LittleEndian::read_u32(&payload[4..8]),
            index: LittleEndian::read_u32(&payload[8..12]),
            data: payload[13..13 + length].to_vec(),
        })
    }
}

/// One row of the discovery index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub schema: u8,
    pub platform: u8,
    pub flags: u8,
    pub app_id: u32,
    pub version: Semver,
    pub cartridge_ref: CartridgeKey,
    pub title: String,
}

impl CatalogEntry {
    pub fn is_retired(&self) -> bool {
        self.flags & FLAG_RETIRED != 0
    }

    pub fn encode(&self) -> Result<[u8; RECORD_SIZE]> {
        let title = self.title.as_bytes();
        if title.len() > MAX_TITLE_BYTES {
            return Err(Error::InvalidInput(format!(
                "title {:?} is {} bytes (max {})",
                self.title,
                title.len(),
                MAX_TITLE_BYTES
            )));
        }
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(RecordKind::CatalogEntry.magic());
        buf[4] = self.schema;
        buf[5] = self.platform;
        buf[6] = self.flags;
        LittleEndian::write_u32(&mut buf[7..11], self.app_id);
        buf[11] = self.version.major;
        buf[12] = self.version.minor;
        buf[13] = self.version.patch;
        buf[14..34].copy_from_slice(self.cartridge_ref.as_bytes());
        buf[34..34 + title.len()].copy_from_slice(title);
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if !check_layout(payload, RecordKind::CatalogEntry) {
            return None;
        }
        let mut cartridge_ref = [0u8; 20];
        cartridge_ref.copy_from_slice(&payload[14..34]);
        let title_field = &payload[34..34 + TITLE_FIELD_LEN];
        let title_len = title_field
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(TITLE_FIELD_LEN);
        Some(Self {
            schema: payload[4],
            platform: payload[5],
            flags: payload[6],
            app_id: LittleEndian::read_u32(&payload[7..11]),
            version: Semver::new(payload[11], payload[12], payload[13]),
            cartridge_ref: CartridgeKey::from_bytes(cartridge_ref),
            title: String::from_utf8_lossy(&title_field[..title_len]).into_owned(),
        })
    }
}

/// Any decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Header(Header),
    Chunk(Chunk),
    CatalogEntry(CatalogEntry),
}

impl Record {
    /// Sniff the magic and decode the matching kind.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        match RecordKind::sniff(payload)? {
            RecordKind::Header => Header::decode(payload).map(Record::Header),
            RecordKind::Chunk => Chunk::decode(payload).map(Record::Chunk),
            RecordKind::CatalogEntry => CatalogEntry::decode(payload).map(Record::CatalogEntry),
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Header(_) => RecordKind::Header,
            Record::Chunk(_) => RecordKind::Chunk,
            Record::CatalogEntry(_) => RecordKind::CatalogEntry,
        }
    }
}
