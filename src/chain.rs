use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

use crate::fingerprint::sha256_hex;

/// `previous_hash` of the genesis block and the sentinel fingerprint in its
/// record.
pub const GENESIS_SENTINEL: &str = "0";
const GENESIS_OWNER: &str = "Genesis";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("ledger file {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("ledger file {} has no genesis block", .0.display())]
    MissingGenesis(PathBuf),
    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Registration payload carried by a block. Field order is the canonical
/// serialization order for hashing; do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// SHA-256 hex of the normalized image bytes ("0" for genesis).
    pub image_hash: String,
    pub owner: String,
    /// RFC 3339 registration time.
    pub timestamp: String,
    /// Artifact file name in the image store; absent on the genesis record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl Record {
    pub fn genesis() -> Self {
        Self {
            image_hash: GENESIS_SENTINEL.to_string(),
            owner: GENESIS_OWNER.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            filename: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    pub timestamp: String,
    pub data: Record,
    pub hash: String,
}

impl Block {
    /// SHA-256 over the concatenation of the header fields and the
    /// canonical JSON of the record.
    pub fn compute_hash(index: u64, previous_hash: &str, timestamp: &str, data: &Record) -> String {
        // Serializing a plain struct with string fields cannot fail.
        let canonical = serde_json::to_string(data).unwrap_or_default();
        sha256_hex(format!("{index}{previous_hash}{timestamp}{canonical}").as_bytes())
    }

    fn is_internally_consistent(&self) -> bool {
        self.hash == Self::compute_hash(self.index, &self.previous_hash, &self.timestamp, &self.data)
    }
}

/// Append-only hash-linked chain of registration blocks. Index 0 is always
/// the genesis block; existing blocks are never edited or removed.
#[derive(Debug, Clone)]
pub struct Ledger {
    blocks: Vec<Block>,
    path: PathBuf,
}

impl Ledger {
    /// Load a persisted chain. A missing file is the expected fresh-start
    /// case and yields a chain holding only the genesis block; a file that
    /// exists but does not parse is surfaced as `ChainError::Corrupt`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ChainError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                blocks: vec![Self::genesis_block()],
                path,
            });
        }
        let bytes = fs::read(&path)?;
        let blocks: Vec<Block> =
            serde_json::from_slice(&bytes).map_err(|source| ChainError::Corrupt {
                path: path.clone(),
                source,
            })?;
        if blocks.is_empty() {
            return Err(ChainError::MissingGenesis(path));
        }
        Ok(Self { blocks, path })
    }

    fn genesis_block() -> Block {
        let data = Record::genesis();
        let timestamp = Utc::now().to_rfc3339();
        let hash = Block::compute_hash(0, GENESIS_SENTINEL, &timestamp, &data);
        Block {
            index: 0,
            previous_hash: GENESIS_SENTINEL.to_string(),
            timestamp,
            data,
            hash,
        }
    }

    /// Append a new block carrying `record` and return it. No validation of
    /// the record itself happens here; gating is the caller's job.
    pub fn append(&mut self, record: Record) -> &Block {
        // Index 0 always exists.
        let last = self.blocks.last().expect("chain has a genesis block");
        let index = last.index + 1;
        let previous_hash = last.hash.clone();
        let timestamp = Utc::now().to_rfc3339();
        let hash = Block::compute_hash(index, &previous_hash, &timestamp, &record);
        self.blocks.push(Block {
            index,
            previous_hash,
            timestamp,
            data: record,
            hash,
        });
        self.blocks.last().expect("just pushed")
    }

    /// Drop the most recently appended block. Only for unwinding an append
    /// whose persistence failed, so the in-memory chain never runs ahead of
    /// the durable one; the genesis block is never removed.
    pub(crate) fn rollback_last(&mut self) {
        if self.blocks.len() > 1 {
            self.blocks.pop();
        }
    }

    /// Persist the full chain, overwriting the previous file. Writes to a
    /// temp file first and renames into place so a crash mid-save leaves
    /// the old chain intact.
    pub fn save(&self) -> Result<(), ChainError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&self.blocks).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            let _ = f.sync_all(); // best-effort
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Recompute every block hash and check each link to its predecessor.
    /// Genesis has no predecessor check but its own hash is verified.
    pub fn validate(&self) -> bool {
        for (i, block) in self.blocks.iter().enumerate() {
            if !block.is_internally_consistent() {
                return false;
            }
            if i > 0 && block.previous_hash != self.blocks[i - 1].hash {
                return false;
            }
        }
        true
    }

    /// First block whose record carries `fp`. The genesis sentinel never
    /// matches a real fingerprint.
    pub fn find_by_fingerprint(&self, fp: &str) -> Option<&Block> {
        self.records().find(|b| b.data.image_hash == fp)
    }

    /// All non-genesis blocks in chain order; a fresh scan each call.
    pub fn records(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().skip(1)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
