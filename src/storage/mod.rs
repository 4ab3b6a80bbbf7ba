//! # Storage Module - De-duplication and Identity Persistence
//!
//! Sled-backed state that survives restarts:
//!
//! - **Processed messages**: one record per `(message key, source)` pair, written
//!   at most once. Writes are a transactional insert-if-absent together with
//!   the time-index entry, so two transports racing on the same packet cannot
//!   both win.
//! - **Time index**: `recorded_at ++ primary key`, so the retention sweep is a
//!   range scan instead of a full table walk.
//! - **Node identities**: last-write-wins labels per node number.
//! - **Radio identities**: last-write-wins node number and label per source.
//!
//! ```text
//! data/message_tracking/
//! ├── processed_messages   ← key "{node:08x}_{seq}\0{source}"
//! ├── processed_by_time    ← key be(recorded_at ms) ++ primary key
//! ├── node_identities      ← key be(node id)
//! └── radio_identities     ← key source name
//! ```
//!
//! Values are bincode-encoded serde structs.

use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{IVec, Transactional};
use thiserror::Error;

use crate::meshtastic::MessageKey;

const TREE_PROCESSED: &str = "processed_messages";
const TREE_BY_TIME: &str = "processed_by_time";
const TREE_NODES: &str = "node_identities";
const TREE_RADIOS: &str = "radio_identities";

/// Errors raised by the de-duplication store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("retention window out of range")]
    Retention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_key: String,
    pub source_name: String,
    pub first_seen: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: u32,
    pub short_label: String,
    pub long_label: String,
    pub last_seen: DateTime<Utc>,
}

impl NodeIdentity {
    pub fn label(&self) -> Option<&str> {
        [&self.short_label, &self.long_label]
            .into_iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioIdentity {
    pub source_name: String,
    pub node_id: u32,
    pub display_label: String,
    pub last_updated: DateTime<Utc>,
}

/// Table sizes, as printed by `meshcord status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub processed_messages: usize,
    pub node_identities: usize,
    pub radio_identities: usize,
    pub oldest_record: Option<DateTime<Utc>>,
}

pub struct DedupStore {
    db: sled::Db,
    processed: sled::Tree,
    by_time: sled::Tree,
    nodes: sled::Tree,
    radios: sled::Tree,
}

impl DedupStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let processed = db.open_tree(TREE_PROCESSED)?;
        let by_time = db.open_tree(TREE_BY_TIME)?;
        let nodes = db.open_tree(TREE_NODES)?;
        let radios = db.open_tree(TREE_RADIOS)?;
        debug!("dedup store opened at {}", path_ref.display());
        Ok(Self {
            db,
            processed,
            by_time,
            nodes,
            radios,
        })
    }

    /// Flush pending writes to disk.
    pub fn close(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn primary_key(key: &MessageKey, source: &str) -> Vec<u8> {
        let mut out = key.to_string().into_bytes();
        out.push(0);
        out.extend_from_slice(source.as_bytes());
        out
    }

    fn time_key(at: DateTime<Utc>, primary: &[u8]) -> Vec<u8> {
        let millis = at.timestamp_millis().max(0) as u64;
        let mut out = millis.to_be_bytes().to_vec();
        out.extend_from_slice(primary);
        out
    }

    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: IVec) -> Result<T, StoreError> {
        Ok(bincode::deserialize::<T>(&bytes)?)
    }

    pub fn was_seen(&self, key: &MessageKey, source: &str) -> Result<bool, StoreError> {
        Ok(self.processed.contains_key(Self::primary_key(key, source))?)
    }

    /// Insert the record unless one already exists. Returns whether this call wrote it.
    ///
    /// The record and its time-index entry are written in one transaction, so
    /// a committed record is always reachable by the retention sweep.
    pub fn record(
        &self,
        key: &MessageKey,
        source: &str,
        first_seen: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let primary = Self::primary_key(key, source);
        let rec = MessageRecord {
            message_key: key.to_string(),
            source_name: source.to_string(),
            first_seen,
            recorded_at: Utc::now(),
        };
        let value = Self::serialize(&rec)?;
        let time_key = Self::time_key(rec.recorded_at, &primary);
        (&self.processed, &self.by_time)
            .transaction(
                |(processed, by_time)| -> ConflictableTransactionResult<bool, Infallible> {
                    if processed.get(primary.as_slice())?.is_some() {
                        return Ok(false);
                    }
                    processed.insert(primary.as_slice(), value.as_slice())?;
                    by_time.insert(time_key.as_slice(), &[] as &[u8])?;
                    Ok(true)
                },
            )
            .map_err(|e| match e {
                TransactionError::Storage(e) => StoreError::Sled(e),
                TransactionError::Abort(never) => match never {},
            })
    }

    pub fn message_record(
        &self,
        key: &MessageKey,
        source: &str,
    ) -> Result<Option<MessageRecord>, StoreError> {
        match self.processed.get(Self::primary_key(key, source))? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove records whose `recorded_at` is older than `retention`.
    pub fn purge_older_than(&self, retention: Duration) -> Result<usize, StoreError> {
        let window = chrono::Duration::from_std(retention).map_err(|_| StoreError::Retention)?;
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .ok_or(StoreError::Retention)?;
        let removed = self.purge_before(cutoff)?;
        if removed > 0 {
            info!("purged {} processed-message records older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    /// Remove records recorded strictly before `cutoff`.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let upper = (cutoff.timestamp_millis().max(0) as u64).to_be_bytes();
        let mut removed = 0usize;
        for entry in self.by_time.range(..upper.to_vec()) {
            let (time_key, _) = entry?;
            let primary = &time_key[8..];
            if self.processed.remove(primary)?.is_some() {
                removed += 1;
            }
            self.by_time.remove(&time_key)?;
        }
        Ok(removed)
    }

    pub fn upsert_node_identity(
        &self,
        node_id: u32,
        short_label: &str,
        long_label: &str,
    ) -> Result<(), StoreError> {
        let rec = NodeIdentity {
            node_id,
            short_label: short_label.trim().to_string(),
            long_label: long_label.trim().to_string(),
            last_seen: Utc::now(),
        };
        self.nodes.insert(node_id.to_be_bytes(), Self::serialize(&rec)?)?;
        Ok(())
    }

    pub fn node_identity(&self, node_id: u32) -> Result<Option<NodeIdentity>, StoreError> {
        match self.nodes.get(node_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn upsert_radio_identity(
        &self,
        source: &str,
        node_id: u32,
        display_label: &str,
    ) -> Result<(), StoreError> {
        let rec = RadioIdentity {
            source_name: source.to_string(),
            node_id,
            display_label: display_label.to_string(),
            last_updated: Utc::now(),
        };
        self.radios.insert(source.as_bytes(), Self::serialize(&rec)?)?;
        Ok(())
    }

    pub fn radio_identity(&self, source: &str) -> Result<Option<RadioIdentity>, StoreError> {
        match self.radios.get(source.as_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// `"{label} ({id:08x})"` preferring the short label, else `"{id:08x}"`.
    pub fn lookup_node_label(&self, node_id: u32) -> Result<String, StoreError> {
        let label = self
            .node_identity(node_id)?
            .and_then(|n| n.label().map(str::to_string));
        Ok(match label {
            Some(l) => format!("{} ({:08x})", l, node_id),
            None => format!("{:08x}", node_id),
        })
    }

    /// `"{label} ({node:08x})"` for a radio that reported itself, else `None`.
    pub fn lookup_radio_label(&self, source: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .radio_identity(source)?
            .map(|r| format!("{} ({:08x})", r.display_label, r.node_id)))
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let oldest_record = match self.by_time.first()? {
            Some((k, _)) if k.len() >= 8 => {
                let mut ms = [0u8; 8];
                ms.copy_from_slice(&k[..8]);
                Utc.timestamp_millis_opt(u64::from_be_bytes(ms) as i64).single()
            }
            _ => None,
        };
        Ok(StoreStats {
            processed_messages: self.processed.len(),
            node_identities: self.nodes.len(),
            radio_identities: self.radios.len(),
            oldest_record,
        })
    }
}
