//! Identifier and position types shared by the poller and output client.

use crate::error::{Result, XClusterError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Tablet identifier.
pub type TabletId = String;

/// Table identifier.
pub type TableId = String;

/// Schema version of a table. `0` is the invalid sentinel.
pub type SchemaVersion = u32;

/// Sentinel for "no schema version known".
pub const INVALID_SCHEMA_VERSION: SchemaVersion = 0;

/// Names the replication source: one tablet of a producer universe's stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerTabletInfo {
    pub universe_uuid: String,
    pub stream_id: String,
    pub tablet_id: TabletId,
}

/// Names the replication destination: one tablet of a local table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerTabletInfo {
    pub table_id: TableId,
    pub tablet_id: TabletId,
}

/// Replication log position (term, index).
///
/// Ordered by term, then index. [`OpId::MIN`] is the sentinel used while
/// no batch is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub term: i64,
    pub index: i64,
}

impl OpId {
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    pub fn new(term: i64, index: i64) -> Self {
        Self { term, index }
    }

    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Hybrid logical timestamp. Only ordering matters to the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTime(pub u64);

impl HybridTime {
    pub const MIN: HybridTime = HybridTime(0);

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 16-byte distributed transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId([u8; 16]);

impl TransactionId {
    pub const LEN: usize = 16;

    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Decode a transaction id from its wire bytes.
    ///
    /// Fails unless exactly [`TransactionId::LEN`] bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 16] = bytes.try_into().map_err(|_| {
            XClusterError::InvalidArgument(format!(
                "Invalid transaction id length: expected {}, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Stable 64-bit hash of the id.
    ///
    /// Must be identical across processes and releases: every consumer that
    /// sees the same status tablet set has to pick the same status tablet.
    pub fn stable_hash(&self) -> u64 {
        let digest = Sha256::digest(self.0);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
