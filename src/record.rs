// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Decoded CDC records and batches.
//!
//! A [`ChangeBatch`] is what one "get changes" call against a producer tablet
//! returns: an ordered list of [`ChangeRecord`]s plus the checkpoint the
//! batch ends at. Order within a batch is significant and is preserved all
//! the way to the consumer tablets.
//!
//! # Record Kinds
//!
//! | Operation | Routed by | Notes |
//! |-----------|-----------|-------|
//! | `Write` / `Delete` | partition key point lookup | first key of the record |
//! | `Apply` | key range against the cached tablet list | may fan out to several tablets |
//! | `SplitOp` | n/a (meta op) | control plane is told about the children |
//! | `ChangeMetadata` | n/a (meta op) | may gate polling on a schema version |
//! | `TransactionCreated` / `TransactionCommitted` | status tablet | transaction status table only |
//!
//! Decoding the wire format is not this crate's job; the transport hands
//! over already-decoded records.

use crate::error::{Result, XClusterError};
use crate::types::{HybridTime, OpId, SchemaVersion, TableId, TabletId, TransactionId};
use serde::{Deserialize, Serialize};

/// One key/value mutation inside a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Half-open partition key range `[start, end)`.
///
/// An empty `end` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && (self.end.is_empty() || key < self.end.as_slice())
    }

    /// Whether the two ranges share at least one key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        let starts_before_other_ends = other.end.is_empty() || self.start < other.end;
        let other_starts_before_end = self.end.is_empty() || other.start < self.end;
        starts_before_other_ends && other_starts_before_end
    }
}

/// Producer-side tablet split: the parent tablet and its two children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitTabletInfo {
    pub tablet_id: TabletId,
    pub new_tablet1_id: TabletId,
    pub new_tablet2_id: TabletId,
    pub split_encoded_key: Vec<u8>,
    pub split_partition_key: Vec<u8>,
}

/// Producer-side schema change pushed to the local control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadataRequest {
    pub table_id: TableId,
    pub schema_version: SchemaVersion,
    /// Encoded schema, opaque to the consumer.
    pub schema: Vec<u8>,
}

/// Transaction metadata attached to transactional records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionState {
    /// Raw transaction id bytes, decoded with [`TransactionId::from_bytes`].
    pub transaction_id: Vec<u8>,
    /// Producer tablets involved in the transaction (set on commit records).
    pub tablets: Vec<TabletId>,
}

/// Operation kind of a record, with its operation-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Write,
    Delete,
    /// Apply of transaction intents over a key range.
    Apply { partition: KeyRange },
    SplitOp(SplitTabletInfo),
    ChangeMetadata(ChangeMetadataRequest),
    TransactionCreated,
    TransactionCommitted,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Write => "WRITE",
            Operation::Delete => "DELETE",
            Operation::Apply { .. } => "APPLY",
            Operation::SplitOp(_) => "SPLIT_OP",
            Operation::ChangeMetadata(_) => "CHANGE_METADATA",
            Operation::TransactionCreated => "TRANSACTION_CREATED",
            Operation::TransactionCommitted => "TRANSACTION_COMMITTED",
        }
    }
}

/// One CDC entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub operation: Operation,
    /// Producer commit time of the record.
    pub time: HybridTime,
    /// Mutations; all pairs belong to the same row, so `changes[0].key`
    /// carries the row's partition key.
    pub changes: Vec<KvPair>,
    pub transaction_state: Option<TransactionState>,
}

impl ChangeRecord {
    pub fn new(operation: Operation, time: HybridTime, changes: Vec<KvPair>) -> Self {
        Self {
            operation,
            time,
            changes,
            transaction_state: None,
        }
    }

    pub fn with_transaction(mut self, state: TransactionState) -> Self {
        self.transaction_state = Some(state);
        self
    }

    /// SPLIT_OP and CHANGE_METADATA are processed synchronously and never
    /// produce buffered writes.
    pub fn is_meta_op(&self) -> bool {
        matches!(
            self.operation,
            Operation::SplitOp(_) | Operation::ChangeMetadata(_)
        )
    }

    /// Partition key used for point lookups.
    pub fn partition_key(&self) -> Result<&[u8]> {
        self.changes
            .first()
            .map(|pair| pair.key.as_slice())
            .ok_or_else(|| {
                XClusterError::InvalidArgument(format!(
                    "{} record carries no key to route by",
                    self.operation.name()
                ))
            })
    }

    /// Decode the transaction id of a transactional record.
    pub fn transaction_id(&self) -> Result<TransactionId> {
        let state = self.transaction_state.as_ref().ok_or_else(|| {
            XClusterError::InvalidArgument(format!(
                "{} record has no transaction state",
                self.operation.name()
            ))
        })?;
        TransactionId::from_bytes(&state.transaction_id)
    }
}

/// Response of one "get changes" call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
    /// Position the batch ends at. Always present on a valid response.
    pub checkpoint: Option<OpId>,
    /// Producer safe time as of this batch, if the producer reported one.
    pub safe_hybrid_time: Option<HybridTime>,
}

impl ChangeBatch {
    pub fn new(records: Vec<ChangeRecord>, checkpoint: OpId) -> Self {
        Self {
            records,
            checkpoint: Some(checkpoint),
            safe_hybrid_time: None,
        }
    }

    pub fn with_safe_time(mut self, safe_time: HybridTime) -> Self {
        self.safe_hybrid_time = Some(safe_time);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// "Get changes" request sent to the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChangesRequest {
    pub stream_id: String,
    pub tablet_id: TabletId,
    pub from_checkpoint: OpId,
}

/// A consumer tablet as seen by the tablet locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTablet {
    pub tablet_id: TabletId,
    pub partition: KeyRange,
}

impl RemoteTablet {
    pub fn new(tablet_id: impl Into<TabletId>, partition: KeyRange) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            partition,
        }
    }
}

/// Tablets whose partition overlaps `range`, in list order.
pub fn filter_tablets_by_key_range<'a>(
    tablets: &'a [RemoteTablet],
    range: &KeyRange,
) -> Vec<&'a RemoteTablet> {
    tablets
        .iter()
        .filter(|tablet| tablet.partition.overlaps(range))
        .collect()
}
