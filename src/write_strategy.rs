//! Write strategies: how resolved records are buffered into write requests.
//!
//! The output client resolves every record of a batch to one or more
//! consumer tablets and hands `(tablet, record)` to a [`WriteStrategy`].
//! Once the pass over the batch stops, it drains the buffered requests one
//! at a time and sends them, strictly one in flight.
//!
//! # Design
//!
//! ```text
//! ChangeRecord ──┬──▶ process_record(tablet) ─────────▶ per-tablet WriteRequest queue
//!                │                                             │
//!                │                                             ▼
//!                │                                  next_write_request() (one at a time)
//!                │
//!                └──▶ process_create_record / process_commit_record
//!                                      │
//!                                      ▼
//!                        take_transaction_metadatas() (CREATEs, then COMMITs)
//! ```
//!
//! Two implementations exist:
//!
//! - [`BatchedWriteStrategy`]: one request per target tablet, records appended
//!   in arrival order, sealed at `max_records_per_request`.
//! - [`PerRecordWriteStrategy`]: one request per (record, tablet).
//!
//! A strategy lives for exactly one batch; the output client builds a fresh
//! one at the start of every batch.

use crate::error::Result;
use crate::record::{ChangeRecord, Operation};
use crate::types::{HybridTime, SchemaVersion, TabletId, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Kind of mutation carried by a [`WritePair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Put,
    Delete,
}

/// Transaction tagging of an intent write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTransactionInfo {
    pub transaction_id: TransactionId,
    /// Status tablet coordinating the transaction on this universe. Set on
    /// every intent when transaction status replication is enabled, so a
    /// tablet receiving its first batch for the transaction can find it.
    pub status_tablet_id: Option<TabletId>,
}

/// One translated mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub op: WriteOp,
    /// Producer commit time, applied as the external hybrid time.
    pub external_hybrid_time: HybridTime,
    pub transaction: Option<WriteTransactionInfo>,
}

/// Buffered writes for one consumer tablet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub tablet_id: TabletId,
    pub pairs: Vec<WritePair>,
    /// Last consumer schema version the producer rows are compatible with.
    pub schema_version: SchemaVersion,
}

impl WriteRequest {
    fn new(tablet_id: TabletId, schema_version: SchemaVersion) -> Self {
        Self {
            tablet_id,
            pairs: Vec::new(),
            schema_version,
        }
    }
}

/// Routing decision for one record on one tablet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecordInfo {
    pub tablet_id: TabletId,
    pub enable_replicate_transaction_status_table: bool,
    pub status_tablet_id: Option<TabletId>,
    pub last_compatible_consumer_schema_version: SchemaVersion,
}

/// External transaction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOperation {
    Create,
    Commit,
}

impl std::fmt::Display for TransactionOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Commit => write!(f, "COMMIT"),
        }
    }
}

/// A pending CREATE or COMMIT for the transaction coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTransactionMetadata {
    pub transaction_id: TransactionId,
    pub status_tablet: TabletId,
    pub operation_type: TransactionOperation,
    pub hybrid_time: HybridTime,
    /// Consumer tablets holding intents (COMMIT only).
    pub involved_tablet_ids: Vec<TabletId>,
}

/// Buffers translated writes for one batch.
pub trait WriteStrategy: Send + Sync {
    /// Buffer `record` for `info.tablet_id`.
    fn process_record(&mut self, info: &ProcessRecordInfo, record: &ChangeRecord) -> Result<()>;

    /// Queue a CREATE for the record's transaction on `status_tablet`.
    fn process_create_record(&mut self, status_tablet: &str, record: &ChangeRecord) -> Result<()>;

    /// Queue a COMMIT for the record's transaction on `status_tablet`.
    fn process_commit_record(
        &mut self,
        status_tablet: &str,
        involved_target_tablet_ids: Vec<TabletId>,
        record: &ChangeRecord,
    ) -> Result<()>;

    /// Pop the next buffered request, oldest first.
    fn next_write_request(&mut self) -> Option<WriteRequest>;

    /// Drain all pending transaction metadata in arrival order.
    fn take_transaction_metadatas(&mut self) -> Vec<ExternalTransactionMetadata>;
}

/// Which [`WriteStrategy`] the output client builds per batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategyKind {
    #[default]
    Batched,
    PerRecord,
}

impl WriteStrategyKind {
    pub fn build(self, max_records_per_request: usize) -> Box<dyn WriteStrategy> {
        match self {
            WriteStrategyKind::Batched => Box::new(BatchedWriteStrategy::new(max_records_per_request)),
            WriteStrategyKind::PerRecord => Box::new(PerRecordWriteStrategy::default()),
        }
    }
}

/// Translate a record's mutations into write pairs for one tablet.
fn to_write_pairs(info: &ProcessRecordInfo, record: &ChangeRecord) -> Result<Vec<WritePair>> {
    let transaction = match &record.transaction_state {
        Some(_) => Some(WriteTransactionInfo {
            transaction_id: record.transaction_id()?,
            status_tablet_id: info.status_tablet_id.clone(),
        }),
        None => None,
    };
    let op = match record.operation {
        Operation::Delete => WriteOp::Delete,
        _ => WriteOp::Put,
    };

    Ok(record
        .changes
        .iter()
        .map(|pair| WritePair {
            key: pair.key.clone(),
            value: pair.value.clone(),
            op,
            external_hybrid_time: record.time,
            transaction: transaction.clone(),
        })
        .collect())
}

/// Pending CREATE/COMMIT operations, shared by both strategies.
#[derive(Debug, Default)]
struct TransactionBuffer {
    pending: Vec<ExternalTransactionMetadata>,
}

impl TransactionBuffer {
    fn push(
        &mut self,
        operation_type: TransactionOperation,
        status_tablet: &str,
        involved_tablet_ids: Vec<TabletId>,
        record: &ChangeRecord,
    ) -> Result<()> {
        let transaction_id = record.transaction_id()?;
        trace!(
            transaction_id = %transaction_id,
            status_tablet,
            operation = %operation_type,
            "Buffered external transaction operation"
        );
        self.pending.push(ExternalTransactionMetadata {
            transaction_id,
            status_tablet: status_tablet.to_string(),
            operation_type,
            hybrid_time: record.time,
            involved_tablet_ids,
        });
        Ok(())
    }

    fn take(&mut self) -> Vec<ExternalTransactionMetadata> {
        std::mem::take(&mut self.pending)
    }
}

/// One request per tablet, appended in arrival order.
#[derive(Debug)]
pub struct BatchedWriteStrategy {
    /// Requests in the order their tablet was first seen.
    requests: VecDeque<WriteRequest>,
    /// Tablet → index of its open (unsealed) request in `requests`.
    open: HashMap<TabletId, usize>,
    /// Requests already popped from the front; keeps `open` indexes valid.
    drained: usize,
    max_records_per_request: usize,
    transactions: TransactionBuffer,
}

impl BatchedWriteStrategy {
    pub fn new(max_records_per_request: usize) -> Self {
        Self {
            requests: VecDeque::new(),
            open: HashMap::new(),
            drained: 0,
            max_records_per_request: max_records_per_request.max(1),
            transactions: TransactionBuffer::default(),
        }
    }

    /// Number of buffered requests not yet drained.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn open_request(&mut self, info: &ProcessRecordInfo) -> &mut WriteRequest {
        let max = self.max_records_per_request;
        let slot = self
            .open
            .get(&info.tablet_id)
            .map(|absolute| absolute - self.drained)
            .filter(|&i| i < self.requests.len() && self.requests[i].pairs.len() < max);

        let index = match slot {
            Some(i) => i,
            None => {
                self.requests.push_back(WriteRequest::new(
                    info.tablet_id.clone(),
                    info.last_compatible_consumer_schema_version,
                ));
                let i = self.requests.len() - 1;
                self.open.insert(info.tablet_id.clone(), i + self.drained);
                i
            }
        };
        &mut self.requests[index]
    }
}

impl WriteStrategy for BatchedWriteStrategy {
    fn process_record(&mut self, info: &ProcessRecordInfo, record: &ChangeRecord) -> Result<()> {
        let pairs = to_write_pairs(info, record)?;
        let request = self.open_request(info);
        request.pairs.extend(pairs);
        Ok(())
    }

    fn process_create_record(&mut self, status_tablet: &str, record: &ChangeRecord) -> Result<()> {
        self.transactions
            .push(TransactionOperation::Create, status_tablet, Vec::new(), record)
    }

    fn process_commit_record(
        &mut self,
        status_tablet: &str,
        involved_target_tablet_ids: Vec<TabletId>,
        record: &ChangeRecord,
    ) -> Result<()> {
        self.transactions.push(
            TransactionOperation::Commit,
            status_tablet,
            involved_target_tablet_ids,
            record,
        )
    }

    fn next_write_request(&mut self) -> Option<WriteRequest> {
        let request = self.requests.pop_front()?;
        let absolute = self.drained;
        self.drained += 1;
        if self.open.get(&request.tablet_id) == Some(&absolute) {
            self.open.remove(&request.tablet_id);
        }
        Some(request)
    }

    fn take_transaction_metadatas(&mut self) -> Vec<ExternalTransactionMetadata> {
        self.transactions.take()
    }
}

/// One request per (record, tablet).
#[derive(Debug, Default)]
pub struct PerRecordWriteStrategy {
    requests: VecDeque<WriteRequest>,
    transactions: TransactionBuffer,
}

impl WriteStrategy for PerRecordWriteStrategy {
    fn process_record(&mut self, info: &ProcessRecordInfo, record: &ChangeRecord) -> Result<()> {
        let mut request = WriteRequest::new(
            info.tablet_id.clone(),
            info.last_compatible_consumer_schema_version,
        );
        request.pairs = to_write_pairs(info, record)?;
        self.requests.push_back(request);
        Ok(())
    }

    fn process_create_record(&mut self, status_tablet: &str, record: &ChangeRecord) -> Result<()> {
        self.transactions
            .push(TransactionOperation::Create, status_tablet, Vec::new(), record)
    }

    fn process_commit_record(
        &mut self,
        status_tablet: &str,
        involved_target_tablet_ids: Vec<TabletId>,
        record: &ChangeRecord,
    ) -> Result<()> {
        self.transactions.push(
            TransactionOperation::Commit,
            status_tablet,
            involved_target_tablet_ids,
            record,
        )
    }

    fn next_write_request(&mut self) -> Option<WriteRequest> {
        self.requests.pop_front()
    }

    fn take_transaction_metadatas(&mut self) -> Vec<ExternalTransactionMetadata> {
        self.transactions.take()
    }
}
