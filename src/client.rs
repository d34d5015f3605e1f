// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator interfaces.
//!
//! The consumer engine never talks to the network directly. The host
//! process provides implementations of these traits, which lets tests swap
//! in deterministic fakes.
//!
//! | Trait | Used by | Provides |
//! |-------|---------|----------|
//! | [`ProducerClient`] | poller | "get changes" against the producer tablet |
//! | [`LocalClient`] | output client | tablet lookups, write RPCs, control-plane calls |
//! | [`ConsumerRegistry`] | output client | producer → consumer tablet mapping, coordinator, counters |
//! | [`TransactionCoordinator`] | output client | external transaction CREATE / COMMIT |
//!
//! All async methods return a boxed future so the traits stay object safe.
//! Deadlines are applied by the caller with `tokio::time::timeout`.

use crate::error::{Result, XClusterError};
use crate::record::{ChangeBatch, ChangeMetadataRequest, GetChangesRequest, RemoteTablet, SplitTabletInfo};
use crate::types::{ConsumerTabletInfo, ProducerTabletInfo, SchemaVersion, TableId};
use crate::write_strategy::{ExternalTransactionMetadata, WriteRequest};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Await `fut`, failing with [`XClusterError::TimedOut`] after `deadline`.
pub async fn with_deadline<T>(
    operation: &str,
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(XClusterError::timed_out(operation, deadline)),
    }
}

/// Kind of consumer table being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    /// Regular user table.
    User,
    /// The transaction status table; records are routed to status tablets.
    TransactionStatus,
}

/// An opened consumer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    pub table_id: TableId,
    pub table_type: TableType,
}

impl TableHandle {
    pub fn is_transaction_status_table(&self) -> bool {
        self.table_type == TableType::TransactionStatus
    }
}

/// Response of a write RPC that reached the tablet.
///
/// `error` carries an application-level failure reported by the tablet
/// server even though the RPC itself succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResponse {
    pub error: Option<XClusterError>,
}

/// Control-plane answer to a producer schema change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerMetadataResponse {
    /// Polling must pause until the consumer schema catches up.
    pub should_wait: bool,
    pub last_compatible_consumer_schema_version: Option<SchemaVersion>,
}

/// Source of CDC batches.
pub trait ProducerClient: Send + Sync + 'static {
    /// Fetch the next batch after `request.from_checkpoint`.
    fn get_changes(&self, request: GetChangesRequest) -> BoxFuture<'_, ChangeBatch>;
}

/// Client of the local (consumer) universe.
pub trait LocalClient: Send + Sync + 'static {
    /// Open a table by id.
    fn open_table(&self, table_id: &str) -> BoxFuture<'_, TableHandle>;

    /// Enumerate every tablet of the table with its partition.
    fn lookup_all_tablets(&self, table: &TableHandle) -> BoxFuture<'_, Vec<RemoteTablet>>;

    /// Find the tablet owning `partition_key`.
    fn lookup_tablet_by_key(
        &self,
        table: &TableHandle,
        partition_key: &[u8],
    ) -> BoxFuture<'_, RemoteTablet>;

    /// Drop the cached partition map so the next lookup refreshes it.
    fn mark_partitions_stale(&self, table: &TableHandle);

    /// Send one write request to its tablet.
    ///
    /// With `use_local_tserver` the request goes to the co-located tablet
    /// server instead of through a remote proxy.
    fn write(&self, request: WriteRequest, use_local_tserver: bool) -> BoxFuture<'_, WriteResponse>;

    /// Tell the control plane that a producer tablet split into two children.
    fn update_consumer_on_producer_split(
        &self,
        producer: &ProducerTabletInfo,
        split: SplitTabletInfo,
    ) -> BoxFuture<'_, ()>;

    /// Push a producer schema change to the control plane.
    fn update_consumer_on_producer_metadata(
        &self,
        producer: &ProducerTabletInfo,
        request: ChangeMetadataRequest,
    ) -> BoxFuture<'_, ProducerMetadataResponse>;
}

/// External transaction coordinator.
pub trait TransactionCoordinator: Send + Sync + 'static {
    fn create_external_transaction(
        &self,
        metadata: ExternalTransactionMetadata,
    ) -> BoxFuture<'_, ()>;

    fn commit_external_transaction(
        &self,
        metadata: ExternalTransactionMetadata,
    ) -> BoxFuture<'_, ()>;
}

/// The owning consumer service, shared by every poller in the process.
pub trait ConsumerRegistry: Send + Sync + 'static {
    /// Consumer tablet replicating `producer_tablet_id`.
    ///
    /// Returns [`XClusterError::NotFound`] when that producer tablet is not
    /// replicated to this universe.
    fn consumer_tablet_for_producer(&self, producer_tablet_id: &str) -> Result<ConsumerTabletInfo>;

    /// Coordinator used for external transactions, if one is running.
    fn transaction_coordinator(&self) -> Option<Arc<dyn TransactionCoordinator>>;

    fn increment_num_successful_write_rpcs(&self) {}
}
