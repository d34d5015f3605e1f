// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Output client: applies one CDC batch to the consumer universe.
//!
//! The client is an actor. [`XClusterOutputClient::spawn`] starts a private
//! task that owns every piece of per-batch state; the handle only enqueues
//! batches and flips the shutdown signal. Exactly one [`OutputResult`] is
//! sent on the result channel for every batch, unless the client was shut
//! down first.
//!
//! # Batch Flow
//!
//! ```text
//! apply_changes(batch)
//!     │ reset counters, fresh WriteStrategy
//!     │ empty? ──────────────────────────────────────────────▶ result (0 records)
//!     ▼
//! open table (cached) ─▶ lookup all tablets (deadline, barrier)
//!     ▼
//! process_changes_starting_from_index(i) ◀───────────────────────────┐
//!     │ meta op after buffered writes ─▶ stop, flush first            │
//!     │ meta op first ─▶ split / schema push ─▶ result                │
//!     │ status table ─▶ status tablet (CREATE / COMMIT / intent)      │
//!     │ local tablet ─▶ mapped consumer tablet                        │
//!     │ APPLY ─▶ cached tablets filtered by key range                 │
//!     │ WRITE / DELETE ─▶ point lookup by partition key               │
//!     ▼                                                               │
//! flush: send_transaction_updates | send_user_table_writes            │
//!     │ (one RPC in flight, raced against shutdown,                   │
//!     │  continuation on the worker pool)                             │
//!     ▼                                                               │
//! records left? ──── yes ─────────────────────────────────────────────┘
//!     │ no
//!     ▼
//! result
//! ```
//!
//! # Error Handling
//!
//! Every failure converges on `handle_error`: it records the status,
//! refreshes the partition cache when the error says the mapping is stale,
//! and finalizes the batch. A failed batch reports zero processed records
//! and [`OpId::MIN`]; the poller retries the whole cycle.

use crate::client::{with_deadline, ConsumerRegistry, LocalClient, TableHandle, WriteResponse};
use crate::config::{FaultInjection, OutputClientConfig};
use crate::error::{Result, XClusterError};
use crate::metrics;
use crate::record::{filter_tablets_by_key_range, ChangeBatch, ChangeRecord, KeyRange, Operation, RemoteTablet};
use crate::resilience::Bulkhead;
use crate::types::{
    ConsumerTabletInfo, OpId, ProducerTabletInfo, SchemaVersion, TabletId, TransactionId,
    INVALID_SCHEMA_VERSION,
};
use crate::write_strategy::{
    ExternalTransactionMetadata, ProcessRecordInfo, TransactionOperation, WriteRequest, WriteStrategy,
};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Level};

/// Outcome of one `apply_changes` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputResult {
    pub status: Result<()>,
    /// Batch checkpoint on success, [`OpId::MIN`] on failure.
    pub last_applied_op_id: OpId,
    pub processed_record_count: usize,
    /// Non-zero when polling must pause until the consumer schema reaches it.
    pub wait_for_version: SchemaVersion,
}

impl OutputResult {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Applies batches to the consumer universe.
///
/// Results are delivered out of band on the channel given at construction.
pub trait OutputClient: Send + Sync + 'static {
    /// Queue a batch. Fails only once the client is shut down.
    fn apply_changes(&self, batch: ChangeBatch) -> Result<()>;

    /// Raise the schema version stamped on every write. The invalid
    /// sentinel and lower versions are ignored.
    fn set_last_compatible_consumer_schema_version(&self, version: SchemaVersion);

    /// Stop the client. Idempotent. No result is delivered afterwards.
    fn shutdown(&self);
}

/// Pick the status tablet coordinating `transaction_id`.
///
/// A pure function of the id and the tablet set, so every consumer sharing
/// the same set picks the same tablet.
pub fn select_status_tablet<'a>(
    transaction_id: &TransactionId,
    status_tablets: &'a [TabletId],
) -> Result<&'a TabletId> {
    if status_tablets.is_empty() {
        return Err(XClusterError::IllegalState("Found no status tablets".to_string()));
    }
    let index = transaction_id.stable_hash() % status_tablets.len() as u64;
    Ok(&status_tablets[index as usize])
}

/// Collaborators and identity of one output client.
#[derive(Clone)]
pub struct OutputClientContext {
    pub producer_tablet: ProducerTabletInfo,
    pub consumer_tablet: ConsumerTabletInfo,
    pub local_client: Arc<dyn LocalClient>,
    pub registry: Arc<dyn ConsumerRegistry>,
    /// Shared by every output client in the process.
    pub worker_pool: Arc<Bulkhead>,
    pub global_transaction_status_tablets: Vec<TabletId>,
    pub last_compatible_consumer_schema_version: SchemaVersion,
}

/// Handle to a running output client actor.
pub struct XClusterOutputClient {
    consumer_tablet: ConsumerTabletInfo,
    batches: mpsc::UnboundedSender<ChangeBatch>,
    shutdown_tx: watch::Sender<bool>,
    is_shutdown: Arc<AtomicBool>,
    last_compatible: Arc<AtomicU32>,
}

impl XClusterOutputClient {
    /// Start the actor. Must be called inside a tokio runtime.
    pub fn spawn(
        context: OutputClientContext,
        config: OutputClientConfig,
        faults: FaultInjection,
        results: mpsc::UnboundedSender<OutputResult>,
    ) -> Self {
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let is_shutdown = Arc::new(AtomicBool::new(false));
        let last_compatible = Arc::new(AtomicU32::new(INVALID_SCHEMA_VERSION));
        raise_schema_version(&last_compatible, context.last_compatible_consumer_schema_version);

        let span = info_span!(
            "xcluster_output_client",
            producer_tablet = %context.producer_tablet.tablet_id,
            consumer_tablet = %context.consumer_tablet.tablet_id,
        );
        let consumer_tablet = context.consumer_tablet.clone();
        let actor = OutputActor {
            batch: BatchState::idle(config.write_strategy.build(config.max_records_per_write_request)),
            producer_tablet: context.producer_tablet,
            consumer_tablet: context.consumer_tablet,
            local_client: context.local_client,
            registry: context.registry,
            worker_pool: context.worker_pool,
            status_tablets: context.global_transaction_status_tablets,
            config,
            faults,
            table: None,
            results,
            shutdown_rx,
            is_shutdown: Arc::clone(&is_shutdown),
            last_compatible: Arc::clone(&last_compatible),
        };
        tokio::spawn(actor.run(batch_rx).instrument(span));

        Self {
            consumer_tablet,
            batches: batch_tx,
            shutdown_tx,
            is_shutdown,
            last_compatible,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    pub fn last_compatible_consumer_schema_version(&self) -> SchemaVersion {
        self.last_compatible.load(Ordering::Acquire)
    }

    pub fn consumer_tablet(&self) -> &ConsumerTabletInfo {
        &self.consumer_tablet
    }
}

impl OutputClient for XClusterOutputClient {
    fn apply_changes(&self, batch: ChangeBatch) -> Result<()> {
        if self.is_shutdown() {
            return Err(XClusterError::Shutdown);
        }
        self.batches.send(batch).map_err(|_| XClusterError::Shutdown)
    }

    fn set_last_compatible_consumer_schema_version(&self, version: SchemaVersion) {
        raise_schema_version(&self.last_compatible, version);
    }

    fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(consumer_tablet = %self.consumer_tablet.tablet_id, "Shutting down output client");
        // Drops whatever RPC the actor is awaiting.
        self.shutdown_tx.send_replace(true);
    }
}

impl Drop for XClusterOutputClient {
    fn drop(&mut self) {
        debug_assert!(
            self.is_shutdown() || std::thread::panicking(),
            "XClusterOutputClient dropped without shutdown()"
        );
        self.shutdown();
    }
}

fn raise_schema_version(watermark: &AtomicU32, version: SchemaVersion) {
    if version == INVALID_SCHEMA_VERSION {
        return;
    }
    let previous = watermark.fetch_max(version, Ordering::AcqRel);
    if previous < version {
        info!(schema_version = version, "Last compatible consumer schema version updated");
    }
}

/// Retryable apply errors are expected churn; the rest need attention.
fn error_log_level(error: &XClusterError) -> Level {
    if error.is_retryable() {
        Level::WARN
    } else {
        Level::ERROR
    }
}

/// Resolves once shutdown is signalled or the handle is gone.
async fn shutdown_signalled(mut shutdown_rx: watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Per-batch state, owned by the actor.
struct BatchState {
    records: Arc<[ChangeRecord]>,
    op_id: OpId,
    error: Option<XClusterError>,
    done_processing: bool,
    wait_for_version: SchemaVersion,
    processed_record_count: usize,
    record_count: usize,
    write_strategy: Box<dyn WriteStrategy>,
    /// Full tablet list of the consumer table, looked up once per batch.
    all_tablets: Result<Vec<RemoteTablet>>,
}

impl BatchState {
    fn idle(write_strategy: Box<dyn WriteStrategy>) -> Self {
        Self::new(OpId::MIN, Vec::new(), write_strategy)
    }

    fn new(op_id: OpId, records: Vec<ChangeRecord>, write_strategy: Box<dyn WriteStrategy>) -> Self {
        Self {
            record_count: records.len(),
            records: records.into(),
            op_id,
            error: None,
            done_processing: false,
            wait_for_version: 0,
            processed_record_count: 0,
            write_strategy,
            all_tablets: Ok(Vec::new()),
        }
    }

    /// Returns whether the batch is complete.
    fn inc_processed_record_count(&mut self) -> bool {
        self.processed_record_count += 1;
        debug_assert!(self.processed_record_count <= self.record_count);
        if self.processed_record_count == self.record_count {
            self.done_processing = true;
        }
        self.done_processing
    }

    /// Index to resume at, if any record is left.
    fn next_record_index(&self) -> Option<usize> {
        (self.processed_record_count < self.record_count).then_some(self.processed_record_count)
    }
}

/// How a pass over the records ended.
#[derive(Debug, PartialEq, Eq)]
enum PassOutcome {
    /// A meta op completed the batch.
    Finished,
    /// Writes or transaction updates are buffered.
    Flush,
    NothingBuffered,
}

struct OutputActor {
    producer_tablet: ProducerTabletInfo,
    consumer_tablet: ConsumerTabletInfo,
    local_client: Arc<dyn LocalClient>,
    registry: Arc<dyn ConsumerRegistry>,
    worker_pool: Arc<Bulkhead>,
    status_tablets: Vec<TabletId>,
    config: OutputClientConfig,
    faults: FaultInjection,
    table: Option<TableHandle>,
    batch: BatchState,
    results: mpsc::UnboundedSender<OutputResult>,
    shutdown_rx: watch::Receiver<bool>,
    is_shutdown: Arc<AtomicBool>,
    last_compatible: Arc<AtomicU32>,
}

impl OutputActor {
    async fn run(mut self, mut batches: mpsc::UnboundedReceiver<ChangeBatch>) {
        debug!("Output client started");
        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown_signalled(self.shutdown_rx.clone()) => break,
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.apply_changes(batch).await;
        }
        debug!("Output client stopped");
    }

    fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Run `fut` unless shutdown wins the race; dropping it aborts the RPC.
    async fn until_shutdown<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        if self.is_shutdown() {
            return Err(XClusterError::Shutdown);
        }
        tokio::select! {
            biased;
            _ = shutdown_signalled(self.shutdown_rx.clone()) => Err(XClusterError::Shutdown),
            out = fut => Ok(out),
        }
    }

    /// Slot in the shared worker pool for continuation work.
    async fn worker_permit(&self) -> Result<OwnedSemaphorePermit> {
        let permit = self.until_shutdown(self.worker_pool.acquire()).await??;
        Ok(permit)
    }

    fn new_write_strategy(&self) -> Box<dyn WriteStrategy> {
        self.config
            .write_strategy
            .build(self.config.max_records_per_write_request)
    }

    async fn apply_changes(&mut self, batch: ChangeBatch) {
        let ChangeBatch {
            records,
            checkpoint,
            ..
        } = batch;
        debug_assert!(self.batch.op_id.is_min(), "previous batch was not finalized");

        let Some(checkpoint) = checkpoint else {
            self.batch = BatchState::idle(self.new_write_strategy());
            self.handle_error(XClusterError::InvalidArgument(
                "ApplyChanges called on a batch without a checkpoint".to_string(),
            ));
            return;
        };

        self.batch = BatchState::new(checkpoint, records, self.new_write_strategy());
        debug!(op_id = %checkpoint, records = self.batch.record_count, "Applying changes");

        if self.batch.record_count == 0 {
            self.handle_response();
            return;
        }

        if let Err(e) = self.apply_records().await {
            self.handle_error(e);
        }
    }

    async fn apply_records(&mut self) -> Result<()> {
        let table = self.ensure_table().await?;

        if self.faults.disable_transaction_status_table_replication
            && table.is_transaction_status_table()
        {
            return Err(XClusterError::TryAgain(
                "Failing ApplyChanges for transaction status table for test".to_string(),
            ));
        }

        // Barrier: routing starts only once the full tablet list is known.
        let timeout = self.config.read_rpc_timeout();
        self.batch.all_tablets = self
            .until_shutdown(with_deadline(
                "LookupAllTablets",
                timeout,
                self.local_client.lookup_all_tablets(&table),
            ))
            .await?;

        self.drive_batch(&table).await
    }

    async fn ensure_table(&mut self) -> Result<TableHandle> {
        if let Some(table) = &self.table {
            return Ok(table.clone());
        }
        let table = self
            .until_shutdown(with_deadline(
                "OpenTable",
                self.config.read_rpc_timeout(),
                self.local_client.open_table(&self.consumer_tablet.table_id),
            ))
            .await??;
        self.table = Some(table.clone());
        Ok(table)
    }

    /// Alternate routing passes and flushes until the batch is finalized.
    async fn drive_batch(&mut self, table: &TableHandle) -> Result<()> {
        let mut start = 0;
        loop {
            let outcome = {
                let _permit = self.worker_permit().await?;
                self.process_changes_starting_from_index(table, start).await?
            };

            match outcome {
                PassOutcome::Finished | PassOutcome::NothingBuffered => break,
                PassOutcome::Flush => {
                    if table.is_transaction_status_table() {
                        self.send_transaction_updates().await?;
                    } else {
                        self.send_user_table_writes().await?;
                    }
                }
            }

            match self.batch.next_record_index() {
                Some(next) if next > 0 => start = next,
                _ => break,
            }
        }
        self.handle_response();
        Ok(())
    }

    async fn process_changes_starting_from_index(
        &mut self,
        table: &TableHandle,
        start: usize,
    ) -> Result<PassOutcome> {
        let records = Arc::clone(&self.batch.records);
        let mut buffered = false;

        for (index, record) in records.iter().enumerate().skip(start) {
            if self.is_shutdown() {
                return Err(XClusterError::Shutdown);
            }
            if record.is_meta_op() {
                if buffered {
                    // Buffered writes go out before the meta op is acted on.
                    break;
                }
                if self.process_meta_op(record).await? {
                    debug_assert_eq!(index, records.len() - 1, "meta op must end the batch");
                    return Ok(PassOutcome::Finished);
                }
                continue;
            }

            if table.is_transaction_status_table() {
                self.process_record_for_transaction_status_tablet(record)?;
            } else if self.config.routes_to_local_tablet() {
                let tablet_id = self.consumer_tablet.tablet_id.clone();
                self.process_record(&[tablet_id], record)?;
            } else {
                match &record.operation {
                    Operation::Apply { partition } => {
                        self.process_record_for_tablet_range(table, partition, record)?;
                    }
                    Operation::TransactionCreated | Operation::TransactionCommitted => {
                        return Err(XClusterError::IllegalState(format!(
                            "Unsupported operation {} for user table {}",
                            record.operation.name(),
                            table.table_id
                        )));
                    }
                    _ => {
                        let partition_key = record.partition_key()?;
                        let tablet = self
                            .until_shutdown(with_deadline(
                                "LookupTabletByKey",
                                self.config.read_rpc_timeout(),
                                self.local_client.lookup_tablet_by_key(table, partition_key),
                            ))
                            .await??;
                        self.process_record(&[tablet.tablet_id], record)?;
                    }
                }
            }
            buffered = true;
        }

        Ok(if buffered {
            PassOutcome::Flush
        } else {
            PassOutcome::NothingBuffered
        })
    }

    /// Buffer `record` once per target tablet and count it once.
    fn process_record(&mut self, tablet_ids: &[TabletId], record: &ChangeRecord) -> Result<()> {
        let status_tablet_id = if self.config.enable_replicate_transaction_status_table
            && record.transaction_state.is_some()
        {
            // Set on every intent: a tablet may not have seen an earlier
            // batch naming the status tablet.
            Some(self.select_status_tablet_id_for_transaction(&record.transaction_id()?)?)
        } else {
            None
        };
        self.buffer_record(tablet_ids, status_tablet_id, record)
    }

    fn buffer_record(
        &mut self,
        tablet_ids: &[TabletId],
        status_tablet_id: Option<TabletId>,
        record: &ChangeRecord,
    ) -> Result<()> {
        for tablet_id in tablet_ids {
            let info = ProcessRecordInfo {
                tablet_id: tablet_id.clone(),
                enable_replicate_transaction_status_table: self
                    .config
                    .enable_replicate_transaction_status_table,
                status_tablet_id: status_tablet_id.clone(),
                last_compatible_consumer_schema_version: self.last_compatible.load(Ordering::Acquire),
            };
            if let Err(e) = self.batch.write_strategy.process_record(&info, record) {
                self.batch.error = Some(e.clone());
                return Err(e);
            }
        }
        trace!(tablets = tablet_ids.len(), operation = record.operation.name(), "Buffered record");
        self.batch.inc_processed_record_count();
        Ok(())
    }

    fn process_record_for_tablet_range(
        &mut self,
        table: &TableHandle,
        partition: &KeyRange,
        record: &ChangeRecord,
    ) -> Result<()> {
        let tablets = self.batch.all_tablets.as_ref().map_err(|e| e.clone())?;
        let tablet_ids: Vec<TabletId> = filter_tablets_by_key_range(tablets, partition)
            .into_iter()
            .map(|tablet| tablet.tablet_id.clone())
            .collect();

        if tablet_ids.is_empty() {
            self.local_client.mark_partitions_stale(table);
            metrics::record_partition_refresh(&table.table_id);
            return Err(XClusterError::TryAgain(
                "No tablets found for key range, refreshing partitions to try again.".to_string(),
            ));
        }
        self.process_record(&tablet_ids, record)
    }

    fn select_status_tablet_id_for_transaction(&self, transaction_id: &TransactionId) -> Result<TabletId> {
        select_status_tablet(transaction_id, &self.status_tablets).cloned()
    }

    fn process_record_for_transaction_status_tablet(&mut self, record: &ChangeRecord) -> Result<()> {
        let transaction_id = record.transaction_id()?;
        let status_tablet = self.select_status_tablet_id_for_transaction(&transaction_id)?;

        match record.operation {
            Operation::TransactionCommitted => {
                let involved = self.get_involved_target_tablets_from_commit_record(record)?;
                self.batch
                    .write_strategy
                    .process_commit_record(&status_tablet, involved, record)?;
                self.batch.inc_processed_record_count();
                Ok(())
            }
            Operation::TransactionCreated => {
                self.batch
                    .write_strategy
                    .process_create_record(&status_tablet, record)?;
                self.batch.inc_processed_record_count();
                Ok(())
            }
            // Intents always carry the status tablet they were routed to.
            _ => self.buffer_record(&[status_tablet.clone()], Some(status_tablet), record),
        }
    }

    /// Consumer tablets for the producer tablets named in a commit record,
    /// deduplicated and sorted.
    fn get_involved_target_tablets_from_commit_record(
        &self,
        record: &ChangeRecord,
    ) -> Result<Vec<TabletId>> {
        let producer_tablets = record
            .transaction_state
            .as_ref()
            .map(|state| state.tablets.as_slice())
            .unwrap_or_default();

        let mut involved = BTreeSet::new();
        for producer_tablet in producer_tablets {
            match self.registry.consumer_tablet_for_producer(producer_tablet) {
                Ok(consumer) => {
                    involved.insert(consumer.tablet_id);
                }
                Err(e) if e.is_not_found() => {
                    debug!(
                        producer_tablet = %producer_tablet,
                        "Ignoring producer tablet from commit record, not replicated to this universe"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(involved.into_iter().collect())
    }

    /// Returns whether the batch is finalized by this meta op.
    async fn process_meta_op(&mut self, record: &ChangeRecord) -> Result<bool> {
        let timeout = self.config.read_rpc_timeout();
        let mut wait_for_version = 0;
        let mut last_compatible = INVALID_SCHEMA_VERSION;

        match &record.operation {
            Operation::SplitOp(split) => {
                if self.faults.fail_after_process_split_op {
                    return Err(XClusterError::Internal(
                        "Fail due to fail_after_process_split_op".to_string(),
                    ));
                }
                self.until_shutdown(with_deadline(
                    "UpdateConsumerOnProducerSplit",
                    timeout,
                    self.local_client
                        .update_consumer_on_producer_split(&self.producer_tablet, split.clone()),
                ))
                .await??;
                metrics::record_producer_split(&self.producer_tablet.tablet_id);
                info!(
                    parent = %split.tablet_id,
                    child1 = %split.new_tablet1_id,
                    child2 = %split.new_tablet2_id,
                    "Producer tablet split"
                );
            }
            Operation::ChangeMetadata(request) => {
                let response = self
                    .until_shutdown(with_deadline(
                        "UpdateConsumerOnProducerMetadata",
                        timeout,
                        self.local_client
                            .update_consumer_on_producer_metadata(&self.producer_tablet, request.clone()),
                    ))
                    .await??;
                if response.should_wait {
                    wait_for_version = request.schema_version;
                    info!(
                        schema_version = wait_for_version,
                        "Halting polling due to schema change"
                    );
                }
                if let Some(version) = response.last_compatible_consumer_schema_version {
                    last_compatible = version;
                }
            }
            other => {
                return Err(XClusterError::IllegalState(format!(
                    "{} is not a meta op",
                    other.name()
                )));
            }
        }

        raise_schema_version(&self.last_compatible, last_compatible);
        self.batch.wait_for_version = wait_for_version;
        if wait_for_version != 0 {
            // Left uncounted: the batch is not fully applied until the
            // consumer schema catches up.
            return Ok(true);
        }
        Ok(self.batch.inc_processed_record_count())
    }

    /// All CREATEs, then buffered intents, then all COMMITs.
    async fn send_transaction_updates(&mut self) -> Result<()> {
        let metadatas = self.batch.write_strategy.take_transaction_metadatas();

        self.send_transaction_phase(TransactionOperation::Create, &metadatas)
            .await?;
        self.send_buffered_writes(false).await?;
        self.send_transaction_phase(TransactionOperation::Commit, &metadatas)
            .await
    }

    async fn send_transaction_phase(
        &self,
        phase: TransactionOperation,
        metadatas: &[ExternalTransactionMetadata],
    ) -> Result<()> {
        let pending: Vec<_> = metadatas
            .iter()
            .filter(|metadata| metadata.operation_type == phase)
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let coordinator = self
            .registry
            .transaction_coordinator()
            .ok_or_else(|| XClusterError::InvalidArgument("Could not commit transactions".to_string()))?;

        let count = pending.len();
        let updates = pending.into_iter().map(|metadata| match phase {
            TransactionOperation::Create => coordinator.create_external_transaction(metadata),
            TransactionOperation::Commit => coordinator.commit_external_transaction(metadata),
        });
        let timeout = self.config.write_rpc_timeout();
        let results = self
            .until_shutdown(with_deadline("ExternalTransaction", timeout, async {
                Ok(join_all(updates).await)
            }))
            .await??;

        let _permit = self.worker_permit().await?;
        metrics::record_transaction_updates(&self.consumer_tablet.tablet_id, &phase.to_string(), count);
        debug!(phase = %phase, count, "Sent external transaction updates");
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn send_user_table_writes(&mut self) -> Result<()> {
        self.send_buffered_writes(true).await
    }

    /// Send buffered requests one at a time until the strategy is drained.
    async fn send_buffered_writes(&mut self, expect_request: bool) -> Result<()> {
        let mut next = self.batch.write_strategy.next_write_request();
        if next.is_none() && expect_request {
            warn!("Expected to find a write request but were unable to");
            return Err(XClusterError::IllegalState(
                "Could not find a write request to send".to_string(),
            ));
        }
        while let Some(request) = next {
            self.send_next_write_to_tablet(request).await?;
            next = self.batch.write_strategy.next_write_request();
        }
        Ok(())
    }

    async fn send_next_write_to_tablet(&self, request: WriteRequest) -> Result<()> {
        let tablet_id = request.tablet_id.clone();
        let timeout = self.config.write_rpc_timeout();
        let use_local_tserver = self.config.routes_to_local_tablet();
        let started = Instant::now();

        let outcome = self
            .until_shutdown(with_deadline(
                "Write",
                timeout,
                self.local_client.write(request, use_local_tserver),
            ))
            .await?;

        self.write_cdc_record_done(&tablet_id, outcome, started).await
    }

    async fn write_cdc_record_done(
        &self,
        tablet_id: &str,
        outcome: Result<WriteResponse>,
        started: Instant,
    ) -> Result<()> {
        if self.is_shutdown() {
            return Err(XClusterError::Shutdown);
        }
        let _permit = self.worker_permit().await?;

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                metrics::record_write_rpc(tablet_id, false, started.elapsed());
                return Err(e);
            }
        };
        if let Some(e) = response.error {
            metrics::record_write_rpc(tablet_id, false, started.elapsed());
            return Err(e);
        }

        metrics::record_write_rpc(tablet_id, true, started.elapsed());
        self.registry.increment_num_successful_write_rpcs();
        trace!(tablet_id, "Write RPC succeeded");
        Ok(())
    }

    fn handle_error(&mut self, error: XClusterError) {
        if self.is_shutdown() {
            debug!(error = %error, "Dropping batch error, output client is shut down");
            return;
        }
        if error_log_level(&error) == Level::WARN {
            warn!(error = %error, "Retrying applying replicated record");
        } else {
            error!(error = %error, "Error while applying replicated record");
        }

        if error.is_partition_list_stale() {
            if let Some(table) = &self.table {
                self.local_client.mark_partitions_stale(table);
                metrics::record_partition_refresh(&table.table_id);
            }
        }
        self.batch.error = Some(error);
        self.handle_response();
    }

    fn prepare_response(&mut self) -> OutputResult {
        let status = match self.batch.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        let mut response = OutputResult {
            status,
            last_applied_op_id: OpId::MIN,
            processed_record_count: 0,
            wait_for_version: 0,
        };
        if response.is_ok() {
            response.last_applied_op_id = self.batch.op_id;
            response.processed_record_count = self.batch.processed_record_count;
            response.wait_for_version = self.batch.wait_for_version;
        }
        self.batch.op_id = OpId::MIN;
        self.batch.processed_record_count = 0;
        response
    }

    fn handle_response(&mut self) {
        let response = self.prepare_response();
        let outcome = match &response.status {
            Ok(()) => "ok",
            Err(e) => e.kind(),
        };
        metrics::record_apply_result(
            &self.consumer_tablet.tablet_id,
            outcome,
            response.processed_record_count,
        );
        self.send_response(response);
    }

    fn send_response(&self, response: OutputResult) {
        if self.is_shutdown() {
            debug!("Not sending apply result, output client is shut down");
            return;
        }
        if self.results.send(response).is_err() {
            debug!("Apply result receiver dropped");
        }
    }
}
