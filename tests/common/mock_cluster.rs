//! In-memory consumer cluster for testing.
//!
//! Records every call made by the output client and poller for assertions.
//! Calls that matter for ordering are also appended to a shared [`EventLog`]
//! so tests can check the interleaving of writes and coordinator calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xcluster_consumer::client::{
    BoxFuture, ConsumerRegistry, LocalClient, ProducerClient, ProducerMetadataResponse, TableHandle,
    TableType, TransactionCoordinator, WriteResponse,
};
use xcluster_consumer::error::{Result, XClusterError};
use xcluster_consumer::record::{
    ChangeBatch, ChangeMetadataRequest, GetChangesRequest, RemoteTablet, SplitTabletInfo,
};
use xcluster_consumer::types::{ConsumerTabletInfo, ProducerTabletInfo};
use xcluster_consumer::write_strategy::{ExternalTransactionMetadata, WriteRequest};

/// Ordered log of calls across mocks.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// =============================================================================
// Local universe
// =============================================================================

/// Mock of the local universe: tablet locator, write path and control plane.
///
/// # Example
/// ```rust,ignore
/// let local = MockLocalClient::user_table("table-1", three_tablets());
/// local.fail_writes_with(XClusterError::TryAgain("busy".into()));
///
/// // Use in tests...
///
/// assert_eq!(local.writes().len(), 1);
/// ```
pub struct MockLocalClient {
    table: TableHandle,
    tablets: Mutex<Vec<RemoteTablet>>,
    writes: Mutex<Vec<(WriteRequest, bool)>>,
    write_attempts: AtomicUsize,
    splits: Mutex<Vec<SplitTabletInfo>>,
    metadata_requests: Mutex<Vec<ChangeMetadataRequest>>,
    metadata_response: Mutex<ProducerMetadataResponse>,
    stale_marks: AtomicUsize,
    /// Error returned in every write response
    write_error: Mutex<Option<XClusterError>>,
    /// Error returned by lookup_all_tablets
    lookup_error: Mutex<Option<XClusterError>>,
    /// Writes never complete
    hang_writes: AtomicBool,
    /// Latency of every lookup_tablet_by_key call
    key_lookup_delay: Mutex<Option<Duration>>,
    key_lookups: AtomicUsize,
    log: EventLog,
}

impl MockLocalClient {
    pub fn new(table: TableHandle, tablets: Vec<RemoteTablet>, log: EventLog) -> Self {
        Self {
            table,
            tablets: Mutex::new(tablets),
            writes: Mutex::new(Vec::new()),
            write_attempts: AtomicUsize::new(0),
            splits: Mutex::new(Vec::new()),
            metadata_requests: Mutex::new(Vec::new()),
            metadata_response: Mutex::new(ProducerMetadataResponse::default()),
            stale_marks: AtomicUsize::new(0),
            write_error: Mutex::new(None),
            lookup_error: Mutex::new(None),
            hang_writes: AtomicBool::new(false),
            key_lookup_delay: Mutex::new(None),
            key_lookups: AtomicUsize::new(0),
            log,
        }
    }

    /// A regular user table.
    pub fn user_table(table_id: &str, tablets: Vec<RemoteTablet>) -> Self {
        let table = TableHandle {
            table_id: table_id.to_string(),
            table_type: TableType::User,
        };
        Self::new(table, tablets, EventLog::default())
    }

    /// The transaction status table, sharing `log` with a coordinator.
    pub fn status_table(table_id: &str, log: EventLog) -> Self {
        let table = TableHandle {
            table_id: table_id.to_string(),
            table_type: TableType::TransactionStatus,
        };
        Self::new(table, Vec::new(), log)
    }

    pub fn set_tablets(&self, tablets: Vec<RemoteTablet>) {
        *self.tablets.lock().unwrap() = tablets;
    }

    pub fn set_metadata_response(&self, response: ProducerMetadataResponse) {
        *self.metadata_response.lock().unwrap() = response;
    }

    pub fn fail_writes_with(&self, error: XClusterError) {
        *self.write_error.lock().unwrap() = Some(error);
    }

    pub fn fail_lookups_with(&self, error: XClusterError) {
        *self.lookup_error.lock().unwrap() = Some(error);
    }

    pub fn heal(&self) {
        *self.write_error.lock().unwrap() = None;
        *self.lookup_error.lock().unwrap() = None;
        self.hang_writes.store(false, Ordering::SeqCst);
    }

    pub fn hang_writes(&self) {
        self.hang_writes.store(true, Ordering::SeqCst);
    }

    pub fn slow_key_lookups(&self, delay: Duration) {
        *self.key_lookup_delay.lock().unwrap() = Some(delay);
    }

    /// Number of lookup_tablet_by_key calls issued.
    pub fn key_lookups(&self) -> usize {
        self.key_lookups.load(Ordering::SeqCst)
    }

    /// Successfully completed writes with their `use_local_tserver` flag.
    pub fn writes(&self) -> Vec<(WriteRequest, bool)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn splits(&self) -> Vec<SplitTabletInfo> {
        self.splits.lock().unwrap().clone()
    }

    pub fn metadata_requests(&self) -> Vec<ChangeMetadataRequest> {
        self.metadata_requests.lock().unwrap().clone()
    }

    pub fn stale_marks(&self) -> usize {
        self.stale_marks.load(Ordering::SeqCst)
    }
}

impl LocalClient for MockLocalClient {
    fn open_table(&self, table_id: &str) -> BoxFuture<'_, TableHandle> {
        let result = if table_id == self.table.table_id {
            Ok(self.table.clone())
        } else {
            Err(XClusterError::NotFound(format!("table {table_id}")))
        };
        Box::pin(async move { result })
    }

    fn lookup_all_tablets(&self, _table: &TableHandle) -> BoxFuture<'_, Vec<RemoteTablet>> {
        let result = match self.lookup_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(self.tablets.lock().unwrap().clone()),
        };
        Box::pin(async move { result })
    }

    fn lookup_tablet_by_key(
        &self,
        _table: &TableHandle,
        partition_key: &[u8],
    ) -> BoxFuture<'_, RemoteTablet> {
        self.key_lookups.fetch_add(1, Ordering::SeqCst);
        let delay = *self.key_lookup_delay.lock().unwrap();
        let result = self
            .tablets
            .lock()
            .unwrap()
            .iter()
            .find(|tablet| tablet.partition.contains(partition_key))
            .cloned()
            .ok_or_else(|| XClusterError::NotFound("no tablet for key".to_string()));
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }

    fn mark_partitions_stale(&self, _table: &TableHandle) {
        self.stale_marks.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self, request: WriteRequest, use_local_tserver: bool) -> BoxFuture<'_, WriteResponse> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if self.hang_writes.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            let error = self.write_error.lock().unwrap().clone();
            if error.is_none() {
                self.log.push(format!("WRITE {}", request.tablet_id));
                self.writes.lock().unwrap().push((request, use_local_tserver));
            }
            Ok(WriteResponse { error })
        })
    }

    fn update_consumer_on_producer_split(
        &self,
        _producer: &ProducerTabletInfo,
        split: SplitTabletInfo,
    ) -> BoxFuture<'_, ()> {
        self.log.push(format!("SPLIT {}", split.tablet_id));
        self.splits.lock().unwrap().push(split);
        Box::pin(async { Ok(()) })
    }

    fn update_consumer_on_producer_metadata(
        &self,
        _producer: &ProducerTabletInfo,
        request: ChangeMetadataRequest,
    ) -> BoxFuture<'_, ProducerMetadataResponse> {
        self.log.push(format!("METADATA {}", request.schema_version));
        self.metadata_requests.lock().unwrap().push(request);
        let response = self.metadata_response.lock().unwrap().clone();
        Box::pin(async move { Ok(response) })
    }
}

// =============================================================================
// Transaction coordinator and registry
// =============================================================================

/// Records CREATE / COMMIT calls in issue order.
pub struct MockCoordinator {
    calls: Mutex<Vec<ExternalTransactionMetadata>>,
    fail: AtomicBool,
    /// Latency of every CREATE
    create_delay: Mutex<Option<Duration>>,
    creates_in_flight: Arc<AtomicUsize>,
    /// COMMITs issued while a CREATE was still running
    overlapping_commits: AtomicUsize,
    log: EventLog,
}

impl MockCoordinator {
    pub fn new(log: EventLog) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            create_delay: Mutex::new(None),
            creates_in_flight: Arc::new(AtomicUsize::new(0)),
            overlapping_commits: AtomicUsize::new(0),
            log,
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn slow_creates(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<ExternalTransactionMetadata> {
        self.calls.lock().unwrap().clone()
    }

    pub fn overlapping_commits(&self) -> usize {
        self.overlapping_commits.load(Ordering::SeqCst)
    }

    fn record(&self, metadata: ExternalTransactionMetadata) -> bool {
        let fail = self.fail.load(Ordering::SeqCst);
        if !fail {
            self.log.push(format!("{} {}", metadata.operation_type, metadata.transaction_id));
            self.calls.lock().unwrap().push(metadata);
        }
        fail
    }
}

fn coordinator_reply(fail: bool) -> Result<()> {
    if fail {
        Err(XClusterError::rpc("ExternalTransaction", "coordinator unavailable"))
    } else {
        Ok(())
    }
}

impl TransactionCoordinator for MockCoordinator {
    fn create_external_transaction(&self, metadata: ExternalTransactionMetadata) -> BoxFuture<'_, ()> {
        let fail = self.record(metadata);
        let delay = *self.create_delay.lock().unwrap();
        let in_flight = Arc::clone(&self.creates_in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
            coordinator_reply(fail)
        })
    }

    fn commit_external_transaction(&self, metadata: ExternalTransactionMetadata) -> BoxFuture<'_, ()> {
        if self.creates_in_flight.load(Ordering::SeqCst) > 0 {
            self.overlapping_commits.fetch_add(1, Ordering::SeqCst);
        }
        let fail = self.record(metadata);
        Box::pin(async move { coordinator_reply(fail) })
    }
}

/// Producer → consumer tablet map plus an optional coordinator.
#[derive(Default)]
pub struct MockRegistry {
    tablet_map: HashMap<String, ConsumerTabletInfo>,
    coordinator: Option<Arc<MockCoordinator>>,
    successful_writes: AtomicUsize,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coordinator(mut self, coordinator: Arc<MockCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn map_tablet(mut self, producer_tablet: &str, table_id: &str, consumer_tablet: &str) -> Self {
        self.tablet_map.insert(
            producer_tablet.to_string(),
            ConsumerTabletInfo {
                table_id: table_id.to_string(),
                tablet_id: consumer_tablet.to_string(),
            },
        );
        self
    }

    pub fn successful_writes(&self) -> usize {
        self.successful_writes.load(Ordering::SeqCst)
    }
}

impl ConsumerRegistry for MockRegistry {
    fn consumer_tablet_for_producer(&self, producer_tablet_id: &str) -> Result<ConsumerTabletInfo> {
        self.tablet_map
            .get(producer_tablet_id)
            .cloned()
            .ok_or_else(|| XClusterError::NotFound(producer_tablet_id.to_string()))
    }

    fn transaction_coordinator(&self) -> Option<Arc<dyn TransactionCoordinator>> {
        self.coordinator
            .clone()
            .map(|coordinator| coordinator as Arc<dyn TransactionCoordinator>)
    }

    fn increment_num_successful_write_rpcs(&self) {
        self.successful_writes.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Producer
// =============================================================================

/// Replays scripted "get changes" responses, then returns empty batches at
/// the requested checkpoint.
#[derive(Default)]
pub struct MockProducer {
    responses: Mutex<VecDeque<Result<ChangeBatch>>>,
    requests: Mutex<Vec<GetChangesRequest>>,
}

impl MockProducer {
    pub fn new(responses: Vec<Result<ChangeBatch>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: Result<ChangeBatch>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<GetChangesRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ProducerClient for MockProducer {
    fn get_changes(&self, request: GetChangesRequest) -> BoxFuture<'_, ChangeBatch> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.responses.lock().unwrap().pop_front();
        Box::pin(async move {
            next.unwrap_or_else(|| Ok(ChangeBatch::new(Vec::new(), request.from_checkpoint)))
        })
    }
}
