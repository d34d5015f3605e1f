//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - In-memory local universe, coordinator, registry and producer mocks
//! - Change record builders
//! - Output client setup and result helpers

#![allow(dead_code)]

pub mod mock_cluster;

pub use mock_cluster::*;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use xcluster_consumer::config::{FaultInjection, OutputClientConfig};
use xcluster_consumer::output_client::{
    OutputClient, OutputClientContext, OutputResult, XClusterOutputClient,
};
use xcluster_consumer::record::{
    ChangeRecord, KeyRange, KvPair, Operation, RemoteTablet, TransactionState,
};
use xcluster_consumer::resilience::Bulkhead;
use xcluster_consumer::types::{ConsumerTabletInfo, HybridTime, ProducerTabletInfo, TabletId};

pub const TABLE_ID: &str = "table-1";
pub const STATUS_TABLE_ID: &str = "status-table";

pub fn producer_tablet() -> ProducerTabletInfo {
    ProducerTabletInfo {
        universe_uuid: "producer-universe".into(),
        stream_id: "stream-1".into(),
        tablet_id: "p-1".into(),
    }
}

pub fn consumer_tablet(table_id: &str) -> ConsumerTabletInfo {
    ConsumerTabletInfo {
        table_id: table_id.into(),
        tablet_id: "c-1".into(),
    }
}

/// Tablets split at 0x40 and 0x80.
pub fn three_tablets() -> Vec<RemoteTablet> {
    vec![
        RemoteTablet::new("t-a", KeyRange::new(vec![], vec![0x40])),
        RemoteTablet::new("t-b", KeyRange::new(vec![0x40], vec![0x80])),
        RemoteTablet::new("t-c", KeyRange::new(vec![0x80], vec![])),
    ]
}

// =============================================================================
// Record builders
// =============================================================================

pub fn write_record(key: &[u8], value: &[u8], time: u64) -> ChangeRecord {
    ChangeRecord::new(
        Operation::Write,
        HybridTime(time),
        vec![KvPair::new(key.to_vec(), value.to_vec())],
    )
}

pub fn delete_record(key: &[u8], time: u64) -> ChangeRecord {
    ChangeRecord::new(
        Operation::Delete,
        HybridTime(time),
        vec![KvPair::new(key.to_vec(), Vec::new())],
    )
}

pub fn txn_state(id: u8, tablets: &[&str]) -> TransactionState {
    TransactionState {
        transaction_id: vec![id; 16],
        tablets: tablets.iter().map(|t| t.to_string()).collect(),
    }
}

pub fn intent_record(key: &[u8], txn: u8, time: u64) -> ChangeRecord {
    write_record(key, b"intent", time).with_transaction(txn_state(txn, &[]))
}

pub fn created_record(txn: u8, time: u64) -> ChangeRecord {
    ChangeRecord::new(Operation::TransactionCreated, HybridTime(time), Vec::new())
        .with_transaction(txn_state(txn, &[]))
}

pub fn committed_record(txn: u8, producer_tablets: &[&str], time: u64) -> ChangeRecord {
    ChangeRecord::new(Operation::TransactionCommitted, HybridTime(time), Vec::new())
        .with_transaction(txn_state(txn, producer_tablets))
}

pub fn apply_record(start: &[u8], end: &[u8], txn: u8, time: u64) -> ChangeRecord {
    ChangeRecord::new(
        Operation::Apply {
            partition: KeyRange::new(start.to_vec(), end.to_vec()),
        },
        HybridTime(time),
        Vec::new(),
    )
    .with_transaction(txn_state(txn, &[]))
}

// =============================================================================
// Output client setup
// =============================================================================

pub struct OutputHarness {
    pub client: Arc<XClusterOutputClient>,
    pub results: mpsc::UnboundedReceiver<OutputResult>,
}

impl OutputHarness {
    /// Next result, failing the test after five seconds.
    pub async fn next_result(&mut self) -> OutputResult {
        tokio::time::timeout(Duration::from_secs(5), self.results.recv())
            .await
            .expect("apply result in time")
            .expect("result channel open")
    }

    /// Asserts no result arrives within `wait`.
    pub async fn assert_no_result(&mut self, wait: Duration) {
        if let Ok(Some(result)) = tokio::time::timeout(wait, self.results.recv()).await {
            panic!("unexpected apply result: {result:?}");
        }
    }
}

impl Drop for OutputHarness {
    fn drop(&mut self) {
        self.client.shutdown();
    }
}

pub fn spawn_output_client(
    local: Arc<MockLocalClient>,
    registry: Arc<MockRegistry>,
    table_id: &str,
    status_tablets: Vec<TabletId>,
    config: OutputClientConfig,
    faults: FaultInjection,
) -> OutputHarness {
    let (tx, rx) = mpsc::unbounded_channel();
    let context = OutputClientContext {
        producer_tablet: producer_tablet(),
        consumer_tablet: consumer_tablet(table_id),
        local_client: local,
        registry,
        worker_pool: Arc::new(Bulkhead::new(4)),
        global_transaction_status_tablets: status_tablets,
        last_compatible_consumer_schema_version: 0,
    };
    OutputHarness {
        client: Arc::new(XClusterOutputClient::spawn(context, config, faults, tx)),
        results: rx,
    }
}

/// Output client for a user table with default test config.
pub fn user_table_client(local: Arc<MockLocalClient>) -> OutputHarness {
    spawn_output_client(
        local,
        Arc::new(MockRegistry::new()),
        TABLE_ID,
        Vec::new(),
        OutputClientConfig::for_testing(),
        FaultInjection::default(),
    )
}
