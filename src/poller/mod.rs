// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Poller: the per-tablet poll loop.
//!
//! One poller runs per (producer tablet, consumer tablet) pair. Its task
//! owns the replication position and failure counters and cycles through:
//!
//! 1. Wait: the largest of polling delay, idle delay and failure backoff
//! 2. Poll: "get changes" from the last acknowledged [`OpId`] (deadline-bound)
//! 3. Apply: hand the batch to the [`OutputClient`] and await its result
//! 4. Bookkeeping: advance the position, raise safe time, gate on schema
//!
//! # Schema Gating
//!
//! When a batch result carries `wait_for_version > 0`, the loop parks in
//! [`PollerState::WaitingForSchema`] until [`XClusterPoller::set_schema_version`]
//! raises the validated version to at least that value.
//!
//! # Shutdown
//!
//! [`XClusterPoller::shutdown`] is idempotent. It flips an atomic flag,
//! signals the loop through a `watch` channel (dropping any in-flight poll)
//! and shuts the output client down, so no further result is delivered.

mod types;

pub use types::PollerState;

use crate::client::{with_deadline, ProducerClient};
use crate::config::PollerConfig;
use crate::error::{Result, XClusterError};
use crate::metrics;
use crate::output_client::{OutputClient, OutputResult};
use crate::record::{ChangeBatch, GetChangesRequest};
use crate::types::{ConsumerTabletInfo, HybridTime, OpId, ProducerTabletInfo, SchemaVersion};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Everything a poller needs besides its configuration.
pub struct PollerContext {
    pub producer_tablet: ProducerTabletInfo,
    pub consumer_tablet: ConsumerTabletInfo,
    pub producer_client: Arc<dyn ProducerClient>,
    pub output_client: Arc<dyn OutputClient>,
    /// Result channel the output client reports on.
    pub results: mpsc::UnboundedReceiver<OutputResult>,
    /// Position to resume polling from.
    pub initial_checkpoint: OpId,
    pub validated_schema_version: SchemaVersion,
}

/// State read outside the poll task.
struct PollerShared {
    is_shutdown: AtomicBool,
    /// False while paused for schema gating.
    is_polling: AtomicBool,
    /// Read-mostly; kept apart from the loop's own state.
    safe_time: RwLock<HybridTime>,
}

impl PollerShared {
    fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    fn safe_time(&self) -> HybridTime {
        *self.safe_time.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raise safe time; never moves it backwards.
    fn update_safe_time(&self, new_time: HybridTime) -> bool {
        let mut guard = self
            .safe_time
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if new_time > *guard {
            *guard = new_time;
            true
        } else {
            false
        }
    }
}

/// Handle to a running poller.
pub struct XClusterPoller {
    producer_tablet: ProducerTabletInfo,
    consumer_tablet: ConsumerTabletInfo,
    shared: Arc<PollerShared>,
    output_client: Arc<dyn OutputClient>,
    validated_schema_version: watch::Sender<SchemaVersion>,
    state_rx: watch::Receiver<PollerState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl XClusterPoller {
    /// Start polling. Must be called inside a tokio runtime.
    pub fn spawn(config: PollerConfig, context: PollerContext) -> Self {
        let shared = Arc::new(PollerShared {
            is_shutdown: AtomicBool::new(false),
            is_polling: AtomicBool::new(true),
            safe_time: RwLock::new(HybridTime::MIN),
        });
        let (state_tx, state_rx) = watch::channel(PollerState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (validated_tx, validated_rx) = watch::channel(context.validated_schema_version);

        let span = info_span!(
            "xcluster_poller",
            producer_tablet = %context.producer_tablet.tablet_id,
            consumer_tablet = %context.consumer_tablet.tablet_id,
            stream_id = %context.producer_tablet.stream_id,
        );

        let poll_loop = PollLoop {
            producer_tablet: context.producer_tablet.clone(),
            producer_client: context.producer_client,
            output_client: Arc::clone(&context.output_client),
            results: context.results,
            config,
            op_id: context.initial_checkpoint,
            poll_failures: 0,
            apply_failures: 0,
            idle_polls: 0,
            wait_for_version: 0,
            shared: Arc::clone(&shared),
            state_tx,
            shutdown_rx,
            validated_rx,
        };
        let task = tokio::spawn(poll_loop.run().instrument(span));

        Self {
            producer_tablet: context.producer_tablet,
            consumer_tablet: context.consumer_tablet,
            shared,
            output_client: context.output_client,
            validated_schema_version: validated_tx,
            state_rx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn producer_tablet(&self) -> &ProducerTabletInfo {
        &self.producer_tablet
    }

    pub fn consumer_tablet_info(&self) -> &ConsumerTabletInfo {
        &self.consumer_tablet
    }

    pub fn state(&self) -> PollerState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<PollerState> {
        self.state_rx.clone()
    }

    /// False while polling is paused for a schema change.
    pub fn is_polling(&self) -> bool {
        self.shared.is_polling.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Producer safe time as of the last successfully applied batch.
    pub fn get_safe_time(&self) -> HybridTime {
        self.shared.safe_time()
    }

    pub fn validated_schema_version(&self) -> SchemaVersion {
        *self.validated_schema_version.borrow()
    }

    /// Record that the consumer schema reached `current_version`.
    ///
    /// Resumes polling if it was paused for a version at or below it.
    pub fn set_schema_version(
        &self,
        current_version: SchemaVersion,
        last_compatible_consumer_schema_version: SchemaVersion,
    ) {
        if self.is_shutdown() {
            return;
        }
        let raised = self.validated_schema_version.send_if_modified(|validated| {
            if current_version > *validated {
                *validated = current_version;
                true
            } else {
                false
            }
        });
        if raised {
            debug!(
                producer_tablet = %self.producer_tablet.tablet_id,
                schema_version = current_version,
                "Validated schema version raised"
            );
        }
        self.output_client
            .set_last_compatible_consumer_schema_version(last_compatible_consumer_schema_version);
    }

    /// Stop polling. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(producer_tablet = %self.producer_tablet.tablet_id, "Shutting down poller");
        self.shutdown_tx.send_replace(true);
        self.output_client.shutdown();
    }

    /// Shut down and wait for the poll task to exit.
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Poll task panicked during shutdown");
            }
        }
    }
}

impl Drop for XClusterPoller {
    fn drop(&mut self) {
        debug_assert!(
            self.is_shutdown() || std::thread::panicking(),
            "XClusterPoller dropped without shutdown()"
        );
        self.shutdown();
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

enum PollOutcome {
    Batch(ChangeBatch),
    Failed,
    Shutdown,
}

/// The poll task. Owns the position and failure counters.
struct PollLoop {
    producer_tablet: ProducerTabletInfo,
    producer_client: Arc<dyn ProducerClient>,
    output_client: Arc<dyn OutputClient>,
    results: mpsc::UnboundedReceiver<OutputResult>,
    config: PollerConfig,
    op_id: OpId,
    poll_failures: u32,
    apply_failures: u32,
    idle_polls: u32,
    wait_for_version: SchemaVersion,
    shared: Arc<PollerShared>,
    state_tx: watch::Sender<PollerState>,
    shutdown_rx: watch::Receiver<bool>,
    validated_rx: watch::Receiver<SchemaVersion>,
}

impl PollLoop {
    async fn run(mut self) {
        info!(op_id = %self.op_id, "Poller started");

        while !self.shared.is_shutdown() {
            if self.wait_for_version > 0 && !self.wait_for_schema().await {
                break;
            }

            let failures = self.poll_failures.max(self.apply_failures);
            let delay = self.config.delay_before_poll(self.idle_polls, failures);
            if !delay.is_zero() && !self.sleep(delay).await {
                break;
            }

            let batch = match self.poll().await {
                PollOutcome::Batch(batch) => batch,
                PollOutcome::Failed => continue,
                PollOutcome::Shutdown => break,
            };

            let safe_time = batch.safe_hybrid_time;
            let Some(result) = self.apply(batch).await else {
                break;
            };
            self.handle_apply_changes(result, safe_time);
            self.set_state(PollerState::Idle);
        }

        self.set_state(PollerState::Shutdown);
        info!(op_id = %self.op_id, "Poller stopped");
    }

    fn set_state(&self, state: PollerState) {
        self.state_tx.send_replace(state);
        metrics::set_poller_state(&self.producer_tablet.tablet_id, &state.to_string());
    }

    /// Returns false if shutdown interrupted the sleep.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = shutdown_signalled(self.shutdown_rx.clone()) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn poll(&mut self) -> PollOutcome {
        if self.shared.is_shutdown() {
            return PollOutcome::Shutdown;
        }
        self.set_state(PollerState::Polling);

        let request = GetChangesRequest {
            stream_id: self.producer_tablet.stream_id.clone(),
            tablet_id: self.producer_tablet.tablet_id.clone(),
            from_checkpoint: self.op_id,
        };
        let started = Instant::now();
        let timeout = self.config.read_rpc_timeout();

        let result = tokio::select! {
            biased;
            _ = shutdown_signalled(self.shutdown_rx.clone()) => return PollOutcome::Shutdown,
            result = with_deadline("GetChanges", timeout, self.producer_client.get_changes(request)) => result,
        };

        metrics::record_poll(&self.producer_tablet.tablet_id, result.is_ok(), started.elapsed());
        match self.handle_poll(result) {
            Some(batch) => PollOutcome::Batch(batch),
            None => PollOutcome::Failed,
        }
    }

    fn handle_poll(&mut self, result: Result<ChangeBatch>) -> Option<ChangeBatch> {
        let result = result.and_then(|batch| match batch.checkpoint {
            Some(_) => Ok(batch),
            None => Err(XClusterError::InvalidArgument(
                "get changes response carries no checkpoint".to_string(),
            )),
        });

        match result {
            Ok(batch) => {
                self.poll_failures = self.poll_failures.saturating_sub(2);
                metrics::set_poll_failures(&self.producer_tablet.tablet_id, self.poll_failures);
                metrics::record_records_received(&self.producer_tablet.tablet_id, batch.len());
                debug!(records = batch.len(), "Received changes");
                Some(batch)
            }
            Err(e) => {
                self.poll_failures = self.poll_failures.saturating_add(1);
                metrics::set_poll_failures(&self.producer_tablet.tablet_id, self.poll_failures);
                warn!(error = %e, failures = self.poll_failures, "Poll failed");
                None
            }
        }
    }

    /// Hand the batch over and wait for its result; None on shutdown.
    async fn apply(&mut self, batch: ChangeBatch) -> Option<OutputResult> {
        self.set_state(PollerState::Applying);
        if let Err(e) = self.output_client.apply_changes(batch) {
            if !self.shared.is_shutdown() {
                error!(error = %e, "Output client rejected batch");
            }
            return None;
        }

        tokio::select! {
            biased;
            _ = shutdown_signalled(self.shutdown_rx.clone()) => None,
            result = self.results.recv() => result,
        }
    }

    fn handle_apply_changes(&mut self, result: OutputResult, safe_time: Option<HybridTime>) {
        let tablet = self.producer_tablet.tablet_id.clone();

        if let Err(e) = &result.status {
            // Retry the whole cycle from the last acknowledged position.
            self.apply_failures = self.apply_failures.saturating_add(1);
            metrics::set_apply_failures(&tablet, self.apply_failures);
            if e.is_retryable() {
                warn!(error = %e, failures = self.apply_failures, op_id = %self.op_id, "Apply failed, will retry");
            } else {
                error!(error = %e, failures = self.apply_failures, op_id = %self.op_id, "Apply failed, will retry");
            }
            return;
        }

        self.apply_failures = self.apply_failures.saturating_sub(2);
        metrics::set_apply_failures(&tablet, self.apply_failures);
        self.op_id = result.last_applied_op_id;

        if result.processed_record_count == 0 {
            self.idle_polls = self.idle_polls.saturating_add(1);
            metrics::record_idle_poll(&tablet);
        } else {
            self.idle_polls = 0;
        }

        if let Some(safe_time) = safe_time {
            if self.shared.update_safe_time(safe_time) {
                metrics::set_safe_time(&tablet, safe_time.as_u64());
            }
        }

        if result.wait_for_version > 0 {
            self.wait_for_version = result.wait_for_version;
            metrics::record_schema_wait(&tablet, result.wait_for_version);
        }
        debug!(
            op_id = %self.op_id,
            records = result.processed_record_count,
            "Applied changes"
        );
    }

    /// Park until the validated schema reaches `wait_for_version`.
    /// Returns false on shutdown.
    async fn wait_for_schema(&mut self) -> bool {
        let target = self.wait_for_version;
        self.shared.is_polling.store(false, Ordering::Release);
        self.set_state(PollerState::WaitingForSchema);
        info!(schema_version = target, "Waiting for consumer schema");

        let mut validated_rx = self.validated_rx.clone();
        let reached = tokio::select! {
            biased;
            _ = shutdown_signalled(self.shutdown_rx.clone()) => false,
            reached = schema_reaches(&mut validated_rx, target) => reached,
        };
        if !reached {
            return false;
        }

        self.wait_for_version = 0;
        self.shared.is_polling.store(true, Ordering::Release);
        self.set_state(PollerState::Idle);
        info!(schema_version = target, "Consumer schema caught up, resuming polling");
        true
    }
}

async fn schema_reaches(validated_rx: &mut watch::Receiver<SchemaVersion>, target: SchemaVersion) -> bool {
    validated_rx.wait_for(|version| *version >= target).await.is_ok()
}
