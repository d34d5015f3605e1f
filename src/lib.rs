//! # xCluster Consumer
//!
//! Consumer side of asynchronous cross-cluster CDC replication.
//!
//! ## Architecture
//!
//! One [`XClusterPoller`] runs per replicated producer tablet. It pulls
//! change batches from the producer and hands each to its
//! [`XClusterOutputClient`], which routes every record to the consumer
//! tablets that must receive it and sends the writes:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           xcluster-consumer                              │
//! │                                                                          │
//! │  ┌──────────────┐ batch  ┌──────────────────┐ records ┌───────────────┐  │
//! │  │ Poller       │───────►│ OutputClient     │────────►│ WriteStrategy │  │
//! │  │ (per tablet) │◄───────│ (actor)          │◄────────│ (buffering)   │  │
//! │  └──────┬───────┘ result └────────┬─────────┘ requests└───────────────┘  │
//! │         │ get_changes             │ write / lookup / txn coordinator     │
//! │         ▼                         ▼                                      │
//! │  ┌──────────────┐        ┌────────────────────────────────────────────┐  │
//! │  │ Producer     │        │ LocalClient + ConsumerRegistry             │  │
//! │  └──────────────┘        └────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The producer, the local universe and the transaction coordinator are
//! reached through the traits in [`client`]; this crate ships no RPC layer.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use xcluster_consumer::{
//!     OutputClientContext, PollerContext, XClusterConfig, XClusterOutputClient, XClusterPoller,
//! };
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! let config = XClusterConfig::default();
//! let (results_tx, results_rx) = mpsc::unbounded_channel();
//! let output = Arc::new(XClusterOutputClient::spawn(
//!     output_context,
//!     config.output_client.clone(),
//!     config.fault_injection.clone(),
//!     results_tx,
//! ));
//! let poller = XClusterPoller::spawn(config.poller.clone(), PollerContext {
//!     producer_tablet,
//!     consumer_tablet,
//!     producer_client,
//!     output_client: output,
//!     results: results_rx,
//!     initial_checkpoint,
//!     validated_schema_version,
//! });
//!
//! // On schema change or teardown
//! poller.set_schema_version(new_version, new_version);
//! poller.shutdown_and_wait().await;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod output_client;
pub mod poller;
pub mod record;
pub mod resilience;
pub mod types;
pub mod write_strategy;

// Re-exports for convenience
pub use client::{ConsumerRegistry, LocalClient, ProducerClient, TransactionCoordinator};
pub use config::{FaultInjection, OutputClientConfig, PollerConfig, XClusterConfig};
pub use error::{Result, XClusterError};
pub use output_client::{OutputClient, OutputClientContext, OutputResult, XClusterOutputClient};
pub use poller::{PollerContext, PollerState, XClusterPoller};
pub use record::{ChangeBatch, ChangeRecord, Operation};
pub use resilience::{Bulkhead, RetryConfig};
pub use types::{ConsumerTabletInfo, HybridTime, OpId, ProducerTabletInfo, SchemaVersion, TabletId};
pub use write_strategy::{WriteStrategy, WriteStrategyKind};
