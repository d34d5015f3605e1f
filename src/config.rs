//! Configuration for the xCluster consumer.
//!
//! Configuration is assembled once by the host and passed by value to
//! [`XClusterPoller::spawn()`](crate::poller::XClusterPoller::spawn) and
//! [`XClusterOutputClient::spawn()`](crate::output_client::XClusterOutputClient::spawn).
//! Nothing here is process-global or mutable after construction.
//!
//! # Quick Start
//!
//! ```rust
//! use xcluster_consumer::config::{XClusterConfig, OutputClientConfig};
//!
//! let config = XClusterConfig {
//!     output_client: OutputClientConfig {
//!         force_remote_tserver: true,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! XClusterConfig
//! ├── poller: PollerConfig               # Poll loop pacing and backoff
//! ├── output_client: OutputClientConfig  # Timeouts, routing, write strategy
//! ├── fault_injection: FaultInjection    # Test-only failure switches
//! └── worker_pool_size: usize            # Shared continuation pool
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "poller": { "idle_delay_ms": 250, "failure_backoff_max_ms": 10000 },
//!   "output_client": {
//!     "write_rpc_timeout_ms": 15000,
//!     "write_strategy": "per_record",
//!     "enable_replicate_transaction_status_table": true
//!   },
//!   "worker_pool_size": 32
//! }
//! ```

use crate::error::{Result, XClusterError};
use crate::resilience::RetryConfig;
use crate::write_strategy::WriteStrategyKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything one poller/output-client pair needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XClusterConfig {
    #[serde(default)]
    pub poller: PollerConfig,

    #[serde(default)]
    pub output_client: OutputClientConfig,

    #[serde(default)]
    pub fault_injection: FaultInjection,

    /// Permits in the shared continuation pool.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_worker_pool_size() -> usize {
    64
}

impl Default for XClusterConfig {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            output_client: OutputClientConfig::default(),
            fault_injection: FaultInjection::default(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

impl XClusterConfig {
    /// Short delays and timeouts so tests run fast.
    pub fn for_testing() -> Self {
        Self {
            poller: PollerConfig::for_testing(),
            output_client: OutputClientConfig::for_testing(),
            fault_injection: FaultInjection::default(),
            worker_pool_size: 8,
        }
    }

    /// Parse a JSON document, filling omitted fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| XClusterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(XClusterError::Config(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.output_client.max_records_per_write_request == 0 {
            return Err(XClusterError::Config(
                "max_records_per_write_request must be at least 1".to_string(),
            ));
        }
        if self.poller.failure_backoff_base_ms > self.poller.failure_backoff_max_ms {
            return Err(XClusterError::Config(format!(
                "failure_backoff_base_ms ({}) exceeds failure_backoff_max_ms ({})",
                self.poller.failure_backoff_base_ms, self.poller.failure_backoff_max_ms
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PollerConfig: poll loop pacing
// ═══════════════════════════════════════════════════════════════════════════════

/// Poll loop pacing and failure backoff.
///
/// Before every poll the poller waits the largest of: the fixed polling
/// delay, the idle delay (after `max_idle_polls` empty applies), and the
/// failure backoff for the current failure count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Fixed delay between polls.
    #[serde(default)]
    pub polling_delay_ms: u64,

    /// Delay once the producer has been idle for `max_idle_polls` polls.
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,

    #[serde(default = "default_max_idle_polls")]
    pub max_idle_polls: u32,

    /// Backoff after the first failure; doubles per consecutive failure.
    #[serde(default = "default_failure_backoff_base_ms")]
    pub failure_backoff_base_ms: u64,

    #[serde(default = "default_failure_backoff_max_ms")]
    pub failure_backoff_max_ms: u64,

    /// Deadline for one "get changes" call.
    #[serde(default = "default_rpc_timeout_ms")]
    pub read_rpc_timeout_ms: u64,
}

fn default_idle_delay_ms() -> u64 {
    100
}

fn default_max_idle_polls() -> u32 {
    3
}

fn default_failure_backoff_base_ms() -> u64 {
    1
}

fn default_failure_backoff_max_ms() -> u64 {
    65_536
}

fn default_rpc_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            polling_delay_ms: 0,
            idle_delay_ms: default_idle_delay_ms(),
            max_idle_polls: default_max_idle_polls(),
            failure_backoff_base_ms: default_failure_backoff_base_ms(),
            failure_backoff_max_ms: default_failure_backoff_max_ms(),
            read_rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl PollerConfig {
    pub fn for_testing() -> Self {
        Self {
            polling_delay_ms: 0,
            idle_delay_ms: 5,
            max_idle_polls: 3,
            failure_backoff_base_ms: 1,
            failure_backoff_max_ms: 20,
            read_rpc_timeout_ms: 500,
        }
    }

    pub fn polling_delay(&self) -> Duration {
        Duration::from_millis(self.polling_delay_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn read_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.read_rpc_timeout_ms)
    }

    /// Backoff schedule for consecutive failures.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(self.failure_backoff_base_ms),
            max_delay: Duration::from_millis(self.failure_backoff_max_ms),
            backoff_factor: 2.0,
        }
    }

    /// Delay before the next poll.
    pub fn delay_before_poll(&self, idle_polls: u32, consecutive_failures: u32) -> Duration {
        let mut delay = self.polling_delay();
        if idle_polls >= self.max_idle_polls {
            delay = delay.max(self.idle_delay());
        }
        delay.max(self.retry_config().backoff_for_failures(consecutive_failures))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OutputClientConfig: routing and write RPCs
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputClientConfig {
    /// Deadline for tablet lookups.
    #[serde(default = "default_rpc_timeout_ms")]
    pub read_rpc_timeout_ms: u64,

    /// Deadline for one write RPC.
    #[serde(default = "default_rpc_timeout_ms")]
    pub write_rpc_timeout_ms: u64,

    /// Disable the local tablet shortcut even when the registry offers it.
    #[serde(default)]
    pub force_remote_tserver: bool,

    #[serde(default)]
    pub write_strategy: WriteStrategyKind,

    /// Seal a batched write request once it holds this many mutations.
    #[serde(default = "default_max_records_per_write_request")]
    pub max_records_per_write_request: usize,

    /// Tag transactional intents with their status tablet.
    #[serde(default)]
    pub enable_replicate_transaction_status_table: bool,

    /// Write straight to the mapped consumer tablet instead of routing by
    /// key. Only valid when producer and consumer partitioning match.
    #[serde(default)]
    pub use_local_tserver: bool,
}

fn default_max_records_per_write_request() -> usize {
    1024
}

impl Default for OutputClientConfig {
    fn default() -> Self {
        Self {
            read_rpc_timeout_ms: default_rpc_timeout_ms(),
            write_rpc_timeout_ms: default_rpc_timeout_ms(),
            force_remote_tserver: false,
            write_strategy: WriteStrategyKind::default(),
            max_records_per_write_request: default_max_records_per_write_request(),
            enable_replicate_transaction_status_table: false,
            use_local_tserver: false,
        }
    }
}

impl OutputClientConfig {
    pub fn for_testing() -> Self {
        Self {
            read_rpc_timeout_ms: 500,
            write_rpc_timeout_ms: 500,
            ..Self::default()
        }
    }

    pub fn read_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.read_rpc_timeout_ms)
    }

    pub fn write_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.write_rpc_timeout_ms)
    }

    /// Whether records go straight to the mapped consumer tablet.
    pub fn routes_to_local_tablet(&self) -> bool {
        self.use_local_tserver && !self.force_remote_tserver
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FaultInjection: test-only switches
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure switches for tests. All off by default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultInjection {
    /// Fail any batch targeting the transaction status table with `TryAgain`.
    #[serde(default)]
    pub disable_transaction_status_table_replication: bool,

    /// Fail SPLIT_OP handling with `Internal` before the control plane is told.
    #[serde(default)]
    pub fail_after_process_split_op: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xcluster_config_default() {
        let config = XClusterConfig::default();
        assert_eq!(config.worker_pool_size, 64);
        assert_eq!(config.poller.idle_delay_ms, 100);
        assert_eq!(config.poller.max_idle_polls, 3);
        assert_eq!(config.output_client.write_rpc_timeout(), Duration::from_secs(30));
        assert_eq!(config.output_client.write_strategy, WriteStrategyKind::Batched);
        assert_eq!(config.fault_injection, FaultInjection::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = XClusterConfig::from_json(
            r#"{
                "output_client": { "write_strategy": "per_record", "force_remote_tserver": true },
                "fault_injection": { "fail_after_process_split_op": true }
            }"#,
        )
        .unwrap();

        assert_eq!(config.output_client.write_strategy, WriteStrategyKind::PerRecord);
        assert!(config.output_client.force_remote_tserver);
        assert_eq!(config.output_client.max_records_per_write_request, 1024);
        assert_eq!(config.output_client.read_rpc_timeout_ms, 30_000);
        assert!(config.fault_injection.fail_after_process_split_op);
        assert!(!config.fault_injection.disable_transaction_status_table_replication);
        assert_eq!(config.poller.failure_backoff_max_ms, 65_536);
        assert_eq!(config.worker_pool_size, 64);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = XClusterConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, XClusterError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let err = XClusterConfig::from_json(r#"{ "worker_pool_size": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("worker_pool_size"));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = XClusterConfig::default();
        config.poller.failure_backoff_base_ms = 100;
        config.poller.failure_backoff_max_ms = 10;
        assert!(matches!(config.validate(), Err(XClusterError::Config(_))));
    }

    #[test]
    fn test_local_tablet_routing() {
        let mut config = OutputClientConfig::default();
        assert!(!config.routes_to_local_tablet());

        config.use_local_tserver = true;
        assert!(config.routes_to_local_tablet());

        config.force_remote_tserver = true;
        assert!(!config.routes_to_local_tablet());
    }

    #[test]
    fn test_delay_before_poll() {
        let config = PollerConfig::default();

        // Healthy and busy: poll immediately
        assert_eq!(config.delay_before_poll(0, 0), Duration::ZERO);

        // Idle producer
        assert_eq!(config.delay_before_poll(3, 0), Duration::from_millis(100));

        // Backoff dominates once large enough
        assert_eq!(config.delay_before_poll(0, 1), Duration::from_millis(1));
        assert_eq!(config.delay_before_poll(3, 9), Duration::from_millis(256));
        assert_eq!(config.delay_before_poll(0, 64), Duration::from_millis(65_536));
    }

    #[test]
    fn test_polling_delay_is_floor() {
        let config = PollerConfig {
            polling_delay_ms: 50,
            ..PollerConfig::default()
        };
        assert_eq!(config.delay_before_poll(0, 0), Duration::from_millis(50));
        assert_eq!(config.delay_before_poll(0, 2), Duration::from_millis(50));
    }

    #[test]
    fn test_for_testing_is_fast() {
        let config = XClusterConfig::for_testing();
        assert!(config.poller.read_rpc_timeout() <= Duration::from_secs(1));
        assert!(config.output_client.write_rpc_timeout() <= Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = XClusterConfig::for_testing();
        config.output_client.enable_replicate_transaction_status_table = true;
        config.fault_injection.disable_transaction_status_table_replication = true;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: XClusterConfig = serde_json::from_str(&json).unwrap();

        assert!(parsed.output_client.enable_replicate_transaction_status_table);
        assert!(parsed.fault_injection.disable_transaction_status_table_replication);
        assert_eq!(parsed.worker_pool_size, 8);
        assert_eq!(parsed.poller.idle_delay_ms, 5);
    }
}
