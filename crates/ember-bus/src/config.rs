//! Bus construction options.

use std::sync::Arc;
use std::time::Duration;

use ember_core::{BusLogger, SchemaRegistry};
use ember_store_core::{PayloadFormat, TxStore};

/// Default capacity of the buffered dispatch queue.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Default worker count in buffered mode.
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Default bound on causation-path depth.
pub const DEFAULT_MAX_DEPTH: usize = 20;
/// Default per-handler deadline on the transactional path.
pub const DEFAULT_TX_HANDLER_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default attempt budget per handler row.
pub const DEFAULT_HANDLER_MAX_RETRIES: u32 = 3;
/// Default delay before a retryable row becomes eligible again.
pub const DEFAULT_HANDLER_BACKOFF: Duration = Duration::from_millis(1_000);
/// Default retention window for terminal transactions.
pub const DEFAULT_TX_RETENTION: Duration = Duration::from_millis(7 * 24 * 60 * 60 * 1_000);
/// Default cadence of the retention sweep.
pub const DEFAULT_TX_CLEANUP_INTERVAL: Duration = Duration::from_millis(60 * 60 * 1_000);
/// Default cadence of the worker poll loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Default bound on the graceful-shutdown wait.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(10_000);

/// How the fire-and-forget path schedules handler tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Every task runs on its own spawned task; submission never blocks.
    #[default]
    Unlimited,
    /// Bounded FIFO drained by a fixed worker pool. A full queue rejects
    /// the publish with `buffer_full` - the backpressure signal.
    Buffered {
        /// Queue capacity.
        buffer_size: usize,
        /// Worker task count.
        concurrency: usize,
    },
}

impl DispatchMode {
    /// Buffered mode with the default queue size and worker count.
    pub fn buffered() -> Self {
        Self::Buffered {
            buffer_size: DEFAULT_BUFFER_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Options accepted by [`Bus::new`](crate::Bus::new).
///
/// A schema registry is mandatory; everything else defaults per the
/// constants above. Retention cleanup runs only while both `tx_retention`
/// and `tx_cleanup_interval` are set (they are, by default).
pub struct BusConfig {
    /// Dispatch scheduling model.
    pub mode: DispatchMode,
    /// Bound on causation-path depth for derived envelopes.
    pub max_depth: usize,
    /// Structured log sink; tracing-backed when `None`.
    pub logger: Option<Arc<dyn BusLogger>>,
    /// Validator registry. Required.
    pub schema_registry: Option<SchemaRegistry>,
    /// Transactional store backend; `transact` is unavailable without one.
    pub tx_store: Option<Arc<dyn TxStore>>,
    /// How payloads round-trip through the store.
    pub payload_format: PayloadFormat,
    /// Per-handler deadline on the transactional path.
    pub tx_handler_timeout: Duration,
    /// Attempt budget per handler row.
    pub handler_max_retries: u32,
    /// Delay before a retryable row becomes eligible again.
    pub handler_backoff: Duration,
    /// Retention window for terminal transactions; `None` disables cleanup.
    pub tx_retention: Option<Duration>,
    /// Cadence of the retention sweep; `None` disables cleanup.
    pub tx_cleanup_interval: Option<Duration>,
    /// Cadence of the worker poll loop.
    pub poll_interval: Duration,
    /// Bound on the graceful-shutdown wait in `close`.
    pub shutdown_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            logger: None,
            schema_registry: None,
            tx_store: None,
            payload_format: PayloadFormat::default(),
            tx_handler_timeout: DEFAULT_TX_HANDLER_TIMEOUT,
            handler_max_retries: DEFAULT_HANDLER_MAX_RETRIES,
            handler_backoff: DEFAULT_HANDLER_BACKOFF,
            tx_retention: Some(DEFAULT_TX_RETENTION),
            tx_cleanup_interval: Some(DEFAULT_TX_CLEANUP_INTERVAL),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl BusConfig {
    /// Start from a registry, leaving every other knob at its default.
    pub fn with_registry(registry: SchemaRegistry) -> Self {
        Self {
            schema_registry: Some(registry),
            ..Default::default()
        }
    }
}

/// Runtime knobs the bus keeps after construction.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub max_depth: usize,
    pub payload_format: PayloadFormat,
    pub tx_handler_timeout: Duration,
    pub handler_max_retries: u32,
    pub handler_backoff: Duration,
    pub tx_retention: Option<Duration>,
    pub tx_cleanup_interval: Option<Duration>,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Settings {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            payload_format: config.payload_format,
            tx_handler_timeout: config.tx_handler_timeout,
            handler_max_retries: config.handler_max_retries,
            handler_backoff: config.handler_backoff,
            tx_retention: config.tx_retention,
            tx_cleanup_interval: config.tx_cleanup_interval,
            poll_interval: config.poll_interval,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = BusConfig::default();
        assert_eq!(config.mode, DispatchMode::Unlimited);
        assert_eq!(config.max_depth, 20);
        assert_eq!(config.tx_handler_timeout, Duration::from_secs(10));
        assert_eq!(config.handler_max_retries, 3);
        assert_eq!(config.handler_backoff, Duration::from_secs(1));
        assert_eq!(config.tx_retention, Some(Duration::from_secs(7 * 24 * 3600)));
        assert_eq!(config.tx_cleanup_interval, Some(Duration::from_secs(3600)));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn buffered_defaults() {
        match DispatchMode::buffered() {
            DispatchMode::Buffered {
                buffer_size,
                concurrency,
            } => {
                assert_eq!(buffer_size, 1024);
                assert_eq!(concurrency, 4);
            }
            DispatchMode::Unlimited => panic!("expected buffered mode"),
        }
    }
}
