//! Tunables for the device shadow.

use std::time::Duration;

/// Configuration for one device shadow.
///
/// The defaults are the protocol-mandated values; tests narrow them to keep
/// paused-clock runs short.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Minimum report interval requested on subscribe, in seconds.
    pub min_report_interval_secs: u16,
    /// Lower clamp for the subscription max report interval.
    pub max_report_interval_floor: Duration,
    /// Upper clamp for the subscription max report interval.
    pub max_report_interval_ceiling: Duration,
    /// How long a subscription attempt may run before the device is
    /// publicly marked unreachable.
    pub unreachable_timeout: Duration,
    /// Ceiling of the resubscribe exponential backoff.
    pub backoff_ceiling: Duration,
    /// Minimum age of the last subscription failure before a client read
    /// triggers an out-of-band resubscribe attempt.
    pub read_through_retry_guard: Duration,
    /// Minimum delay before the next expected-value sweep.
    pub expected_sweep_min_delay: Duration,
    /// Delay between subscription establishment and the first time-sync.
    pub initial_time_sync_delay: Duration,
    /// Automatic retries for a failed read operation.
    pub read_retry_budget: u32,
    /// Automatic retries for a busy-rejected invoke.
    pub invoke_retry_budget: u32,
    /// Maximum attribute paths batched into one read request.
    pub read_batch_limit: usize,
    /// Timed-invoke timeout supplied when the command requires one and the
    /// caller gave none, in milliseconds.
    pub default_timed_invoke_timeout_ms: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            min_report_interval_secs: 0,
            max_report_interval_floor: Duration::from_secs(60),
            max_report_interval_ceiling: Duration::from_secs(3600),
            unreachable_timeout: Duration::from_secs(10),
            backoff_ceiling: Duration::from_secs(3600),
            read_through_retry_guard: Duration::from_secs(600),
            expected_sweep_min_delay: Duration::from_millis(100),
            initial_time_sync_delay: Duration::from_secs(120),
            read_retry_budget: 2,
            invoke_retry_budget: 5,
            read_batch_limit: 9,
            default_timed_invoke_timeout_ms: 10_000,
        }
    }
}

/// Unit-test hooks injected at construction. Production passes the default,
/// which is a no-op.
#[derive(Debug, Clone, Default)]
pub struct TestOverrides {
    /// Skip installing expected values on write/invoke.
    pub skip_expected_values: bool,
    /// Never establish a subscription; reads fall through to the queue.
    pub skip_subscription: bool,
    /// Override the subscription max report interval.
    pub max_interval_override: Option<Duration>,
}
