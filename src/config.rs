use std::time::Duration;

use rand::Rng;

/// Backoff schedule for mutations that failed to push.
///
/// Delays grow as `base_delay * multiplier^retry_count`, capped at
/// `max_delay`. Once `max_retries` is reached the mutation is discarded
/// instead of rescheduled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Spread each delay by ±12.5% to avoid retry stampedes.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            multiplier: 2,
            max_delay: Duration::from_secs(3600),
            max_retries: 8,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = self
            .base_delay
            .as_secs()
            .saturating_mul((self.multiplier as u64).saturating_pow(retry_count));
        let capped = exp.min(self.max_delay.as_secs());

        let secs = if self.jitter && capped > 0 {
            let span = (capped / 8).max(1);
            rand::thread_rng()
                .gen_range(capped.saturating_sub(span)..=capped + span)
                .min(self.max_delay.as_secs())
        } else {
            capped
        };

        Duration::from_secs(secs)
    }
}

/// Tunables for the whole engine. `Default` gives sensible values for a
/// client syncing every minute over an unreliable link; the `with_*`
/// builders override individual knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Minimum time a connectivity state must hold before an event is emitted.
    pub debounce_window: Duration,
    /// Per-request timeout applied to every remote push and pull.
    pub request_timeout: Duration,
    /// Maximum number of remote changes fetched per pull page.
    pub pull_batch_size: usize,
    /// Upper bound on a single write payload; larger writes are rejected.
    pub max_payload_bytes: usize,
    pub auto_sync_interval: Duration,
    pub auto_sync_enabled: bool,
    /// Start a session when connectivity comes back.
    pub sync_on_reconnect: bool,
    /// How long confirmed-deleted tombstones are kept before purging.
    pub tombstone_retention: Duration,
    /// Capacity of the event and change broadcast channels.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            debounce_window: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            pull_batch_size: 500,
            max_payload_bytes: 1024 * 1024, // 1MB
            auto_sync_interval: Duration::from_secs(60),
            auto_sync_enabled: true,
            sync_on_reconnect: true,
            tombstone_retention: Duration::from_secs(30 * 24 * 3600), // 30 days
            event_buffer: 100,
        }
    }
}

impl EngineConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size;
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn with_auto_sync_interval(mut self, interval: Duration) -> Self {
        self.auto_sync_interval = interval;
        self.auto_sync_enabled = true;
        self
    }

    pub fn with_tombstone_retention_days(mut self, days: u64) -> Self {
        self.tombstone_retention = Duration::from_secs(days * 24 * 3600);
        self
    }

    /// Disable every automatic trigger; sessions start only on `sync()`.
    pub fn manual_sync_only(mut self) -> Self {
        self.auto_sync_enabled = false;
        self.sync_on_reconnect = false;
        self
    }
}
