//! Core configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the core can start with zero
//! configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Ratchet and key-store limits.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Largest counter jump a single incoming message may cause.
    /// Env: `SIGIL_MAX_SKIPPED_KEYS`
    /// Default: `1000`
    pub max_skipped_keys: u32,

    /// Total skipped message keys retained per session; the oldest are
    /// evicted beyond this.
    /// Env: `SIGIL_MAX_STORED_SKIPPED_KEYS`
    /// Default: `2000`
    pub max_stored_skipped_keys: usize,

    /// One-time pre-keys generated per published bundle.
    /// Env: `SIGIL_ONE_TIME_PREKEYS`
    /// Default: `100`
    pub one_time_prekeys: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skipped_keys: 1000,
            max_stored_skipped_keys: 2000,
            one_time_prekeys: 100,
        }
    }
}

/// Delivery Queue retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    /// Env: `SIGIL_RETRY_BASE_MS`
    pub base_delay: Duration,

    /// Backoff ceiling.
    /// Env: `SIGIL_RETRY_MAX_MS`
    pub max_delay: Duration,

    /// Attempts after which an entry is abandoned.
    /// Env: `SIGIL_RETRY_MAX_ATTEMPTS`
    pub max_attempts: u32,

    /// Fraction of the delay that is randomised (0.0 - 1.0).
    /// Env: `SIGIL_RETRY_JITTER`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            max_attempts: 8,
            jitter: 0.5,
        }
    }
}

/// Shortest accepted scheduler period.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(1);

/// Transport worker pool and queue scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    pub retry: RetryPolicy,

    /// Timer period of the queue scheduler.
    /// Env: `SIGIL_SCAN_INTERVAL_MS`
    pub scan_interval: Duration,

    /// Concurrent transport attempts.
    /// Env: `SIGIL_TRANSPORT_WORKERS`
    pub transport_workers: usize,

    /// Per-attempt send timeout.
    /// Env: `SIGIL_SEND_TIMEOUT_MS`
    pub send_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            scan_interval: Duration::from_secs(1),
            transport_workers: 8,
            send_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    /// Out-of-order transactions buffered per conversation while their
    /// parent is missing.
    /// Env: `SIGIL_MAX_PENDING_PER_CONVERSATION`
    /// Default: `256`
    pub max_pending_per_conversation: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_pending_per_conversation: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SigilConfig {
    pub session: SessionConfig,
    pub delivery: DeliveryConfig,
    pub ledger: LedgerConfig,

    /// SQLite database path; in-memory storage when unset.
    /// Env: `SIGIL_DB_PATH`
    pub db_path: Option<PathBuf>,
}

impl SigilConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SigilConfig::from_env`] but reading from an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        override_parsed(&lookup, "SIGIL_MAX_SKIPPED_KEYS", &mut config.session.max_skipped_keys);
        override_parsed(
            &lookup,
            "SIGIL_MAX_STORED_SKIPPED_KEYS",
            &mut config.session.max_stored_skipped_keys,
        );
        override_parsed(&lookup, "SIGIL_ONE_TIME_PREKEYS", &mut config.session.one_time_prekeys);

        override_millis(&lookup, "SIGIL_RETRY_BASE_MS", &mut config.delivery.retry.base_delay);
        override_millis(&lookup, "SIGIL_RETRY_MAX_MS", &mut config.delivery.retry.max_delay);
        override_parsed(
            &lookup,
            "SIGIL_RETRY_MAX_ATTEMPTS",
            &mut config.delivery.retry.max_attempts,
        );
        override_parsed(&lookup, "SIGIL_RETRY_JITTER", &mut config.delivery.retry.jitter);
        if !config.delivery.retry.jitter.is_finite() {
            tracing::warn!(
                key = "SIGIL_RETRY_JITTER",
                value = config.delivery.retry.jitter,
                "Invalid value, using default"
            );
            config.delivery.retry.jitter = RetryPolicy::default().jitter;
        }
        config.delivery.retry.jitter = config.delivery.retry.jitter.clamp(0.0, 1.0);

        override_millis(&lookup, "SIGIL_SCAN_INTERVAL_MS", &mut config.delivery.scan_interval);
        config.delivery.scan_interval = config.delivery.scan_interval.max(MIN_SCAN_INTERVAL);
        override_parsed(
            &lookup,
            "SIGIL_TRANSPORT_WORKERS",
            &mut config.delivery.transport_workers,
        );
        config.delivery.transport_workers = config.delivery.transport_workers.max(1);
        override_millis(&lookup, "SIGIL_SEND_TIMEOUT_MS", &mut config.delivery.send_timeout);

        override_parsed(
            &lookup,
            "SIGIL_MAX_PENDING_PER_CONVERSATION",
            &mut config.ledger.max_pending_per_conversation,
        );

        if let Some(path) = lookup("SIGIL_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
        }
    }
}

fn override_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut millis = slot.as_millis() as u64;
    override_parsed(lookup, key, &mut millis);
    *slot = Duration::from_millis(millis);
}
