//! Monitor configuration
//!
//! [`MonitorConfig`] is the plain, serde-friendly form loaded from TOML.
//! [`RuntimeConfig`] is what the engine actually reads: every option is an
//! atomic, read at call time, so settings can change while the host runs.
//!
//! Window capacity and bucket quantum only apply to histograms created after
//! the change; existing histograms keep the ring they were built with.

use crate::error::{MonitorError, Result};
use crate::histogram::MAX_WINDOW_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Configuration for the call timing monitor
///
/// # Example
/// ```
/// use callstat::config::MonitorConfig;
///
/// let config = MonitorConfig::default();
/// assert_eq!(config.window_capacity_buckets, 1000);
/// assert_eq!(config.max_window_ms(), 50_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Buckets per call-site histogram (max window = capacity * quantum)
    pub window_capacity_buckets: u64,

    /// Duration covered by one bucket
    pub bucket_quantum_ms: u64,

    /// Minimum time between two periodic reports
    pub report_interval_secs: u64,

    /// Periodic reporting on/off; collection continues either way
    pub report_enabled: bool,

    /// Rows per report
    pub report_top_n: usize,

    /// Rows whose window total is below this are left out of reports
    pub report_min_total_ms: f64,

    /// Calls shorter than this are not recorded at all
    pub min_sample_duration_ns: u64,

    /// Call sites idle for longer than this drop out of ranking scans
    pub active_key_ttl_secs: u64,

    /// Stop tracking sources that belong to the host application
    pub exclude_builtin_entries: bool,

    /// Record how long report generation itself takes
    pub track_internal_performance: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_capacity_buckets: 1000,
            bucket_quantum_ms: 50,
            report_interval_secs: 5,
            report_enabled: true,
            report_top_n: 50,
            report_min_total_ms: 0.0,
            min_sample_duration_ns: 10_000, // 10us
            active_key_ttl_secs: 60,
            exclude_builtin_entries: false,
            track_internal_performance: false,
        }
    }
}

impl MonitorConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| MonitorError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> String {
        // Plain struct of scalars, serialization can not fail
        toml::to_string(self).unwrap_or_default()
    }

    /// Longest window a histogram built from this config can answer
    pub fn max_window_ms(&self) -> u64 {
        self.window_capacity_buckets
            .saturating_mul(self.bucket_quantum_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &'static str, reason: &str) -> MonitorError {
            MonitorError::InvalidConfig {
                field,
                reason: reason.to_string(),
            }
        }

        if self.window_capacity_buckets == 0 {
            return Err(invalid("window_capacity_buckets", "must be > 0"));
        }
        if self.window_capacity_buckets > MAX_WINDOW_CAPACITY as u64 {
            return Err(invalid(
                "window_capacity_buckets",
                &format!("must be <= {}", MAX_WINDOW_CAPACITY),
            ));
        }
        if self.bucket_quantum_ms == 0 {
            return Err(invalid("bucket_quantum_ms", "must be > 0"));
        }
        if self.active_key_ttl_secs == 0 {
            return Err(invalid("active_key_ttl_secs", "must be > 0"));
        }
        if self.report_top_n == 0 {
            return Err(invalid("report_top_n", "must be > 0"));
        }
        if !self.report_min_total_ms.is_finite() || self.report_min_total_ms < 0.0 {
            return Err(invalid(
                "report_min_total_ms",
                "must be a finite, non-negative number",
            ));
        }
        Ok(())
    }
}

/// Runtime-mutable view of [`MonitorConfig`]
///
/// All loads are `Relaxed`: options are independent and a reader seeing a
/// slightly stale value for one call is harmless.
#[derive(Debug)]
pub struct RuntimeConfig {
    window_capacity_buckets: AtomicU64,
    bucket_quantum_ms: AtomicU64,
    report_interval_secs: AtomicU64,
    report_enabled: AtomicBool,
    report_top_n: AtomicU64,
    report_min_total_ms_bits: AtomicU64,
    min_sample_duration_ns: AtomicU64,
    active_key_ttl_secs: AtomicU64,
    exclude_builtin_entries: AtomicBool,
    track_internal_performance: AtomicBool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

fn clamp_capacity(buckets: u64) -> u64 {
    buckets.clamp(1, MAX_WINDOW_CAPACITY as u64)
}

impl From<&MonitorConfig> for RuntimeConfig {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            window_capacity_buckets: AtomicU64::new(clamp_capacity(config.window_capacity_buckets)),
            bucket_quantum_ms: AtomicU64::new(config.bucket_quantum_ms.max(1)),
            report_interval_secs: AtomicU64::new(config.report_interval_secs),
            report_enabled: AtomicBool::new(config.report_enabled),
            report_top_n: AtomicU64::new(config.report_top_n as u64),
            report_min_total_ms_bits: AtomicU64::new(config.report_min_total_ms.to_bits()),
            min_sample_duration_ns: AtomicU64::new(config.min_sample_duration_ns),
            active_key_ttl_secs: AtomicU64::new(config.active_key_ttl_secs),
            exclude_builtin_entries: AtomicBool::new(config.exclude_builtin_entries),
            track_internal_performance: AtomicBool::new(config.track_internal_performance),
        }
    }
}

impl RuntimeConfig {
    /// Current values as a plain config
    pub fn snapshot(&self) -> MonitorConfig {
        MonitorConfig {
            window_capacity_buckets: self.window_capacity_buckets.load(Ordering::Relaxed),
            bucket_quantum_ms: self.bucket_quantum_ms.load(Ordering::Relaxed),
            report_interval_secs: self.report_interval_secs.load(Ordering::Relaxed),
            report_enabled: self.report_enabled(),
            report_top_n: self.report_top_n(),
            report_min_total_ms: self.report_min_total_ms(),
            min_sample_duration_ns: self.min_sample_duration_ns(),
            active_key_ttl_secs: self.active_key_ttl_secs.load(Ordering::Relaxed),
            exclude_builtin_entries: self.exclude_builtin_entries(),
            track_internal_performance: self.track_internal_performance(),
        }
    }

    pub fn window_capacity_buckets(&self) -> usize {
        self.window_capacity_buckets.load(Ordering::Relaxed) as usize
    }

    pub fn bucket_quantum_ns(&self) -> u64 {
        self.bucket_quantum_ms
            .load(Ordering::Relaxed)
            .saturating_mul(1_000_000)
    }

    pub fn max_window_ms(&self) -> u64 {
        self.window_capacity_buckets
            .load(Ordering::Relaxed)
            .saturating_mul(self.bucket_quantum_ms.load(Ordering::Relaxed))
    }

    pub fn bucket_quantum_ms(&self) -> u64 {
        self.bucket_quantum_ms.load(Ordering::Relaxed)
    }

    pub fn report_interval_ns(&self) -> u64 {
        self.report_interval_secs
            .load(Ordering::Relaxed)
            .saturating_mul(1_000_000_000)
    }

    pub fn report_interval_ms(&self) -> u64 {
        self.report_interval_secs
            .load(Ordering::Relaxed)
            .saturating_mul(1000)
    }

    pub fn report_enabled(&self) -> bool {
        self.report_enabled.load(Ordering::Relaxed)
    }

    pub fn report_top_n(&self) -> usize {
        self.report_top_n.load(Ordering::Relaxed) as usize
    }

    pub fn report_min_total_ms(&self) -> f64 {
        f64::from_bits(self.report_min_total_ms_bits.load(Ordering::Relaxed))
    }

    pub fn min_sample_duration_ns(&self) -> u64 {
        self.min_sample_duration_ns.load(Ordering::Relaxed)
    }

    pub fn active_key_ttl_ns(&self) -> u64 {
        self.active_key_ttl_secs
            .load(Ordering::Relaxed)
            .saturating_mul(1_000_000_000)
    }

    pub fn exclude_builtin_entries(&self) -> bool {
        self.exclude_builtin_entries.load(Ordering::Relaxed)
    }

    pub fn track_internal_performance(&self) -> bool {
        self.track_internal_performance.load(Ordering::Relaxed)
    }

    pub fn set_window_capacity_buckets(&self, buckets: u64) {
        self.window_capacity_buckets
            .store(clamp_capacity(buckets), Ordering::Relaxed);
    }

    pub fn set_bucket_quantum_ms(&self, quantum_ms: u64) {
        self.bucket_quantum_ms
            .store(quantum_ms.max(1), Ordering::Relaxed);
    }

    pub fn set_report_interval_secs(&self, secs: u64) {
        self.report_interval_secs.store(secs, Ordering::Relaxed);
    }

    pub fn set_report_enabled(&self, enabled: bool) {
        self.report_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_report_top_n(&self, top_n: usize) {
        self.report_top_n
            .store(top_n.max(1) as u64, Ordering::Relaxed);
    }

    pub fn set_report_min_total_ms(&self, min_total_ms: f64) {
        let value = if min_total_ms.is_finite() {
            min_total_ms.max(0.0)
        } else {
            0.0
        };
        self.report_min_total_ms_bits
            .store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn set_min_sample_duration_ns(&self, nanos: u64) {
        self.min_sample_duration_ns.store(nanos, Ordering::Relaxed);
    }

    pub fn set_active_key_ttl_secs(&self, secs: u64) {
        self.active_key_ttl_secs
            .store(secs.max(1), Ordering::Relaxed);
    }

    /// Flag only; the registry applies the policy change
    pub(crate) fn set_exclude_builtin_entries(&self, exclude: bool) -> bool {
        self.exclude_builtin_entries.swap(exclude, Ordering::Relaxed)
    }

    pub fn set_track_internal_performance(&self, enabled: bool) {
        self.track_internal_performance
            .store(enabled, Ordering::Relaxed);
    }
}
