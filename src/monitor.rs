//! Monitor context
//!
//! [`PerfMonitor`] is the object a host keeps for the lifetime of its
//! scripting runtime. It ties the configuration, clock, registry, reporter and
//! report sink together and exposes the hook entry points. There is no global
//! instance: the host constructs it, shares it (usually behind an `Arc`) with
//! its hooks and calls [`PerfMonitor::reset`] when the runtime reloads.

use crate::clock::{Clock, MonotonicClock};
use crate::config::{MonitorConfig, RuntimeConfig};
use crate::error::Result;
use crate::identity::IdentityResolver;
use crate::registry::{CallSiteRegistry, RecordOutcome, TopEntry};
use crate::reporter::{build_report, LogSink, PeriodicReporter, Report, ReportSink};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name under which report generation time is recorded
pub const REPORT_INTERNAL_KEY: &str = "report";

/// Call timing monitor
///
/// # Example
///
/// ```
/// use callstat::config::MonitorConfig;
/// use callstat::identity::LocationResolver;
/// use callstat::monitor::PerfMonitor;
///
/// let monitor = PerfMonitor::new(LocationResolver::default(), &MonitorConfig::default()).unwrap();
/// let sum = monitor.measure_caller(|| (0..1000u64).sum::<u64>());
/// assert_eq!(sum, 499_500);
/// ```
pub struct PerfMonitor<R: IdentityResolver> {
    config: Arc<RuntimeConfig>,
    clock: Arc<dyn Clock>,
    registry: CallSiteRegistry<R>,
    reporter: PeriodicReporter,
    sink: Box<dyn ReportSink>,
    sink_failures: AtomicU64,
}

impl<R: IdentityResolver> PerfMonitor<R> {
    /// Validate `config` and build a monitor reporting through [`LogSink`]
    pub fn new(resolver: R, config: &MonitorConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(RuntimeConfig::from(config));
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let reporter = PeriodicReporter::new();
        reporter.reset(clock.now_ns());

        Ok(Self {
            registry: CallSiteRegistry::new(resolver, Arc::clone(&config)),
            config,
            clock,
            reporter,
            sink: Box::new(LogSink),
            sink_failures: AtomicU64::new(0),
        })
    }

    /// Replace the time source; the report interval restarts from its time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.reporter.reset(clock.now_ns());
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn registry(&self) -> &CallSiteRegistry<R> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Hook entry point: `identity` just returned after `duration_ns`
    pub fn on_call(&self, identity: &R::Identity, duration_ns: u64) -> RecordOutcome {
        self.on_call_at(identity, self.clock.now_ns(), duration_ns)
    }

    /// Like [`on_call`](Self::on_call) with an explicit observation time
    pub fn on_call_at(
        &self,
        identity: &R::Identity,
        observed_at_ns: u64,
        duration_ns: u64,
    ) -> RecordOutcome {
        if duration_ns < self.config.min_sample_duration_ns() {
            return RecordOutcome::BelowThreshold;
        }
        let outcome = self.registry.record(identity, observed_at_ns, duration_ns);
        self.maybe_report_at(observed_at_ns);
        outcome
    }

    /// Time `f` and record it under `identity`
    pub fn measure<T>(&self, identity: &R::Identity, f: impl FnOnce() -> T) -> T {
        let start = self.clock.now_ns();
        let out = f();
        let end = self.clock.now_ns();
        self.on_call_at(identity, end, end.saturating_sub(start));
        out
    }

    /// Publish a report if reporting is on and the interval has elapsed
    pub fn maybe_report(&self) -> bool {
        self.maybe_report_at(self.clock.now_ns())
    }

    fn maybe_report_at(&self, now_ns: u64) -> bool {
        if !self.config.report_enabled() {
            return false;
        }
        let Some(_guard) = self
            .reporter
            .try_begin(now_ns, self.config.report_interval_ns())
        else {
            return false;
        };
        self.generate(now_ns);
        true
    }

    /// Build and publish a report right away, ignoring the interval
    pub fn report_now(&self) -> Report {
        self.generate(self.clock.now_ns())
    }

    fn generate(&self, now_ns: u64) -> Report {
        let started = self.clock.now_ns();
        let report = build_report(&self.registry, &self.config, now_ns);
        if let Err(err) = self.sink.publish(&report) {
            self.sink_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "failed to publish call timing report");
        }
        if self.config.track_internal_performance() {
            let elapsed = self.clock.now_ns().saturating_sub(started);
            self.registry
                .record_internal(REPORT_INTERNAL_KEY, now_ns, elapsed);
        }
        report
    }

    /// Busiest call sites over the trailing `window_ms`
    pub fn top_entries(&self, window_ms: u64, limit: usize) -> Vec<TopEntry> {
        self.registry
            .top_entries(self.clock.now_ns(), window_ms, limit)
    }

    /// Apply the builtin exclusion policy
    pub fn set_exclude_builtin_entries(&self, exclude: bool) {
        self.registry.set_exclude_builtin(exclude);
    }

    /// Reports whose sink returned an error
    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    /// Forget every call site; the next report is one interval away
    pub fn reset(&self) {
        self.registry.reset();
        self.reporter.reset(self.clock.now_ns());
        debug!("monitor reset");
    }
}

impl<R: IdentityResolver<Identity = Location<'static>>> PerfMonitor<R> {
    /// Time `f` and record it under the caller's source location
    #[track_caller]
    pub fn measure_caller<T>(&self, f: impl FnOnce() -> T) -> T {
        let location = Location::caller();
        self.measure(location, f)
    }
}
