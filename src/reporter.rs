//! Periodic ranked reports
//!
//! Any recording thread may trigger a report, at most once per interval. The
//! interval check is double-checked: an unlocked compare filters almost every
//! caller, a `try_lock` lets exactly one contender through, and the winner
//! re-checks the timestamp under the lock. Losers never wait.

use crate::classify::Category;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::identity::IdentityResolver;
use crate::registry::{CallSiteRegistry, TopEntry};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, trace};

/// Rate limiter deciding which caller generates the next report
#[derive(Debug, Default)]
pub struct PeriodicReporter {
    last_report_ns: AtomicU64,
    gate: Mutex<()>,
}

/// Held by the thread generating a report
#[derive(Debug)]
pub struct ReportGuard<'a> {
    _gate: MutexGuard<'a, ()>,
}

impl PeriodicReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the report slot if `interval_ns` has passed since the last one
    pub fn try_begin(&self, now_ns: u64, interval_ns: u64) -> Option<ReportGuard<'_>> {
        if !self.is_due(now_ns, interval_ns) {
            return None;
        }
        let gate = self.gate.try_lock()?;
        if !self.is_due(now_ns, interval_ns) {
            return None;
        }
        self.last_report_ns.store(now_ns, Ordering::Release);
        trace!(now_ns, "report slot claimed");
        Some(ReportGuard { _gate: gate })
    }

    fn is_due(&self, now_ns: u64, interval_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_report_ns.load(Ordering::Acquire)) >= interval_ns
    }

    pub fn last_report_ns(&self) -> u64 {
        self.last_report_ns.load(Ordering::Acquire)
    }

    /// Forget the last report time
    pub fn reset(&self, now_ns: u64) {
        self.last_report_ns.store(now_ns, Ordering::Release);
    }
}

/// One ranked call site
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub category: Category,
    pub stable_name: String,
    pub path: String,
    pub line: u32,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub count: u64,
}

impl ReportRow {
    pub fn from_entry(entry: &TopEntry) -> Self {
        Self {
            category: entry.site.category,
            stable_name: entry.key.stable_name(),
            path: entry.site.relative_path.clone(),
            line: entry.site.line,
            total_ms: entry.stats.total_ms(),
            avg_ms: entry.stats.avg_ms(),
            min_ms: entry.stats.min_ms(),
            max_ms: entry.stats.max_ms(),
            count: entry.stats.count,
        }
    }

    /// Type and `file:line` columns
    pub fn display_columns(&self) -> (String, String) {
        crate::identity::SiteInfo {
            category: self.category,
            relative_path: self.path.clone(),
            line: self.line,
        }
        .display_columns()
    }
}

/// Ranked snapshot of the busiest call sites
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub window_ms: u64,
    pub generated_at_ns: u64,
    pub rows: Vec<ReportRow>,
}

impl Report {
    /// Render as a fixed-width table, header first
    pub fn render_table(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        lines.push(format!(
            "{:<12} {:>10} {:>8} {:>8} {:>8} {:>8}  {}",
            "Type", "Total(ms)", "Avg(ms)", "Min(ms)", "Max(ms)", "Count", "File:Line"
        ));
        for row in &self.rows {
            let (kind, file) = row.display_columns();
            lines.push(format!(
                "{:<12} {:>10.2} {:>8.3} {:>8.3} {:>8.3} {:>8}  {}",
                kind, row.total_ms, row.avg_ms, row.min_ms, row.max_ms, row.count, file
            ));
        }
        lines
    }
}

/// Window used by periodic reports
///
/// The report interval, capped at the longest window a histogram can answer
/// and never shorter than one bucket.
pub fn report_window_ms(config: &RuntimeConfig) -> u64 {
    config
        .report_interval_ms()
        .min(config.max_window_ms())
        .max(config.bucket_quantum_ms())
}

/// Rank the registry as of `now_ns` and build a report
pub fn build_report<R: IdentityResolver>(
    registry: &CallSiteRegistry<R>,
    config: &RuntimeConfig,
    now_ns: u64,
) -> Report {
    let window_ms = report_window_ms(config);
    let min_total_ms = config.report_min_total_ms();
    let rows = registry
        .top_entries(now_ns, window_ms, config.report_top_n())
        .iter()
        .map(ReportRow::from_entry)
        .filter(|row| row.total_ms >= min_total_ms)
        .collect();
    Report {
        window_ms,
        generated_at_ns: now_ns,
        rows,
    }
}

/// Destination of generated reports
pub trait ReportSink: Send + Sync {
    fn publish(&self, report: &Report) -> Result<()>;
}

/// Writes reports through `tracing` at INFO level
#[derive(Debug, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn publish(&self, report: &Report) -> Result<()> {
        info!(
            window_ms = report.window_ms,
            rows = report.rows.len(),
            "call timing report"
        );
        for line in report.render_table() {
            info!("{}", line);
        }
        Ok(())
    }
}

/// Writes one JSON document per report, newline separated
#[derive(Debug)]
pub struct JsonSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> ReportSink for JsonSink<W> {
    fn publish(&self, report: &Report) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, report)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps every published report
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<Report>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    pub fn last(&self) -> Option<Report> {
        self.reports.lock().last().cloned()
    }
}

impl ReportSink for MemorySink {
    fn publish(&self, report: &Report) -> Result<()> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

impl<S: ReportSink + ?Sized> ReportSink for std::sync::Arc<S> {
    fn publish(&self, report: &Report) -> Result<()> {
        (**self).publish(report)
    }
}

impl<S: ReportSink + ?Sized> ReportSink for Box<S> {
    fn publish(&self, report: &Report) -> Result<()> {
        (**self).publish(report)
    }
}
