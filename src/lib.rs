//! callstat - In-process sliding-window call timing aggregator
//!
//! This library records the duration of every call an embedding runtime makes
//! into user code, aggregates them per call site over a sliding time window and
//! periodically reports the call sites that consumed the most time.

pub mod classify;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod histogram;
pub mod identity;
pub mod monitor;
pub mod registry;
pub mod reporter;

pub use config::{MonitorConfig, RuntimeConfig};
pub use error::{MonitorError, ResolveError, Result};
pub use histogram::{WindowStats, WindowedHistogram};
pub use identity::{CallIdentity, FastKey, IdentityResolver, LocationResolver, SlowKey};
pub use monitor::PerfMonitor;
pub use registry::{CallSiteRegistry, RecordOutcome, TopEntry};
pub use reporter::{JsonSink, LogSink, MemorySink, Report, ReportRow, ReportSink};
