// Shared helpers for integration tests
#![allow(dead_code)]

use callstat::classify::{FileInfo, PathClassifier};
use callstat::clock::ManualClock;
use callstat::config::{MonitorConfig, RuntimeConfig};
use callstat::error::ResolveError;
use callstat::identity::IdentityResolver;
use callstat::monitor::PerfMonitor;
use callstat::registry::CallSiteRegistry;
use callstat::reporter::MemorySink;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MS: u64 = 1_000_000;
pub const SEC: u64 = 1_000_000_000;

pub const CACHE_DIR: &str = "/home/u/Zomboid";
pub const GAME_ROOT: &str = "/opt/game";

/// Identities are `"path:line"` strings that resolve to themselves
///
/// Counts resolver calls, can be made slow or failing.
pub struct ScriptResolver {
    classifier: PathClassifier,
    calls: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
}

impl ScriptResolver {
    pub fn new() -> Self {
        Self {
            classifier: PathClassifier::new()
                .with_cache_dir(CACHE_DIR)
                .with_game_root(GAME_ROOT),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl IdentityResolver for ScriptResolver {
    type Identity = str;

    fn resolve(&self, identity: &str) -> Result<String, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ResolveError::Failed("prototype not loaded".into()));
        }
        Ok(identity.to_string())
    }

    fn classify(&self, source_path: &str) -> FileInfo {
        self.classifier.classify(source_path)
    }
}

pub fn game_site(name: &str, line: u32) -> String {
    format!("{}/media/lua/shared/{}.lua:{}", GAME_ROOT, name, line)
}

pub fn mod_site(mod_name: &str, name: &str, line: u32) -> String {
    format!("{}/mods/{}/media/lua/client/{}.lua:{}", CACHE_DIR, mod_name, name, line)
}

pub fn registry_with(resolver: ScriptResolver, config: &MonitorConfig) -> CallSiteRegistry<ScriptResolver> {
    CallSiteRegistry::new(resolver, Arc::new(RuntimeConfig::from(config)))
}

/// Monitor on a manual clock starting at zero, reporting into memory
pub fn test_monitor(
    config: MonitorConfig,
) -> (PerfMonitor<ScriptResolver>, ManualClock, Arc<MemorySink>) {
    let clock = ManualClock::new(0);
    let sink = Arc::new(MemorySink::new());
    let monitor = PerfMonitor::new(ScriptResolver::new(), &config)
        .expect("valid config")
        .with_clock(Arc::new(clock.clone()))
        .with_sink(Arc::clone(&sink));
    (monitor, clock, sink)
}
