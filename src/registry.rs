//! Call-site registry
//!
//! Maps call identities to their [`WindowedHistogram`] in two steps:
//!
//! ```text
//!  identity ──fast_key()──► FastKey ──KeySlot (resolved once)──► SlowKey ──► SiteEntry
//!   (hot, O(1))                        (cold, memoized)                  (histogram)
//! ```
//!
//! A key slot resolves its slow key exactly once even when many threads
//! see a new call site at the same moment: the first caller runs the resolver
//! under the slot's gate while the others wait and reuse the result. The
//! exclusion check happens inside that same critical section, so no sample of
//! an excluded site is recorded while its key is still being published.
//!
//! Exclusions derived from classification are committed under a read guard of
//! the registry epoch. Disabling the policy and [`CallSiteRegistry::reset`]
//! take the write side, so a slow classification that straddles either one
//! cannot leave a stale exclusion behind.
//!
//! Ranking queries only look at the *active* index (sites seen within the TTL)
//! instead of every site ever observed.

use crate::classify::Category;
use crate::config::RuntimeConfig;
use crate::error::ResolveError;
use crate::histogram::{WindowStats, WindowedHistogram};
use crate::identity::{
    parse_stable_name, CallIdentity, FastKey, IdentityResolver, SiteInfo, SlowKey,
};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Minimum delay before a failed resolution is attempted again
pub const RESOLVE_RETRY_NS: u64 = 1_000_000_000;

/// What happened to a recorded sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// The call site is in the exclusion set
    Excluded,
    /// Shorter than the minimum sample duration, dropped by the monitor
    BelowThreshold,
}

/// Per fast key memo of the slow key
#[derive(Debug, Default)]
struct KeySlot {
    resolved: OnceLock<SlowKey>,
    gate: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    last_failure_ns: Option<u64>,
    failures: u64,
}

/// Registry entry owning one call site's histogram
#[derive(Debug)]
struct SiteEntry {
    histogram: WindowedHistogram,
    info: OnceLock<Arc<SiteInfo>>,
}

/// One ranked call site
#[derive(Debug, Clone)]
pub struct TopEntry {
    pub key: SlowKey,
    pub site: Arc<SiteInfo>,
    pub stats: WindowStats,
}

/// Concurrent registry of call sites and their histograms
pub struct CallSiteRegistry<R: IdentityResolver> {
    resolver: R,
    config: Arc<RuntimeConfig>,
    keys: DashMap<FastKey, Arc<KeySlot>>,
    sites: DashMap<SlowKey, Arc<SiteEntry>>,
    active: DashMap<SlowKey, u64>,
    excluded: DashSet<SlowKey>,
    /// Bumped by every reset
    epoch: RwLock<u64>,
    resolutions: AtomicU64,
    resolution_failures: AtomicU64,
}

impl<R: IdentityResolver> CallSiteRegistry<R> {
    pub fn new(resolver: R, config: Arc<RuntimeConfig>) -> Self {
        Self {
            resolver,
            config,
            keys: DashMap::new(),
            sites: DashMap::new(),
            active: DashMap::new(),
            excluded: DashSet::new(),
            epoch: RwLock::new(0),
            resolutions: AtomicU64::new(0),
            resolution_failures: AtomicU64::new(0),
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    /// Record one call of `identity` that took `duration_ns`, observed at `now_ns`
    pub fn record(&self, identity: &R::Identity, now_ns: u64, duration_ns: u64) -> RecordOutcome {
        let fast = identity.fast_key();
        let slot = self.slot(fast);
        let (key, dropped) = self.slow_key(&slot, fast, identity, now_ns);
        if dropped || self.excluded.contains(&key) {
            return RecordOutcome::Excluded;
        }
        self.record_key(key, now_ns, duration_ns);
        RecordOutcome::Recorded
    }

    /// Record a measurement of the engine itself
    pub fn record_internal(&self, name: &'static str, now_ns: u64, duration_ns: u64) {
        self.record_key(SlowKey::Internal(name), now_ns, duration_ns);
    }

    fn slot(&self, fast: FastKey) -> Arc<KeySlot> {
        if let Some(slot) = self.keys.get(&fast).map(|s| Arc::clone(s.value())) {
            return slot;
        }
        Arc::clone(self.keys.entry(fast).or_default().value())
    }

    /// Slow key of `identity`, and whether this one sample must be dropped
    fn slow_key(
        &self,
        slot: &KeySlot,
        fast: FastKey,
        identity: &R::Identity,
        now_ns: u64,
    ) -> (SlowKey, bool) {
        if let Some(key) = slot.resolved.get() {
            return (key.clone(), false);
        }

        let mut state = slot.gate.lock();
        if let Some(key) = slot.resolved.get() {
            return (key.clone(), false);
        }
        if let Some(failed_at) = state.last_failure_ns {
            if now_ns.saturating_sub(failed_at) < RESOLVE_RETRY_NS {
                return (SlowKey::Unresolved(fast), false);
            }
        }

        let epoch = *self.epoch.read();
        match self.resolve(identity) {
            Ok(name) => {
                let key = SlowKey::named(&name);
                if self.config.exclude_builtin_entries() && self.is_builtin(&key) {
                    let current = self.epoch.read();
                    let exclude = self.config.exclude_builtin_entries();
                    if *current != epoch {
                        // Reset meanwhile: this slot is gone, publish nothing
                        debug!(key = %key, "registry reset during resolution");
                        return (key, exclude);
                    }
                    if exclude {
                        self.excluded.insert(key.clone());
                    }
                }
                self.resolutions.fetch_add(1, Ordering::Relaxed);
                let _ = slot.resolved.set(key.clone());
                (key, false)
            }
            Err(err) => {
                if state.failures == 0 {
                    warn!(fast_key = %fast, error = %err, "call identity resolution failed, recording under fallback key");
                }
                state.failures += 1;
                state.last_failure_ns = Some(now_ns);
                self.resolution_failures.fetch_add(1, Ordering::Relaxed);
                (SlowKey::Unresolved(fast), false)
            }
        }
    }

    fn resolve(&self, identity: &R::Identity) -> Result<String, ResolveError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.resolver.resolve(identity)))
            .unwrap_or(Err(ResolveError::Panicked))
    }

    fn is_builtin(&self, key: &SlowKey) -> bool {
        let SlowKey::Named(name) = key else {
            return false;
        };
        let (path, _) = parse_stable_name(name);
        panic::catch_unwind(AssertUnwindSafe(|| self.resolver.classify(path)))
            .map(|info| info.category.is_builtin())
            .unwrap_or(false)
    }

    fn describe(&self, key: &SlowKey) -> SiteInfo {
        panic::catch_unwind(AssertUnwindSafe(|| SiteInfo::describe(key, &self.resolver)))
            .unwrap_or_else(|_| SiteInfo {
                category: Category::Unknown,
                relative_path: key.to_string(),
                line: 0,
            })
    }

    fn record_key(&self, key: SlowKey, now_ns: u64, duration_ns: u64) {
        let site = self.site(&key, now_ns);
        self.touch_active(key, now_ns);
        site.histogram.add_sample(now_ns, duration_ns);
    }

    /// Refresh the active index at most once per bucket quantum per site
    ///
    /// The common case only takes a shard read lock. Pruning may therefore
    /// run up to one quantum early, which the TTL absorbs.
    fn touch_active(&self, key: SlowKey, now_ns: u64) {
        let quantum_ns = self.config.bucket_quantum_ns();
        let fresh = self
            .active
            .get(&key)
            .is_some_and(|seen| now_ns.saturating_sub(*seen) < quantum_ns);
        if fresh {
            return;
        }
        self.active
            .entry(key)
            .and_modify(|seen| *seen = (*seen).max(now_ns))
            .or_insert(now_ns);
    }

    fn site(&self, key: &SlowKey, now_ns: u64) -> Arc<SiteEntry> {
        if let Some(site) = self.sites.get(key).map(|s| Arc::clone(s.value())) {
            return site;
        }
        let entry = self.sites.entry(key.clone()).or_insert_with(|| {
            Arc::new(SiteEntry {
                histogram: WindowedHistogram::new(
                    self.config.window_capacity_buckets(),
                    self.config.bucket_quantum_ns(),
                    now_ns,
                ),
                info: OnceLock::new(),
            })
        });
        Arc::clone(entry.value())
    }

    /// Busiest call sites by total time in the trailing `window_ms`
    ///
    /// Prunes expired active keys first, so the cost is bounded by the number
    /// of recently active sites. Ties are broken by key order.
    pub fn top_entries(&self, now_ns: u64, window_ms: u64, limit: usize) -> Vec<TopEntry> {
        let ttl_ns = self.config.active_key_ttl_ns();
        self.active
            .retain(|_, last_seen| now_ns.saturating_sub(*last_seen) <= ttl_ns);

        let candidates: Vec<SlowKey> = self
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !self.excluded.contains(key))
            .collect();

        let mut ranked: Vec<(SlowKey, Arc<SiteEntry>, WindowStats)> = candidates
            .into_iter()
            .filter_map(|key| {
                let site = self.sites.get(&key).map(|s| Arc::clone(s.value()))?;
                let stats = site.histogram.query(now_ns, window_ms)?;
                Some((key, site, stats))
            })
            .collect();

        ranked.sort_by(|a, b| b.2.sum_ns.cmp(&a.2.sum_ns).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);

        ranked
            .into_iter()
            .map(|(key, site, stats)| {
                let info = Arc::clone(site.info.get_or_init(|| Arc::new(self.describe(&key))));
                TopEntry {
                    key,
                    site: info,
                    stats,
                }
            })
            .collect()
    }

    /// Window statistics of one call site
    pub fn site_stats(&self, key: &SlowKey, now_ns: u64, window_ms: u64) -> Option<WindowStats> {
        let site = self.sites.get(key).map(|s| Arc::clone(s.value()))?;
        site.histogram.query(now_ns, window_ms)
    }

    /// Running totals over one call site's whole histogram
    pub fn retained_stats(&self, key: &SlowKey) -> Option<WindowStats> {
        let site = self.sites.get(key).map(|s| Arc::clone(s.value()))?;
        site.histogram.retained()
    }

    /// Apply the "exclude built-in entries" policy
    ///
    /// Enabling classifies every resolved key and excludes the built-in ones.
    /// Disabling clears the exclusion set; samples dropped meanwhile stay lost.
    pub fn set_exclude_builtin(&self, exclude: bool) {
        let previous = {
            let _epoch = self.epoch.write();
            let previous = self.config.set_exclude_builtin_entries(exclude);
            if !exclude {
                let dropped = self.excluded.len();
                self.excluded.clear();
                debug!(dropped, "builtin exclusion disabled");
                return;
            }
            previous
        };
        if previous {
            return;
        }

        let slots: Vec<Arc<KeySlot>> = self.keys.iter().map(|s| Arc::clone(s.value())).collect();
        for slot in slots {
            // Waits out an in-flight resolution; later ones see the new flag.
            let _gate = slot.gate.lock();
            if let Some(key) = slot.resolved.get() {
                if self.is_builtin(key) {
                    let _epoch = self.epoch.read();
                    if !self.config.exclude_builtin_entries() {
                        break;
                    }
                    self.excluded.insert(key.clone());
                    self.active.remove(key);
                }
            }
        }
        debug!(excluded = self.excluded.len(), "builtin exclusion enabled");
    }

    /// Exclude one call site explicitly
    pub fn exclude(&self, key: SlowKey) {
        self.active.remove(&key);
        self.excluded.insert(key);
    }

    pub fn is_excluded(&self, key: &SlowKey) -> bool {
        self.excluded.contains(key)
    }

    /// Drop every call site, memoized key and exclusion
    pub fn reset(&self) {
        let mut epoch = self.epoch.write();
        *epoch += 1;
        let sites = self.sites.len();
        self.keys.clear();
        self.excluded.clear();
        self.active.clear();
        self.sites.clear();
        self.resolutions.store(0, Ordering::Relaxed);
        self.resolution_failures.store(0, Ordering::Relaxed);
        debug!(sites, epoch = *epoch, "call-site registry reset");
    }

    /// Call sites with a histogram
    pub fn tracked_sites(&self) -> usize {
        self.sites.len()
    }

    /// Call sites in the active index (not pruned yet)
    pub fn active_sites(&self) -> usize {
        self.active.len()
    }

    pub fn excluded_sites(&self) -> usize {
        self.excluded.len()
    }

    /// Successful resolver calls
    pub fn resolved_keys(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    pub fn resolution_failures(&self) -> u64 {
        self.resolution_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FileInfo;
    use crate::config::MonitorConfig;
    use crate::histogram::MAX_WINDOW_CAPACITY;
    use std::thread;
    use std::time::Duration;

    const MS: u64 = 1_000_000;

    /// Resolves `"name"` to `"name:1"`, names starting with `game/` are builtin
    struct TestResolver;

    impl IdentityResolver for TestResolver {
        type Identity = str;

        fn resolve(&self, identity: &str) -> Result<String, ResolveError> {
            if identity.is_empty() {
                return Err(ResolveError::NoSourceInfo);
            }
            if identity == "boom" {
                panic!("resolver exploded");
            }
            Ok(format!("{}:1", identity))
        }

        fn classify(&self, source_path: &str) -> FileInfo {
            match source_path.strip_prefix("game/") {
                Some(rest) => FileInfo::new(Category::Game, rest),
                None => FileInfo::unknown(source_path),
            }
        }
    }

    /// Same names as `TestResolver`, but classification sleeps first
    struct SlowClassifier(Duration);

    impl IdentityResolver for SlowClassifier {
        type Identity = str;

        fn resolve(&self, identity: &str) -> Result<String, ResolveError> {
            TestResolver.resolve(identity)
        }

        fn classify(&self, source_path: &str) -> FileInfo {
            thread::sleep(self.0);
            TestResolver.classify(source_path)
        }
    }

    fn slow_registry() -> Arc<CallSiteRegistry<SlowClassifier>> {
        let reg = CallSiteRegistry::new(
            SlowClassifier(Duration::from_millis(200)),
            Arc::new(RuntimeConfig::default()),
        );
        reg.set_exclude_builtin(true);
        Arc::new(reg)
    }

    fn registry() -> CallSiteRegistry<TestResolver> {
        let config = MonitorConfig {
            window_capacity_buckets: 20,
            ..Default::default()
        };
        CallSiteRegistry::new(TestResolver, Arc::new(RuntimeConfig::from(&config)))
    }

    #[test]
    fn test_record_creates_site() {
        let reg = registry();
        assert_eq!(reg.record("a.lua", 0, 5 * MS), RecordOutcome::Recorded);
        assert_eq!(reg.record("a.lua", MS, 5 * MS), RecordOutcome::Recorded);

        assert_eq!(reg.tracked_sites(), 1);
        assert_eq!(reg.resolved_keys(), 1);
        let stats = reg.site_stats(&SlowKey::named("a.lua:1"), MS, 1000).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.sum_ns, 10 * MS);
    }

    #[test]
    fn test_top_entries_sorted_and_limited() {
        let reg = registry();
        reg.record("small", 0, MS);
        reg.record("big", 0, 9 * MS);
        reg.record("mid", 0, 4 * MS);

        let top = reg.top_entries(MS, 1000, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].key, SlowKey::named("big:1"));
        assert_eq!(top[1].key, SlowKey::named("mid:1"));
        assert_eq!(top[0].site.relative_path, "big");
        assert_eq!(top[0].site.line, 1);
    }

    #[test]
    fn test_top_entries_ties_break_by_key() {
        let reg = registry();
        reg.record("b", 0, MS);
        reg.record("a", 0, MS);
        let top = reg.top_entries(0, 1000, 10);
        assert_eq!(top[0].key, SlowKey::named("a:1"));
        assert_eq!(top[1].key, SlowKey::named("b:1"));
    }

    #[test]
    fn test_expired_active_keys_are_pruned() {
        let reg = registry();
        reg.record("old", 0, MS);
        reg.record("new", 59_000 * MS, MS);

        reg.top_entries(61_000 * MS, 1000, 10);
        assert_eq!(reg.active_sites(), 1);
        // The histogram itself is kept
        assert_eq!(reg.tracked_sites(), 2);
    }

    #[test]
    fn test_resolution_failure_uses_fallback_then_retries() {
        let reg = registry();
        let fast = "".fast_key();

        reg.record("", 0, MS);
        reg.record("", MS, MS);
        assert_eq!(reg.resolution_failures(), 1);
        assert_eq!(
            reg.retained_stats(&SlowKey::Unresolved(fast)).unwrap().count,
            2
        );

        reg.record("", RESOLVE_RETRY_NS + MS, MS);
        assert_eq!(reg.resolution_failures(), 2);
    }

    #[test]
    fn test_resolver_panic_is_absorbed() {
        let reg = registry();
        assert_eq!(reg.record("boom", 0, MS), RecordOutcome::Recorded);
        assert_eq!(reg.resolution_failures(), 1);
        let top = reg.top_entries(0, 1000, 10);
        assert_eq!(top.len(), 1);
        assert!(matches!(top[0].key, SlowKey::Unresolved(_)));
    }

    #[test]
    fn test_exclude_builtin_policy() {
        let reg = registry();
        reg.set_exclude_builtin(true);
        assert_eq!(reg.record("game/core", 0, MS), RecordOutcome::Excluded);
        assert_eq!(reg.record("mods/x", 0, MS), RecordOutcome::Recorded);
        assert_eq!(reg.excluded_sites(), 1);
        assert!(reg.is_excluded(&SlowKey::named("game/core:1")));

        reg.set_exclude_builtin(false);
        assert_eq!(reg.record("game/core", MS, MS), RecordOutcome::Recorded);
        let top = reg.top_entries(MS, 1000, 10);
        let game = top
            .iter()
            .find(|e| e.key == SlowKey::named("game/core:1"))
            .unwrap();
        assert_eq!(game.stats.count, 1);
        assert_eq!(game.site.category, Category::Game);
    }

    #[test]
    fn test_enabling_policy_excludes_known_builtin_sites() {
        let reg = registry();
        reg.record("game/ui", 0, MS);
        reg.record("user", 0, MS);
        reg.set_exclude_builtin(true);

        let top = reg.top_entries(0, 1000, 10);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].key, SlowKey::named("user:1"));
        assert_eq!(reg.record("game/ui", MS, MS), RecordOutcome::Excluded);
    }

    #[test]
    fn test_internal_records_are_never_excluded() {
        let reg = registry();
        reg.set_exclude_builtin(true);
        reg.record_internal("report", 0, 2 * MS);
        let top = reg.top_entries(0, 1000, 10);
        assert_eq!(top[0].key, SlowKey::Internal("report"));
        assert_eq!(top[0].site.category, Category::Internal);
    }

    #[test]
    fn test_reset_clears_everything() {
        let reg = registry();
        reg.set_exclude_builtin(true);
        reg.record("game/a", 0, MS);
        reg.record("b", 0, MS);
        reg.reset();

        assert_eq!(reg.tracked_sites(), 0);
        assert_eq!(reg.active_sites(), 0);
        assert_eq!(reg.excluded_sites(), 0);
        assert_eq!(reg.resolved_keys(), 0);
        assert!(reg.top_entries(0, 1000, 10).is_empty());
    }

    #[test]
    fn test_two_fast_keys_same_name_share_histogram() {
        let reg = registry();
        reg.record("dup", 0, MS);
        // Same stable name reached through a different fast key
        let key = SlowKey::named("dup:1");
        reg.record_key(key.clone(), MS, MS);
        assert_eq!(reg.tracked_sites(), 1);
        assert_eq!(reg.retained_stats(&key).unwrap().count, 2);
    }

    #[test]
    fn test_disabling_policy_during_classification_leaves_no_exclusion() {
        let reg = slow_registry();
        let worker = {
            let reg = Arc::clone(&reg);
            thread::spawn(move || reg.record("game/x", 0, MS))
        };
        thread::sleep(Duration::from_millis(50));
        reg.set_exclude_builtin(false);

        assert_eq!(worker.join().unwrap(), RecordOutcome::Recorded);
        assert_eq!(reg.excluded_sites(), 0);
        assert_eq!(reg.record("game/x", MS, MS), RecordOutcome::Recorded);
        assert_eq!(
            reg.retained_stats(&SlowKey::named("game/x:1")).unwrap().count,
            2
        );
    }

    #[test]
    fn test_reset_during_classification_leaves_no_exclusion() {
        let reg = slow_registry();
        let worker = {
            let reg = Arc::clone(&reg);
            thread::spawn(move || reg.record("game/x", 0, MS))
        };
        thread::sleep(Duration::from_millis(50));
        reg.reset();

        // The sample is dropped, the orphaned slot publishes nothing
        assert_eq!(worker.join().unwrap(), RecordOutcome::Excluded);
        assert_eq!(reg.excluded_sites(), 0);
        assert_eq!(reg.tracked_sites(), 0);
        assert_eq!(reg.resolved_keys(), 0);

        // The policy survives the reset and applies to a fresh resolution
        assert_eq!(reg.record("game/x", MS, MS), RecordOutcome::Excluded);
        assert_eq!(reg.excluded_sites(), 1);
        assert_eq!(reg.resolved_keys(), 1);
    }

    #[test]
    fn test_active_index_refreshed_once_per_quantum() {
        let reg = registry();
        let key = SlowKey::named("hot:1");
        reg.record("hot", 0, MS);
        reg.record("hot", 10 * MS, MS);
        assert_eq!(*reg.active.get(&key).unwrap(), 0);

        reg.record("hot", 50 * MS, MS);
        assert_eq!(*reg.active.get(&key).unwrap(), 50 * MS);

        // Still active one TTL after the refreshed timestamp
        reg.top_entries(60_050 * MS, 1000, 10);
        assert_eq!(reg.active_sites(), 1);
        reg.top_entries(60_051 * MS, 1000, 10);
        assert_eq!(reg.active_sites(), 0);
        assert_eq!(reg.retained_stats(&key).unwrap().count, 3);
    }

    #[test]
    fn test_oversized_capacity_is_capped_on_site_creation() {
        let reg = registry();
        reg.config().set_window_capacity_buckets(u64::MAX);
        assert_eq!(reg.record("wide", 0, MS), RecordOutcome::Recorded);
        assert_eq!(reg.config().window_capacity_buckets(), MAX_WINDOW_CAPACITY);
        let stats = reg.retained_stats(&SlowKey::named("wide:1")).unwrap();
        assert_eq!(stats.count, 1);
    }
}
