//! Integration tests for the call-site registry under concurrency
//!
//! # Test Coverage
//!
//! - Exact aggregate counts from many threads and identities
//! - Single-flight resolution of a new call site
//! - Reset racing with recording threads
//! - Builtin exclusion policy on and off
//! - Resolver failures and later recovery

mod utils;

use callstat::config::MonitorConfig;
use callstat::identity::{CallIdentity, SlowKey};
use callstat::registry::{RecordOutcome, RESOLVE_RETRY_NS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use utils::{game_site, mod_site, registry_with, ScriptResolver, MS};

#[test]
fn test_many_threads_many_identities_exact_counts() {
    const THREADS: usize = 8;
    const SITES: usize = 32;
    const ROUNDS: usize = 250;

    let registry = Arc::new(registry_with(ScriptResolver::new(), &MonitorConfig::default()));
    let sites: Arc<Vec<String>> =
        Arc::new((0..SITES).map(|i| mod_site("Stress", "f", i as u32)).collect());

    let handles: Vec<_> = (0..THREADS)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            let sites = Arc::clone(&sites);
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let site = &sites[(worker + round) % SITES];
                    registry.record(site, MS, 20_000);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let top = registry.top_entries(MS, 1000, SITES);
    assert_eq!(top.len(), SITES);
    let total: u64 = top.iter().map(|e| e.stats.count).sum();
    assert_eq!(total, (THREADS * ROUNDS) as u64);
    assert_eq!(registry.tracked_sites(), SITES);
    assert_eq!(registry.resolved_keys(), SITES as u64);
    for entry in &top {
        assert_eq!(entry.stats.sum_ns, entry.stats.count * 20_000);
    }
}

#[test]
fn test_first_time_callers_resolve_once() {
    const THREADS: usize = 16;

    let registry = Arc::new(registry_with(
        ScriptResolver::slow(Duration::from_millis(20)),
        &MonitorConfig::default(),
    ));
    let barrier = Arc::new(Barrier::new(THREADS));
    let site = mod_site("Once", "init", 7);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let site = site.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.record(&site, MS, 50_000)
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), RecordOutcome::Recorded);
    }

    assert_eq!(registry.resolver().calls(), 1);
    assert_eq!(registry.resolved_keys(), 1);
    let stats = registry.site_stats(&SlowKey::named(&site), MS, 1000).unwrap();
    assert_eq!(stats.count, THREADS as u64);
}

#[test]
fn test_reset_during_concurrent_records_drops_stale_sites() {
    let registry = Arc::new(registry_with(ScriptResolver::new(), &MonitorConfig::default()));
    let stale: Vec<String> = (0..16).map(|i| mod_site("Old", "stale", i)).collect();
    for site in &stale {
        registry.record(site, MS, 30_000);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let writers: Vec<_> = (0..4)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let site = mod_site("Live", "hot", worker);
                let mut recorded = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    registry.record(&site, 2 * MS, 30_000);
                    recorded += 1;
                }
                recorded
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    registry.reset();
    thread::sleep(Duration::from_millis(20));
    stop.store(true, Ordering::Relaxed);
    for writer in writers {
        writer.join().unwrap();
    }

    let top = registry.top_entries(2 * MS, 1000, 100);
    assert!(!top.is_empty());
    for entry in &top {
        let name = entry.key.stable_name();
        assert!(name.contains("/Live/"), "stale site survived reset: {}", name);
    }
}

#[test]
fn test_excluded_identity_never_ranked_and_policy_clear_resumes() {
    let registry = registry_with(ScriptResolver::new(), &MonitorConfig::default());
    let builtin = game_site("ISInventoryPane", 120);
    let user = mod_site("Hydrocraft", "crafting", 44);

    registry.set_exclude_builtin(true);
    for t in 0..10 {
        assert_eq!(registry.record(&builtin, t * MS, MS), RecordOutcome::Excluded);
        assert_eq!(registry.record(&user, t * MS, MS), RecordOutcome::Recorded);
    }
    let top = registry.top_entries(10 * MS, 1000, 10);
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].key, SlowKey::named(&user));

    registry.set_exclude_builtin(false);
    assert_eq!(registry.excluded_sites(), 0);
    registry.record(&builtin, 11 * MS, MS);

    let top = registry.top_entries(11 * MS, 1000, 10);
    let entry = top
        .iter()
        .find(|e| e.key == SlowKey::named(&builtin))
        .expect("builtin site tracked again");
    // Samples dropped while excluded are not recovered
    assert_eq!(entry.stats.count, 1);
    assert_eq!(entry.site.relative_path, "shared/ISInventoryPane.lua");
}

#[test]
fn test_exclusion_holds_for_concurrent_first_records() {
    let config = MonitorConfig {
        exclude_builtin_entries: true,
        ..Default::default()
    };
    let registry = Arc::new(registry_with(
        ScriptResolver::slow(Duration::from_millis(10)),
        &config,
    ));
    let barrier = Arc::new(Barrier::new(8));
    let site = game_site("TimedActions", 3);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let site = site.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.record(&site, MS, MS)
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), RecordOutcome::Excluded);
    }
    assert_eq!(registry.tracked_sites(), 0);
}

#[test]
fn test_resolver_failure_falls_back_then_recovers() {
    let registry = registry_with(ScriptResolver::new(), &MonitorConfig::default());
    let site = mod_site("Flaky", "late", 9);
    let fallback = SlowKey::Unresolved(site.as_str().fast_key());

    registry.resolver().set_failing(true);
    registry.record(&site, 0, MS);
    registry.record(&site, MS, MS);
    assert_eq!(registry.resolution_failures(), 1);
    assert_eq!(registry.retained_stats(&fallback).unwrap().count, 2);

    registry.resolver().set_failing(false);
    // Still inside the retry delay: stays on the fallback
    registry.record(&site, 2 * MS, MS);
    assert_eq!(registry.retained_stats(&fallback).unwrap().count, 3);

    let later = RESOLVE_RETRY_NS + MS;
    registry.record(&site, later, MS);
    registry.record(&site, later + MS, MS);
    let named = registry.retained_stats(&SlowKey::named(&site)).unwrap();
    assert_eq!(named.count, 2);
    assert_eq!(registry.retained_stats(&fallback).unwrap().count, 3);
    assert_eq!(registry.resolved_keys(), 1);
}

#[test]
fn test_top_entries_bounded_sorted_and_non_empty() {
    let registry = registry_with(ScriptResolver::new(), &MonitorConfig::default());
    for i in 0..30u64 {
        let site = mod_site("Rank", "f", i as u32);
        for _ in 0..=i {
            registry.record(&site, MS, (i + 1) * 10_000);
        }
    }

    let top = registry.top_entries(MS, 1000, 10);
    assert_eq!(top.len(), 10);
    assert!(top.windows(2).all(|w| w[0].stats.sum_ns >= w[1].stats.sum_ns));
    assert!(top.iter().all(|e| e.stats.count > 0));
    assert_eq!(top[0].key, SlowKey::named(&mod_site("Rank", "f", 29)));
}
