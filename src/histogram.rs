//! Sliding-window timing histogram
//!
//! Each call site owns one [`WindowedHistogram`]: a fixed ring of time buckets,
//! each covering one bucket quantum (50ms by default). Samples always land in
//! the current bucket; the cursor moves forward only from [`add_sample`], by as
//! many quanta as have elapsed since the current bucket opened.
//!
//! ```text
//!   oldest                                   current
//!     │                                         │
//!  ┌──▼──┬─────┬─────┬─────┬─────┬─────┬─────┬──▼──┐
//!  │ b+1 │ b+2 │ ... │     │     │     │ b-1 │  b  │   capacity buckets
//!  └─────┴─────┴─────┴─────┴─────┴─────┴─────┴─────┘
//!     ▲ evicted from the running totals before reuse
//! ```
//!
//! The running totals (count, sum, min, max) always equal the aggregate over
//! the live buckets. Window queries never mutate anything, so a reader can not
//! shift bucket boundaries under concurrent writers.
//!
//! [`add_sample`]: WindowedHistogram::add_sample

use parking_lot::Mutex;
use serde::Serialize;

pub const NANOS_PER_MS: u64 = 1_000_000;

/// Largest ring a histogram allocates (about 55 minutes at 50ms quanta)
pub const MAX_WINDOW_CAPACITY: usize = 1 << 16;

/// Aggregate statistics over a window (all values in nanoseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub count: u64,
    pub sum_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl WindowStats {
    /// Total time in milliseconds
    pub fn total_ms(&self) -> f64 {
        self.sum_ns as f64 / NANOS_PER_MS as f64
    }

    /// Average duration in milliseconds
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms() / self.count as f64
        }
    }

    pub fn min_ms(&self) -> f64 {
        self.min_ns as f64 / NANOS_PER_MS as f64
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ns as f64 / NANOS_PER_MS as f64
    }
}

/// One quantum of samples
#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
    /// When this bucket became the current one
    opened_ns: u64,
    /// When the cursor moved past it
    closed_ns: u64,
}

impl Bucket {
    fn new(at_ns: u64) -> Self {
        Self {
            count: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
            opened_ns: at_ns,
            closed_ns: at_ns,
        }
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn clear(&mut self) {
        self.count = 0;
        self.sum = 0;
        self.min = u64::MAX;
        self.max = 0;
    }

    fn add(&mut self, duration_ns: u64) {
        self.count += 1;
        self.sum = self.sum.saturating_add(duration_ns);
        self.min = self.min.min(duration_ns);
        self.max = self.max.max(duration_ns);
    }
}

/// Everything guarded by the histogram lock
#[derive(Debug)]
struct HistogramState {
    buckets: Box<[Bucket]>,
    cursor: usize,
    total_count: u64,
    total_sum: u64,
    global_min: u64,
    global_max: u64,
}

impl HistogramState {
    fn new(capacity: usize, now_ns: u64) -> Self {
        Self {
            buckets: vec![Bucket::new(now_ns); capacity].into_boxed_slice(),
            cursor: 0,
            total_count: 0,
            total_sum: 0,
            global_min: u64::MAX,
            global_max: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Move the cursor forward by the number of whole quanta elapsed since the
    /// current bucket opened, evicting each reused bucket.
    fn advance(&mut self, now_ns: u64, quantum_ns: u64) {
        let opened = self.buckets[self.cursor].opened_ns;
        // A clock that went backwards counts as no elapsed time.
        let elapsed = now_ns.saturating_sub(opened);
        let steps = elapsed / quantum_ns;
        if steps == 0 {
            return;
        }
        if steps >= self.capacity() as u64 {
            self.clear_all(now_ns);
            return;
        }

        let mut extrema_stale = false;
        for _ in 0..steps {
            self.buckets[self.cursor].closed_ns = now_ns;
            self.cursor = (self.cursor + 1) % self.capacity();
            extrema_stale |= self.evict(self.cursor);
            let bucket = &mut self.buckets[self.cursor];
            bucket.opened_ns = now_ns;
            bucket.closed_ns = now_ns;
        }
        if extrema_stale {
            self.recompute_extrema();
        }
    }

    /// Remove a bucket's contents from the running totals and zero it.
    /// Returns true when it held the global min or max.
    fn evict(&mut self, index: usize) -> bool {
        let bucket = self.buckets[index];
        if bucket.is_empty() {
            return false;
        }
        self.total_count -= bucket.count;
        self.total_sum = self.total_sum.saturating_sub(bucket.sum);
        self.buckets[index].clear();
        bucket.min == self.global_min || bucket.max == self.global_max
    }

    fn recompute_extrema(&mut self) {
        self.global_min = u64::MAX;
        self.global_max = 0;
        for bucket in self.buckets.iter().filter(|b| !b.is_empty()) {
            self.global_min = self.global_min.min(bucket.min);
            self.global_max = self.global_max.max(bucket.max);
        }
    }

    fn clear_all(&mut self, now_ns: u64) {
        for bucket in self.buckets.iter_mut() {
            *bucket = Bucket::new(now_ns);
        }
        self.total_count = 0;
        self.total_sum = 0;
        self.global_min = u64::MAX;
        self.global_max = 0;
    }

    fn add(&mut self, duration_ns: u64) {
        self.buckets[self.cursor].add(duration_ns);
        self.total_count += 1;
        self.total_sum = self.total_sum.saturating_add(duration_ns);
        self.global_min = self.global_min.min(duration_ns);
        self.global_max = self.global_max.max(duration_ns);
    }
}

/// Per call site ring of time buckets
///
/// # Example
///
/// ```
/// use callstat::histogram::WindowedHistogram;
///
/// const MS: u64 = 1_000_000;
/// let hist = WindowedHistogram::new(4, 50 * MS, 0);
/// for t in [0, 60, 120, 180] {
///     hist.add_sample(t * MS, 10 * MS);
/// }
///
/// let all = hist.query(200 * MS, 200).unwrap();
/// assert_eq!(all.count, 4);
/// assert_eq!(all.sum_ns, 40 * MS);
///
/// let last = hist.query(200 * MS, 50).unwrap();
/// assert_eq!(last.count, 1);
/// ```
#[derive(Debug)]
pub struct WindowedHistogram {
    quantum_ns: u64,
    state: Mutex<HistogramState>,
}

impl WindowedHistogram {
    /// Create a histogram whose first bucket opens at `now_ns`
    ///
    /// Zero capacity or a zero quantum are raised to 1. Capacity is capped at
    /// [`MAX_WINDOW_CAPACITY`].
    pub fn new(capacity: usize, quantum_ns: u64, now_ns: u64) -> Self {
        Self {
            quantum_ns: quantum_ns.max(1),
            state: Mutex::new(HistogramState::new(
                capacity.clamp(1, MAX_WINDOW_CAPACITY),
                now_ns,
            )),
        }
    }

    /// Record one call duration observed at `now_ns`
    ///
    /// Advance and update happen under a single lock acquisition.
    pub fn add_sample(&self, now_ns: u64, duration_ns: u64) {
        let mut state = self.state.lock();
        state.advance(now_ns, self.quantum_ns);
        state.add(duration_ns);
    }

    /// Aggregate the buckets covering the trailing `window_ms` as of `now_ns`
    ///
    /// Returns `None` when the window holds no samples. The current bucket is
    /// counted only if it opened strictly after the window start; older
    /// buckets are counted while their close time is after the window start.
    pub fn query(&self, now_ns: u64, window_ms: u64) -> Option<WindowStats> {
        let state = self.state.lock();
        let capacity = state.capacity();
        let requested_ns = window_ms.saturating_mul(NANOS_PER_MS);
        let window_ns = requested_ns.min(self.max_window_ns(capacity));
        // None: the window reaches back past the clock origin
        let window_start = now_ns.checked_sub(window_ns);
        let positions = (requested_ns / self.quantum_ns).clamp(1, capacity as u64) as usize;

        let mut stats = WindowStats {
            count: 0,
            sum_ns: 0,
            min_ns: u64::MAX,
            max_ns: 0,
        };

        for i in 0..positions {
            let bucket = &state.buckets[(state.cursor + capacity - i) % capacity];
            if i == 0 {
                if window_start.is_some_and(|start| bucket.opened_ns <= start) {
                    continue;
                }
            } else if window_start.is_some_and(|start| bucket.closed_ns <= start) {
                // Everything further back closed even earlier.
                break;
            }
            if bucket.is_empty() {
                continue;
            }
            stats.count += bucket.count;
            stats.sum_ns = stats.sum_ns.saturating_add(bucket.sum);
            stats.min_ns = stats.min_ns.min(bucket.min);
            stats.max_ns = stats.max_ns.max(bucket.max);
        }

        (stats.count > 0).then_some(stats)
    }

    /// Running totals over every live bucket
    pub fn retained(&self) -> Option<WindowStats> {
        let state = self.state.lock();
        (state.total_count > 0).then_some(WindowStats {
            count: state.total_count,
            sum_ns: state.total_sum,
            min_ns: state.global_min,
            max_ns: state.global_max,
        })
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    pub fn quantum_ns(&self) -> u64 {
        self.quantum_ns
    }

    /// Longest window this histogram can answer
    pub fn max_window_ms(&self) -> u64 {
        self.max_window_ns(self.capacity()) / NANOS_PER_MS
    }

    /// Opening timestamp of the current bucket
    pub fn current_bucket_opened_ns(&self) -> u64 {
        let state = self.state.lock();
        state.buckets[state.cursor].opened_ns
    }

    fn max_window_ns(&self, capacity: usize) -> u64 {
        (capacity as u64).saturating_mul(self.quantum_ns)
    }
}
