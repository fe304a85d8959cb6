//! Process-wide statistics: atomic counters, EWMA rates, the per-AS
//! frequency sketch and the recent-error ring read by the stats interface.
//!
//! Everything here is updated from the hot path, so writes are atomic or
//! behind short uncontended locks. Readers (the stats server) only ever
//! take snapshots.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Maximum heavy-hitter entries kept per direction.
pub const TOP_AS_CAPACITY: usize = 256;

/// EWMA time constant for the in/out packet rates.
const RATE_TAU_SECS: f64 = 10.0;

/// Direction of an AS observation within a flow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Src,
    Dst,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Src => "src",
            Direction::Dst => "dst",
        }
    }
}

/// All pipeline counters. Monotonic except the two gauges at the end.
#[derive(Debug, Default)]
pub struct Counters {
    pub pkts_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub pkts_out: AtomicU64,
    pub bytes_out: AtomicU64,
    pub pkts_dropped_queue: AtomicU64,
    pub pkts_dropped_decode: AtomicU64,
    pub pkts_dropped_orphan_template: AtomicU64,
    pub pkts_dropped_forward: AtomicU64,
    pub pkts_dropped_oversized: AtomicU64,
    pub templates_seen: AtomicU64,
    pub records_decoded: AtomicU64,
    pub records_with_as: AtomicU64,
    pub records_enriched: AtomicU64,

    /// Gauge: largest ingress datagram seen so far.
    pub max_packet_seen: AtomicU64,
    /// Gauge: datagrams currently queued inside the pipeline.
    pub in_flight: AtomicU64,
}

impl Counters {
    pub fn note_packet_in(&self, len: usize) {
        self.pkts_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
        self.max_packet_seen.fetch_max(len as u64, Ordering::Relaxed);
    }

    pub fn note_packet_out(&self, len: usize) {
        self.pkts_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// One entry of the `errors` command output.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Bounded ring of the most recent error events, newest last.
#[derive(Debug)]
struct ErrorLog {
    events: Mutex<VecDeque<ErrorEvent>>,
    capacity: usize,
}

impl ErrorLog {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn push(&self, message: String) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(ErrorEvent {
            at: Utc::now(),
            message,
        });
    }

    /// Newest first.
    fn recent(&self) -> Vec<ErrorEvent> {
        self.events.lock().iter().rev().cloned().collect()
    }
}

/// Exponentially weighted packet rate, fed by the janitor once a second.
#[derive(Debug, Default)]
struct EwmaRate {
    last_count: u64,
    rate: f64,
}

impl EwmaRate {
    fn update(&mut self, count: u64, dt: Duration) -> f64 {
        let secs = dt.as_secs_f64();
        if secs <= 0.0 {
            return self.rate;
        }
        let instant_rate = count.saturating_sub(self.last_count) as f64 / secs;
        self.last_count = count;
        let alpha = secs / (RATE_TAU_SECS + secs);
        self.rate += alpha * (instant_rate - self.rate);
        self.rate
    }
}

/// Count-min sketch over `(direction, as_number)` plus a bounded
/// heavy-hitters table per direction. The sketch caps memory no matter how
/// many distinct AS numbers pass through; the table keeps exact counts only
/// for the current top entries.
#[derive(Debug)]
pub struct TopAsSketch {
    cells: Vec<AtomicU32>,
    hitters: Mutex<HashMap<(Direction, u32), u64>>,
}

const SKETCH_DEPTH: usize = 4;
const SKETCH_WIDTH: usize = 2048;

impl TopAsSketch {
    fn new() -> Self {
        let mut cells = Vec::with_capacity(SKETCH_DEPTH * SKETCH_WIDTH);
        cells.resize_with(SKETCH_DEPTH * SKETCH_WIDTH, AtomicU32::default);
        Self {
            cells,
            hitters: Mutex::new(HashMap::new()),
        }
    }

    fn cell_index(row: usize, direction: Direction, asn: u32) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        (row as u64).hash(&mut hasher);
        direction.hash(&mut hasher);
        asn.hash(&mut hasher);
        row * SKETCH_WIDTH + (hasher.finish() as usize % SKETCH_WIDTH)
    }

    /// Count one observation and update the heavy-hitters table.
    pub fn observe(&self, direction: Direction, asn: u32) {
        let mut estimate = u32::MAX;
        for row in 0..SKETCH_DEPTH {
            let cell = &self.cells[Self::cell_index(row, direction, asn)];
            let value = cell.fetch_add(1, Ordering::Relaxed).saturating_add(1);
            estimate = estimate.min(value);
        }

        let mut hitters = self.hitters.lock();
        if let Some(count) = hitters.get_mut(&(direction, asn)) {
            *count += 1;
            return;
        }

        let per_direction = hitters
            .keys()
            .filter(|(d, _)| *d == direction)
            .count();
        if per_direction < TOP_AS_CAPACITY {
            hitters.insert((direction, asn), u64::from(estimate));
            return;
        }

        // Table full for this direction: replace the smallest entry when the
        // sketched count exceeds it.
        let min = hitters
            .iter()
            .filter(|((d, _), _)| *d == direction)
            .min_by_key(|(_, count)| **count)
            .map(|(key, count)| (*key, *count));
        if let Some((min_key, min_count)) = min {
            if u64::from(estimate) > min_count {
                hitters.remove(&min_key);
                hitters.insert((direction, asn), u64::from(estimate));
            }
        }
    }

    /// Heavy hitters for one direction, sorted by count descending.
    pub fn top(&self, direction: Direction) -> Vec<(u32, u64)> {
        let hitters = self.hitters.lock();
        let mut entries: Vec<(u32, u64)> = hitters
            .iter()
            .filter(|((d, _), _)| *d == direction)
            .map(|((_, asn), count)| (*asn, *count))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries
    }
}

/// Per-key token gate used to rate-limit repetitive log lines, e.g. the
/// unknown-template warning at one line per exporter per minute.
#[derive(Debug)]
pub struct LogGate {
    last: Mutex<HashMap<IpAddr, Instant>>,
    interval: Duration,
}

impl LogGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// True when the caller may log for this key now.
    pub fn allow(&self, key: IpAddr) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match last.get(&key) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }
}

/// Snapshot handed to the stats server for the `stats` command.
#[derive(Debug, Clone)]
pub struct RateSnapshot {
    pub in_pps: f64,
    pub out_pps: f64,
}

/// Everything the pipeline shares: counters, rates, sketch and error ring.
#[derive(Debug)]
pub struct Stats {
    pub counters: Counters,
    pub top_as: TopAsSketch,
    errors: ErrorLog,
    rates: Mutex<Rates>,
    started: Instant,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Rates {
    in_rate: EwmaRate,
    out_rate: EwmaRate,
    last_tick: Option<Instant>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            top_as: TopAsSketch::new(),
            errors: ErrorLog::new(10),
            rates: Mutex::new(Rates::default()),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record an operator-visible error event.
    pub fn record_error(&self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Last 10 error events, newest first.
    pub fn recent_errors(&self) -> Vec<ErrorEvent> {
        self.errors.recent()
    }

    /// Advance the EWMA rates; called by the janitor roughly once a second.
    pub fn tick_rates(&self) {
        let now = Instant::now();
        let mut rates = self.rates.lock();
        let dt = match rates.last_tick {
            Some(at) => now.duration_since(at),
            None => Duration::from_secs(1),
        };
        rates.last_tick = Some(now);
        let pkts_in = self.counters.pkts_in.load(Ordering::Relaxed);
        let pkts_out = self.counters.pkts_out.load(Ordering::Relaxed);
        rates.in_rate.update(pkts_in, dt);
        rates.out_rate.update(pkts_out, dt);
    }

    pub fn rates(&self) -> RateSnapshot {
        let rates = self.rates.lock();
        RateSnapshot {
            in_pps: rates.in_rate.rate,
            out_pps: rates.out_rate.rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_note_packets() {
        let counters = Counters::default();
        counters.note_packet_in(100);
        counters.note_packet_in(1400);
        counters.note_packet_out(100);

        assert_eq!(counters.pkts_in.load(Ordering::Relaxed), 2);
        assert_eq!(counters.bytes_in.load(Ordering::Relaxed), 1500);
        assert_eq!(counters.pkts_out.load(Ordering::Relaxed), 1);
        assert_eq!(counters.bytes_out.load(Ordering::Relaxed), 100);
        assert_eq!(counters.max_packet_seen.load(Ordering::Relaxed), 1400);
    }

    #[test]
    fn test_error_log_keeps_last_ten_newest_first() {
        let stats = Stats::new();
        for i in 0..15 {
            stats.record_error(format!("event {i}"));
        }
        let recent = stats.recent_errors();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].message, "event 14");
        assert_eq!(recent[9].message, "event 5");
    }

    #[test]
    fn test_sketch_counts_and_orders() {
        let sketch = TopAsSketch::new();
        for _ in 0..50 {
            sketch.observe(Direction::Src, 15169);
        }
        for _ in 0..20 {
            sketch.observe(Direction::Src, 13335);
        }
        sketch.observe(Direction::Dst, 64512);

        let top = sketch.top(Direction::Src);
        assert_eq!(top[0], (15169, 50));
        assert_eq!(top[1], (13335, 20));

        let top_dst = sketch.top(Direction::Dst);
        assert_eq!(top_dst, vec![(64512, 1)]);
    }

    #[test]
    fn test_sketch_bounded_per_direction() {
        let sketch = TopAsSketch::new();
        // One heavy AS, then far more distinct light ones than the table holds.
        for _ in 0..1000 {
            sketch.observe(Direction::Src, 1);
        }
        for asn in 2..2000u32 {
            sketch.observe(Direction::Src, asn);
        }
        let top = sketch.top(Direction::Src);
        assert!(top.len() <= TOP_AS_CAPACITY);
        assert_eq!(top[0].0, 1, "heavy hitter must survive churn");
    }

    #[test]
    fn test_ewma_rate_converges() {
        let mut rate = EwmaRate::default();
        let mut total = 0;
        for _ in 0..120 {
            total += 100;
            rate.update(total, Duration::from_secs(1));
        }
        // 100 pps steady state; EWMA should be well within 5% after 2 min.
        assert!((rate.rate - 100.0).abs() < 5.0, "rate was {}", rate.rate);
    }

    #[test]
    fn test_log_gate() {
        let gate = LogGate::new(Duration::from_secs(60));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(gate.allow(ip));
        assert!(!gate.allow(ip));
        assert!(gate.allow(other), "keys are independent");
    }

    #[test]
    fn test_stats_rates_tick() {
        let stats = Stats::new();
        stats.counters.pkts_in.store(1000, Ordering::Relaxed);
        stats.tick_rates();
        let snapshot = stats.rates();
        assert!(snapshot.in_pps > 0.0);
        assert_eq!(snapshot.out_pps, 0.0);
    }
}
