//! Counters, latency accumulation, and the final cross-worker summary.
//!
//! Two tiers with different sharing rules:
//!
//! - [`WorkerCounters`]: relaxed atomics, bumped on the hot paths and read
//!   live by the interval-stats thread and by the sender's pacing gates.
//! - [`ReceiverStats`]: owned by the receiver thread alone (latency sums,
//!   extrema, rcode histogram, the bounded sample buffer) and handed to the
//!   aggregator when the thread joins. Summation across workers happens
//!   once, after every join, so it needs no synchronization at all.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::wire::{RCODE_NAMES, rcode_name};

/// Default cap on latency samples kept per worker. Pushes past the cap are
/// silently dropped; the summary statistics still cover every completion.
pub const DEFAULT_MAX_SAMPLES: usize = 100_000_000;

/// Shared per-worker counters. Relaxed ordering is enough: cross-thread
/// readers only want a recent value, and the authoritative totals are read
/// after both threads have joined.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub num_sent: AtomicU64,
    pub num_completed: AtomicU64,
    pub num_timedout: AtomicU64,
    pub num_interrupted: AtomicU64,
    pub total_request_size: AtomicU64,
    pub total_response_size: AtomicU64,
}

impl WorkerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.num_sent.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.num_completed.load(Ordering::Relaxed)
    }

    pub fn timedout(&self) -> u64 {
        self.num_timedout.load(Ordering::Relaxed)
    }
}

/// Latency accumulation for one worker, receiver-private.
#[derive(Debug)]
pub struct LatencyStats {
    pub sum_us: f64,
    pub sum_squares: f64,
    pub min_us: u64,
    pub max_us: u64,
    pub count: u64,
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyStats {
    pub fn new(max_samples: usize) -> Self {
        Self {
            sum_us: 0.0,
            sum_squares: 0.0,
            min_us: u64::MAX,
            max_us: 0,
            count: 0,
            samples: Vec::new(),
            max_samples,
        }
    }

    pub fn record(&mut self, latency_us: u64) {
        self.count += 1;
        let l = latency_us as f64;
        self.sum_us += l;
        self.sum_squares += l * l;
        self.min_us = self.min_us.min(latency_us);
        self.max_us = self.max_us.max(latency_us);
        if self.samples.len() < self.max_samples {
            self.samples.push(latency_us);
        }
    }

    pub fn samples(&self) -> &[u64] {
        &self.samples
    }
}

/// Everything the receiver thread accumulates and returns on join.
#[derive(Debug)]
pub struct ReceiverStats {
    pub rcode_counts: [u64; 16],
    pub latency: LatencyStats,
    /// Epoch microseconds of the latest reply this worker saw.
    pub last_arrival_us: u64,
}

impl ReceiverStats {
    pub fn new(max_samples: usize) -> Self {
        Self {
            rcode_counts: [0; 16],
            latency: LatencyStats::new(max_samples),
            last_arrival_us: 0,
        }
    }

    pub fn record_completion(&mut self, latency_us: u64, rcode: u8, arrival_us: u64) {
        self.latency.record(latency_us);
        self.rcode_counts[usize::from(rcode & 0x0f)] += 1;
        self.last_arrival_us = self.last_arrival_us.max(arrival_us);
    }
}

/// Per-worker results snapshot, taken after both threads joined.
#[derive(Debug)]
pub struct WorkerReport {
    pub id: usize,
    pub sent: u64,
    pub completed: u64,
    pub timedout: u64,
    pub interrupted: u64,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub rx: ReceiverStats,
}

/// One rcode histogram row in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct RcodeCount {
    pub rcode: &'static str,
    pub count: u64,
}

/// The aggregated, printable, serializable run result.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub queries_sent: u64,
    pub queries_completed: u64,
    pub queries_lost: u64,
    pub queries_interrupted: u64,
    pub rcodes: Vec<RcodeCount>,
    pub avg_request_size: f64,
    pub avg_response_size: f64,
    pub run_time_s: f64,
    pub queries_per_second: f64,
    pub latency_min_s: f64,
    pub latency_avg_s: f64,
    pub latency_max_s: f64,
    pub latency_stddev_s: f64,
}

impl RunSummary {
    /// Fold per-worker reports into run totals. `run_time_us` is the span
    /// from gate-open to the latest arrival (or shutdown, whichever is
    /// later-known by the coordinator).
    pub fn aggregate(reports: &[WorkerReport], run_time_us: u64) -> Self {
        let mut sent = 0u64;
        let mut completed = 0u64;
        let mut lost = 0u64;
        let mut interrupted = 0u64;
        let mut request_bytes = 0u64;
        let mut response_bytes = 0u64;
        let mut rcode_counts = [0u64; 16];
        let mut sum = 0.0f64;
        let mut sum_squares = 0.0f64;
        let mut n = 0u64;
        let mut min_us = u64::MAX;
        let mut max_us = 0u64;

        for r in reports {
            sent += r.sent;
            completed += r.completed;
            lost += r.timedout;
            interrupted += r.interrupted;
            request_bytes += r.request_bytes;
            response_bytes += r.response_bytes;
            for (acc, c) in rcode_counts.iter_mut().zip(r.rx.rcode_counts) {
                *acc += c;
            }
            sum += r.rx.latency.sum_us;
            sum_squares += r.rx.latency.sum_squares;
            n += r.rx.latency.count;
            min_us = min_us.min(r.rx.latency.min_us);
            max_us = max_us.max(r.rx.latency.max_us);
        }

        let run_time_s = run_time_us as f64 / 1e6;
        let rcodes = RCODE_NAMES
            .iter()
            .zip(rcode_counts)
            .filter(|(_, c)| *c > 0)
            .map(|(name, count)| RcodeCount { rcode: name, count })
            .collect();

        Self {
            queries_sent: sent,
            queries_completed: completed,
            queries_lost: lost,
            queries_interrupted: interrupted,
            rcodes,
            avg_request_size: ratio(request_bytes as f64, sent),
            avg_response_size: ratio(response_bytes as f64, completed),
            run_time_s,
            queries_per_second: if run_time_s > 0.0 { completed as f64 / run_time_s } else { 0.0 },
            latency_min_s: if n > 0 { min_us as f64 / 1e6 } else { 0.0 },
            latency_avg_s: ratio(sum / 1e6, n),
            latency_max_s: max_us as f64 / 1e6,
            latency_stddev_s: stddev_us(sum, sum_squares, n) / 1e6,
        }
    }

    /// The human-readable `Statistics:` block.
    pub fn print(&self) {
        println!();
        println!("Statistics:");
        println!();
        println!("  Queries sent:         {}", self.queries_sent);
        println!(
            "  Queries completed:    {} ({:.2}%)",
            self.queries_completed,
            percent(self.queries_completed, self.queries_sent)
        );
        println!(
            "  Queries lost:         {} ({:.2}%)",
            self.queries_lost,
            percent(self.queries_lost, self.queries_sent)
        );
        println!("  Queries interrupted:  {}", self.queries_interrupted);
        println!();

        if !self.rcodes.is_empty() {
            let histogram = self
                .rcodes
                .iter()
                .map(|r| {
                    format!(
                        "{} {} ({:.2}%)",
                        r.rcode,
                        r.count,
                        percent(r.count, self.queries_completed)
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            println!("  Response codes:       {histogram}");
        }
        println!(
            "  Average packet size:  request {:.0}, response {:.0}",
            self.avg_request_size, self.avg_response_size
        );
        println!("  Run time (s):         {:.6}", self.run_time_s);
        println!("  Queries per second:   {:.6}", self.queries_per_second);
        println!();
        println!(
            "  Average Latency (s):  {:.6} (min {:.6}, max {:.6})",
            self.latency_avg_s, self.latency_min_s, self.latency_max_s
        );
        println!("  Latency StdDev (s):   {:.6}", self.latency_stddev_s);
    }

    /// The per-sample dump: every recorded latency, per worker, in
    /// insertion order.
    pub fn print_samples(reports: &[WorkerReport]) {
        for r in reports {
            let samples = r.rx.latency.samples();
            if samples.is_empty() {
                continue;
            }
            println!();
            println!("Latencies for thread {} (s):", r.id);
            for s in samples {
                println!("  {}", format_us(*s));
            }
        }
    }
}

/// `sqrt((Σx² - (Σx)²/n) / (n-1))`, zero below two samples.
fn stddev_us(sum: f64, sum_squares: f64, n: u64) -> f64 {
    if n < 2 {
        return 0.0;
    }
    let n = n as f64;
    let var = (sum_squares - sum * sum / n) / (n - 1.0);
    if var > 0.0 { var.sqrt() } else { 0.0 }
}

fn ratio(total: f64, n: u64) -> f64 {
    if n > 0 { total / n as f64 } else { 0.0 }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole > 0 { part as f64 * 100.0 / whole as f64 } else { 0.0 }
}

/// Microseconds as `<sec>.<usec>` with the fixed six-digit fraction.
pub fn format_us(us: u64) -> String {
    format!("{}.{:06}", us / 1_000_000, us % 1_000_000)
}

/// One line of `-v` output for a completed query.
pub fn print_verbose_completion(rcode: u8, desc: Option<&str>, latency_us: u64) {
    println!(
        "> {} {} {}",
        rcode_name(rcode),
        desc.unwrap_or("-"),
        format_us(latency_us)
    );
}
