//! Run configuration and the rules that split global resources across
//! worker threads.

use std::time::Duration;

use crate::error::Error;
use crate::stats::DEFAULT_MAX_SAMPLES;
use crate::table::NUM_SLOTS;
use crate::wire::QueryBuilder;

/// Ceiling on outstanding queries per worker: one slot per transaction id.
pub const MAX_OUTSTANDING_PER_WORKER: usize = NUM_SLOTS;

/// Ceiling on client sockets per worker.
pub const MAX_CLIENTS_PER_WORKER: usize = 256;

/// Global knobs, straight from the command line.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Total client sockets across all workers.
    pub clients: usize,
    /// Requested worker thread count (may be reduced by the split rules).
    pub threads: usize,
    /// Global outstanding-query ceiling.
    pub max_outstanding: usize,
    /// Global QPS ceiling; 0 = unlimited.
    pub max_qps: u64,
    /// Per-query timeout.
    pub timeout: Duration,
    /// Total run length; `None` = until input is exhausted.
    pub time_limit: Option<Duration>,
    /// Passes over the datafile; 0 = unlimited.
    pub max_passes: u64,
    /// Interval-statistics period; `None` = off.
    pub stats_interval: Option<Duration>,
    pub verbose: bool,
    pub builder: QueryBuilder,
    /// Per-worker latency sample cap.
    pub max_samples: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            clients: 1,
            threads: 1,
            max_outstanding: 100,
            max_qps: 0,
            timeout: Duration::from_secs(5),
            time_limit: None,
            max_passes: 1,
            stats_interval: None,
            verbose: false,
            builder: QueryBuilder::default(),
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

/// The `-n` default depends on `-l`: a time-bounded run loops the input
/// forever, a plain run makes one pass.
pub fn default_max_passes(time_limit: Option<Duration>) -> u64 {
    if time_limit.is_some() { 0 } else { 1 }
}

/// One worker's share of the global resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub id: usize,
    pub clients: usize,
    pub max_outstanding: usize,
    /// This worker's QPS ceiling; 0 = unlimited.
    pub max_qps: u64,
    pub timeout_us: u64,
    pub verbose: bool,
    pub max_samples: usize,
}

/// `R/threads`, plus one of the `R mod threads` leftovers for the first
/// workers.
fn per_thread(total: u64, threads: u64, offset: u64) -> u64 {
    total / threads + u64::from(offset < total % threads)
}

/// The thread count actually used, after the clamping rules.
pub fn effective_threads(config: &RunConfig) -> usize {
    let mut threads = config.threads;
    if config.max_qps > 0 && threads as u64 > config.max_qps {
        threads = config.max_qps as usize;
    }
    if threads > config.clients {
        threads = config.clients;
    }
    threads
}

/// Validate and split the run configuration into per-worker shares.
pub fn split(config: &RunConfig) -> Result<Vec<WorkerConfig>, Error> {
    if config.clients == 0 {
        return Err(Error::Config("need at least one client socket".to_string()));
    }
    if config.threads == 0 {
        return Err(Error::Config("need at least one thread".to_string()));
    }
    if config.max_outstanding == 0 {
        return Err(Error::Config("max outstanding must be positive".to_string()));
    }

    let threads = effective_threads(config);
    if config.max_outstanding < threads {
        return Err(Error::Config(format!(
            "max outstanding ({}) must cover every thread ({threads})",
            config.max_outstanding
        )));
    }

    let t = threads as u64;
    let timeout_us = config.timeout.as_micros() as u64;
    let workers = (0..threads)
        .map(|id| {
            let offset = id as u64;
            WorkerConfig {
                id,
                clients: (per_thread(config.clients as u64, t, offset) as usize)
                    .min(MAX_CLIENTS_PER_WORKER),
                max_outstanding: (per_thread(config.max_outstanding as u64, t, offset) as usize)
                    .min(MAX_OUTSTANDING_PER_WORKER),
                max_qps: if config.max_qps > 0 { per_thread(config.max_qps, t, offset) } else { 0 },
                timeout_us,
                verbose: config.verbose,
                max_samples: config.max_samples,
            }
        })
        .collect();
    Ok(workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(clients: usize, threads: usize, q: usize, qps: u64) -> RunConfig {
        RunConfig {
            clients,
            threads,
            max_outstanding: q,
            max_qps: qps,
            ..RunConfig::default()
        }
    }

    // -----------------------------------------------------------------------
    // Thread clamping
    // -----------------------------------------------------------------------

    #[test]
    fn test_threads_clamped_to_qps() {
        let cfg = config(16, 8, 100, 3);
        assert_eq!(effective_threads(&cfg), 3);
    }

    #[test]
    fn test_threads_clamped_to_clients() {
        let cfg = config(2, 8, 100, 0);
        assert_eq!(effective_threads(&cfg), 2);
    }

    #[test]
    fn test_threads_unclamped() {
        let cfg = config(8, 4, 100, 1000);
        assert_eq!(effective_threads(&cfg), 4);
    }

    // -----------------------------------------------------------------------
    // Resource splitting
    // -----------------------------------------------------------------------

    #[test]
    fn test_split_even() {
        let workers = split(&config(4, 2, 100, 50)).unwrap();
        assert_eq!(workers.len(), 2);
        for w in &workers {
            assert_eq!(w.clients, 2);
            assert_eq!(w.max_outstanding, 50);
            assert_eq!(w.max_qps, 25);
        }
    }

    #[test]
    fn test_split_remainder_to_first_workers() {
        let workers = split(&config(5, 3, 10, 7)).unwrap();
        let clients: Vec<usize> = workers.iter().map(|w| w.clients).collect();
        assert_eq!(clients, vec![2, 2, 1]);
        let q: Vec<usize> = workers.iter().map(|w| w.max_outstanding).collect();
        assert_eq!(q, vec![4, 3, 3]);
        let qps: Vec<u64> = workers.iter().map(|w| w.max_qps).collect();
        assert_eq!(qps, vec![3, 2, 2]);
    }

    #[test]
    fn test_split_totals_conserved() {
        let workers = split(&config(17, 5, 103, 1009)).unwrap();
        assert_eq!(workers.iter().map(|w| w.clients).sum::<usize>(), 17);
        assert_eq!(workers.iter().map(|w| w.max_outstanding).sum::<usize>(), 103);
        assert_eq!(workers.iter().map(|w| w.max_qps).sum::<u64>(), 1009);
    }

    #[test]
    fn test_split_unlimited_qps_stays_unlimited() {
        let workers = split(&config(4, 2, 100, 0)).unwrap();
        assert!(workers.iter().all(|w| w.max_qps == 0));
    }

    #[test]
    fn test_split_caps_per_worker_limits() {
        let cfg = config(600, 1, 200_000, 0);
        let workers = split(&cfg).unwrap();
        assert_eq!(workers[0].clients, MAX_CLIENTS_PER_WORKER);
        assert_eq!(workers[0].max_outstanding, MAX_OUTSTANDING_PER_WORKER);
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_split_rejects_zero_clients() {
        assert!(split(&config(0, 1, 100, 0)).is_err());
    }

    #[test]
    fn test_split_rejects_outstanding_below_threads() {
        assert!(split(&config(8, 4, 3, 0)).is_err());
    }

    #[test]
    fn test_default_max_passes() {
        assert_eq!(default_max_passes(None), 1);
        assert_eq!(default_max_passes(Some(Duration::from_secs(10))), 0);
    }
}
