//! Run control: spawn workers, open the start gate, watch for the deadline,
//! full drain, or an interrupt, then broadcast termination and aggregate.

use std::sync::atomic::Ordering;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use crate::config::{self, RunConfig};
use crate::error::Error;
use crate::input::InputSource;
use crate::run::{Event, RunContext, StopReason, TIMEOUT_CHECK_US};
use crate::stats::{RunSummary, WorkerReport, format_us};
use crate::transport::TransportFactory;
use crate::worker::{Worker, WorkerShared};

/// Everything a finished run produced.
pub struct RunResult {
    pub summary: RunSummary,
    pub reports: Vec<WorkerReport>,
    pub reason: StopReason,
    /// Wall-clock span the summary rates are computed over.
    pub run_time_us: u64,
}

/// Execute a full run.
///
/// The caller owns the [`RunContext`] and the event channel so a signal
/// handler can interrupt the run from outside: flip the context's flag and
/// post [`Event::Interrupted`] on `events_tx`.
pub fn run(
    cfg: &RunConfig,
    input: Arc<InputSource>,
    factory: &dyn TransportFactory,
    ctx: Arc<RunContext>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
) -> Result<RunResult, Error> {
    let worker_cfgs = config::split(cfg)?;

    let mut workers = Vec::with_capacity(worker_cfgs.len());
    for wc in worker_cfgs {
        let transports = factory.open(wc.id, wc.clients)?;
        workers.push(Worker::spawn(
            &ctx,
            wc,
            Arc::clone(&input),
            cfg.builder.clone(),
            transports,
            events_tx.clone(),
        )?);
    }
    let n_workers = workers.len();
    log::debug!("spawned {n_workers} workers");

    let shared: Vec<Arc<WorkerShared>> =
        workers.iter().map(|w| Arc::clone(&w.shared)).collect();
    let interval_thread = cfg
        .stats_interval
        .map(|period| spawn_interval_thread(Arc::clone(&ctx), shared.clone(), period));

    // Everything is constructed; let the workers loose.
    ctx.open_gate();

    let mut receivers_done = 0usize;
    let reason = loop {
        if ctx.is_interrupted() {
            break StopReason::Interrupted;
        }
        let stop = ctx.stop_time_us();
        let wait_us = stop.saturating_sub(ctx.now_us()).clamp(1, 500_000);
        match events_rx.recv_timeout(Duration::from_micros(wait_us)) {
            Ok(Event::ReceiverDone(_)) => {
                receivers_done += 1;
                if receivers_done == n_workers {
                    break StopReason::Drained;
                }
            }
            Ok(Event::SenderDone(_)) => {}
            Ok(Event::Interrupted) => break StopReason::Interrupted,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if stop != u64::MAX && ctx.now_us() >= stop {
                    break StopReason::TimeLimit;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break StopReason::Drained,
        }
    };
    log::debug!("stopping: {reason}");

    // One-shot broadcast, then release any sender parked on its condvar.
    ctx.request_stop();
    for s in &shared {
        s.cond.notify_all();
    }

    let reports: Vec<WorkerReport> = workers.into_iter().map(Worker::join).collect();
    if let Some(handle) = interval_thread {
        let _ = handle.join();
    }

    // Run time: gate-open to the latest arrival, falling back to the latest
    // send-done mark, then to now for runs that never completed a query.
    let start = ctx.start_us();
    let latest_arrival = reports
        .iter()
        .map(|r| r.rx.last_arrival_us)
        .max()
        .unwrap_or(0);
    let latest_done = shared
        .iter()
        .map(|s| s.done_send_time_us.load(Ordering::Acquire))
        .max()
        .unwrap_or(0);
    let mut end = latest_arrival.max(latest_done);
    if end <= start {
        end = ctx.now_us().max(start + 1);
    }
    let run_time_us = end - start;

    let summary = RunSummary::aggregate(&reports, run_time_us);
    Ok(RunResult { summary, reports, reason, run_time_us })
}

/// The optional interval-QPS publisher: `<elapsed>: <qps>` once per period.
fn spawn_interval_thread(
    ctx: Arc<RunContext>,
    shared: Vec<Arc<WorkerShared>>,
    period: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        ctx.wait_start();
        let period_us = (period.as_micros() as u64).max(1);
        let mut last_completed = 0u64;
        let mut last_us = ctx.start_us();
        loop {
            let target = last_us + period_us;
            while ctx.now_us() < target && !ctx.is_stopping() {
                let remain = target.saturating_sub(ctx.now_us());
                thread::sleep(Duration::from_micros(remain.min(TIMEOUT_CHECK_US)));
            }
            if ctx.is_stopping() {
                break;
            }
            let now = ctx.now_us();
            let completed: u64 = shared.iter().map(|s| s.counters.completed()).sum();
            let dt = now.saturating_sub(last_us).max(1);
            let qps = (completed - last_completed) as f64 * 1e6 / dt as f64;
            println!("{}: {qps:.6}", format_us(now - ctx.start_us()));
            last_completed = completed;
            last_us = now;
        }
    })
}
