//! The paced sender loop: one per worker.
//!
//! Ordering per iteration: anti-flood jitter, QPS gate, concurrency gate on
//! the worker condition, slot allocation, socket pick (up to 2N probes),
//! descriptor pull, build, commit, send. Any failure after allocation rolls
//! the slot back to the *front* of the free list so the id is reused by the
//! next attempt and the id→slot mapping never drifts.

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::WorkerConfig;
use crate::input::InputSource;
use crate::run::{Event, RunContext, TIMEOUT_CHECK_US};
use crate::transport::{Probe, in_progress, would_block};
use crate::wire::QueryBuilder;
use crate::worker::WorkerShared;

pub(crate) fn run(
    ctx: &RunContext,
    shared: &WorkerShared,
    cfg: &WorkerConfig,
    input: &InputSource,
    builder: &QueryBuilder,
    events: &mpsc::Sender<Event>,
) {
    ctx.wait_start();
    log::debug!("sender {} started, {} sockets", cfg.id, shared.bank.len());

    let term = ctx.term_fd();
    let mut msg = Vec::with_capacity(512);
    let mut any_in_progress = false;

    'main: while !ctx.is_interrupted()
        && !ctx.is_stopping()
        && ctx.now_us() < ctx.stop_time_us()
    {
        let num_sent = shared.counters.sent();

        // Anti-flood jitter: stagger the opening burst so the receiver gets
        // scheduled before the queue saturates.
        if num_sent < cfg.max_outstanding as u64 && num_sent % 2 == 1 {
            if shared.counters.completed() == 0 {
                thread::sleep(Duration::from_millis(1));
            } else {
                thread::yield_now();
            }
        }

        // QPS gate.
        if cfg.max_qps > 0 {
            let target_us = num_sent.saturating_mul(1_000_000) / cfg.max_qps;
            let elapsed = ctx.now_us().saturating_sub(ctx.start_us());
            if target_us > elapsed {
                let remaining = ctx.stop_time_us().saturating_sub(ctx.now_us());
                let wait = (target_us - elapsed).min(remaining).min(TIMEOUT_CHECK_US);
                if wait > 0 {
                    thread::sleep(Duration::from_micros(wait));
                }
                continue;
            }
        }

        // Concurrency gate and slot allocation under the worker lock.
        let qid = {
            let table = shared.table.lock().unwrap();
            if table.outstanding_len() >= cfg.max_outstanding {
                let wait_us = ctx
                    .stop_time_us()
                    .saturating_sub(ctx.now_us())
                    .min(TIMEOUT_CHECK_US)
                    .max(1);
                let _ = shared
                    .cond
                    .wait_timeout(table, Duration::from_micros(wait_us))
                    .unwrap();
                continue;
            }
            let mut table = table;
            match table.allocate() {
                Ok(qid) => qid,
                Err(_) => {
                    // Free list empty: every id is in flight.
                    drop(table);
                    thread::yield_now();
                    continue;
                }
            }
        };

        // Pick a ready socket: probe up to 2N, first Ready wins.
        let mut chosen = None;
        for _ in 0..(2 * shared.bank.len()) {
            let idx = shared.bank.pick();
            match shared.bank.probe(idx, 0, term) {
                Probe::Ready => {
                    chosen = Some(idx);
                    break;
                }
                Probe::InProgress => any_in_progress = true,
                Probe::NotReady => {}
                Probe::Timeout => {
                    shared.table.lock().unwrap().release_to_front(qid);
                    break 'main;
                }
            }
        }
        let Some(socket_idx) = chosen else {
            shared.table.lock().unwrap().release_to_front(qid);
            let _ = shared.bank.wait_any_writable(term, TIMEOUT_CHECK_US);
            continue;
        };

        // Next descriptor; an empty source ends this loop and nothing else.
        let Some(desc) = input.next() else {
            shared.table.lock().unwrap().release_to_front(qid);
            break;
        };

        if let Err(e) = builder.build(&desc.name, desc.qtype, qid, &mut msg) {
            log::error!("cannot build query for '{}': {e}", desc.text);
            shared.table.lock().unwrap().release_to_front(qid);
            continue;
        }

        // Stamp the send time, then transmit. The stamp goes in first so a
        // reply can never race a sentinel timestamp.
        let now = ctx.now_us();
        shared
            .table
            .lock()
            .unwrap()
            .commit(qid, now, socket_idx, cfg.verbose.then(|| desc.text.clone()));

        match shared.bank.with(socket_idx, |t| t.send(&msg)) {
            Ok(n) if n == msg.len() => {
                shared.counters.num_sent.fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .total_request_size
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(n) => {
                log::warn!("short send: {n} of {} bytes", msg.len());
                shared.table.lock().unwrap().release_to_front(qid);
            }
            Err(e) if in_progress(&e) => {
                // Queued behind a connect/handshake; the drain below flushes
                // it. The query is in flight from the engine's perspective.
                any_in_progress = true;
                shared.counters.num_sent.fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .total_request_size
                    .fetch_add(msg.len() as u64, Ordering::Relaxed);
            }
            Err(e) if would_block(&e) => {
                shared.table.lock().unwrap().release_to_front(qid);
            }
            Err(e) => {
                log::warn!("send on socket {socket_idx} failed: {e}");
                shared.table.lock().unwrap().release_to_front(qid);
            }
        }
    }

    // Keep driving sockets whose connect/handshake is still running, so
    // queries queued behind them actually hit the wire.
    while any_in_progress && !ctx.is_stopping() {
        any_in_progress = false;
        for idx in 0..shared.bank.len() {
            match shared.bank.probe(idx, 0, term) {
                Probe::InProgress => any_in_progress = true,
                Probe::Timeout => {
                    any_in_progress = false;
                    break;
                }
                Probe::Ready | Probe::NotReady => {}
            }
        }
        if any_in_progress {
            let _ = shared.bank.wait_any_writable(term, TIMEOUT_CHECK_US);
        }
    }

    shared
        .done_send_time_us
        .store(ctx.now_us(), Ordering::Release);
    shared.done_sending.store(true, Ordering::Release);
    log::debug!(
        "sender {} done: {} queries sent",
        cfg.id,
        shared.counters.sent()
    );
    let _ = events.send(Event::SenderDone(cfg.id));
}
