//! The receiver loop: one per worker.
//!
//! Each iteration prunes timeouts from the old end of the outstanding list,
//! drains up to a batch of packets across the socket bank without holding
//! any lock, correlates the whole batch under one lock acquisition, then
//! does the latency bookkeeping unlocked. Short and unexpected replies are
//! logged and discarded without touching the counters that drive
//! completion.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::mpsc;

use crate::config::WorkerConfig;
use crate::run::{Event, RunContext, TIMEOUT_CHECK_US};
use crate::stats::{ReceiverStats, print_verbose_completion};
use crate::table::ReplyMatch;
use crate::transport::would_block;
use crate::wire::peek_header;
use crate::worker::WorkerShared;

/// Packets drained from the bank before taking the table lock.
pub(crate) const RECV_BATCH_SIZE: usize = 16;

/// One packet staged between the drain and the correlation pass.
struct RecvRecord {
    socket: usize,
    qid: u16,
    rcode: u8,
    len: usize,
    arrival_us: u64,
    sent_us: u64,
    desc: Option<String>,
    unexpected: bool,
    short: bool,
}

pub(crate) fn run(
    ctx: &RunContext,
    shared: &WorkerShared,
    cfg: &WorkerConfig,
    events: &mpsc::Sender<Event>,
) -> ReceiverStats {
    ctx.wait_start();
    log::debug!("receiver {} started", cfg.id);

    let mut stats = ReceiverStats::new(cfg.max_samples);
    let term = ctx.term_fd();
    let nsocks = shared.bank.len();
    let mut last_socket = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    let mut timed_out: Vec<Option<String>> = Vec::new();

    loop {
        // Timeout prune: walk from the oldest outstanding query and stop at
        // the first one still inside the window.
        let cutoff = ctx.now_us().saturating_sub(cfg.timeout_us);
        timed_out.clear();
        {
            let mut table = shared.table.lock().unwrap();
            while let Some((qid, sent)) = table.oldest() {
                if sent >= cutoff {
                    break;
                }
                let (_, desc) = table.release_to_back(qid);
                shared.counters.num_timedout.fetch_add(1, Ordering::Relaxed);
                timed_out.push(desc);
            }
            if !timed_out.is_empty() {
                shared.cond.notify_one();
            }
        }
        for desc in timed_out.drain(..) {
            match desc {
                Some(d) => println!("> T {d}"),
                None => log::debug!("query timed out"),
            }
        }

        // Done when the sender has finished and nothing is in flight.
        if shared.done_sending.load(Ordering::Acquire)
            && shared.table.lock().unwrap().outstanding_len() == 0
        {
            break;
        }
        if ctx.is_stopping() {
            break;
        }

        // Batch drain across the bank, fair rotation from last_socket.
        let mut batch: Vec<RecvRecord> = Vec::with_capacity(RECV_BATCH_SIZE);
        let mut fatal: Option<io::Error> = None;
        'drain: while batch.len() < RECV_BATCH_SIZE {
            let mut got = false;
            for k in 0..nsocks {
                let idx = (last_socket + k) % nsocks;
                match shared.bank.with(idx, |t| t.recv(&mut buf)) {
                    Ok(n) => {
                        let arrival_us = ctx.now_us();
                        let rec = match peek_header(&buf[..n]) {
                            Some((qid, rcode)) => RecvRecord {
                                socket: idx,
                                qid,
                                rcode,
                                len: n,
                                arrival_us,
                                sent_us: 0,
                                desc: None,
                                unexpected: false,
                                short: false,
                            },
                            None => RecvRecord {
                                socket: idx,
                                qid: 0,
                                rcode: 0,
                                len: n,
                                arrival_us,
                                sent_us: 0,
                                desc: None,
                                unexpected: false,
                                short: true,
                            },
                        };
                        batch.push(rec);
                        last_socket = (idx + 1) % nsocks;
                        got = true;
                        break;
                    }
                    Err(e) if would_block(&e) => {} // drained for this batch
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        fatal = Some(e);
                        break 'drain;
                    }
                }
            }
            if !got {
                break;
            }
        }

        // Correlation: one lock acquisition for the whole batch.
        if !batch.is_empty() {
            let mut table = shared.table.lock().unwrap();
            for rec in &mut batch {
                if rec.short {
                    continue;
                }
                match table.match_reply(rec.qid, rec.socket) {
                    ReplyMatch::Matched { sent_us, desc } => {
                        rec.sent_us = sent_us;
                        rec.desc = desc;
                    }
                    ReplyMatch::NotOutstanding | ReplyMatch::Unsent | ReplyMatch::WrongSocket => {
                        rec.unexpected = true;
                    }
                }
            }
            // Completions freed capacity; wake a gated sender.
            shared.cond.notify_one();
        }

        // Bookkeeping, no lock held.
        for rec in &batch {
            if rec.short {
                log::warn!("discarding short response ({} bytes)", rec.len);
                continue;
            }
            if rec.unexpected {
                log::warn!("received response with unexpected id {}", rec.qid);
                continue;
            }
            let latency_us = rec.arrival_us.saturating_sub(rec.sent_us);
            stats.record_completion(latency_us, rec.rcode, rec.arrival_us);
            shared.counters.num_completed.fetch_add(1, Ordering::Relaxed);
            shared
                .counters
                .total_response_size
                .fetch_add(rec.len as u64, Ordering::Relaxed);
            if cfg.verbose {
                print_verbose_completion(rec.rcode, rec.desc.as_deref(), latency_us);
            }
        }

        // A short batch means the bank ran dry (or broke): block until a
        // socket turns readable, termination fires, or the check interval
        // lapses and the timeout pruner gets another look.
        if batch.len() < RECV_BATCH_SIZE {
            if let Some(e) = fatal {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("receive on worker {} failed: {e}", cfg.id);
                ctx.request_stop();
                break;
            }
            let _ = shared.bank.wait_any_readable(term, TIMEOUT_CHECK_US);
        }
    }

    log::debug!(
        "receiver {} done: {} completed, {} timed out",
        cfg.id,
        shared.counters.completed(),
        shared.counters.timedout()
    );
    let _ = events.send(Event::ReceiverDone(cfg.id));
    stats
}
