//! One worker: a sender thread and a receiver thread over shared state.
//!
//! The query table and its condition variable form the only cross-thread
//! lock on the hot path. The counters are relaxed atomics; everything else
//! the receiver accumulates is private to it and comes back through the
//! thread's join handle.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::thread::JoinHandle;

use crate::bank::SocketBank;
use crate::config::WorkerConfig;
use crate::input::InputSource;
use crate::run::{Event, RunContext};
use crate::stats::{ReceiverStats, WorkerCounters, WorkerReport};
use crate::table::QueryTable;
use crate::transport::Transport;
use crate::wire::QueryBuilder;
use crate::{receiver, sender};

pub struct WorkerShared {
    pub table: Mutex<QueryTable>,
    pub cond: Condvar,
    pub bank: SocketBank,
    pub counters: WorkerCounters,
    pub done_sending: AtomicBool,
    pub done_send_time_us: AtomicU64,
}

impl WorkerShared {
    pub fn new(transports: Vec<Box<dyn Transport>>) -> Self {
        Self {
            table: Mutex::new(QueryTable::new()),
            cond: Condvar::new(),
            bank: SocketBank::new(transports),
            counters: WorkerCounters::new(),
            done_sending: AtomicBool::new(false),
            done_send_time_us: AtomicU64::new(0),
        }
    }
}

pub struct Worker {
    pub shared: Arc<WorkerShared>,
    id: usize,
    sender: JoinHandle<()>,
    receiver: JoinHandle<ReceiverStats>,
}

impl Worker {
    pub fn spawn(
        ctx: &Arc<RunContext>,
        cfg: WorkerConfig,
        input: Arc<InputSource>,
        builder: QueryBuilder,
        transports: Vec<Box<dyn Transport>>,
        events: mpsc::Sender<Event>,
    ) -> io::Result<Self> {
        let shared = Arc::new(WorkerShared::new(transports));
        let id = cfg.id;

        let sender = {
            let ctx = Arc::clone(ctx);
            let shared = Arc::clone(&shared);
            let cfg = cfg.clone();
            let events = events.clone();
            std::thread::Builder::new()
                .name(format!("send-{id}"))
                .spawn(move || sender::run(&ctx, &shared, &cfg, &input, &builder, &events))?
        };

        let receiver = {
            let ctx = Arc::clone(ctx);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("recv-{id}"))
                .spawn(move || receiver::run(&ctx, &shared, &cfg, &events))?
        };

        Ok(Self { shared, id, sender, receiver })
    }

    /// Join both threads, reclassify whatever is still outstanding as
    /// interrupted, and snapshot this worker's results.
    pub fn join(self) -> WorkerReport {
        if self.sender.join().is_err() {
            log::error!("sender thread {} panicked", self.id);
        }
        let rx = match self.receiver.join() {
            Ok(rx) => rx,
            Err(_) => {
                log::error!("receiver thread {} panicked", self.id);
                ReceiverStats::new(0)
            }
        };

        let drained = self.shared.table.lock().unwrap().drain_outstanding();
        self.shared
            .counters
            .num_interrupted
            .fetch_add(drained as u64, Ordering::Relaxed);

        let c = &self.shared.counters;
        WorkerReport {
            id: self.id,
            sent: c.sent(),
            completed: c.completed(),
            timedout: c.timedout(),
            interrupted: c.num_interrupted.load(Ordering::Relaxed),
            request_bytes: c.total_request_size.load(Ordering::Relaxed),
            response_bytes: c.total_response_size.load(Ordering::Relaxed),
            rx,
        }
    }
}
