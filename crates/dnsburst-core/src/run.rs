//! Run-wide state shared by the coordinator and every worker thread.
//!
//! One `RunContext` replaces what would otherwise be a scatter of globals:
//! the monotonic clock epoch, the stop deadline, the interrupted flag, the
//! start gate that holds workers until everything is constructed, and the
//! termination pipe that every blocking wait polls. The signal handler's
//! only legal actions are flipping the interrupted flag and posting an
//! [`Event::Interrupted`] on the coordinator channel.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cap on every blocking wait in the worker loops, so termination and
/// timeouts are noticed promptly.
pub(crate) const TIMEOUT_CHECK_US: u64 = 100_000;

/// Worker→coordinator notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    SenderDone(usize),
    ReceiverDone(usize),
    Interrupted,
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Input exhausted and every reply arrived or timed out.
    Drained,
    TimeLimit,
    Interrupted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drained => write!(f, "input exhausted"),
            Self::TimeLimit => write!(f, "time limit reached"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// One-shot broadcast channel built on a pipe, so it composes with `poll`.
struct TermPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl TermPipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { read_fd: fds[0], write_fd: fds[1] })
    }

    fn trigger(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.write_fd, byte.as_ptr().cast(), 1);
        }
    }
}

impl Drop for TermPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

pub struct RunContext {
    epoch: Instant,
    time_limit: Option<Duration>,
    /// Epoch microseconds when the start gate opened.
    start_us: AtomicU64,
    /// Epoch microseconds after which senders must stop; `u64::MAX` when
    /// the run is time-unbounded. Set when the gate opens.
    stop_time_us: AtomicU64,
    interrupted: AtomicBool,
    stopping: AtomicBool,
    gate: Mutex<bool>,
    gate_cond: Condvar,
    term: TermPipe,
}

impl RunContext {
    pub fn new(time_limit: Option<Duration>) -> io::Result<Self> {
        Ok(Self {
            epoch: Instant::now(),
            time_limit,
            start_us: AtomicU64::new(0),
            stop_time_us: AtomicU64::new(u64::MAX),
            interrupted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            gate: Mutex::new(false),
            gate_cond: Condvar::new(),
            term: TermPipe::new()?,
        })
    }

    /// Microseconds since the context was created.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    pub fn start_us(&self) -> u64 {
        self.start_us.load(Ordering::Acquire)
    }

    pub fn stop_time_us(&self) -> u64 {
        self.stop_time_us.load(Ordering::Acquire)
    }

    /// Open the start gate: stamp the run start, arm the deadline, release
    /// every worker blocked in [`wait_start`](Self::wait_start).
    pub fn open_gate(&self) {
        let now = self.now_us();
        self.start_us.store(now, Ordering::Release);
        let stop = match self.time_limit {
            Some(limit) => now.saturating_add(limit.as_micros() as u64),
            None => u64::MAX,
        };
        self.stop_time_us.store(stop, Ordering::Release);
        let mut open = self.gate.lock().unwrap();
        *open = true;
        self.gate_cond.notify_all();
    }

    pub fn wait_start(&self) {
        let mut open = self.gate.lock().unwrap();
        while !*open {
            open = self.gate_cond.wait(open).unwrap();
        }
    }

    /// Signal-handler side of an interrupt.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Broadcast termination: wakes every `poll` on the termination pipe.
    pub fn request_stop(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            self.term.trigger();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Read side of the termination pipe, for `poll` sets.
    pub fn term_fd(&self) -> RawFd {
        self.term.read_fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_clock_is_monotonic() {
        let ctx = RunContext::new(None).unwrap();
        let a = ctx.now_us();
        let b = ctx.now_us();
        assert!(b >= a);
    }

    #[test]
    fn test_gate_releases_waiters() {
        let ctx = Arc::new(RunContext::new(None).unwrap());
        let worker = {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || {
                ctx.wait_start();
                ctx.start_us()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        ctx.open_gate();
        worker.join().unwrap();
    }

    #[test]
    fn test_deadline_armed_at_gate_open() {
        let ctx = RunContext::new(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ctx.stop_time_us(), u64::MAX, "unarmed before the gate opens");
        ctx.open_gate();
        let stop = ctx.stop_time_us();
        assert!(stop >= ctx.start_us() + 5_000_000);
        assert!(stop < u64::MAX);
    }

    #[test]
    fn test_unbounded_run_has_no_deadline() {
        let ctx = RunContext::new(None).unwrap();
        ctx.open_gate();
        assert_eq!(ctx.stop_time_us(), u64::MAX);
    }

    #[test]
    fn test_request_stop_wakes_poll() {
        let ctx = RunContext::new(None).unwrap();
        ctx.request_stop();
        let mut fds = [libc::pollfd { fd: ctx.term_fd(), events: libc::POLLIN, revents: 0 }];
        let n = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
        assert_eq!(n, 1, "termination pipe should be readable");
    }

    #[test]
    fn test_interrupt_flag() {
        let ctx = RunContext::new(None).unwrap();
        assert!(!ctx.is_interrupted());
        ctx.interrupt();
        assert!(ctx.is_interrupted());
    }
}
