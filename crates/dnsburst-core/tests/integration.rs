//! End-to-end tests for the dnsburst engine.
//!
//! These run the full coordinator/worker machinery against an in-process
//! echo transport built on `UnixDatagram::pair`: real fds (so the poll-based
//! waits behave exactly as they do against network sockets) with a
//! programmable peer that can delay, swallow, truncate, or forge replies.

use std::io::{self, Cursor};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use dnsburst_core::{
    Error, Event, InputSource, Probe, RunConfig, RunContext, StopReason, Transport,
    TransportFactory, coordinator,
};

// ---------------------------------------------------------------------------
// Echo transport double
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct EchoBehavior {
    /// Delay before each reply.
    delay: Option<Duration>,
    /// Swallow every Nth request (2 = every second one).
    drop_every: Option<u64>,
    /// Reply with a 3-byte runt instead of a DNS header.
    short_reply: bool,
    /// Reply with the transaction id bumped by one.
    forge_qid: bool,
}

struct StubTransport {
    sock: UnixDatagram,
}

impl Transport for StubTransport {
    fn send(&mut self, msg: &[u8]) -> io::Result<usize> {
        self.sock.send(msg)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf)
    }

    fn probe(&mut self, _timeout_us: u64, _intr_fd: RawFd) -> Probe {
        Probe::Ready
    }

    fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

struct StubFactory {
    behavior: EchoBehavior,
    stop: Arc<AtomicBool>,
    echoes: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl StubFactory {
    fn new(behavior: EchoBehavior) -> Self {
        Self {
            behavior,
            stop: Arc::new(AtomicBool::new(false)),
            echoes: Mutex::new(Vec::new()),
        }
    }
}

impl TransportFactory for StubFactory {
    fn open(&self, _worker: usize, count: usize) -> Result<Vec<Box<dyn Transport>>, Error> {
        let mut out: Vec<Box<dyn Transport>> = Vec::with_capacity(count);
        for _ in 0..count {
            let (client, server) = UnixDatagram::pair().map_err(Error::Io)?;
            client.set_nonblocking(true).map_err(Error::Io)?;
            server
                .set_read_timeout(Some(Duration::from_millis(50)))
                .map_err(Error::Io)?;

            let behavior = self.behavior;
            let stop = Arc::clone(&self.stop);
            let handle = thread::spawn(move || echo_loop(&server, behavior, &stop));
            self.echoes.lock().unwrap().push(handle);

            out.push(Box::new(StubTransport { sock: client }));
        }
        Ok(out)
    }
}

impl Drop for StubFactory {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.echoes.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

fn echo_loop(server: &UnixDatagram, behavior: EchoBehavior, stop: &AtomicBool) {
    let mut buf = [0u8; 4096];
    let mut received = 0u64;
    while !stop.load(Ordering::SeqCst) {
        let n = match server.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(_) => break,
        };
        received += 1;
        if let Some(k) = behavior.drop_every
            && received % k == 0
        {
            continue;
        }
        if let Some(delay) = behavior.delay {
            thread::sleep(delay);
        }
        if behavior.short_reply {
            if server.send(&buf[..3.min(n)]).is_err() {
                break;
            }
            continue;
        }
        let mut reply = buf[..n].to_vec();
        if reply.len() >= 4 {
            reply[2] |= 0x80; // QR bit
            if behavior.forge_qid {
                let qid = u16::from_be_bytes([reply[0], reply[1]]).wrapping_add(1);
                reply[..2].copy_from_slice(&qid.to_be_bytes());
            }
        }
        if server.send(&reply).is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn input_lines(n: usize) -> String {
    (0..n).map(|i| format!("host{i}.example A\n")).collect()
}

fn run_engine(
    config: RunConfig,
    input: &str,
    behavior: EchoBehavior,
) -> coordinator::RunResult {
    let input =
        Arc::new(InputSource::from_reader(Cursor::new(input.to_string()), config.max_passes).unwrap());
    let factory = StubFactory::new(behavior);
    let ctx = Arc::new(RunContext::new(config.time_limit).unwrap());
    let (tx, rx) = mpsc::channel();
    coordinator::run(&config, input, &factory, ctx, tx, rx).unwrap()
}

fn assert_conservation(result: &coordinator::RunResult) {
    let s = &result.summary;
    assert_eq!(
        s.queries_sent,
        s.queries_completed + s.queries_lost + s.queries_interrupted,
        "sent must equal completed + lost + interrupted after joins"
    );
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn echo_loopback_completes_everything() {
    let config = RunConfig {
        clients: 1,
        threads: 1,
        max_outstanding: 1,
        max_qps: 10,
        timeout: Duration::from_secs(5),
        max_passes: 1,
        ..RunConfig::default()
    };
    let behavior = EchoBehavior {
        delay: Some(Duration::from_millis(5)),
        ..EchoBehavior::default()
    };
    let result = run_engine(config, &input_lines(10), behavior);

    assert_eq!(result.reason, StopReason::Drained);
    assert_eq!(result.summary.queries_sent, 10);
    assert_eq!(result.summary.queries_completed, 10);
    assert_eq!(result.summary.queries_lost, 0);
    assert!(
        result.summary.latency_min_s >= 0.004,
        "min latency {} below the echo delay",
        result.summary.latency_min_s
    );
    assert!(
        result.summary.latency_max_s < 1.0,
        "max latency {} absurdly high for a loopback echo",
        result.summary.latency_max_s
    );
    assert_conservation(&result);
}

#[test]
fn qps_ceiling_bounds_send_rate() {
    let config = RunConfig {
        clients: 2,
        threads: 2,
        max_outstanding: 100,
        max_qps: 100,
        timeout: Duration::from_millis(500),
        time_limit: Some(Duration::from_secs(2)),
        max_passes: 0,
        ..RunConfig::default()
    };
    let result = run_engine(config, &input_lines(4), EchoBehavior::default());

    let sent = result.summary.queries_sent;
    assert!(
        (140..=260).contains(&sent),
        "expected ~200 sends over 2s at 100 qps, got {sent}"
    );
    assert_conservation(&result);
}

#[test]
fn swallowed_replies_become_timeouts() {
    let config = RunConfig {
        clients: 1,
        threads: 1,
        max_outstanding: 100,
        timeout: Duration::from_millis(100),
        max_passes: 1,
        ..RunConfig::default()
    };
    let behavior = EchoBehavior { drop_every: Some(2), ..EchoBehavior::default() };
    let result = run_engine(config, &input_lines(100), behavior);

    assert_eq!(result.reason, StopReason::Drained);
    assert_eq!(result.summary.queries_sent, 100);
    assert_eq!(result.summary.queries_completed, 50);
    assert_eq!(result.summary.queries_lost, 50);
    assert_conservation(&result);
}

#[test]
fn interrupt_reclassifies_outstanding_and_joins_quickly() {
    let config = RunConfig {
        clients: 1,
        threads: 1,
        max_outstanding: 100,
        max_qps: 500,
        timeout: Duration::from_secs(5),
        max_passes: 0, // unlimited: only the interrupt ends this run
        ..RunConfig::default()
    };
    let input = Arc::new(
        InputSource::from_reader(Cursor::new(input_lines(4)), config.max_passes).unwrap(),
    );
    let factory = StubFactory::new(EchoBehavior {
        delay: Some(Duration::from_millis(1)),
        ..EchoBehavior::default()
    });
    let ctx = Arc::new(RunContext::new(config.time_limit).unwrap());
    let (tx, rx) = mpsc::channel();

    let (result_tx, result_rx) = mpsc::channel();
    let runner = {
        let ctx = Arc::clone(&ctx);
        let tx = tx.clone();
        thread::spawn(move || {
            let result = coordinator::run(&config, input, &factory, ctx, tx, rx);
            let _ = result_tx.send(result);
        })
    };

    thread::sleep(Duration::from_millis(300));
    ctx.interrupt();
    tx.send(Event::Interrupted).unwrap();

    let result = result_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("run did not wind down within 2s of the interrupt")
        .unwrap();
    runner.join().unwrap();

    assert_eq!(result.reason, StopReason::Interrupted);
    assert!(result.summary.queries_sent > 0);
    assert_conservation(&result);
}

#[test]
fn short_replies_are_discarded_then_time_out() {
    let config = RunConfig {
        clients: 1,
        threads: 1,
        max_outstanding: 100,
        timeout: Duration::from_millis(200),
        max_passes: 1,
        ..RunConfig::default()
    };
    let behavior = EchoBehavior { short_reply: true, ..EchoBehavior::default() };
    let result = run_engine(config, &input_lines(5), behavior);

    assert_eq!(result.summary.queries_sent, 5);
    assert_eq!(result.summary.queries_completed, 0, "runts must not count");
    assert_eq!(result.summary.queries_lost, 5);
    assert_conservation(&result);
}

#[test]
fn forged_ids_never_complete_anything() {
    let config = RunConfig {
        clients: 1,
        threads: 1,
        max_outstanding: 1,
        timeout: Duration::from_millis(150),
        max_passes: 1,
        ..RunConfig::default()
    };
    let behavior = EchoBehavior { forge_qid: true, ..EchoBehavior::default() };
    let result = run_engine(config, &input_lines(5), behavior);

    assert_eq!(result.summary.queries_sent, 5);
    assert_eq!(
        result.summary.queries_completed, 0,
        "a reply matching a free slot must stay on the unexpected path"
    );
    assert_eq!(result.summary.queries_lost, 5);
    assert_conservation(&result);
}

#[test]
fn rcode_histogram_reflects_replies() {
    // The echo sets QR and leaves the rcode at whatever the request carried:
    // zero, i.e. NOERROR.
    let config = RunConfig {
        clients: 1,
        threads: 1,
        max_outstanding: 10,
        max_passes: 1,
        ..RunConfig::default()
    };
    let result = run_engine(config, &input_lines(8), EchoBehavior::default());

    assert_eq!(result.summary.queries_completed, 8);
    assert_eq!(result.summary.rcodes.len(), 1);
    assert_eq!(result.summary.rcodes[0].rcode, "NOERROR");
    assert_eq!(result.summary.rcodes[0].count, 8);
    assert!(result.summary.avg_request_size > 0.0);
    assert!(result.summary.avg_response_size > 0.0);
}

#[test]
fn multi_worker_run_drains_cleanly() {
    let config = RunConfig {
        clients: 4,
        threads: 2,
        max_outstanding: 40,
        max_passes: 2,
        timeout: Duration::from_secs(2),
        ..RunConfig::default()
    };
    let result = run_engine(config, &input_lines(50), EchoBehavior::default());

    assert_eq!(result.reason, StopReason::Drained);
    assert_eq!(result.summary.queries_sent, 100, "50 entries x 2 passes");
    assert_eq!(result.summary.queries_completed, 100);
    assert_eq!(result.reports.len(), 2);
    assert_conservation(&result);
}
