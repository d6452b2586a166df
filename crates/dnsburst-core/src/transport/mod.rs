//! Client transports: one DNS message in, one DNS message out.
//!
//! Every transport is non-blocking. `recv` yields at most one whole DNS
//! message per call (stream transports reassemble frames internally), `send`
//! accepts one message and never surfaces a partial frame, and `probe`
//! answers "can I send on this socket right now?" — which for TCP and TLS
//! also drives connect and handshake progress.

mod tcp;
mod tls;
mod udp;

pub use tcp::TcpTransport;
pub use tls::{TlsTransport, client_config};
pub use udp::UdpTransport;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::error::Error;

/// Result of a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The socket can take a send now.
    Ready,
    /// Not writable within the probe window.
    NotReady,
    /// A TCP connect or TLS handshake is still running; do not retry this
    /// socket synchronously, but drain it before declaring sending done.
    InProgress,
    /// The termination channel became readable; the caller should wind down.
    Timeout,
}

pub trait Transport: Send {
    /// Queue/transmit one DNS message. An error with `EINPROGRESS` means the
    /// message is queued behind an unfinished connect/handshake.
    fn send(&mut self, msg: &[u8]) -> io::Result<usize>;

    /// Non-blocking receive of one whole DNS message into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Probe send readiness, waiting at most `timeout_us`. A readable
    /// `intr_fd` short-circuits to [`Probe::Timeout`].
    fn probe(&mut self, timeout_us: u64, intr_fd: RawFd) -> Probe;

    /// The fd the receiver polls for readability.
    fn fd(&self) -> RawFd;
}

/// Opens the per-worker socket bank; the seam test doubles plug into.
pub trait TransportFactory: Send + Sync {
    fn open(&self, worker: usize, count: usize) -> Result<Vec<Box<dyn Transport>>, Error>;
}

/// Wire protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Udp,
    Tcp,
    Tls,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
            Self::Tls => write!(f, "tls"),
        }
    }
}

/// Network transport factory used by the CLI.
pub struct NetFactory {
    pub mode: Mode,
    pub server: SocketAddr,
    /// Name presented for TLS SNI/verification; usually the `-s` argument.
    pub server_name: String,
    pub local: Option<IpAddr>,
    /// Socket buffer size in kilobytes, if overridden.
    pub bufsize_kb: Option<usize>,
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl TransportFactory for NetFactory {
    fn open(&self, _worker: usize, count: usize) -> Result<Vec<Box<dyn Transport>>, Error> {
        let mut out: Vec<Box<dyn Transport>> = Vec::with_capacity(count);
        for _ in 0..count {
            match self.mode {
                Mode::Udp => {
                    out.push(Box::new(UdpTransport::open(self.server, self.local, self.bufsize_kb)?));
                }
                Mode::Tcp => {
                    out.push(Box::new(TcpTransport::open(self.server, self.local, self.bufsize_kb)?));
                }
                Mode::Tls => {
                    let config = self
                        .tls
                        .clone()
                        .ok_or_else(|| Error::Tls("no TLS client configuration".to_string()))?;
                    out.push(Box::new(TlsTransport::open(
                        self.server,
                        self.local,
                        self.bufsize_kb,
                        config,
                        &self.server_name,
                    )?));
                }
            }
        }
        Ok(out)
    }
}

/// What a bounded poll on (socket, interrupt) came back with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Socket,
    Interrupt,
    TimedOut,
}

/// Poll one socket fd for the given direction alongside the interrupt fd.
pub(crate) fn wait_fd(
    fd: RawFd,
    want_write: bool,
    intr_fd: RawFd,
    timeout_us: u64,
) -> io::Result<Readiness> {
    let events = if want_write { libc::POLLOUT } else { libc::POLLIN };
    let mut fds = [
        libc::pollfd { fd, events, revents: 0 },
        libc::pollfd { fd: intr_fd, events: libc::POLLIN, revents: 0 },
    ];
    let timeout_ms = timeout_us.div_ceil(1000).min(i32::MAX as u64) as i32;
    loop {
        let n = unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout_ms) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if n == 0 {
            return Ok(Readiness::TimedOut);
        }
        if fds[1].revents != 0 {
            return Ok(Readiness::Interrupt);
        }
        return Ok(Readiness::Socket);
    }
}

pub(crate) fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS)
}

pub(crate) fn einprogress() -> io::Error {
    io::Error::from_raw_os_error(libc::EINPROGRESS)
}

/// Apply `-b`: identical send and receive buffer sizes, in bytes.
pub(crate) fn set_buffer_sizes(fd: RawFd, bytes: usize) -> io::Result<()> {
    let val = bytes.min(i32::MAX as usize) as libc::c_int;
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                std::ptr::addr_of!(val).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
