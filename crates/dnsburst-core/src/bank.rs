//! Per-worker socket bank: the transports one worker drives, plus the
//! round-robin cursor the sender picks from.
//!
//! The sender and receiver threads touch the same sockets from opposite
//! directions, and stream transports carry internal buffers, so each socket
//! sits behind its own mutex. The fd list is kept alongside so the receiver
//! can poll the whole bank without taking any lock.

use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::transport::{Probe, Readiness, Transport};

pub struct SocketBank {
    sockets: Vec<Mutex<Box<dyn Transport>>>,
    fds: Vec<RawFd>,
    cursor: AtomicUsize,
}

impl SocketBank {
    pub fn new(transports: Vec<Box<dyn Transport>>) -> Self {
        let fds = transports.iter().map(|t| t.fd()).collect();
        Self {
            sockets: transports.into_iter().map(Mutex::new).collect(),
            fds,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// The socket at `cursor % N`; the cursor advances every call.
    pub fn pick(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.sockets.len()
    }

    /// Run `f` with the socket at `index` locked.
    pub fn with<R>(&self, index: usize, f: impl FnOnce(&mut dyn Transport) -> R) -> R {
        let mut guard = self.sockets[index].lock().unwrap();
        f(guard.as_mut())
    }

    pub fn probe(&self, index: usize, timeout_us: u64, intr_fd: RawFd) -> Probe {
        self.with(index, |t| t.probe(timeout_us, intr_fd))
    }

    /// Block until any socket is readable, the interrupt fd fires, or the
    /// timeout lapses.
    pub fn wait_any_readable(&self, intr_fd: RawFd, timeout_us: u64) -> io::Result<Readiness> {
        self.wait_any(libc::POLLIN, intr_fd, timeout_us)
    }

    /// Same, for writability; used when every socket came back busy.
    pub fn wait_any_writable(&self, intr_fd: RawFd, timeout_us: u64) -> io::Result<Readiness> {
        self.wait_any(libc::POLLOUT, intr_fd, timeout_us)
    }

    fn wait_any(&self, events: i16, intr_fd: RawFd, timeout_us: u64) -> io::Result<Readiness> {
        let mut fds: Vec<libc::pollfd> = self
            .fds
            .iter()
            .map(|&fd| libc::pollfd { fd, events, revents: 0 })
            .collect();
        fds.push(libc::pollfd { fd: intr_fd, events: libc::POLLIN, revents: 0 });
        let timeout_ms = timeout_us.div_ceil(1000).min(i32::MAX as u64) as i32;
        loop {
            let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
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
            if fds.last().map(|p| p.revents != 0).unwrap_or(false) {
                return Ok(Readiness::Interrupt);
            }
            return Ok(Readiness::Socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    struct PairTransport {
        sock: UnixDatagram,
    }

    impl PairTransport {
        fn pair() -> (Self, UnixDatagram) {
            let (a, b) = UnixDatagram::pair().unwrap();
            a.set_nonblocking(true).unwrap();
            (Self { sock: a }, b)
        }
    }

    impl Transport for PairTransport {
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
            use std::os::fd::AsRawFd;
            self.sock.as_raw_fd()
        }
    }

    #[test]
    fn test_pick_round_robins() {
        let (a, _pa) = PairTransport::pair();
        let (b, _pb) = PairTransport::pair();
        let (c, _pc) = PairTransport::pair();
        let bank = SocketBank::new(vec![Box::new(a), Box::new(b), Box::new(c)]);
        let picks: Vec<usize> = (0..6).map(|_| bank.pick()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_wait_any_readable_sees_data() {
        let (a, peer) = PairTransport::pair();
        let bank = SocketBank::new(vec![Box::new(a)]);
        assert_eq!(bank.wait_any_readable(-1, 0).unwrap(), Readiness::TimedOut);
        peer.send(b"hi").unwrap();
        assert_eq!(
            bank.wait_any_readable(-1, 1_000_000).unwrap(),
            Readiness::Socket
        );
    }

    #[test]
    fn test_wait_any_interrupt_takes_priority() {
        let (a, _peer) = PairTransport::pair();
        let bank = SocketBank::new(vec![Box::new(a)]);
        let (intr_r, intr_w) = UnixDatagram::pair().unwrap();
        intr_w.send(b"x").unwrap();
        use std::os::fd::AsRawFd;
        assert_eq!(
            bank.wait_any_readable(intr_r.as_raw_fd(), 1_000_000).unwrap(),
            Readiness::Interrupt
        );
    }
}
