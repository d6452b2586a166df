//! Connected, non-blocking UDP client socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use super::{Probe, Readiness, Transport, set_buffer_sizes, wait_fd};

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn open(
        server: SocketAddr,
        local: Option<IpAddr>,
        bufsize_kb: Option<usize>,
    ) -> io::Result<Self> {
        let bind = match local {
            Some(ip) => SocketAddr::new(ip, 0),
            None if server.is_ipv4() => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            None => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(server)?;
        socket.set_nonblocking(true)?;
        if let Some(kb) = bufsize_kb {
            set_buffer_sizes(socket.as_raw_fd(), kb * 1024)?;
        }
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, msg: &[u8]) -> io::Result<usize> {
        self.socket.send(msg)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn probe(&mut self, timeout_us: u64, intr_fd: RawFd) -> Probe {
        match wait_fd(self.fd(), true, intr_fd, timeout_us) {
            Ok(Readiness::Socket) => Probe::Ready,
            Ok(Readiness::Interrupt) => Probe::Timeout,
            Ok(Readiness::TimedOut) => Probe::NotReady,
            Err(_) => Probe::NotReady,
        }
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_roundtrip_on_loopback() {
        let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server = echo.local_addr().unwrap();
        let mut t = UdpTransport::open(server, None, None).unwrap();

        assert_eq!(t.probe(0, -1), Probe::Ready);
        t.send(b"ping").unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = echo.recv_from(&mut buf).unwrap();
        echo.send_to(&buf[..n], from).unwrap();

        // Wait for the reply to land, then read it non-blockingly.
        wait_fd(t.fd(), false, -1, 1_000_000).unwrap();
        let n = t.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_udp_recv_would_block_when_empty() {
        let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut t = UdpTransport::open(echo.local_addr().unwrap(), None, None).unwrap();
        let mut buf = [0u8; 16];
        let err = t.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_udp_buffer_size_override() {
        let echo = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(UdpTransport::open(echo.local_addr().unwrap(), None, Some(64)).is_ok());
    }
}
