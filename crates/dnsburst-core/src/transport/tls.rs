//! Non-blocking DNS-over-TLS client.
//!
//! Same two-byte framing as TCP, with a rustls `ClientConnection` in the
//! middle. `probe` drives both the TCP connect and the TLS handshake and
//! reports `InProgress` until application data can flow. Certificate
//! verification is off by default — this is a load-testing client, not a
//! resolver — unless a CA bundle is supplied.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use super::tcp::TcpTransport;
use super::{Probe, Transport, would_block};
use crate::error::Error;

pub struct TlsTransport {
    /// The underlying transport is used for connect/readiness plumbing only;
    /// framing happens above the TLS layer, so raw stream I/O goes through
    /// `conn` against the inner `TcpStream`.
    inner: RawStream,
    conn: ClientConnection,
    inbuf: Vec<u8>,
    handshaking: bool,
}

/// Plain non-blocking TCP stream with connect-state tracking, shared with
/// the TCP transport via composition.
struct RawStream {
    tcp: TcpTransport,
}

impl TlsTransport {
    pub fn open(
        server: SocketAddr,
        local: Option<IpAddr>,
        bufsize_kb: Option<usize>,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> Result<Self, Error> {
        let tcp = TcpTransport::open(server, local, bufsize_kb)?;
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name '{server_name}': {e}")))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self {
            inner: RawStream { tcp },
            conn,
            inbuf: Vec::new(),
            handshaking: true,
        })
    }

    /// Move TLS records in both directions without blocking.
    fn drive_io(&mut self) -> io::Result<()> {
        loop {
            let mut progressed = false;
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut self.inner) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(_) => progressed = true,
                    Err(e) if would_block(&e) => break,
                    Err(e) => return Err(e),
                }
            }
            if self.conn.wants_read() {
                match self.conn.read_tls(&mut self.inner) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                        progressed = true;
                    }
                    Err(e) if would_block(&e) => {}
                    Err(e) => return Err(e),
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn take_frame(&mut self, buf: &mut [u8]) -> Option<usize> {
        if self.inbuf.len() < 2 {
            return None;
        }
        let need = usize::from(u16::from_be_bytes([self.inbuf[0], self.inbuf[1]]));
        if self.inbuf.len() < 2 + need {
            return None;
        }
        let n = need.min(buf.len());
        buf[..n].copy_from_slice(&self.inbuf[2..2 + n]);
        self.inbuf.drain(..2 + need);
        Some(n)
    }
}

impl Transport for TlsTransport {
    fn send(&mut self, msg: &[u8]) -> io::Result<usize> {
        // rustls buffers plaintext written before the handshake finishes and
        // releases it afterwards, so the frame is always queued here.
        let len = (msg.len() as u16).to_be_bytes();
        self.conn.writer().write_all(&len)?;
        self.conn.writer().write_all(msg)?;
        if self.handshaking {
            return Err(super::einprogress());
        }
        self.drive_io()?;
        Ok(msg.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(n) = self.take_frame(buf) {
            return Ok(n);
        }
        self.drive_io()?;
        let mut chunk = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    if let Some(n) = self.take_frame(buf) {
                        return Ok(n);
                    }
                }
                Err(e) if would_block(&e) => {
                    return match self.take_frame(buf) {
                        Some(n) => Ok(n),
                        None => Err(e),
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn probe(&mut self, timeout_us: u64, intr_fd: RawFd) -> Probe {
        // First the TCP connect.
        match self.inner.tcp.probe(timeout_us, intr_fd) {
            Probe::Ready => {}
            other => return other,
        }
        if !self.handshaking {
            return Probe::Ready;
        }
        // Then the TLS handshake.
        if let Err(e) = self.drive_io() {
            log::warn!("tls handshake i/o failed: {e}");
            return Probe::NotReady;
        }
        if self.conn.is_handshaking() {
            return Probe::InProgress;
        }
        self.handshaking = false;
        if let Err(e) = self.drive_io() {
            log::warn!("tls flush after handshake failed: {e}");
            return Probe::NotReady;
        }
        Probe::Ready
    }

    fn fd(&self) -> RawFd {
        self.inner.tcp.fd()
    }
}

impl Read for RawStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.tcp.stream_read(buf)
    }
}

impl Write for RawStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tcp.stream_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Build the rustls client configuration: verify against `ca_path` when
/// given, otherwise accept whatever certificate the server presents.
pub fn client_config(ca_path: Option<&std::path::Path>) -> Result<Arc<ClientConfig>, Error> {
    let config = match ca_path {
        Some(path) => {
            let pem = std::fs::File::open(path)
                .map_err(|e| Error::Tls(format!("cannot open CA file '{}': {e}", path.display())))?;
            let mut reader = io::BufReader::new(pem);
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| Error::Tls(format!("bad CA file: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("bad CA certificate: {e}")))?;
            }
            if roots.is_empty() {
                return Err(Error::Tls("CA file contains no certificates".to_string()));
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Skips certificate verification. Measuring a server you point a flood at
/// does not require trusting it.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_without_ca() {
        assert!(client_config(None).is_ok());
    }

    #[test]
    fn test_client_config_missing_ca_file() {
        let err = client_config(Some(std::path::Path::new("/no/such/file.pem"))).unwrap_err();
        assert!(err.to_string().contains("cannot open CA file"));
    }

    #[test]
    fn test_client_config_ca_file_without_certs() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let err = client_config(Some(f.path())).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }
}
