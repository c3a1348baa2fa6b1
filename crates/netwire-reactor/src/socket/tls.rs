//! TLS socket device with a reactor-driven handshake.
//!
//! A [`TlsSocket`] accepted from a TLS listener starts out with its
//! handshake pending; the first `read()` or `write()` drives it.  Whenever
//! the TLS engine cannot make progress it reports what it needs next, the
//! socket's device mode is set to exactly that (`Read` or `Write`), and the
//! call returns `WouldBlock` so the reactor retries on the next readiness
//! notification.  The handshake therefore advances purely through the
//! normal event loop and never blocks; client connects work the same way.
//!
//! A clean TLS end of stream reads as `Ok(0)`.  Server listeners share one
//! [`ServerConfig`] across every accepted connection.  Client connections
//! do not verify the peer certificate unless a root store is supplied via
//! [`client_config_with_roots`].

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::ops::{Deref, DerefMut};
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, RootCertStore,
    ServerConfig, ServerConnection, SignatureScheme,
};
use tracing::debug;

use crate::device::{Device, Mode, Pollable};
use crate::socket::{recv_raw, send_raw, IpAddress, Socket, SocketError, SocketFlags};

/// A TCP socket carrying a TLS session.
pub struct TlsSocket {
    sock: Socket,
    session: Option<Connection>,
    /// Listener-side configuration, shared with every accepted connection.
    server_config: Option<Arc<ServerConfig>>,
    client_config: Option<Arc<ClientConfig>>,
}

impl TlsSocket {
    /// Creates a client-side TLS socket.  A default non-verifying client
    /// configuration is built lazily on the first connect.
    pub fn new() -> Self {
        TlsSocket {
            sock: Socket::new(),
            session: None,
            server_config: None,
            client_config: None,
        }
    }

    /// Creates a listener that accepts TLS connections with the given
    /// configuration.  The configuration is borrowed by every accepted
    /// connection for its lifetime (it is reference counted, never copied).
    pub fn with_server_config(config: Arc<ServerConfig>) -> Self {
        TlsSocket {
            sock: Socket::new(),
            session: None,
            server_config: Some(config),
            client_config: None,
        }
    }

    /// Creates a client-side TLS socket with an explicit configuration.
    pub fn with_client_config(config: Arc<ClientConfig>) -> Self {
        TlsSocket {
            sock: Socket::new(),
            session: None,
            server_config: None,
            client_config: Some(config),
        }
    }

    /// Binds a TLS listener address; fails without a server configuration.
    pub fn bind(&mut self, ip: IpAddress, port: u16) -> Result<(), SocketError> {
        if self.server_config.is_none() {
            debug!("bind: no TLS server configuration");
            return Err(SocketError::Tls("no TLS server configuration".into()));
        }
        self.sock.bind(ip, port)
    }

    /// Binds an IPv6 TLS listener address; fails without a server
    /// configuration.
    pub fn bind_v6(&mut self, ip: IpAddress, port: u16) -> Result<(), SocketError> {
        if self.server_config.is_none() {
            debug!("bind: no TLS server configuration");
            return Err(SocketError::Tls("no TLS server configuration".into()));
        }
        self.sock.bind_v6(ip, port)
    }

    /// Accepts one pending connection and attaches a server session to it.
    /// The returned socket reports `is_accepted() == false` until its first
    /// read or write completes the handshake.
    pub fn accept(&mut self) -> Result<Option<TlsSocket>, SocketError> {
        let Some(config) = self.server_config.clone() else {
            return Err(SocketError::Tls("no TLS server configuration".into()));
        };
        let Some(mut plain) = self.sock.accept()? else {
            return Ok(None);
        };

        let conn = ServerConnection::new(config)
            .map_err(|e| SocketError::Tls(format!("session creation failed: {e}")))?;
        plain.flags |= SocketFlags::IN_ACCEPT;

        Ok(Some(TlsSocket {
            sock: plain,
            session: Some(Connection::Server(conn)),
            server_config: None,
            client_config: None,
        }))
    }

    /// Connects to an IPv4 peer and prepares a client session.  Like the
    /// plain socket, an in-progress non-blocking connect is success; the
    /// handshake is driven by the first read or write.
    pub fn connect(&mut self, hostname: &str, port: u16) -> Result<(), SocketError> {
        self.connect_family(hostname, port, false)
    }

    /// Connects to an IPv6 peer and prepares a client session.
    pub fn connect_v6(&mut self, hostname: &str, port: u16) -> Result<(), SocketError> {
        self.connect_family(hostname, port, true)
    }

    fn connect_family(&mut self, hostname: &str, port: u16, v6: bool) -> Result<(), SocketError> {
        self.sock.close();
        self.session = None;
        self.sock.device_mut().set_mode(Mode::empty());

        let config = self.ensure_client_config();
        if v6 {
            self.sock.connect_v6(hostname, port)?;
        } else {
            self.sock.connect(hostname, port)?;
        }

        self.attach_client_session(config, hostname)
    }

    /// Takes over the connection of an already connected plain socket,
    /// leaving `socket` invalid, and prepares a client session on it.
    pub fn take(&mut self, socket: &mut Socket) -> Result<(), SocketError> {
        self.sock.close();
        self.session = None;

        let config = self.ensure_client_config();

        self.sock.hostname = socket.hostname.clone();
        self.sock.addr = socket.addr;
        self.sock.port = socket.port;
        self.sock.flags = socket.flags;
        self.sock.bytes_sent = socket.bytes_sent;
        self.sock.bytes_received = socket.bytes_received;
        self.sock.io_timeout = socket.io_timeout;
        let fd = socket.device_mut().take_fd();
        self.sock.device_mut().adopt_fd(fd);

        let hostname = self.sock.hostname.clone();
        self.attach_client_session(config, &hostname)
    }

    fn ensure_client_config(&mut self) -> Arc<ClientConfig> {
        match &self.client_config {
            Some(config) => config.clone(),
            None => {
                let config = client_config();
                self.client_config = Some(config.clone());
                config
            }
        }
    }

    fn attach_client_session(
        &mut self,
        config: Arc<ClientConfig>,
        hostname: &str,
    ) -> Result<(), SocketError> {
        let name = ServerName::try_from(hostname.to_string())
            .map_err(|_| SocketError::Tls(format!("invalid server name: {hostname}")))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| SocketError::Tls(format!("session creation failed: {e}")))?;
        self.session = Some(Connection::Client(conn));
        self.sock.flags |= SocketFlags::IN_ACCEPT;
        Ok(())
    }

    /// The certificate chain presented by the peer, once the handshake has
    /// progressed far enough.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.session.as_ref()?.peer_certificates()
    }

    /// Advances a pending handshake.  Every would-block from the TLS engine
    /// sets the device mode to what the engine needs next before
    /// propagating, so the reactor resumes the handshake on the right
    /// readiness condition.
    fn drive_handshake(&mut self) -> io::Result<()> {
        let Some(conn) = self.session.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no TLS session"));
        };
        if !conn.is_handshaking() {
            self.sock.flags.remove(SocketFlags::IN_ACCEPT);
            return Ok(());
        }

        let mut transport = FdIo {
            fd: self.sock.dev.fd(),
        };

        while conn.is_handshaking() {
            if conn.wants_write() {
                match conn.write_tls(&mut transport) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.sock.dev.set_mode(Mode::WRITE);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            if conn.wants_read() {
                match conn.read_tls(&mut transport) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed during TLS handshake",
                        ));
                    }
                    Ok(_) => match conn.process_new_packets() {
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("TLS handshake failed: {e}");
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                e.to_string(),
                            ));
                        }
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.sock.dev.set_mode(Mode::READ);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.sock.flags.remove(SocketFlags::IN_ACCEPT);
        debug!(
            "TLS handshake complete with {} ({})",
            self.sock.hostname,
            self.sock.addr.anonymized()
        );
        Ok(())
    }
}

impl Default for TlsSocket {
    fn default() -> Self {
        TlsSocket::new()
    }
}

impl Deref for TlsSocket {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.sock
    }
}

impl DerefMut for TlsSocket {
    fn deref_mut(&mut self) -> &mut Socket {
        &mut self.sock
    }
}

impl Pollable for TlsSocket {
    fn device(&self) -> &Device {
        self.sock.device()
    }

    fn device_mut(&mut self) -> &mut Device {
        self.sock.device_mut()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.drive_handshake()?;
        let Some(conn) = self.session.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no TLS session"));
        };
        let mut transport = FdIo {
            fd: self.sock.dev.fd(),
        };

        loop {
            match conn.reader().read(buf) {
                Ok(n) => {
                    self.sock.bytes_received += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No buffered plaintext; pull more ciphertext.
                    match conn.read_tls(&mut transport) {
                        Ok(0) => return Ok(0),
                        Ok(_) => {
                            if let Err(err) = conn.process_new_packets() {
                                debug!("TLS read failed: {err}");
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    err.to_string(),
                                ));
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.sock.dev.add_mode(Mode::READ);
                            return Err(e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.drive_handshake()?;
        let Some(conn) = self.session.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no TLS session"));
        };

        // An empty write is a plain flush of pending ciphertext.
        let written = if buf.is_empty() {
            0
        } else {
            conn.writer().write(buf)?
        };
        self.sock.bytes_sent += written as u64;

        let mut transport = FdIo {
            fd: self.sock.dev.fd(),
        };
        while conn.wants_write() {
            match conn.write_tls(&mut transport) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Remaining ciphertext stays queued in the session and
                    // flushes on the next writable cycle.
                    self.sock.dev.add_mode(Mode::WRITE);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    fn close(&mut self) {
        self.sock.close();
    }
}

/// Raw descriptor transport handed to the TLS engine for ciphertext I/O.
/// Byte counters are not touched here: the socket counts plaintext, like
/// the plain socket counts its stream.
struct FdIo {
    fd: RawFd,
}

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        recv_raw(self.fd, buf)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        send_raw(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Configuration loaders ─────────────────────────────────────────────────────

/// Builds a server configuration from PEM certificate chain and private key
/// files.
pub fn server_config(cert_pem: &Path, key_pem: &Path) -> Result<Arc<ServerConfig>, SocketError> {
    let certs = load_certs(cert_pem)?;
    let key = load_key(key_pem)?;
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map(Arc::new)
        .map_err(|e| SocketError::Tls(format!("server configuration rejected key material: {e}")))
}

/// Builds the default client configuration: any server certificate is
/// accepted without verification.  Use [`client_config_with_roots`] to
/// verify against a CA bundle instead.
pub fn client_config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth(),
    )
}

/// Builds a verifying client configuration from a PEM CA bundle.
pub fn client_config_with_roots(ca_pem: &Path) -> Result<Arc<ClientConfig>, SocketError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| SocketError::Tls(format!("bad CA certificate: {e}")))?;
    }
    Ok(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SocketError> {
    let file = File::open(path)
        .map_err(|e| SocketError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| SocketError::Tls(format!("bad certificate in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(SocketError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, SocketError> {
    let file = File::open(path)
        .map_err(|e| SocketError::Tls(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| SocketError::Tls(format!("bad private key in {}: {e}", path.display())))?
        .ok_or_else(|| SocketError::Tls(format!("no private key found in {}", path.display())))
}

/// Certificate verifier that accepts any peer certificate.  Signatures are
/// still checked; only the chain itself goes unverified.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: CryptoProvider,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        AcceptAnyServerCert {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
