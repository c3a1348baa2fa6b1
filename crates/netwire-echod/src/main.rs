//! netwire echo daemon entry point.
//!
//! Wires the frame codec and the reactor together into a WebSocket echo
//! service: one `DeviceGroup` multiplexes the listener and every session on
//! a single thread.  TLS is enabled by configuring certificate and key; the
//! handshake then rides the same event loop as everything else.
//!
//! ```text
//! main()
//!  └─ AppConfig::load()          -- TOML config, all fields defaulted
//!  └─ run()
//!       ├─ listener (Socket or TlsSocket) appended to the DeviceGroup
//!       ├─ group timer            -- periodic shutdown-flag check
//!       └─ wait()/next() loop     -- accept, upgrade, echo, expire
//! ```

mod config;
mod session;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use netwire_reactor::{
    server_config, Device, DeviceGroup, DeviceId, IpAddress, Mode, Pollable, Socket, SocketError,
    TlsSocket, TriggerMode,
};

use crate::config::AppConfig;
use crate::session::Session;

/// Set by the SIGINT/SIGTERM handler; polled from the reactor loop.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Listener or session connection, plain or TLS.
enum Conn {
    Plain(Socket),
    Tls(TlsSocket),
}

impl Conn {
    fn accept_conn(&mut self) -> Result<Option<Conn>, SocketError> {
        match self {
            Conn::Plain(sock) => Ok(sock.accept()?.map(Conn::Plain)),
            Conn::Tls(sock) => Ok(sock.accept()?.map(Conn::Tls)),
        }
    }

    fn is_accepted(&self) -> bool {
        match self {
            Conn::Plain(sock) => sock.is_accepted(),
            Conn::Tls(sock) => sock.is_accepted(),
        }
    }

    fn peer(&self) -> String {
        let sock: &Socket = match self {
            Conn::Plain(sock) => sock,
            Conn::Tls(sock) => sock,
        };
        format!("{}:{}", sock.address().anonymized(), sock.port())
    }
}

impl Pollable for Conn {
    fn device(&self) -> &Device {
        match self {
            Conn::Plain(sock) => sock.device(),
            Conn::Tls(sock) => sock.device(),
        }
    }

    fn device_mut(&mut self) -> &mut Device {
        match self {
            Conn::Plain(sock) => sock.device_mut(),
            Conn::Tls(sock) => sock.device_mut(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Plain(sock) => sock.read(buf),
            Conn::Tls(sock) => sock.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Plain(sock) => sock.write(buf),
            Conn::Tls(sock) => sock.write(buf),
        }
    }

    fn close(&mut self) {
        match self {
            Conn::Plain(sock) => Pollable::close(sock),
            Conn::Tls(sock) => Pollable::close(sock),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            AppConfig::load(&path).with_context(|| format!("loading {}", path.display()))?
        }
        None => AppConfig::default(),
    };

    // Safety: the handler only stores into an atomic.
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    info!(
        "netwire-echod starting on {}:{} (tls: {})",
        config.listen.address,
        config.listen.port,
        config.tls.enabled()
    );
    run(config)
}

fn run(config: AppConfig) -> Result<()> {
    let mut group: DeviceGroup<Conn> = DeviceGroup::new();
    if !config.session.edge_triggered {
        group.set_trigger_mode(TriggerMode::LevelTriggered);
    }

    let ip: IpAddress = config
        .listen
        .address
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen.address))?;

    let mut listener = build_listener(&config, ip)?;
    listener.device_mut().set_mode(Mode::READ);
    let listener_id = group
        .append(listener)
        .map_err(|_| anyhow!("failed to register the listener with the reactor"))?;

    // Periodic tick so the loop notices the shutdown flag even when idle.
    group.set_timer(Duration::from_millis(500), false, || {});

    let mut sessions: HashMap<DeviceId, Session> = HashMap::new();

    while !SHUTDOWN.load(Ordering::Relaxed) {
        let mut delivery = group.wait();
        while let Some(event) = delivery {
            if event.id == listener_id {
                accept_pending(&mut group, listener_id, &config, &mut sessions);
            } else {
                service_session(&mut group, event.id, event.timed_out, &mut sessions);
            }
            delivery = group.next();
        }
    }

    info!("netwire-echod stopping ({} open sessions)", sessions.len());
    Ok(())
}

fn build_listener(config: &AppConfig, ip: IpAddress) -> Result<Conn> {
    if config.tls.enabled() {
        let (Some(cert), Some(key)) = (&config.tls.certificate, &config.tls.key) else {
            return Err(anyhow!("[tls] needs both certificate and key"));
        };
        let tls_config =
            server_config(cert, key).map_err(|e| anyhow!("TLS configuration failed: {e}"))?;
        let mut listener = TlsSocket::with_server_config(tls_config);
        listener.set_reuse_addr(true);
        listener
            .bind(ip, config.listen.port)
            .map_err(|e| anyhow!("bind failed: {e}"))?;
        listener
            .listen(config.listen.backlog)
            .map_err(|e| anyhow!("listen failed: {e}"))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| anyhow!("nonblocking failed: {e}"))?;
        Ok(Conn::Tls(listener))
    } else {
        let mut listener = Socket::new();
        listener.set_reuse_addr(true);
        listener
            .bind(ip, config.listen.port)
            .map_err(|e| anyhow!("bind failed: {e}"))?;
        listener
            .listen(config.listen.backlog)
            .map_err(|e| anyhow!("listen failed: {e}"))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| anyhow!("nonblocking failed: {e}"))?;
        Ok(Conn::Plain(listener))
    }
}

/// Accepts every pending connection (edge-triggered listeners report once
/// per readiness transition, so the queue must drain completely).
fn accept_pending(
    group: &mut DeviceGroup<Conn>,
    listener_id: DeviceId,
    config: &AppConfig,
    sessions: &mut HashMap<DeviceId, Session>,
) {
    loop {
        let accepted = {
            let Some(mut listener) = group.get_mut(listener_id) else {
                return;
            };
            listener.accept_conn()
        };

        match accepted {
            Ok(Some(mut conn)) => {
                let peer = conn.peer();
                if let Err(e) = match &mut conn {
                    Conn::Plain(sock) => sock.set_nonblocking(true),
                    Conn::Tls(sock) => sock.set_nonblocking(true),
                } {
                    warn!("{peer}: cannot make connection non-blocking: {e}");
                    continue;
                }
                conn.device_mut().set_mode(Mode::READ);
                conn.device_mut().set_timeout(config.session.idle_timeout_ms);

                match group.append(conn) {
                    Ok(id) => {
                        sessions.insert(id, Session::new(config.session.max_payload));
                        info!("{peer}: connected");
                    }
                    Err(_) => warn!("{peer}: reactor registration failed"),
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!("accept failed: {e}");
                return;
            }
        }
    }
}

/// Handles one readiness or timeout delivery for a session device.
fn service_session(
    group: &mut DeviceGroup<Conn>,
    id: DeviceId,
    timed_out: bool,
    sessions: &mut HashMap<DeviceId, Session>,
) {
    let Some(session) = sessions.get_mut(&id) else {
        // A device the reactor closed on error and we already dropped.
        return;
    };

    if timed_out {
        if let Some(conn) = group.get(id) {
            info!("{}: idle timeout, closing", conn.peer());
        }
        drop_session(group, id, sessions);
        return;
    }

    let mut failed = false;
    let mut peer_gone = false;

    {
        let Some(mut conn) = group.get_mut(id) else {
            sessions.remove(&id);
            return;
        };

        // Drain the socket.
        let mut buf = [0u8; 4096];
        loop {
            match conn.read(&mut buf) {
                Ok(0) => {
                    peer_gone = true;
                    break;
                }
                Ok(n) => {
                    if let Err(e) = session.on_data(&buf[..n]) {
                        debug!("{}: {e}", conn.peer());
                        failed = true;
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("{}: read failed: {e}", conn.peer());
                    failed = true;
                    break;
                }
            }
        }

        // Flush whatever the session queued.
        let mut blocked = false;
        while !session.pending().is_empty() && !blocked {
            match conn.write(session.pending()) {
                Ok(0) => break,
                Ok(n) => session.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => blocked = true,
                Err(e) => {
                    debug!("{}: write failed: {e}", conn.peer());
                    failed = true;
                    break;
                }
            }
        }

        // Keep read interest, add write interest only while output is
        // queued.  During a TLS handshake the socket has already chosen the
        // mode it needs.
        if conn.is_accepted() {
            let mut mode = Mode::READ;
            if !session.pending().is_empty() {
                mode |= Mode::WRITE;
            }
            conn.device_mut().set_mode(mode);
        }
    }

    let done = failed
        || peer_gone
        || (session.is_closing() && session.pending().is_empty());
    if done {
        if let Some(conn) = group.get(id) {
            info!("{}: closing", conn.peer());
        }
        drop_session(group, id, sessions);
    }
}

fn drop_session(
    group: &mut DeviceGroup<Conn>,
    id: DeviceId,
    sessions: &mut HashMap<DeviceId, Session>,
) {
    sessions.remove(&id);
    if let Some(mut conn) = group.remove(id) {
        conn.close();
    } else {
        error!("session device already left the group");
    }
}
