//! UDP runtime for the server edge.
//!
//! Two threads drive the pure [`Server`] core behind a single mutex:
//! - the receive thread blocks on the socket (with a bounded timeout so a
//!   shutdown request is observable) and dispatches inbound datagrams;
//! - the broadcast thread ticks the scheduler at the configured frequency.
//!
//! One lock is sufficient: contention is low and every critical section is
//! short (decode/dispatch or one scheduler tick).

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::{Outbound, Server, ServerConfig};

/// Maximum datagram size accepted on the receive path. This bounds the
/// deployable grid: the default 10x10 grid's worst-case full snapshot
/// encodes to roughly 1 KB.
pub const MAX_DATAGRAM: usize = 2048;

/// Bound on a blocking receive; the shutdown flag is rechecked at this
/// interval.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors raised while setting up the UDP runtime.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("failed to configure UDP socket: {0}")]
    Configure(#[source] io::Error),

    #[error("failed to clone UDP socket handle: {0}")]
    CloneSocket(#[source] io::Error),
}

/// Sender-local milliseconds since the Unix epoch, for header timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to a running server: two threads sharing one [`Server`].
///
/// Dropping the handle (or calling [`ServerRuntime::shutdown`]) requests
/// shutdown and joins both threads.
pub struct ServerRuntime {
    state: Arc<Mutex<Server>>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
    receive_handle: Option<JoinHandle<()>>,
    broadcast_handle: Option<JoinHandle<()>>,
}

impl ServerRuntime {
    /// Bind `addr` and start the receive and broadcast threads.
    pub fn spawn(config: ServerConfig, addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(TransportError::Configure)?;
        let local_addr = socket.local_addr().map_err(TransportError::Configure)?;

        let server = Server::new(config);
        let tick_interval = server.tick_interval();
        log::info!("server listening on {local_addr}, broadcasting every {tick_interval:?}");

        let state = Arc::new(Mutex::new(server));
        let shutdown = Arc::new(AtomicBool::new(false));

        let receive_handle = {
            let socket = socket.try_clone().map_err(TransportError::CloneSocket)?;
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || receive_loop(&socket, &state, &shutdown))
        };

        let broadcast_handle = {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || broadcast_loop(&socket, &state, &shutdown, tick_interval))
        };

        Ok(Self {
            state,
            shutdown,
            local_addr,
            receive_handle: Some(receive_handle),
            broadcast_handle: Some(broadcast_handle),
        })
    }

    /// Address the server is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared server state, for inspection by an embedding process.
    pub fn state(&self) -> Arc<Mutex<Server>> {
        Arc::clone(&self.state)
    }

    /// Request shutdown and join both threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receive_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.broadcast_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: &UdpSocket, state: &Mutex<Server>, shutdown: &AtomicBool) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while !shutdown.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                // A receive error after shutdown was requested is a normal
                // termination, not a failure.
                if !shutdown.load(Ordering::Relaxed) {
                    log::error!("receive loop terminated: {err}");
                }
                return;
            }
        };

        let replies = match state.lock() {
            Ok(mut server) => server.handle_datagram(from, &buf[..len], now_ms()),
            Err(_) => {
                log::error!("server state poisoned; stopping receive loop");
                return;
            }
        };
        send_all(socket, &replies);
    }
}

fn broadcast_loop(
    socket: &UdpSocket,
    state: &Mutex<Server>,
    shutdown: &AtomicBool,
    tick_interval: Duration,
) {
    loop {
        thread::sleep(tick_interval);
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        let outbound = match state.lock() {
            Ok(mut server) => server.broadcast_tick(now_ms()),
            Err(_) => {
                log::error!("server state poisoned; stopping broadcast loop");
                return;
            }
        };
        send_all(socket, &outbound);
    }
}

fn send_all(socket: &UdpSocket, outbound: &[Outbound]) {
    for message in outbound {
        // Best-effort transport: a failed send is logged, never retried.
        if let Err(err) = socket.send_to(&message.datagram, message.to) {
            log::warn!("send to {} failed: {err}", message.to);
        }
    }
}
