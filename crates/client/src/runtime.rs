//! UDP runtime for the client.
//!
//! One receive thread blocks on the socket (with a bounded timeout so a
//! shutdown request is observable), feeds decoded datagrams to the
//! [`ClientSync`] state machine, sends the resulting acks, and pushes the
//! validated events onto a channel. The presentation loop drains that
//! channel at its own poll interval via [`ClientRuntime::poll_events`]; it
//! never touches the socket and never observes a half-applied grid.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gridclash_grid::{CellCoord, GridState};
use thiserror::Error;

use crate::{ClientConfig, ClientSync, SyncEvent, SyncState};

/// Maximum datagram size accepted on the receive path. Matches the server
/// runtime's bound; the default 10x10 grid's worst-case full snapshot
/// encodes to roughly 1 KB.
pub const MAX_DATAGRAM: usize = 2048;

/// Bound on a blocking receive; the shutdown flag is rechecked at this
/// interval.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors raised while setting up or using the client transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind local UDP socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to configure UDP socket: {0}")]
    Configure(#[source] io::Error),

    #[error("failed to clone UDP socket handle: {0}")]
    CloneSocket(#[source] io::Error),

    #[error("send to server failed: {0}")]
    Send(#[source] io::Error),

    #[error("client state lock poisoned")]
    Poisoned,
}

/// Sender-local milliseconds since the Unix epoch, for header timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to a connected client: the receive thread plus the event queue
/// the presentation loop polls.
///
/// Dropping the handle (or calling [`ClientRuntime::shutdown`]) requests
/// shutdown and joins the receive thread; that is the only cancellation
/// primitive, matching the abrupt-shutdown lifecycle.
pub struct ClientRuntime {
    sync: Arc<Mutex<ClientSync>>,
    socket: UdpSocket,
    server_addr: SocketAddr,
    events: Receiver<SyncEvent>,
    shutdown: Arc<AtomicBool>,
    receive_handle: Option<JoinHandle<()>>,
}

impl ClientRuntime {
    /// Bind an ephemeral local socket, send INIT, and start the receive
    /// thread.
    pub fn connect(config: &ClientConfig, server_addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(TransportError::Bind)?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(TransportError::Configure)?;

        let mut sync = ClientSync::new(config);
        let init = sync.connect(now_ms());
        socket
            .send_to(&init, server_addr)
            .map_err(TransportError::Send)?;
        log::info!("connecting to {server_addr}");

        let sync = Arc::new(Mutex::new(sync));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (event_tx, events) = mpsc::channel();

        let receive_handle = {
            let socket = socket.try_clone().map_err(TransportError::CloneSocket)?;
            let sync = Arc::clone(&sync);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || receive_loop(&socket, server_addr, &sync, &shutdown, &event_tx))
        };

        Ok(Self {
            sync,
            socket,
            server_addr,
            events,
            shutdown,
            receive_handle: Some(receive_handle),
        })
    }

    /// Drain all events queued since the last poll.
    pub fn poll_events(&self) -> Vec<SyncEvent> {
        self.events.try_iter().collect()
    }

    /// Send a fire-and-forget acquire request for `cell`.
    ///
    /// Returns `Ok(false)` when the handshake has not completed yet; the
    /// intent is simply not sent (there is no queueing or retry).
    pub fn send_intent(&self, cell: CellCoord) -> Result<bool, TransportError> {
        let datagram = {
            let mut sync = self.sync.lock().map_err(|_| TransportError::Poisoned)?;
            sync.intent(cell, now_ms())
        };
        match datagram {
            Some(datagram) => {
                self.socket
                    .send_to(&datagram, self.server_addr)
                    .map_err(TransportError::Send)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> SyncState {
        self.sync
            .lock()
            .map(|sync| sync.state())
            .unwrap_or(SyncState::Disconnected)
    }

    /// Copy of the local grid, for rendering.
    pub fn grid_snapshot(&self) -> Result<GridState, TransportError> {
        let sync = self.sync.lock().map_err(|_| TransportError::Poisoned)?;
        Ok(sync.grid().clone())
    }

    /// Request shutdown and join the receive thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receive_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ClientRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    sync: &Mutex<ClientSync>,
    shutdown: &AtomicBool,
    events: &Sender<SyncEvent>,
) {
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

        if from != server_addr {
            log::debug!("ignoring datagram from unexpected source {from}");
            continue;
        }

        let handled = match sync.lock() {
            Ok(mut sync) => sync.handle_datagram(&buf[..len], now_ms()),
            Err(_) => {
                log::error!("client state poisoned; stopping receive loop");
                return;
            }
        };

        if let Some(ack) = handled.ack {
            // Best-effort: a lost ack only costs one full resync.
            if let Err(err) = socket.send_to(&ack, server_addr) {
                log::warn!("ack send failed: {err}");
            }
        }
        if let Some(event) = handled.event {
            if events.send(event).is_err() {
                // Presentation side is gone; nothing left to deliver to.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_sane() {
        assert!(now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_connect_and_shutdown() {
        // No server on the other end; the runtime must still come up,
        // stay in Connecting, and shut down cleanly.
        let runtime = ClientRuntime::connect(
            &ClientConfig::default(),
            "127.0.0.1:9".parse().unwrap(),
        )
        .expect("bind ephemeral port");

        assert_eq!(runtime.state(), SyncState::Connecting);
        assert!(runtime.poll_events().is_empty());
        assert!(!runtime.send_intent(CellCoord::new(0, 0)).unwrap());
        runtime.shutdown();
    }
}
