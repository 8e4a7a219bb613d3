//! Socket API boundary to the virtual network overlay.
//!
//! The overlay (join/leave, address resolution, encryption, NAT traversal)
//! is an external collaborator; this module defines the narrow socket
//! interface the relay consumes, plus the readiness signal the bootstrap
//! sequence waits on.
//!
//! Two implementations ship:
//! - [`SystemOverlay`]: the overlay materialises as an operating-system
//!   network interface, so the OS socket stack is its socket API.
//! - [`MemoryOverlay`]: an in-process exchange for tests and demos.

mod memory;
mod system;

pub use memory::{Hub, MemoryOverlay};
pub use system::SystemOverlay;

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::addr::{NetworkId, NodeId};

/// Errors from overlay socket operations.
#[derive(Debug)]
pub enum OverlayError {
    /// I/O error from the underlying socket stack.
    Io(io::Error),
    /// The node or network is not ready yet.
    NotReady,
    /// A blocking operation ran out of time.
    Timeout,
    /// No route to the given address.
    Unreachable(String),
    /// The overlay handle was closed.
    Closed,
}

impl std::fmt::Display for OverlayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlayError::Io(e) => write!(f, "overlay: io: {}", e),
            OverlayError::NotReady => write!(f, "overlay: not ready"),
            OverlayError::Timeout => write!(f, "overlay: timed out"),
            OverlayError::Unreachable(a) => write!(f, "overlay: no route to {}", a),
            OverlayError::Closed => write!(f, "overlay: closed"),
        }
    }
}

impl std::error::Error for OverlayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OverlayError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OverlayError {
    fn from(e: io::Error) -> Self {
        OverlayError::Io(e)
    }
}

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Readiness notifications delivered while the overlay comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// The local node has joined the overlay control plane.
    NodeOnline { node_id: NodeId },
    /// The virtual network is configured and addresses are routable.
    NetworkReady { network_id: NetworkId },
    /// A direct link to a peer came up.
    PeerLinkUp { node_id: NodeId },
}

/// Replayable event log backing `Overlay::subscribe` implementations.
///
/// Events emitted before a subscriber attaches are replayed to it, so a
/// bootstrap sequence that subscribes late still sees node-online and
/// network-ready.
pub(crate) struct EventLog {
    emitted: Mutex<Vec<OverlayEvent>>,
    subscribers: Mutex<Vec<Sender<OverlayEvent>>>,
}

impl EventLog {
    pub(crate) fn new() -> Self {
        Self {
            emitted: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn emit(&self, event: OverlayEvent) {
        self.emitted.lock().unwrap().push(event.clone());
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn subscribe(&self) -> Receiver<OverlayEvent> {
        let (tx, rx) = unbounded();
        for event in self.emitted.lock().unwrap().iter() {
            let _ = tx.send(event.clone());
        }
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

/// A receive-capable datagram socket on the overlay.
pub trait DatagramSocket: Send + Sync {
    /// Sends one datagram to `addr`:`port`. Returns the bytes sent.
    fn send_to(&self, data: &[u8], addr: &str, port: u16) -> Result<usize>;

    /// Receives one datagram. Returns the byte count and the sender's
    /// host address (portless textual form).
    ///
    /// With a receive timeout set, an idle period surfaces as an
    /// `Io` error of kind `WouldBlock` or `TimedOut`.
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, String)>;

    /// Bounds how long `recv_from` may block. `None` blocks forever.
    fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()>;
}

/// One accepted or dialed stream connection.
pub trait StreamConn: Send {
    /// Reads a chunk. Returns 0 once the peer has closed the stream.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes `data` in full. Returns the bytes written.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// The remote host address (portless textual form).
    fn peer_addr(&self) -> Result<String>;

    /// Bounds how long `recv` may block. `None` blocks forever.
    fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()>;
}

/// A listening stream socket on the overlay.
pub trait StreamListener: Send + Sync {
    /// Accepts one pending connection, if any.
    ///
    /// Returns `Ok(None)` when nothing is pending within the listener's
    /// polling grain, so an accept loop can re-check its run flag.
    fn accept(&self) -> Result<Option<(Box<dyn StreamConn>, String)>>;
}

/// Handle to a joined virtual network overlay.
///
/// Creates sockets addressed by the overlay's textual addresses and
/// reports readiness. All sockets are bound on the wildcard address.
pub trait Overlay: Send + Sync {
    /// Opens a datagram socket bound to `port` (0 for ephemeral).
    fn open_datagram(&self, port: u16) -> Result<Box<dyn DatagramSocket>>;

    /// Opens a stream listener bound to `port`.
    fn open_listener(&self, port: u16) -> Result<Box<dyn StreamListener>>;

    /// Dials a stream connection to `addr`:`port`.
    fn connect(&self, addr: &str, port: u16) -> Result<Box<dyn StreamConn>>;

    /// Blocks until the node is online and the network is ready.
    fn wait_ready(&self, timeout: Duration) -> Result<()>;

    /// Subscribes to readiness notifications.
    ///
    /// Events already emitted before the call are replayed to the new
    /// subscriber, so a late bootstrap sequence still observes them.
    fn subscribe(&self) -> Receiver<OverlayEvent>;
}
