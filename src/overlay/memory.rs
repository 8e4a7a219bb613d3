//! In-process overlay for tests and demos.
//!
//! A [`Hub`] plays the role of the virtual network: datagram sockets and
//! stream listeners register their address/port with the hub, and peers
//! deliver to each other through channels. Loss-free and ordered, which
//! keeps end-to-end tests deterministic.

use std::collections::HashMap;
use std::io;
use std::net::Ipv6Addr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::addr::{self, NetworkId, NodeId};
use crate::overlay::{
    DatagramSocket, EventLog, Overlay, OverlayError, OverlayEvent, Result, StreamConn,
    StreamListener,
};

/// Polling grain for `accept` on a memory listener.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// First port handed out for ephemeral binds.
const EPHEMERAL_BASE: u16 = 49152;

/// Canonical form of a host address, used as the hub routing key.
fn canon(addr: &str) -> String {
    match addr.parse::<Ipv6Addr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => addr.to_ascii_lowercase(),
    }
}

struct Datagram {
    data: Vec<u8>,
    from: String,
}

/// A connection handed to a listener along with the dialer's address.
type PendingConn = (MemoryConn, String);

struct HubInner {
    datagram: HashMap<(String, u16), mpsc::Sender<Datagram>>,
    listeners: HashMap<(String, u16), mpsc::Sender<PendingConn>>,
    next_ephemeral: u16,
}

/// The in-process exchange connecting [`MemoryOverlay`] nodes.
pub struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                datagram: HashMap::new(),
                listeners: HashMap::new(),
                next_ephemeral: EPHEMERAL_BASE,
            }),
        })
    }
}

/// An overlay node attached to a [`Hub`].
///
/// The node's host address is derived from its (network id, node id)
/// pair, exactly as the real overlay assigns it.
pub struct MemoryOverlay {
    hub: Arc<Hub>,
    host_addr: String,
    events: EventLog,
}

impl MemoryOverlay {
    /// Joins `hub` as the node `node_id` on network `network_id`.
    pub fn join(hub: &Arc<Hub>, network_id: NetworkId, node_id: NodeId) -> Arc<Self> {
        let host_addr = canon(
            &addr::encode(network_id, node_id & addr::MAX_NODE_ID)
                .expect("masked node id fits 40 bits"),
        );
        let overlay = Arc::new(Self {
            hub: Arc::clone(hub),
            host_addr,
            events: EventLog::new(),
        });
        overlay.events.emit(OverlayEvent::NodeOnline { node_id });
        overlay.events.emit(OverlayEvent::NetworkReady { network_id });
        overlay
    }

    /// This node's host address on the overlay.
    pub fn host_addr(&self) -> &str {
        &self.host_addr
    }

    /// Joins with a literal host address. Lets tests exercise the paths
    /// that handle senders whose address carries no node identity.
    #[cfg(test)]
    pub(crate) fn join_raw(hub: &Arc<Hub>, host_addr: &str) -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::clone(hub),
            host_addr: canon(host_addr),
            events: EventLog::new(),
        })
    }

    fn alloc_port(&self, inner: &mut HubInner) -> u16 {
        let port = inner.next_ephemeral;
        inner.next_ephemeral = inner.next_ephemeral.wrapping_add(1).max(EPHEMERAL_BASE);
        port
    }
}

impl Overlay for MemoryOverlay {
    fn open_datagram(&self, port: u16) -> Result<Box<dyn DatagramSocket>> {
        let mut inner = self.hub.inner.lock().unwrap();
        let port = if port == 0 { self.alloc_port(&mut inner) } else { port };
        let key = (self.host_addr.clone(), port);
        if inner.datagram.contains_key(&key) {
            return Err(OverlayError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{}:{} already bound", key.0, key.1),
            )));
        }
        let (tx, rx) = mpsc::channel();
        inner.datagram.insert(key.clone(), tx);
        Ok(Box::new(MemoryDatagramSocket {
            hub: Arc::clone(&self.hub),
            local: key,
            host_addr: self.host_addr.clone(),
            rx: Mutex::new(rx),
            timeout: Mutex::new(None),
        }))
    }

    fn open_listener(&self, port: u16) -> Result<Box<dyn StreamListener>> {
        let mut inner = self.hub.inner.lock().unwrap();
        let port = if port == 0 { self.alloc_port(&mut inner) } else { port };
        let key = (self.host_addr.clone(), port);
        if inner.listeners.contains_key(&key) {
            return Err(OverlayError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{}:{} already listening", key.0, key.1),
            )));
        }
        let (tx, rx) = mpsc::channel();
        inner.listeners.insert(key.clone(), tx);
        Ok(Box::new(MemoryListener {
            hub: Arc::clone(&self.hub),
            local: key,
            rx: Mutex::new(rx),
        }))
    }

    fn connect(&self, addr: &str, port: u16) -> Result<Box<dyn StreamConn>> {
        let key = (canon(addr), port);
        let tx = {
            let inner = self.hub.inner.lock().unwrap();
            inner.listeners.get(&key).cloned()
        };
        let tx = tx.ok_or_else(|| OverlayError::Unreachable(format!("{}:{}", key.0, key.1)))?;

        let (server, client) = MemoryConn::pair(self.host_addr.clone(), key.0.clone());
        tx.send((server, self.host_addr.clone()))
            .map_err(|_| OverlayError::Unreachable(format!("{}:{}", key.0, key.1)))?;
        Ok(Box::new(client))
    }

    fn wait_ready(&self, _timeout: Duration) -> Result<()> {
        // Readiness was established when the node joined the hub.
        Ok(())
    }

    fn subscribe(&self) -> Receiver<OverlayEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Datagram socket
// ============================================================================

struct MemoryDatagramSocket {
    hub: Arc<Hub>,
    local: (String, u16),
    host_addr: String,
    rx: Mutex<mpsc::Receiver<Datagram>>,
    timeout: Mutex<Option<Duration>>,
}

impl DatagramSocket for MemoryDatagramSocket {
    fn send_to(&self, data: &[u8], addr: &str, port: u16) -> Result<usize> {
        let key = (canon(addr), port);
        let tx = {
            let inner = self.hub.inner.lock().unwrap();
            inner.datagram.get(&key).cloned()
        };
        let tx = tx.ok_or_else(|| OverlayError::Unreachable(format!("{}:{}", key.0, key.1)))?;
        tx.send(Datagram {
            data: data.to_vec(),
            from: self.host_addr.clone(),
        })
        .map_err(|_| OverlayError::Unreachable(format!("{}:{}", key.0, key.1)))?;
        Ok(data.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, String)> {
        let rx = self.rx.lock().unwrap();
        let timeout = *self.timeout.lock().unwrap();
        let dgram = match timeout {
            Some(t) => rx.recv_timeout(t).map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => {
                    OverlayError::Io(io::Error::new(io::ErrorKind::TimedOut, "recv timed out"))
                }
                mpsc::RecvTimeoutError::Disconnected => OverlayError::Closed,
            })?,
            None => rx.recv().map_err(|_| OverlayError::Closed)?,
        };
        let n = dgram.data.len().min(buf.len());
        buf[..n].copy_from_slice(&dgram.data[..n]);
        Ok((n, dgram.from))
    }

    fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        *self.timeout.lock().unwrap() = timeout;
        Ok(())
    }
}

impl Drop for MemoryDatagramSocket {
    fn drop(&mut self) {
        self.hub.inner.lock().unwrap().datagram.remove(&self.local);
    }
}

// ============================================================================
// Stream listener and connection
// ============================================================================

struct MemoryListener {
    hub: Arc<Hub>,
    local: (String, u16),
    rx: Mutex<mpsc::Receiver<PendingConn>>,
}

impl StreamListener for MemoryListener {
    fn accept(&self) -> Result<Option<(Box<dyn StreamConn>, String)>> {
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(ACCEPT_POLL) {
            Ok((conn, from)) => Ok(Some((Box::new(conn) as Box<dyn StreamConn>, from))),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(OverlayError::Closed),
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.hub.inner.lock().unwrap().listeners.remove(&self.local);
    }
}

/// One end of an in-memory duplex stream.
pub struct MemoryConn {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    peer: String,
    pending: Vec<u8>,
    timeout: Mutex<Option<Duration>>,
}

impl MemoryConn {
    /// Creates a connected pair: (listener side, dialer side).
    fn pair(dialer_addr: String, listener_addr: String) -> (MemoryConn, MemoryConn) {
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();
        let server = MemoryConn {
            tx: a_tx,
            rx: Mutex::new(b_rx),
            peer: dialer_addr,
            pending: Vec::new(),
            timeout: Mutex::new(None),
        };
        let client = MemoryConn {
            tx: b_tx,
            rx: Mutex::new(a_rx),
            peer: listener_addr,
            pending: Vec::new(),
            timeout: Mutex::new(None),
        };
        (server, client)
    }
}

impl StreamConn for MemoryConn {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            let rx = self.rx.lock().unwrap();
            let timeout = *self.timeout.lock().unwrap();
            let chunk = match timeout {
                Some(t) => match rx.recv_timeout(t) {
                    Ok(chunk) => chunk,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        return Err(OverlayError::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "recv timed out",
                        )))
                    }
                    // Peer end dropped: clean end of stream.
                    Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
                },
                None => match rx.recv() {
                    Ok(chunk) => chunk,
                    Err(_) => return Ok(0),
                },
            };
            self.pending = chunk;
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| OverlayError::Closed)?;
        Ok(data.len())
    }

    fn peer_addr(&self) -> Result<String> {
        Ok(self.peer.clone())
    }

    fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        *self.timeout.lock().unwrap() = timeout;
        Ok(())
    }
}
