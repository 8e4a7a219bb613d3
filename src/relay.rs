//! Message relay: background receive loops and per-peer inbound queues.
//!
//! A `Relay` owns the receiving side of the channel. Started with a
//! network id, it binds the well-known relay port on the overlay, spawns
//! a receive loop (datagram or stream, per [`TransportMode`]), and files
//! every inbound payload under the sender's node id, recovered by
//! decoding the source address. Callers drain the queues at their own
//! pace through [`Relay::pop_message`]; nothing ever blocks on arrival.
//!
//! Shutdown is cooperative: the loops re-check the run flag every
//! receive-timeout grain, so `stop`'s join is bounded.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::addr::{self, AddrError, NetworkId, NodeId};
use crate::overlay::{DatagramSocket, Overlay, OverlayError, StreamConn, StreamListener};

/// Well-known relay port. All relay traffic uses this port unless the
/// surrounding CLI overrides it.
pub const DEFAULT_PORT: u16 = 9000;

/// Upper bound on a single inbound payload.
pub const MAX_PAYLOAD: usize = 10_000;

/// How long a receive call may block before re-checking the run flag.
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounded-retry policy for stream connects.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Connect attempts before giving up.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(200),
        }
    }
}

/// Which transport the relay receives and sends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Fire-and-forget datagrams. One receive loop.
    #[default]
    Datagram,
    /// Connection-oriented streams. One accept loop plus a drain worker
    /// per accepted connection.
    Stream,
}

/// Options for creating a relay.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Port to bind and to address peers on.
    pub port: u16,
    pub mode: TransportMode,
    /// Polling grain of the receive loops.
    pub recv_timeout: Duration,
    /// Receive buffer size; larger payloads are truncated by the transport.
    pub max_payload: usize,
    pub retry: RetryPolicy,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            mode: TransportMode::Datagram,
            recv_timeout: RECV_TIMEOUT,
            max_payload: MAX_PAYLOAD,
            retry: RetryPolicy::default(),
        }
    }
}

impl RelayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Errors from relay operations.
#[derive(Debug)]
pub enum RelayError {
    /// `send` called before the relay was started.
    NotStarted,
    /// Could not create the ephemeral send socket.
    SocketCreate(OverlayError),
    /// Could not bind the receive socket.
    Bind(OverlayError),
    /// Could not open the stream listener.
    Listen(OverlayError),
    /// The destination address could not be formed.
    BadAddress(AddrError),
    /// Every connect attempt failed.
    RetriesExhausted { attempts: u32 },
    /// The transport refused the payload.
    Send(OverlayError),
    /// The relay was stopped while the send was in progress.
    Stopped,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::NotStarted => write!(f, "relay: not started"),
            RelayError::SocketCreate(e) => write!(f, "relay: create socket: {}", e),
            RelayError::Bind(e) => write!(f, "relay: bind: {}", e),
            RelayError::Listen(e) => write!(f, "relay: listen: {}", e),
            RelayError::BadAddress(e) => write!(f, "relay: {}", e),
            RelayError::RetriesExhausted { attempts } => {
                write!(f, "relay: connect failed after {} attempts", attempts)
            }
            RelayError::Send(e) => write!(f, "relay: send: {}", e),
            RelayError::Stopped => write!(f, "relay: stopped"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<AddrError> for RelayError {
    fn from(e: AddrError) -> Self {
        RelayError::BadAddress(e)
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Background receiver with per-peer inbound queues.
pub struct Relay {
    overlay: Arc<dyn Overlay>,
    opts: RelayOptions,
    running: AtomicBool,
    // Recorded on first start, kept for the relay's lifetime.
    network_id: Mutex<Option<NetworkId>>,
    queues: Mutex<HashMap<NodeId, VecDeque<Bytes>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    // Serialises concurrent stoppers so every caller returns only after
    // all loop threads are joined.
    stop_lock: Mutex<()>,
}

impl Relay {
    /// Creates a stopped relay over `overlay`.
    pub fn new(overlay: Arc<dyn Overlay>, opts: RelayOptions) -> Arc<Self> {
        Arc::new(Self {
            overlay,
            opts,
            running: AtomicBool::new(false),
            network_id: Mutex::new(None),
            queues: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            stop_lock: Mutex::new(()),
        })
    }

    /// Starts the receive loop(s). Idempotent: a second `start` on a
    /// running relay is a no-op. The network id is recorded once, on the
    /// first start.
    pub fn start(self: &Arc<Self>, network_id: NetworkId) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut nwid = self.network_id.lock().unwrap();
            if nwid.is_none() {
                *nwid = Some(network_id);
            }
        }
        if let Err(e) = self.spawn_loops() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(
            "relay: started on port {} ({:?}) for network {:016x}",
            self.opts.port, self.opts.mode, network_id
        );
        Ok(())
    }

    fn spawn_loops(self: &Arc<Self>) -> Result<()> {
        match self.opts.mode {
            TransportMode::Datagram => {
                let socket = self
                    .overlay
                    .open_datagram(self.opts.port)
                    .map_err(RelayError::Bind)?;
                socket
                    .set_recv_timeout(Some(self.opts.recv_timeout))
                    .map_err(RelayError::Bind)?;
                let relay = Arc::clone(self);
                let handle = thread::spawn(move || relay.datagram_loop(socket));
                self.threads.lock().unwrap().push(handle);
            }
            TransportMode::Stream => {
                let listener = self
                    .overlay
                    .open_listener(self.opts.port)
                    .map_err(RelayError::Listen)?;
                let relay = Arc::clone(self);
                let handle = thread::spawn(move || relay.stream_loop(listener));
                self.threads.lock().unwrap().push(handle);
            }
        }
        Ok(())
    }

    /// Stops the receive loop(s) and joins every spawned thread. After
    /// return no further queue mutation occurs. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _guard = self.stop_lock.lock().unwrap();
        // Workers may still be registering while the accept loop winds
        // down; keep draining until no handle is left.
        loop {
            let drained: Vec<_> = {
                let mut threads = self.threads.lock().unwrap();
                threads.drain(..).collect()
            };
            if drained.is_empty() {
                break;
            }
            for handle in drained {
                let _ = handle.join();
            }
        }
    }

    /// True while the receive loop(s) are meant to run.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The network id recorded on first start, if any.
    pub fn network_id(&self) -> Option<NetworkId> {
        *self.network_id.lock().unwrap()
    }

    /// The relay port.
    pub fn port(&self) -> u16 {
        self.opts.port
    }

    /// Removes and returns the oldest buffered payload from `node_id`,
    /// if any. Unknown node ids report no message, never an error.
    pub fn pop_message(&self, node_id: NodeId) -> Option<Bytes> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.get_mut(&node_id)?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&node_id);
        }
        payload
    }

    /// Sends `payload` to the peer `node_id` on the relay's network.
    ///
    /// Datagram mode transmits once over an ephemeral socket. Stream mode
    /// dials with the configured bounded retry policy; stopping the relay
    /// abandons the retry loop early.
    pub fn send(&self, node_id: NodeId, payload: &[u8]) -> Result<usize> {
        let network_id = self
            .network_id
            .lock()
            .unwrap()
            .ok_or(RelayError::NotStarted)?;
        let dest = addr::encode(network_id, node_id)?;
        match self.opts.mode {
            TransportMode::Datagram => self.send_datagram(&dest, payload),
            TransportMode::Stream => self.send_stream(&dest, payload),
        }
    }

    fn send_datagram(&self, dest: &str, payload: &[u8]) -> Result<usize> {
        let socket = self.overlay.open_datagram(0).map_err(RelayError::SocketCreate)?;
        socket
            .send_to(payload, dest, self.opts.port)
            .map_err(RelayError::Send)
    }

    fn send_stream(&self, dest: &str, payload: &[u8]) -> Result<usize> {
        let policy = self.opts.retry;
        for attempt in 1..=policy.max_attempts {
            if !self.running.load(Ordering::SeqCst) {
                return Err(RelayError::Stopped);
            }
            match self.overlay.connect(dest, self.opts.port) {
                Ok(mut conn) => return conn.send(payload).map_err(RelayError::Send),
                Err(e) => {
                    debug!(
                        "relay: connect {} attempt {}/{}: {}",
                        dest, attempt, policy.max_attempts, e
                    );
                    if attempt < policy.max_attempts {
                        thread::sleep(policy.delay);
                    }
                }
            }
        }
        Err(RelayError::RetriesExhausted {
            attempts: policy.max_attempts,
        })
    }

    // ------------------------------------------------------------------
    // Receive loops
    // ------------------------------------------------------------------

    fn datagram_loop(self: Arc<Self>, socket: Box<dyn DatagramSocket>) {
        let mut buf = vec![0u8; self.opts.max_payload];
        while self.running.load(Ordering::SeqCst) {
            let (n, from) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(OverlayError::Io(e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(OverlayError::Closed) => break,
                Err(e) => {
                    // One bad receive never stops the relay.
                    warn!("relay: datagram recv: {}", e);
                    continue;
                }
            };
            if n == 0 {
                continue;
            }
            match addr::decode(&from) {
                Ok(node_id) => self.push(node_id, Bytes::copy_from_slice(&buf[..n])),
                Err(e) => warn!("relay: dropping datagram from {}: {}", from, e),
            }
        }
        debug!("relay: datagram loop exited");
    }

    fn stream_loop(self: Arc<Self>, listener: Box<dyn StreamListener>) {
        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok(Some((conn, from))) => {
                    let node_id = match addr::decode(&from) {
                        Ok(id) => id,
                        Err(e) => {
                            warn!("relay: dropping connection from {}: {}", from, e);
                            continue;
                        }
                    };
                    let relay = Arc::clone(&self);
                    let handle = thread::spawn(move || relay.drain_stream(node_id, conn));
                    self.threads.lock().unwrap().push(handle);
                }
                Ok(None) => continue,
                Err(OverlayError::Closed) => break,
                Err(e) => {
                    warn!("relay: accept: {}", e);
                    continue;
                }
            }
        }
        debug!("relay: stream loop exited");
    }

    fn drain_stream(&self, node_id: NodeId, mut conn: Box<dyn StreamConn>) {
        if conn.set_recv_timeout(Some(self.opts.recv_timeout)).is_err() {
            return;
        }
        let mut buf = vec![0u8; self.opts.max_payload];
        while self.running.load(Ordering::SeqCst) {
            match conn.recv(&mut buf) {
                Ok(0) => break, // peer closed
                Ok(n) => self.push(node_id, Bytes::copy_from_slice(&buf[..n])),
                Err(OverlayError::Io(e))
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    debug!("relay: stream from {:x}: {}", node_id, e);
                    break;
                }
            }
        }
    }

    fn push(&self, node_id: NodeId, payload: Bytes) {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(node_id).or_default().push_back(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{Hub, MemoryOverlay};
    use std::time::Instant;

    const NWID: NetworkId = 0x93afae59635ebb07;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(10),
        }
    }

    fn quick_opts() -> RelayOptions {
        RelayOptions::new()
            .recv_timeout(Duration::from_millis(50))
            .retry(fast_retry())
    }

    /// Polls `pop_message` until a payload arrives or `timeout` passes.
    fn pop_within(relay: &Relay, node_id: NodeId, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(msg) = relay.pop_message(node_id) {
                return Some(msg);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_start_is_idempotent_and_pins_network_id() {
        let hub = Hub::new();
        let overlay = MemoryOverlay::join(&hub, NWID, 0x1);
        let relay = Relay::new(overlay, quick_opts());

        relay.start(NWID).unwrap();
        relay.start(0xdead).unwrap();
        assert_eq!(relay.network_id(), Some(NWID));
        assert!(relay.is_running());
        relay.stop();
        assert!(!relay.is_running());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let hub = Hub::new();
        let overlay = MemoryOverlay::join(&hub, NWID, 0x1);
        let relay = Relay::new(overlay, quick_opts());
        relay.start(NWID).unwrap();
        relay.stop();
        relay.stop();
    }

    #[test]
    fn test_pop_unknown_node_returns_none() {
        let hub = Hub::new();
        let overlay = MemoryOverlay::join(&hub, NWID, 0x1);
        let relay = Relay::new(overlay, quick_opts());
        assert!(relay.pop_message(0x42).is_none());
    }

    #[test]
    fn test_send_before_start() {
        let hub = Hub::new();
        let overlay = MemoryOverlay::join(&hub, NWID, 0x1);
        let relay = Relay::new(overlay, quick_opts());
        assert!(matches!(
            relay.send(0x2, b"hi").unwrap_err(),
            RelayError::NotStarted
        ));
    }

    #[test]
    fn test_send_rejects_wide_node_id() {
        let hub = Hub::new();
        let overlay = MemoryOverlay::join(&hub, NWID, 0x1);
        let relay = Relay::new(overlay, quick_opts());
        relay.start(NWID).unwrap();
        assert!(matches!(
            relay.send(1 << 40, b"hi").unwrap_err(),
            RelayError::BadAddress(AddrError::NodeIdOutOfRange(_))
        ));
        relay.stop();
    }

    #[test]
    fn test_datagram_fifo_per_peer() {
        let hub = Hub::new();
        let relay = Relay::new(MemoryOverlay::join(&hub, NWID, 0x1), quick_opts());
        relay.start(NWID).unwrap();

        let sock = peer_overlay_socket(&hub, NWID, 0x2);
        let dest = addr::encode(NWID, 0x1).unwrap();
        sock.send_to(b"A", &dest, DEFAULT_PORT).unwrap();
        sock.send_to(b"B", &dest, DEFAULT_PORT).unwrap();

        assert_eq!(
            pop_within(&relay, 0x2, Duration::from_secs(2)).as_deref(),
            Some(&b"A"[..])
        );
        assert_eq!(
            pop_within(&relay, 0x2, Duration::from_secs(2)).as_deref(),
            Some(&b"B"[..])
        );
        assert!(relay.pop_message(0x2).is_none());
        relay.stop();
    }

    /// A fresh ephemeral datagram socket for a hub member.
    fn peer_overlay_socket(
        hub: &Arc<Hub>,
        network_id: NetworkId,
        node_id: NodeId,
    ) -> Box<dyn DatagramSocket> {
        MemoryOverlay::join(hub, network_id, node_id)
            .open_datagram(0)
            .unwrap()
    }

    #[test]
    fn test_relay_to_relay_send() {
        let hub = Hub::new();
        let a = Relay::new(MemoryOverlay::join(&hub, NWID, 0xa), quick_opts());
        let b = Relay::new(MemoryOverlay::join(&hub, NWID, 0xb), quick_opts());
        a.start(NWID).unwrap();
        b.start(NWID).unwrap();

        let sent = a.send(0xb, b"ping").unwrap();
        assert_eq!(sent, 4);
        assert_eq!(
            pop_within(&b, 0xa, Duration::from_secs(2)).as_deref(),
            Some(&b"ping"[..])
        );
        a.stop();
        b.stop();
    }

    #[test]
    fn test_concurrent_peers_do_not_cross() {
        let hub = Hub::new();
        let relay = Relay::new(MemoryOverlay::join(&hub, NWID, 0x1), quick_opts());
        relay.start(NWID).unwrap();

        let mut senders = Vec::new();
        for i in 0..8u64 {
            let hub = Arc::clone(&hub);
            senders.push(thread::spawn(move || {
                let node_id = 0x100 + i;
                let sock = MemoryOverlay::join(&hub, NWID, node_id)
                    .open_datagram(0)
                    .unwrap();
                let dest = addr::encode(NWID, 0x1).unwrap();
                let payload = format!("payload-{}", i);
                sock.send_to(payload.as_bytes(), &dest, DEFAULT_PORT).unwrap();
            }));
        }
        for handle in senders {
            handle.join().unwrap();
        }

        for i in 0..8u64 {
            let msg = pop_within(&relay, 0x100 + i, Duration::from_secs(2))
                .unwrap_or_else(|| panic!("no message from peer {}", i));
            assert_eq!(msg.as_ref(), format!("payload-{}", i).as_bytes());
        }
        relay.stop();
    }

    #[test]
    fn test_malformed_source_is_dropped_not_fatal() {
        let hub = Hub::new();
        let relay = Relay::new(MemoryOverlay::join(&hub, NWID, 0x1), quick_opts());
        relay.start(NWID).unwrap();
        let dest = addr::encode(NWID, 0x1).unwrap();

        // A source whose address does not decode to a node id.
        let rogue = MemoryOverlay::join_raw(&hub, "not-an-address");
        rogue
            .open_datagram(0)
            .unwrap()
            .send_to(b"junk", &dest, DEFAULT_PORT)
            .unwrap();

        // A well-formed peer still gets through afterwards.
        let sock = peer_overlay_socket(&hub, NWID, 0x2);
        sock.send_to(b"ok", &dest, DEFAULT_PORT).unwrap();
        assert_eq!(
            pop_within(&relay, 0x2, Duration::from_secs(2)).as_deref(),
            Some(&b"ok"[..])
        );
        relay.stop();
    }

    #[test]
    fn test_stream_mode_end_to_end() {
        let hub = Hub::new();
        let opts = quick_opts().mode(TransportMode::Stream);
        let receiver = Relay::new(MemoryOverlay::join(&hub, NWID, 0x1), opts.clone());
        let sender = Relay::new(MemoryOverlay::join(&hub, NWID, 0x2), opts);
        receiver.start(NWID).unwrap();
        sender.start(NWID).unwrap();

        assert_eq!(sender.send(0x1, b"over-stream").unwrap(), 11);
        assert_eq!(
            pop_within(&receiver, 0x2, Duration::from_secs(2)).as_deref(),
            Some(&b"over-stream"[..])
        );
        sender.stop();
        receiver.stop();
    }

    #[test]
    fn test_stream_retries_exhausted() {
        let hub = Hub::new();
        let relay = Relay::new(
            MemoryOverlay::join(&hub, NWID, 0x1),
            quick_opts().mode(TransportMode::Stream),
        );
        relay.start(NWID).unwrap();

        // Nobody listens for node 0x99.
        match relay.send(0x99, b"void").unwrap_err() {
            RelayError::RetriesExhausted { attempts } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {}", other),
        }
        relay.stop();
    }

    #[test]
    fn test_stop_cancels_inflight_retry() {
        let hub = Hub::new();
        let relay = Relay::new(
            MemoryOverlay::join(&hub, NWID, 0x1),
            quick_opts()
                .mode(TransportMode::Stream)
                .retry(RetryPolicy {
                    max_attempts: 100,
                    delay: Duration::from_millis(20),
                }),
        );
        relay.start(NWID).unwrap();

        let r = Arc::clone(&relay);
        let sender = thread::spawn(move || r.send(0x99, b"void"));
        thread::sleep(Duration::from_millis(50));
        relay.stop();
        assert!(matches!(
            sender.join().unwrap().unwrap_err(),
            RelayError::Stopped
        ));
    }

    #[test]
    fn test_no_queue_mutation_after_stop() {
        let hub = Hub::new();
        let relay = Relay::new(MemoryOverlay::join(&hub, NWID, 0x1), quick_opts());
        relay.start(NWID).unwrap();
        relay.stop();

        // The receive socket is gone; a late datagram has nowhere to land.
        let sock = peer_overlay_socket(&hub, NWID, 0x2);
        let dest = addr::encode(NWID, 0x1).unwrap();
        assert!(sock.send_to(b"late", &dest, DEFAULT_PORT).is_err());
        assert!(relay.pop_message(0x2).is_none());
    }
}
