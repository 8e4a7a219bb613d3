//! Overlay backed by the operating-system socket stack.
//!
//! When the overlay daemon is running, the virtual network materialises
//! as a normal network interface and its address range is routable
//! through ordinary sockets. `std::net` is therefore the overlay's
//! socket API; this type only scopes it to the boundary the relay needs.

use std::io::{Read, Write};
use std::net::{Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::addr::{NetworkId, NodeId};
use crate::overlay::{
    DatagramSocket, EventLog, Overlay, OverlayError, OverlayEvent, Result, StreamConn,
    StreamListener,
};

/// Polling grain for `accept` when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Per-attempt bound on stream dials.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Overlay handle over the local interface the overlay daemon exposes.
pub struct SystemOverlay {
    events: EventLog,
}

impl SystemOverlay {
    /// Creates a handle for `network_id`, announcing `node_id` as the
    /// local identity.
    ///
    /// Interface readiness is the overlay daemon's responsibility; by the
    /// time this process can bind sockets the network is routable, so the
    /// readiness events are emitted immediately.
    pub fn new(network_id: NetworkId, node_id: NodeId) -> Arc<Self> {
        let overlay = Arc::new(Self {
            events: EventLog::new(),
        });
        overlay.events.emit(OverlayEvent::NodeOnline { node_id });
        overlay.events.emit(OverlayEvent::NetworkReady { network_id });
        overlay
    }
}

fn resolve(addr: &str, port: u16) -> Result<SocketAddr> {
    let ip: Ipv6Addr = addr
        .parse()
        .map_err(|_| OverlayError::Unreachable(addr.to_string()))?;
    Ok(SocketAddr::new(ip.into(), port))
}

impl Overlay for SystemOverlay {
    fn open_datagram(&self, port: u16) -> Result<Box<dyn DatagramSocket>> {
        let socket = UdpSocket::bind(("::", port))?;
        Ok(Box::new(SystemDatagramSocket { socket }))
    }

    fn open_listener(&self, port: u16) -> Result<Box<dyn StreamListener>> {
        let listener = TcpListener::bind(("::", port))?;
        // Non-blocking so the accept loop can observe shutdown.
        listener.set_nonblocking(true)?;
        Ok(Box::new(SystemListener { listener }))
    }

    fn connect(&self, addr: &str, port: u16) -> Result<Box<dyn StreamConn>> {
        let remote = resolve(addr, port)?;
        let stream = TcpStream::connect_timeout(&remote, CONNECT_TIMEOUT)?;
        Ok(Box::new(SystemStreamConn { stream }))
    }

    fn wait_ready(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> Receiver<OverlayEvent> {
        self.events.subscribe()
    }
}

struct SystemDatagramSocket {
    socket: UdpSocket,
}

impl DatagramSocket for SystemDatagramSocket {
    fn send_to(&self, data: &[u8], addr: &str, port: u16) -> Result<usize> {
        let remote = resolve(addr, port)?;
        Ok(self.socket.send_to(data, remote)?)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, String)> {
        let (n, from) = self.socket.recv_from(buf)?;
        Ok((n, from.ip().to_string()))
    }

    fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.socket.set_read_timeout(timeout)?)
    }
}

struct SystemListener {
    listener: TcpListener,
}

impl StreamListener for SystemListener {
    fn accept(&self) -> Result<Option<(Box<dyn StreamConn>, String)>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                Ok(Some((
                    Box::new(SystemStreamConn { stream }) as Box<dyn StreamConn>,
                    peer.ip().to_string(),
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                Ok(None)
            }
            Err(e) => Err(OverlayError::Io(e)),
        }
    }
}

struct SystemStreamConn {
    stream: TcpStream,
}

impl StreamConn for SystemStreamConn {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf)?)
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.stream.write_all(data)?;
        Ok(data.len())
    }

    fn peer_addr(&self) -> Result<String> {
        Ok(self.stream.peer_addr()?.ip().to_string())
    }

    fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_datagram() {
        let overlay = SystemOverlay::new(0x1, 0x2);
        let raw = UdpSocket::bind(("::1", 0)).unwrap();
        let raw_port = raw.local_addr().unwrap().port();

        let sender = overlay.open_datagram(0).unwrap();
        sender.send_to(b"probe", "::1", raw_port).unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = raw.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"probe");
    }

    #[test]
    fn test_subscribe_replays_readiness() {
        let overlay = SystemOverlay::new(0xabc, 0x5);
        let rx = overlay.subscribe();
        assert_eq!(rx.recv().unwrap(), OverlayEvent::NodeOnline { node_id: 0x5 });
        assert_eq!(
            rx.recv().unwrap(),
            OverlayEvent::NetworkReady { network_id: 0xabc }
        );
    }
}
