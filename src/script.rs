//! Scripting-host boundary.
//!
//! The embedded scripting host calls exactly two functions, `send` and
//! `receive`, passing and returning primitive values only. `Bridge`
//! adapts a [`CommLayer`] to that convention: every outcome is a value
//! or a (negative code, message) pair, and nothing here ever panics
//! across the boundary.

use std::sync::Arc;

use crate::addr::{NodeId, MAX_NODE_ID};
use crate::comm::CommLayer;
use crate::relay::RelayError;

/// Argument failed validation at the boundary.
pub const ERR_BAD_ARG: i64 = -1;
/// The relay was not started.
pub const ERR_NOT_STARTED: i64 = -2;
/// Could not create the send socket.
pub const ERR_SOCKET: i64 = -3;
/// The destination address could not be formed.
pub const ERR_ADDRESS: i64 = -4;
/// Connect attempts were exhausted.
pub const ERR_RETRIES: i64 = -5;
/// The transport refused the payload.
pub const ERR_SEND: i64 = -6;
/// The relay stopped while sending.
pub const ERR_STOPPED: i64 = -7;

/// Outcome of a boundary `send`, in the host's primitive convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReply {
    /// Bytes sent.
    Sent(i64),
    /// Negative error code plus a human-readable message.
    Failed { code: i64, message: String },
}

fn error_code(err: &RelayError) -> i64 {
    match err {
        RelayError::NotStarted => ERR_NOT_STARTED,
        RelayError::SocketCreate(_) | RelayError::Bind(_) | RelayError::Listen(_) => ERR_SOCKET,
        RelayError::BadAddress(_) => ERR_ADDRESS,
        RelayError::RetriesExhausted { .. } => ERR_RETRIES,
        RelayError::Send(_) => ERR_SEND,
        RelayError::Stopped => ERR_STOPPED,
    }
}

fn valid_node_id(node_id: i64) -> Option<NodeId> {
    if node_id < 0 || node_id as u64 > MAX_NODE_ID {
        return None;
    }
    Some(node_id as NodeId)
}

/// The two-function call boundary over a [`CommLayer`].
pub struct Bridge {
    comm: Arc<CommLayer>,
}

impl Bridge {
    pub fn new(comm: Arc<CommLayer>) -> Self {
        Self { comm }
    }

    /// `send(nodeId, payload) -> bytesSent | (errorCode, errorMessage)`.
    pub fn send(&self, node_id: i64, payload: &str) -> SendReply {
        let node_id = match valid_node_id(node_id) {
            Some(id) => id,
            None => {
                return SendReply::Failed {
                    code: ERR_BAD_ARG,
                    message: "node id must be a non-negative 40-bit integer".to_string(),
                }
            }
        };
        match self.comm.send(node_id, payload.as_bytes()) {
            Ok(n) => SendReply::Sent(n as i64),
            Err(e) => SendReply::Failed {
                code: error_code(&e),
                message: e.to_string(),
            },
        }
    }

    /// `receive(nodeId) -> (length, payload)`; length 0 signals no
    /// buffered message. Invalid node ids also report no message;
    /// nothing could ever be buffered under them.
    pub fn receive(&self, node_id: i64) -> (i64, String) {
        let node_id = match valid_node_id(node_id) {
            Some(id) => id,
            None => return (0, String::new()),
        };
        match self.comm.receive(node_id) {
            Some(payload) => (
                payload.len() as i64,
                String::from_utf8_lossy(&payload).into_owned(),
            ),
            None => (0, String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::NetworkId;
    use crate::overlay::{Hub, MemoryOverlay};
    use std::thread;
    use std::time::{Duration, Instant};

    const NWID: NetworkId = 0x93afae59635ebb07;
    const PORT: u16 = 9000;

    fn bridge_pair(hub: &Arc<Hub>, node_a: NodeId, node_b: NodeId) -> (Bridge, Bridge) {
        let a = CommLayer::new(MemoryOverlay::join(hub, NWID, node_a), NWID, PORT).unwrap();
        let b = CommLayer::new(MemoryOverlay::join(hub, NWID, node_b), NWID, PORT).unwrap();
        (Bridge::new(Arc::new(a)), Bridge::new(Arc::new(b)))
    }

    fn receive_within(bridge: &Bridge, node_id: i64, timeout: Duration) -> (i64, String) {
        let deadline = Instant::now() + timeout;
        loop {
            let (len, payload) = bridge.receive(node_id);
            if len > 0 || Instant::now() >= deadline {
                return (len, payload);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_send_receive_round_trip() {
        let hub = Hub::new();
        let (a, b) = bridge_pair(&hub, 0xaa, 0xbb);

        assert_eq!(a.send(0xbb, "ping"), SendReply::Sent(4));
        let (len, payload) = receive_within(&b, 0xaa, Duration::from_secs(2));
        assert_eq!((len, payload.as_str()), (4, "ping"));
        // Queue drained.
        assert_eq!(b.receive(0xaa), (0, String::new()));
    }

    #[test]
    fn test_send_rejects_bad_node_ids() {
        let hub = Hub::new();
        let (a, _b) = bridge_pair(&hub, 0xaa, 0xbb);

        for bad in [-1i64, (1i64 << 40)] {
            match a.send(bad, "x") {
                SendReply::Failed { code, .. } => assert_eq!(code, ERR_BAD_ARG),
                other => panic!("expected failure, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_receive_bad_node_id_is_empty_not_error() {
        let hub = Hub::new();
        let (a, _b) = bridge_pair(&hub, 0xaa, 0xbb);
        assert_eq!(a.receive(-5), (0, String::new()));
    }

    #[test]
    fn test_send_failure_maps_to_code() {
        let hub = Hub::new();
        let comm = CommLayer::with_options(
            MemoryOverlay::join(&hub, NWID, 0xaa),
            NWID,
            crate::relay::RelayOptions::new()
                .mode(crate::relay::TransportMode::Stream)
                .retry(crate::relay::RetryPolicy {
                    max_attempts: 2,
                    delay: Duration::from_millis(5),
                }),
        )
        .unwrap();
        let bridge = Bridge::new(Arc::new(comm));
        match bridge.send(0x99, "void") {
            SendReply::Failed { code, message } => {
                assert_eq!(code, ERR_RETRIES);
                assert!(message.contains("2 attempts"), "message: {}", message);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
