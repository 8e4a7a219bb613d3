//! vnrelay - peer message relay over a virtual network overlay.
//!
//! This crate provides:
//! - `addr`: codec between (network id, node id) and textual overlay addresses
//! - `overlay`: the socket API boundary to the virtual network
//! - `relay`: background receive loops with per-peer inbound queues
//! - `comm`: the communication façade owning a relay's lifecycle
//! - `script`: the two-function scripting-host boundary
//! - `config`: the key/value configuration reader
//!
//! # Example
//!
//! ```rust,ignore
//! use vnrelay::comm::CommLayer;
//! use vnrelay::overlay::SystemOverlay;
//!
//! let overlay = SystemOverlay::new(0x93afae59635ebb07, 0x8afebc1aea);
//! let comm = CommLayer::new(overlay, 0x93afae59635ebb07, 9000)?;
//! comm.send(0x2bbb385bc2, b"ping")?;
//! while comm.receive(0x2bbb385bc2).is_none() {
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//! }
//! ```

pub mod addr;
pub mod comm;
pub mod config;
pub mod overlay;
pub mod relay;
pub mod script;

// Re-export commonly used types at crate root for convenience
pub use addr::{decode, encode, AddrError, NetworkId, NodeId, MAX_NODE_ID};
pub use comm::CommLayer;
pub use overlay::{
    DatagramSocket, Hub, MemoryOverlay, Overlay, OverlayError, OverlayEvent, StreamConn,
    StreamListener, SystemOverlay,
};
pub use relay::{Relay, RelayError, RelayOptions, RetryPolicy, TransportMode, DEFAULT_PORT};
pub use script::{Bridge, SendReply};
