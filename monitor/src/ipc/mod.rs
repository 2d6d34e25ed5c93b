//! Local duplex channel between the monitor and its display peer.
//!
//! - [`protocol`]: frame codec shared by both sides
//! - [`channel`]: the single active-peer slot and outbound queue
//! - [`listener`]: socket accept loop and per-connection sessions
//! - [`client`]: connect and register from the peer side

pub mod channel;
pub mod client;
pub mod listener;
pub mod protocol;

pub use channel::{IpcChannel, PeerHandler, PeerId, PeerPolicy, SendError, DEFAULT_QUEUE_SIZE};
pub use client::{ConnectError, PeerConnection, ReceiveError, RegisterError};
pub use listener::IpcListener;
pub use protocol::{Frame, FrameError, MAX_FRAME_LEN};
