//! esmon Monitor - privileged file event relay.
//!
//! This crate subscribes to a kernel security event source, decodes each
//! file lifecycle message into a [`FileEvent`], and relays the records as
//! JSON to a single registered, unprivileged peer over a local socket.
//!
//! # Overview
//!
//! The peer connects and registers; registration starts the subscription.
//! When the peer goes away the subscription is torn down. Events observed
//! while no peer is attached are not kept.
//!
//! # Modules
//!
//! - [`types`]: The normalized [`FileEvent`] record and its wire encoding
//! - [`kernel`]: Kernel source contract and borrowed message views
//! - [`decoder`]: Kernel message to [`FileEvent`] conversion
//! - [`users`]: uid to user name lookup with caching
//! - [`source`]: Subscription lifecycle ([`EventSourceClient`])
//! - [`replay`]: A kernel source that plays back recordings
//! - [`ipc`]: Socket framing, peer slot, listener and connecting side
//! - [`dispatch`]: Binds peer lifecycle to the event source
//! - [`service`]: Wires everything behind one socket
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types for monitor operations

pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod replay;
pub mod service;
pub mod source;
pub mod types;
pub mod users;

pub use config::Config;
pub use decoder::Decoder;
pub use dispatch::{ChannelSink, Dispatcher};
pub use error::{MonitorError, Result};
pub use ipc::{IpcChannel, IpcListener, PeerConnection, PeerHandler, PeerId, PeerPolicy, SendError};
pub use kernel::{EventKind, KernelEventSource, RawMessage, SourceFailure};
pub use replay::{RecordedMessage, ReplayError, ReplaySource};
pub use service::{decode_recording, MonitorService};
pub use source::{EventSink, EventSourceClient, SourceError};
pub use types::{EventType, FileEvent};
pub use users::{CachedUsers, SystemUsers, UserLookup};
