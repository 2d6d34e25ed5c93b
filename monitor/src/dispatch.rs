//! Binds peer lifecycle to the event source.
//!
//! [`Dispatcher`] starts the [`EventSourceClient`] when a peer registers and
//! stops it when that peer goes away. [`ChannelSink`] is the sink the source
//! delivers into: it serializes each supported event and queues it for the
//! active peer.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, trace, warn};

use crate::ipc::{IpcChannel, PeerHandler, PeerId, SendError};
use crate::source::{EventSink, EventSourceClient, SourceError};
use crate::types::FileEvent;

/// Forwards decoded events to the channel's active peer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    channel: IpcChannel,
}

impl ChannelSink {
    #[must_use]
    pub fn new(channel: IpcChannel) -> Self {
        Self { channel }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: FileEvent) {
        if !event.is_supported() {
            trace!(pid = event.pid(), "Skipping unsupported event");
            return;
        }
        let payload = match event.to_wire() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, event_type = ?event.event_type(), "Dropping event that failed to serialize");
                return;
            }
        };

        match self.channel.send_current(payload) {
            Ok(()) => {}
            Err(SendError::QueueFull) => {
                warn!(event_type = ?event.event_type(), "Peer queue full, dropping event");
            }
            Err(SendError::PeerUnreachable) => {
                debug!("Peer unreachable, dropping event");
            }
        }
    }
}

/// Starts and stops the source as peers come and go.
pub struct Dispatcher {
    source: Arc<EventSourceClient>,
    last_failure: Mutex<Option<SourceError>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(source: Arc<EventSourceClient>) -> Self {
        Self {
            source,
            last_failure: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn source(&self) -> &EventSourceClient {
        &self.source
    }

    /// The most recent start failure, cleared by the next successful start.
    #[must_use]
    pub fn last_failure(&self) -> Option<SourceError> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, outcome: Option<SourceError>) {
        *self
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = outcome;
    }
}

impl PeerHandler for Dispatcher {
    fn on_peer_attach(&self, peer: PeerId) -> bool {
        match self.source.start() {
            Ok(()) => {
                info!(%peer, "Event delivery started");
                self.record(None);
            }
            Err(e) => {
                error!(%peer, error = %e, retryable = e.is_retryable(), "Failed to start event source; peer stays attached without events");
                self.record(Some(e));
            }
        }
        true
    }

    fn on_peer_detach(&self, peer: PeerId) {
        self.source.stop();
        info!(%peer, "Event delivery stopped");
    }
}
