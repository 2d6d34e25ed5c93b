//! Subscription lifecycle against the kernel event source.
//!
//! [`EventSourceClient`] owns the single client handle. `start` and `stop`
//! are idempotent and serialized by one mutex. Message delivery runs on the
//! source's own thread and passes through a gate that `stop` closes before
//! releasing the handle, so a message racing with `stop` is either delivered
//! to the still-registered sink or dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::decoder::Decoder;
use crate::kernel::{
    ClientHandle, EventKind, KernelEventSource, MessageCallback, RawMessage, SourceFailure,
};
use crate::types::FileEvent;

/// Event kinds every client subscribes to.
pub const SUBSCRIBED_EVENTS: [EventKind; 7] = EventKind::FILE_LIFECYCLE;

/// Receives decoded events on the source's delivery thread.
///
/// Implementations must not block indefinitely.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: FileEvent);
}

impl<F> EventSink for F
where
    F: Fn(FileEvent) + Send + Sync,
{
    fn deliver(&self, event: FileEvent) {
        self(event);
    }
}

/// Reasons [`EventSourceClient::start`] can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The process is not entitled to use the kernel event source.
    #[error("missing entitlement for the kernel event source")]
    MissingEntitlement,

    /// The source rejected the requested event set.
    #[error("kernel event subscription failed: {0}")]
    SubscriptionFailed(String),

    /// The source could not be opened.
    #[error("failed to connect to the kernel event source: {0}")]
    ConnectFailed(String),
}

impl SourceError {
    /// Only connection failures are worth retrying within the same run.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed(_))
    }
}

enum SubscriptionState {
    Disconnected,
    Connected(ClientHandle),
}

/// State shared with the delivery callback.
struct Delivery {
    decoder: Decoder,
    sink: Arc<dyn EventSink>,
    open: RwLock<bool>,
}

impl Delivery {
    fn handle(&self, message: &RawMessage<'_>) {
        let open = self.open.read().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            trace!(code = message.event.code(), "dropping message delivered after stop");
            return;
        }
        self.sink.deliver(self.decoder.decode(message));
    }

    /// Closing waits for every in-flight delivery to finish.
    fn set_open(&self, value: bool) {
        *self.open.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// Owns the connection to a [`KernelEventSource`].
pub struct EventSourceClient {
    source: Arc<dyn KernelEventSource>,
    delivery: Arc<Delivery>,
    state: Mutex<SubscriptionState>,
}

impl EventSourceClient {
    /// Creates a disconnected client that will forward decoded events to `sink`.
    #[must_use]
    pub fn new(
        source: Arc<dyn KernelEventSource>,
        decoder: Decoder,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            source,
            delivery: Arc::new(Delivery {
                decoder,
                sink,
                open: RwLock::new(false),
            }),
            state: Mutex::new(SubscriptionState::Disconnected),
        }
    }

    /// Connects and subscribes to [`SUBSCRIBED_EVENTS`].
    ///
    /// Succeeds without side effects when already connected.
    ///
    /// # Errors
    ///
    /// - [`SourceError::MissingEntitlement`] when the source refuses the caller
    /// - [`SourceError::ConnectFailed`] when the client cannot be created
    /// - [`SourceError::SubscriptionFailed`] when the event set is rejected;
    ///   the freshly created client is released first
    pub fn start(&self) -> Result<(), SourceError> {
        let mut state = self.lock_state();
        if matches!(*state, SubscriptionState::Connected(_)) {
            debug!("kernel event source already connected");
            return Ok(());
        }

        self.delivery.set_open(true);
        let delivery = Arc::clone(&self.delivery);
        let callback: MessageCallback =
            Arc::new(move |message: &RawMessage<'_>| delivery.handle(message));

        let handle = match self.source.new_client(callback) {
            Ok(handle) => handle,
            Err(failure) => {
                self.delivery.set_open(false);
                return Err(match failure {
                    SourceFailure::NotEntitled => {
                        error!("kernel event source entitlement not found");
                        SourceError::MissingEntitlement
                    }
                    SourceFailure::Failed(reason) => {
                        error!(reason = %reason, "failed to create kernel event client");
                        SourceError::ConnectFailed(reason)
                    }
                });
            }
        };

        if let Err(failure) = self.source.subscribe(&handle, &SUBSCRIBED_EVENTS) {
            self.delivery.set_open(false);
            error!(error = %failure, "failed to subscribe to kernel file events");
            if let Err(release) = self.source.delete_client(handle) {
                warn!(error = %release, "unable to release kernel client, resource leak");
            }
            return Err(match failure {
                SourceFailure::NotEntitled => SourceError::MissingEntitlement,
                SourceFailure::Failed(reason) => SourceError::SubscriptionFailed(reason),
            });
        }

        info!(
            client = handle.as_raw(),
            events = SUBSCRIBED_EVENTS.len(),
            "Subscribed to kernel file events"
        );
        *state = SubscriptionState::Connected(handle);
        Ok(())
    }

    /// Unsubscribes and releases the client. No-op when disconnected.
    ///
    /// Release failures are logged; the client is considered gone either way.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        let handle = match std::mem::replace(&mut *state, SubscriptionState::Disconnected) {
            SubscriptionState::Connected(handle) => handle,
            SubscriptionState::Disconnected => {
                debug!("kernel event source already disconnected");
                return;
            }
        };

        self.delivery.set_open(false);

        let client = handle.as_raw();
        if let Err(err) = self.source.unsubscribe(&handle, &SUBSCRIBED_EVENTS) {
            warn!(client, error = %err, "failed to unsubscribe from kernel events");
        }
        if let Err(err) = self.source.delete_client(handle) {
            warn!(client, error = %err, "unable to delete kernel client, resource leak");
        }

        info!(client, "Kernel file monitoring disabled");
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(*self.lock_state(), SubscriptionState::Connected(_))
    }

    fn lock_state(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EventSourceClient {
    fn drop(&mut self) {
        self.stop();
    }
}
