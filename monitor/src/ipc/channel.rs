//! Single-active-peer bookkeeping for the IPC channel.
//!
//! [`IpcChannel`] owns the record of which connection is currently the
//! registered peer and the outbound queue that feeds that connection's
//! socket writer. It is the only place that record lives; sessions and the
//! dispatcher hold clones of the channel, never of the peer.
//!
//! # Accept-and-replace
//!
//! When a second connection registers while one is attached, the newcomer
//! becomes authoritative. The previous session is woken through its
//! invalidation [`Notify`] and closes its socket. Sends addressed to the old
//! [`PeerId`] report [`SendError::PeerUnreachable`] from then on.
//!
//! # Example
//!
//! ```rust
//! use esmon_monitor::ipc::IpcChannel;
//!
//! let channel = IpcChannel::new(16);
//!
//! // Nobody attached: sending is a silent no-op.
//! assert!(channel.current_peer().is_none());
//! assert_eq!(channel.send_current(b"{}".to_vec()), Ok(()));
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::protocol::Frame;

/// Default capacity of the per-peer outbound queue.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

/// Identifies one registered connection.
///
/// A fresh id is minted for every accepted connection, so an id that has
/// been replaced never becomes valid again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from [`IpcChannel::send`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The addressed peer is no longer attached, or its connection closed.
    #[error("peer is unreachable")]
    PeerUnreachable,

    /// The peer's outbound queue is full; the payload was dropped.
    #[error("peer outbound queue is full")]
    QueueFull,
}

/// Application-side hooks for peer lifecycle.
///
/// Both hooks are called from the blocking pool, so they may take locks and
/// wait on OS primitives.
pub trait PeerHandler: Send + Sync + 'static {
    /// A connection completed the register handshake and is now the active
    /// peer. The return value is sent back as the acknowledgment.
    fn on_peer_attach(&self, peer: PeerId) -> bool;

    /// The active peer closed, failed, or violated the protocol.
    ///
    /// Not called for a peer that was replaced by a newer registration.
    fn on_peer_detach(&self, peer: PeerId);
}

/// Which local users may connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPolicy {
    allowed_uids: Option<HashSet<u32>>,
}

impl PeerPolicy {
    /// Accept any local user.
    #[must_use]
    pub fn allow_any() -> Self {
        Self { allowed_uids: None }
    }

    /// Accept only the listed uids.
    #[must_use]
    pub fn allow_uids(uids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            allowed_uids: Some(uids.into_iter().collect()),
        }
    }

    #[must_use]
    pub fn is_authorized(&self, uid: u32) -> bool {
        match &self.allowed_uids {
            Some(allowed) => allowed.contains(&uid),
            None => true,
        }
    }

    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_uids.is_none()
    }
}

impl Default for PeerPolicy {
    fn default() -> Self {
        Self::allow_any()
    }
}

struct ActivePeer {
    id: PeerId,
    outbound: mpsc::Sender<Frame>,
    invalidated: Arc<Notify>,
}

struct Inner {
    active: Mutex<Option<ActivePeer>>,
    queue_size: usize,
}

/// Shared handle to the active-peer slot.
///
/// Cloning is cheap; all clones see the same peer.
#[derive(Clone)]
pub struct IpcChannel {
    inner: Arc<Inner>,
}

impl IpcChannel {
    /// Creates a channel whose sessions use outbound queues of `queue_size`
    /// frames. A zero size is raised to one.
    #[must_use]
    pub fn new(queue_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                active: Mutex::new(None),
                queue_size: queue_size.max(1),
            }),
        }
    }

    /// Capacity of each session's outbound queue.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.inner.queue_size
    }

    /// The currently attached peer, if any.
    #[must_use]
    pub fn current_peer(&self) -> Option<PeerId> {
        self.lock().as_ref().map(|peer| peer.id)
    }

    /// Queues `payload` as an event frame for `peer`.
    ///
    /// Returns `Ok(())` without doing anything when no peer is attached.
    ///
    /// # Errors
    ///
    /// - [`SendError::PeerUnreachable`] if `peer` is not the active peer or
    ///   its connection has already shut down. Clearing the slot is left to
    ///   that connection's teardown, which also runs the detach hook.
    /// - [`SendError::QueueFull`] if the outbound queue has no room; the
    ///   payload is dropped.
    pub fn send(&self, peer: PeerId, payload: Vec<u8>) -> Result<(), SendError> {
        let guard = self.lock();
        let Some(active) = guard.as_ref() else {
            trace!(%peer, "no peer attached, dropping payload");
            return Ok(());
        };
        if active.id != peer {
            return Err(SendError::PeerUnreachable);
        }

        match active.outbound.try_send(Frame::Event(payload)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(SendError::PeerUnreachable),
        }
    }

    /// Sends to whichever peer is attached right now.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn send_current(&self, payload: Vec<u8>) -> Result<(), SendError> {
        match self.current_peer() {
            Some(peer) => self.send(peer, payload),
            None => Ok(()),
        }
    }

    /// Makes `id` the active peer, invalidating any previous one.
    ///
    /// Returns the id that was replaced.
    pub(crate) fn attach(
        &self,
        id: PeerId,
        outbound: mpsc::Sender<Frame>,
        invalidated: Arc<Notify>,
    ) -> Option<PeerId> {
        let previous = self.lock().replace(ActivePeer {
            id,
            outbound,
            invalidated,
        });

        previous.map(|old| {
            info!(old = %old.id, new = %id, "Replacing active peer");
            old.invalidated.notify_one();
            old.id
        })
    }

    /// Clears the slot if `id` still holds it.
    ///
    /// Returns `true` when `id` was the active peer, meaning the caller owes
    /// the detach hook.
    pub(crate) fn detach(&self, id: PeerId) -> bool {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some(active) if active.id == id => {
                *guard = None;
                debug!(peer = %id, "Active peer detached");
                true
            }
            _ => false,
        }
    }

    /// Drops the active peer and tells its session to close.
    ///
    /// Returns the peer that was attached.
    pub fn disconnect(&self) -> Option<PeerId> {
        let previous = self.lock().take();
        previous.map(|old| {
            old.invalidated.notify_one();
            old.id
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActivePeer>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for IpcChannel {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

impl fmt::Debug for IpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcChannel")
            .field("current_peer", &self.current_peer())
            .field("queue_size", &self.inner.queue_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(channel: &IpcChannel) -> (PeerId, mpsc::Receiver<Frame>, Arc<Notify>) {
        let id = PeerId::new();
        let (tx, rx) = mpsc::channel(channel.queue_size());
        let notify = Arc::new(Notify::new());
        channel.attach(id, tx, Arc::clone(&notify));
        (id, rx, notify)
    }

    #[test]
    fn send_without_peer_is_noop() {
        let channel = IpcChannel::new(4);
        assert_eq!(channel.send(PeerId::new(), b"x".to_vec()), Ok(()));
    }

    #[tokio::test]
    async fn send_reaches_active_peer() {
        let channel = IpcChannel::new(4);
        let (id, mut rx, _) = session(&channel);

        channel.send(id, b"hello".to_vec()).unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Event(b"hello".to_vec())));
    }

    #[tokio::test]
    async fn replacement_invalidates_previous_peer() {
        let channel = IpcChannel::new(4);
        let (first, _rx1, first_notify) = session(&channel);
        let (second, mut rx2, _) = session(&channel);

        assert_eq!(channel.current_peer(), Some(second));
        first_notify.notified().await;

        assert_eq!(
            channel.send(first, b"stale".to_vec()),
            Err(SendError::PeerUnreachable)
        );
        channel.send(second, b"fresh".to_vec()).unwrap();
        assert_eq!(rx2.recv().await, Some(Frame::Event(b"fresh".to_vec())));
    }

    #[test]
    fn full_queue_drops_newest() {
        let channel = IpcChannel::new(1);
        let (id, mut rx, _) = session(&channel);

        channel.send(id, b"1".to_vec()).unwrap();
        assert_eq!(channel.send(id, b"2".to_vec()), Err(SendError::QueueFull));
        assert_eq!(rx.try_recv().ok(), Some(Frame::Event(b"1".to_vec())));
    }

    #[test]
    fn closed_session_is_unreachable_but_stays_attached() {
        let channel = IpcChannel::new(4);
        let (id, rx, _) = session(&channel);
        drop(rx);

        assert_eq!(channel.send(id, b"x".to_vec()), Err(SendError::PeerUnreachable));
        assert_eq!(channel.current_peer(), Some(id));
        assert!(channel.detach(id));
        assert_eq!(channel.current_peer(), None);
    }

    #[test]
    fn detach_of_replaced_peer_is_ignored() {
        let channel = IpcChannel::new(4);
        let (first, _rx1, _) = session(&channel);
        let (second, _rx2, _) = session(&channel);

        assert!(!channel.detach(first));
        assert_eq!(channel.current_peer(), Some(second));
    }

    #[tokio::test]
    async fn disconnect_wakes_session() {
        let channel = IpcChannel::new(4);
        let (id, _rx, notify) = session(&channel);

        assert_eq!(channel.disconnect(), Some(id));
        notify.notified().await;
        assert_eq!(channel.current_peer(), None);
        assert_eq!(channel.disconnect(), None);
    }

    #[test]
    fn zero_queue_size_is_raised() {
        assert_eq!(IpcChannel::new(0).queue_size(), 1);
    }

    #[test]
    fn policy_checks_uids() {
        let policy = PeerPolicy::allow_uids([501, 502]);
        assert!(policy.is_authorized(501));
        assert!(!policy.is_authorized(0));
        assert!(!policy.is_unrestricted());
        assert!(PeerPolicy::default().is_authorized(12345));
    }
}
