//! Listening side of the IPC channel.
//!
//! [`IpcListener`] accepts connections on a Unix domain socket, checks each
//! one against the [`PeerPolicy`], and runs a session task per authorized
//! connection. A session becomes the active peer when it sends `Register`.
//!
//! Every change to the active-peer slot runs together with its
//! [`PeerHandler`] hook under one listener-wide lock. A detach that is still
//! stopping the source therefore finishes before the next attach starts it.

use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use super::channel::{IpcChannel, PeerHandler, PeerId, PeerPolicy};
use super::protocol::{read_frame, write_frame, Frame, FrameError};

/// Socket file mode. Access control happens per connection.
const SOCKET_MODE: u32 = 0o666;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts peers on a local socket.
pub struct IpcListener {
    listener: UnixListener,
    path: PathBuf,
    channel: IpcChannel,
    policy: PeerPolicy,
    transitions: Arc<Mutex<()>>,
}

impl IpcListener {
    /// Binds the socket at `path`, replacing a stale socket file.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the stale file cannot be removed, the socket
    /// cannot be bound, or its mode cannot be set.
    pub fn bind(
        path: impl AsRef<Path>,
        channel: IpcChannel,
        policy: PeerPolicy,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

        if policy.is_unrestricted() {
            warn!("No uid allow-list configured; any local user may register");
        }
        info!(path = %path.display(), "Listening for peers");

        Ok(Self {
            listener,
            path,
            channel,
            policy,
            transitions: Arc::new(Mutex::new(())),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn channel(&self) -> &IpcChannel {
        &self.channel
    }

    /// Serves connections until `shutdown` resolves.
    ///
    /// On shutdown all sessions are closed, the detach hook runs for the
    /// active peer if there was one, and the socket file is removed.
    pub async fn run<H, F>(self, handler: Arc<H>, shutdown: F)
    where
        H: PeerHandler,
        F: Future<Output = ()>,
    {
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.admit(stream, &handler, &mut sessions),
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "Peer session task failed");
                    }
                }
            }
        }

        info!("Shutting down listener");
        sessions.shutdown().await;
        {
            let _transition = self.transitions.lock().await;
            if let Some(peer) = self.channel.disconnect() {
                run_detach(&handler, peer).await;
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }

    fn admit<H: PeerHandler>(
        &self,
        stream: UnixStream,
        handler: &Arc<H>,
        sessions: &mut JoinSet<()>,
    ) {
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(e) => {
                warn!(error = %e, "Could not read peer credentials; closing connection");
                return;
            }
        };
        if !self.policy.is_authorized(uid) {
            warn!(uid, "Rejected connection from unauthorized user");
            return;
        }

        let session = PeerSession {
            id: PeerId::new(),
            channel: self.channel.clone(),
            handler: Arc::clone(handler),
            transitions: Arc::clone(&self.transitions),
        };
        info!(peer = %session.id, uid, "Accepted connection");
        sessions.spawn(session.run(stream));
    }
}

async fn run_detach<H: PeerHandler>(handler: &Arc<H>, peer: PeerId) {
    let handler = Arc::clone(handler);
    if let Err(e) = tokio::task::spawn_blocking(move || handler.on_peer_detach(peer)).await {
        error!(%peer, error = %e, "Peer detach hook panicked");
    }
}

/// One accepted connection.
struct PeerSession<H> {
    id: PeerId,
    channel: IpcChannel,
    handler: Arc<H>,
    /// Held across a slot change and the hook that follows it.
    transitions: Arc<Mutex<()>>,
}

impl<H: PeerHandler> PeerSession<H> {
    async fn run(self, stream: UnixStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (outbound, mut queued) = mpsc::channel::<Frame>(self.channel.queue_size());
        let invalidated = Arc::new(Notify::new());

        let mut writer_task = tokio::spawn(async move {
            while let Some(frame) = queued.recv().await {
                write_frame(&mut writer, &frame).await?;
            }
            Ok::<(), FrameError>(())
        });

        let mut registered = false;
        loop {
            tokio::select! {
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(Frame::Register)) => {
                        let accepted = if registered {
                            true
                        } else {
                            registered = true;
                            let _transition = self.transitions.lock().await;
                            self.channel
                                .attach(self.id, outbound.clone(), Arc::clone(&invalidated));
                            self.attach_hook().await
                        };
                        if outbound.send(Frame::Ack(accepted)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(other)) => {
                        warn!(peer = %self.id, frame = ?other, "Unexpected frame from peer");
                        break;
                    }
                    Ok(None) => {
                        debug!(peer = %self.id, "Peer closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %self.id, error = %e, "Failed to read from peer");
                        break;
                    }
                },
                () = invalidated.notified() => {
                    debug!(peer = %self.id, "Session invalidated");
                    break;
                }
                finished = &mut writer_task => {
                    match finished {
                        Ok(Ok(())) => trace!(peer = %self.id, "Writer finished"),
                        Ok(Err(e)) => warn!(peer = %self.id, error = %e, "Failed to write to peer"),
                        Err(e) => error!(peer = %self.id, error = %e, "Writer task failed"),
                    }
                    break;
                }
            }
        }

        if registered {
            let _transition = self.transitions.lock().await;
            if self.channel.detach(self.id) {
                run_detach(&self.handler, self.id).await;
            }
        }
        writer_task.abort();
        info!(peer = %self.id, "Connection closed");
    }

    async fn attach_hook(&self) -> bool {
        let handler = Arc::clone(&self.handler);
        let id = self.id;
        match tokio::task::spawn_blocking(move || handler.on_peer_attach(id)).await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(peer = %id, error = %e, "Peer attach hook panicked");
                false
            }
        }
    }
}
