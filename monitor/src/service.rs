//! Assembles the monitor from its parts.
//!
//! ```text
//! KernelEventSource ─▶ EventSourceClient ─▶ Decoder ─▶ ChannelSink ─▶ IpcChannel ─▶ peer
//!                             ▲                                            │
//!                             └──────────── Dispatcher ◀── IpcListener ◀───┘
//! ```

use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::decoder::Decoder;
use crate::dispatch::{ChannelSink, Dispatcher};
use crate::error::Result;
use crate::ipc::{IpcChannel, IpcListener};
use crate::kernel::KernelEventSource;
use crate::replay::ReplaySource;
use crate::source::EventSourceClient;
use crate::users::{CachedUsers, UserLookup};

/// A bound, ready-to-run monitor.
pub struct MonitorService {
    listener: IpcListener,
    dispatcher: Arc<Dispatcher>,
}

impl MonitorService {
    /// Loads [`Config`] from the environment and binds.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Config`](crate::MonitorError::Config) for an
    /// invalid environment, otherwise as [`bind`](Self::bind).
    pub fn from_env<U>(source: Arc<dyn KernelEventSource>, users: U) -> Result<Self>
    where
        U: UserLookup + 'static,
    {
        let config = Config::from_env()?;
        info!(
            socket = %config.socket_path.display(),
            queue_size = config.queue_size,
            "Starting esmon monitor"
        );
        Self::bind(&config, source, users)
    }

    /// Wires the pipeline and binds the socket from `config`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Io`](crate::MonitorError::Io) if the socket
    /// cannot be bound.
    pub fn bind<U>(
        config: &Config,
        source: Arc<dyn KernelEventSource>,
        users: U,
    ) -> Result<Self>
    where
        U: UserLookup + 'static,
    {
        let channel = IpcChannel::new(config.queue_size);
        let users: Arc<dyn UserLookup> = Arc::new(CachedUsers::new(users, config.user_cache_size));
        let client = EventSourceClient::new(
            source,
            Decoder::new(users),
            Arc::new(ChannelSink::new(channel.clone())),
        );
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(client)));
        let listener = IpcListener::bind(&config.socket_path, channel, config.peer_policy())?;

        Ok(Self {
            listener,
            dispatcher,
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        self.listener.path()
    }

    #[must_use]
    pub fn channel(&self) -> IpcChannel {
        self.listener.channel().clone()
    }

    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Serves peers until `shutdown` resolves, then stops the source and
    /// removes the socket.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.listener.run(self.dispatcher, shutdown).await;

        if tokio::task::spawn_blocking(move || dispatcher.source().stop())
            .await
            .is_err()
        {
            error!("Event source stop panicked during shutdown");
        }
        info!("Monitor stopped");
    }
}

/// Decodes every supported message of the recording at `path` and writes
/// one wire record per line to `out`.
///
/// Returns the number of records written.
///
/// # Errors
///
/// Returns [`MonitorError::Replay`](crate::MonitorError::Replay) if the
/// recording cannot be loaded, and `Json` or `Io` if a record cannot be
/// encoded or written.
pub fn decode_recording<W: Write>(path: &Path, decoder: &Decoder, out: &mut W) -> Result<usize> {
    let source = ReplaySource::from_path(path)?;
    let mut written = 0;
    for message in source.messages() {
        let event = message.with_view(|raw| decoder.decode(raw));
        if !event.is_supported() {
            continue;
        }
        out.write_all(&event.to_wire()?)?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}
