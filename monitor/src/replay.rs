//! Playback of recorded kernel messages.
//!
//! [`ReplaySource`] implements [`KernelEventSource`] over a JSON-lines
//! recording. Each client gets its own delivery thread which lends borrowed
//! [`RawMessage`] views to the client's callback, the same way a native
//! source lends kernel-owned memory.
//!
//! One message per line; blank lines and lines starting with `#` are
//! skipped:
//!
//! ```text
//! {"tv_sec":1700000000,"tv_nsec":5000,"process":{"pid":88,"euid":501,"ppid":1,"executable":{"path":"/bin/mv"}},"event":{"type":"rename","source":{"path":"/tmp/a","size":3},"destination":{"new_path":{"dir":{"path":"/tmp"},"filename":"b"}}}}
//! ```

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::kernel::{
    AuditToken, ClientHandle, Destination, EventKind, KernelEventSource, KernelTime,
    MessageCallback, RawEvent, RawFile, RawMessage, RawProcess, SourceFailure, StringToken,
};
use crate::types::UNKNOWN_PID;

/// Shortest pause between messages when a recording loops.
pub const MIN_REPEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Errors loading a recording.
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to read recording {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid message on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// A file entry in a recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedFile {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: i64,
}

impl RecordedFile {
    fn view(&self) -> RawFile<'_> {
        RawFile {
            path: StringToken::from(self.path.as_str()),
            size: self.size,
        }
    }
}

fn unknown_pid() -> i32 {
    UNKNOWN_PID
}

/// The acting process in a recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedProcess {
    #[serde(default = "unknown_pid")]
    pub pid: i32,
    #[serde(default)]
    pub euid: u32,
    #[serde(default = "unknown_pid")]
    pub ppid: i32,
    #[serde(default)]
    pub is_platform_binary: bool,
    #[serde(default)]
    pub signing_id: String,
    #[serde(default)]
    pub executable: Option<RecordedFile>,
}

/// Create/rename destination in a recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordedDestination {
    ExistingFile(Option<RecordedFile>),
    NewPath {
        #[serde(default)]
        dir: Option<RecordedFile>,
        #[serde(default)]
        filename: String,
    },
}

/// Event payload in a recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordedEvent {
    Open {
        #[serde(default)]
        file: Option<RecordedFile>,
    },
    Close {
        #[serde(default)]
        target: Option<RecordedFile>,
    },
    Create {
        destination: RecordedDestination,
    },
    Clone {
        #[serde(default)]
        source: Option<RecordedFile>,
        #[serde(default)]
        target_dir: Option<RecordedFile>,
        #[serde(default)]
        target_name: String,
    },
    FileProviderUpdate {
        #[serde(default)]
        source: Option<RecordedFile>,
        #[serde(default)]
        target_path: String,
    },
    Rename {
        #[serde(default)]
        source: Option<RecordedFile>,
        destination: RecordedDestination,
    },
    Unlink {
        #[serde(default)]
        target: Option<RecordedFile>,
        #[serde(default)]
        parent_dir: Option<RecordedFile>,
    },
    Other {
        code: u32,
    },
}

/// One recorded kernel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedMessage {
    #[serde(default)]
    pub tv_sec: i64,
    #[serde(default)]
    pub tv_nsec: i64,
    #[serde(default)]
    pub process: Option<RecordedProcess>,
    pub event: RecordedEvent,
}

impl RecordedMessage {
    /// The subscription kind of this message, if supported.
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        match self.event {
            RecordedEvent::Open { .. } => Some(EventKind::NotifyOpen),
            RecordedEvent::Close { .. } => Some(EventKind::NotifyClose),
            RecordedEvent::Create { .. } => Some(EventKind::NotifyCreate),
            RecordedEvent::Clone { .. } => Some(EventKind::NotifyClone),
            RecordedEvent::FileProviderUpdate { .. } => Some(EventKind::NotifyFileProviderUpdate),
            RecordedEvent::Rename { .. } => Some(EventKind::NotifyRename),
            RecordedEvent::Unlink { .. } => Some(EventKind::NotifyUnlink),
            RecordedEvent::Other { code } => EventKind::from_code(code),
        }
    }

    /// Lends a borrowed view of this message to `f`.
    pub fn with_view<R>(&self, f: impl FnOnce(&RawMessage<'_>) -> R) -> R {
        let executable = self
            .process
            .as_ref()
            .and_then(|p| p.executable.as_ref())
            .map(RecordedFile::view);
        let process = self.process.as_ref().map(|p| RawProcess {
            audit_token: AuditToken {
                pid: p.pid,
                euid: p.euid,
            },
            ppid: p.ppid,
            is_platform_binary: p.is_platform_binary,
            signing_id: StringToken::from(p.signing_id.as_str()),
            executable: executable.as_ref(),
        });
        let time = KernelTime {
            tv_sec: self.tv_sec,
            tv_nsec: self.tv_nsec,
        };

        with_event_view(&self.event, |event| {
            f(&RawMessage {
                time,
                process: process.as_ref(),
                event,
            })
        })
    }
}

fn with_destination_view<R>(
    destination: &RecordedDestination,
    f: impl FnOnce(Destination<'_>) -> R,
) -> R {
    match destination {
        RecordedDestination::ExistingFile(file) => {
            let file = file.as_ref().map(RecordedFile::view);
            f(Destination::ExistingFile(file.as_ref()))
        }
        RecordedDestination::NewPath { dir, filename } => {
            let dir = dir.as_ref().map(RecordedFile::view);
            f(Destination::NewPath {
                dir: dir.as_ref(),
                filename: StringToken::from(filename.as_str()),
            })
        }
    }
}

fn with_event_view<R>(event: &RecordedEvent, f: impl FnOnce(RawEvent<'_>) -> R) -> R {
    match event {
        RecordedEvent::Open { file } => {
            let file = file.as_ref().map(RecordedFile::view);
            f(RawEvent::Open {
                file: file.as_ref(),
            })
        }
        RecordedEvent::Close { target } => {
            let target = target.as_ref().map(RecordedFile::view);
            f(RawEvent::Close {
                target: target.as_ref(),
            })
        }
        RecordedEvent::Create { destination } => {
            with_destination_view(destination, |destination| f(RawEvent::Create { destination }))
        }
        RecordedEvent::Clone {
            source,
            target_dir,
            target_name,
        } => {
            let source = source.as_ref().map(RecordedFile::view);
            let target_dir = target_dir.as_ref().map(RecordedFile::view);
            f(RawEvent::Clone {
                source: source.as_ref(),
                target_dir: target_dir.as_ref(),
                target_name: StringToken::from(target_name.as_str()),
            })
        }
        RecordedEvent::FileProviderUpdate {
            source,
            target_path,
        } => {
            let source = source.as_ref().map(RecordedFile::view);
            f(RawEvent::FileProviderUpdate {
                source: source.as_ref(),
                target_path: StringToken::from(target_path.as_str()),
            })
        }
        RecordedEvent::Rename {
            source,
            destination,
        } => {
            let source = source.as_ref().map(RecordedFile::view);
            with_destination_view(destination, |destination| {
                f(RawEvent::Rename {
                    source: source.as_ref(),
                    destination,
                })
            })
        }
        RecordedEvent::Unlink { target, parent_dir } => {
            let target = target.as_ref().map(RecordedFile::view);
            let parent_dir = parent_dir.as_ref().map(RecordedFile::view);
            f(RawEvent::Unlink {
                target: target.as_ref(),
                parent_dir: parent_dir.as_ref(),
            })
        }
        RecordedEvent::Other { code } => f(RawEvent::Other { code: *code }),
    }
}

/// Parses a JSON-lines recording.
///
/// # Errors
///
/// Returns [`ReplayError::Parse`] with the 1-based line number of the first
/// malformed message.
pub fn parse_recording(text: &str) -> Result<Vec<RecordedMessage>, ReplayError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|source| ReplayError::Parse {
                line: index + 1,
                source,
            })
        })
        .collect()
}

/// Interruptible sleep shared between a worker and `delete_client`.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to `timeout`; returns `true` once stopped.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

struct Worker {
    stop: Arc<StopSignal>,
    thread: JoinHandle<()>,
}

struct ReplayClient {
    callback: MessageCallback,
    subscribed: Arc<RwLock<HashSet<EventKind>>>,
    worker: Option<Worker>,
}

/// A [`KernelEventSource`] that plays back a recording.
pub struct ReplaySource {
    messages: Arc<Vec<RecordedMessage>>,
    interval: Duration,
    repeat: bool,
    next_client: AtomicU64,
    clients: Mutex<HashMap<u64, ReplayClient>>,
}

impl ReplaySource {
    #[must_use]
    pub fn new(messages: Vec<RecordedMessage>) -> Self {
        Self {
            messages: Arc::new(messages),
            interval: Duration::ZERO,
            repeat: false,
            next_client: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Loads a recording from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, ReplayError> {
        let text = fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let messages = parse_recording(&text)?;
        info!(path = %path.display(), messages = messages.len(), "Loaded kernel event recording");
        Ok(Self::new(messages))
    }

    /// Pause between consecutive messages.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Restart from the first message after the last one.
    ///
    /// Looping playback never goes faster than [`MIN_REPEAT_INTERVAL`].
    #[must_use]
    pub fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Pause the delivery thread actually uses between messages.
    #[must_use]
    pub fn effective_interval(&self) -> Duration {
        if self.repeat {
            self.interval.max(MIN_REPEAT_INTERVAL)
        } else {
            self.interval
        }
    }

    #[must_use]
    pub fn messages(&self) -> &[RecordedMessage] {
        &self.messages
    }

    /// Number of clients that have not been deleted.
    #[must_use]
    pub fn live_clients(&self) -> usize {
        self.lock_clients().len()
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ReplayClient>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self, client: &ReplayClient, id: u64) -> Result<Worker, SourceFailure> {
        let stop = Arc::new(StopSignal::default());
        let messages = Arc::clone(&self.messages);
        let subscribed = Arc::clone(&client.subscribed);
        let callback = Arc::clone(&client.callback);
        let worker_stop = Arc::clone(&stop);
        let interval = self.effective_interval();
        let repeat = self.repeat;

        let thread = thread::Builder::new()
            .name(format!("esmon-replay-{id}"))
            .spawn(move || {
                play(&messages, &subscribed, &callback, &worker_stop, interval, repeat);
                debug!(client = id, "Replay finished");
            })
            .map_err(|e| SourceFailure::Failed(format!("failed to spawn delivery thread: {e}")))?;

        Ok(Worker { stop, thread })
    }
}

fn play(
    messages: &[RecordedMessage],
    subscribed: &RwLock<HashSet<EventKind>>,
    callback: &MessageCallback,
    stop: &StopSignal,
    interval: Duration,
    repeat: bool,
) {
    loop {
        for message in messages {
            if stop.is_stopped() {
                return;
            }
            let wanted = message.kind().is_some_and(|kind| {
                subscribed
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(&kind)
            });
            if wanted {
                message.with_view(|raw| callback(raw));
            }
            if !interval.is_zero() && stop.wait(interval) {
                return;
            }
        }
        if !repeat || messages.is_empty() {
            return;
        }
    }
}

impl KernelEventSource for ReplaySource {
    fn new_client(&self, callback: MessageCallback) -> Result<ClientHandle, SourceFailure> {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        self.lock_clients().insert(
            id,
            ReplayClient {
                callback,
                subscribed: Arc::new(RwLock::new(HashSet::new())),
                worker: None,
            },
        );
        debug!(client = id, "Created replay client");
        Ok(ClientHandle::from_raw(id))
    }

    fn subscribe(&self, client: &ClientHandle, events: &[EventKind]) -> Result<(), SourceFailure> {
        let mut clients = self.lock_clients();
        let entry = clients
            .get_mut(&client.as_raw())
            .ok_or_else(|| SourceFailure::Failed(format!("unknown client {}", client.as_raw())))?;

        entry
            .subscribed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(events.iter().copied());

        if entry.worker.is_none() {
            let worker = self.spawn_worker(entry, client.as_raw())?;
            entry.worker = Some(worker);
        }
        Ok(())
    }

    fn unsubscribe(&self, client: &ClientHandle, events: &[EventKind]) -> Result<(), SourceFailure> {
        let clients = self.lock_clients();
        let entry = clients
            .get(&client.as_raw())
            .ok_or_else(|| SourceFailure::Failed(format!("unknown client {}", client.as_raw())))?;

        let mut subscribed = entry
            .subscribed
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for kind in events {
            subscribed.remove(kind);
        }
        Ok(())
    }

    fn delete_client(&self, client: ClientHandle) -> Result<(), SourceFailure> {
        let removed = self.lock_clients().remove(&client.as_raw());
        let Some(entry) = removed else {
            return Err(SourceFailure::Failed(format!(
                "unknown client {}",
                client.as_raw()
            )));
        };

        if let Some(worker) = entry.worker {
            worker.stop.stop();
            if worker.thread.thread().id() == thread::current().id() {
                warn!(client = client.as_raw(), "replay client deleted from its own delivery thread");
            } else if worker.thread.join().is_err() {
                warn!(client = client.as_raw(), "replay delivery thread panicked");
            }
        }
        debug!(client = client.as_raw(), "Deleted replay client");
        Ok(())
    }
}
