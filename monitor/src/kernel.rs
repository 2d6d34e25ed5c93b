//! Kernel security event source contract and borrowed message views.
//!
//! The kernel hands out messages it owns for the duration of a callback.
//! Everything in this module that carries a lifetime is such a view: a
//! [`RawMessage`] is only valid inside the callback it was passed to, and
//! consumers copy out whatever they need before returning.
//!
//! The event payload is a tagged variant ([`RawEvent`]) instead of a union,
//! so only the fields valid for a given tag can be reached, and every
//! pointer the kernel may leave null is an `Option`.

use std::sync::Arc;

use thiserror::Error;

/// A length-prefixed byte span supplied by the kernel.
///
/// `length` is the kernel's claim; `data` is the backing memory actually
/// lent to us. A well-formed token has `length <= data.len()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StringToken<'a> {
    length: usize,
    data: &'a [u8],
}

impl<'a> StringToken<'a> {
    /// A token covering all of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            length: data.len(),
            data,
        }
    }

    /// A token with an explicit kernel-reported length.
    #[must_use]
    pub fn with_length(data: &'a [u8], length: usize) -> Self {
        Self { length, data }
    }

    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

impl<'a> From<&'a str> for StringToken<'a> {
    fn from(value: &'a str) -> Self {
        Self::new(value.as_bytes())
    }
}

/// A file as described by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFile<'a> {
    pub path: StringToken<'a>,
    /// `st_size` from the file's stat.
    pub size: i64,
}

/// Identity of the acting process, as carried by its audit token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditToken {
    pub pid: i32,
    pub euid: u32,
}

/// The process that performed the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawProcess<'a> {
    pub audit_token: AuditToken,
    pub ppid: i32,
    pub is_platform_binary: bool,
    pub signing_id: StringToken<'a>,
    pub executable: Option<&'a RawFile<'a>>,
}

/// Kernel wall-clock time of the event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelTime {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

/// Where a create or rename lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination<'a> {
    /// The operation targets a file that already exists.
    ExistingFile(Option<&'a RawFile<'a>>),
    /// The operation creates `filename` inside `dir`.
    NewPath {
        dir: Option<&'a RawFile<'a>>,
        filename: StringToken<'a>,
    },
}

impl Destination<'_> {
    /// Numeric destination type as reported by the kernel.
    #[must_use]
    pub fn type_code(&self) -> u32 {
        match self {
            Self::ExistingFile(_) => 0,
            Self::NewPath { .. } => 1,
        }
    }
}

/// Event payload, tagged by the kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent<'a> {
    Open {
        file: Option<&'a RawFile<'a>>,
    },
    Close {
        target: Option<&'a RawFile<'a>>,
    },
    Create {
        destination: Destination<'a>,
    },
    Clone {
        source: Option<&'a RawFile<'a>>,
        target_dir: Option<&'a RawFile<'a>>,
        target_name: StringToken<'a>,
    },
    FileProviderUpdate {
        source: Option<&'a RawFile<'a>>,
        target_path: StringToken<'a>,
    },
    Rename {
        source: Option<&'a RawFile<'a>>,
        destination: Destination<'a>,
    },
    Unlink {
        target: Option<&'a RawFile<'a>>,
        parent_dir: Option<&'a RawFile<'a>>,
    },
    /// Any kind this crate does not decode.
    Other {
        code: u32,
    },
}

impl RawEvent<'_> {
    /// The subscription kind this payload belongs to, if supported.
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Open { .. } => Some(EventKind::NotifyOpen),
            Self::Close { .. } => Some(EventKind::NotifyClose),
            Self::Create { .. } => Some(EventKind::NotifyCreate),
            Self::Clone { .. } => Some(EventKind::NotifyClone),
            Self::FileProviderUpdate { .. } => Some(EventKind::NotifyFileProviderUpdate),
            Self::Rename { .. } => Some(EventKind::NotifyRename),
            Self::Unlink { .. } => Some(EventKind::NotifyUnlink),
            Self::Other { .. } => None,
        }
    }

    /// The kernel's numeric event type.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Other { code } => *code,
            other => other.kind().map_or(u32::MAX, EventKind::code),
        }
    }
}

/// One kernel message, borrowed for the duration of a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMessage<'a> {
    pub time: KernelTime,
    pub process: Option<&'a RawProcess<'a>>,
    pub event: RawEvent<'a>,
}

/// Notify-only event kinds a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NotifyOpen,
    NotifyClose,
    NotifyCreate,
    NotifyClone,
    NotifyFileProviderUpdate,
    NotifyRename,
    NotifyUnlink,
}

impl EventKind {
    /// The file lifecycle set relayed to peers.
    pub const FILE_LIFECYCLE: [EventKind; 7] = [
        EventKind::NotifyOpen,
        EventKind::NotifyClose,
        EventKind::NotifyCreate,
        EventKind::NotifyClone,
        EventKind::NotifyFileProviderUpdate,
        EventKind::NotifyRename,
        EventKind::NotifyUnlink,
    ];

    /// Endpoint Security `es_event_type_t` value.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::NotifyOpen => 10,
            Self::NotifyClose => 12,
            Self::NotifyCreate => 13,
            Self::NotifyRename => 25,
            Self::NotifyUnlink => 32,
            Self::NotifyFileProviderUpdate => 37,
            Self::NotifyClone => 61,
        }
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::FILE_LIFECYCLE.into_iter().find(|k| k.code() == code)
    }
}

/// Callback invoked by the source for every delivered message.
///
/// Runs on a thread owned by the source.
pub type MessageCallback = Arc<dyn Fn(&RawMessage<'_>) + Send + Sync>;

/// Opaque handle to a client registered with a [`KernelEventSource`].
///
/// Deliberately neither `Clone` nor `Copy`: releasing it consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ClientHandle(u64);

impl ClientHandle {
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Non-success statuses reported by a kernel event source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceFailure {
    /// The process lacks the entitlement required to create a client.
    #[error("caller is not entitled to use the kernel event source")]
    NotEntitled,

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

/// The privileged kernel facility that produces file events.
///
/// Implementations deliver messages by invoking the callback passed to
/// [`new_client`](KernelEventSource::new_client) from their own thread, and
/// only for kinds the client is currently subscribed to.
pub trait KernelEventSource: Send + Sync {
    /// Creates a client whose messages are delivered to `callback`.
    fn new_client(&self, callback: MessageCallback) -> Result<ClientHandle, SourceFailure>;

    /// Starts delivery of `events` to `client`.
    fn subscribe(&self, client: &ClientHandle, events: &[EventKind]) -> Result<(), SourceFailure>;

    /// Stops delivery of `events` to `client`.
    fn unsubscribe(&self, client: &ClientHandle, events: &[EventKind])
        -> Result<(), SourceFailure>;

    /// Releases `client`. No callbacks for it start after this returns.
    fn delete_client(&self, client: ClientHandle) -> Result<(), SourceFailure>;
}
