//! Normalized file event record and its wire encoding.
//!
//! A [`FileEvent`] is produced once per kernel message by the
//! [`decoder`](crate::decoder), serialized exactly once by the dispatch layer
//! and then dropped. Fields are only reachable through accessors so a record
//! cannot be altered between decode and transmission.
//!
//! The wire form is a JSON object whose top-level fields are always present:
//!
//! ```json
//! {
//!   "eventtype": "file::rename",
//!   "processpath": "/bin/mv",
//!   "pid": 4711,
//!   "ppid": 1,
//!   "isplatform": true,
//!   "timestamp": 1700000000123,
//!   "username": "alice",
//!   "signingid": "com.apple.mv",
//!   "props": { "srcpath": "/tmp/a", "srcsize": "12", "desttype": "1", "destfile": "b", "destdir": "/tmp" }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel used for `pid` and `ppid` when the kernel did not supply one.
pub const UNKNOWN_PID: i32 = -1;

/// File lifecycle operations relayed to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "file::open")]
    FileOpen,
    #[serde(rename = "file::close")]
    FileClose,
    #[serde(rename = "file::create")]
    FileCreate,
    #[serde(rename = "file::clone")]
    FileClone,
    #[serde(rename = "file::update")]
    FileProviderUpdate,
    #[serde(rename = "file::rename")]
    FileRename,
    #[serde(rename = "file::unlink")]
    FileUnlink,
}

impl EventType {
    /// Every supported event type, in subscription order.
    pub const ALL: [EventType; 7] = [
        EventType::FileOpen,
        EventType::FileClose,
        EventType::FileCreate,
        EventType::FileClone,
        EventType::FileProviderUpdate,
        EventType::FileRename,
        EventType::FileUnlink,
    ];

    /// Returns the wire label (`file::open`, `file::rename`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileOpen => "file::open",
            Self::FileClose => "file::close",
            Self::FileCreate => "file::create",
            Self::FileClone => "file::clone",
            Self::FileProviderUpdate => "file::update",
            Self::FileRename => "file::rename",
            Self::FileUnlink => "file::unlink",
        }
    }

    /// The `props` keys a fully populated event of this type carries.
    #[must_use]
    pub fn prop_keys(self) -> &'static [&'static str] {
        match self {
            Self::FileOpen
            | Self::FileClose
            | Self::FileCreate
            | Self::FileClone
            | Self::FileProviderUpdate => &["path", "size"],
            Self::FileRename => &["srcpath", "srcsize", "desttype", "destfile", "destdir"],
            Self::FileUnlink => &["dir", "path"],
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == label)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed file operation.
///
/// `event_type` is `None` for kernel messages outside the supported set;
/// such events are never put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    #[serde(rename = "eventtype", with = "event_type_label")]
    pub(crate) event_type: Option<EventType>,
    #[serde(rename = "processpath")]
    pub(crate) process_path: String,
    pub(crate) pid: i32,
    #[serde(rename = "ppid")]
    pub(crate) parent_pid: i32,
    #[serde(rename = "isplatform")]
    pub(crate) is_platform_binary: bool,
    pub(crate) timestamp: i64,
    pub(crate) username: String,
    #[serde(rename = "signingid")]
    pub(crate) signing_id: String,
    pub(crate) props: BTreeMap<String, String>,
}

impl Default for FileEvent {
    fn default() -> Self {
        Self {
            event_type: None,
            process_path: String::new(),
            pid: UNKNOWN_PID,
            parent_pid: UNKNOWN_PID,
            is_platform_binary: false,
            timestamp: 0,
            username: String::new(),
            signing_id: String::new(),
            props: BTreeMap::new(),
        }
    }
}

impl FileEvent {
    #[must_use]
    pub fn event_type(&self) -> Option<EventType> {
        self.event_type
    }

    #[must_use]
    pub fn process_path(&self) -> &str {
        &self.process_path
    }

    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    #[must_use]
    pub fn parent_pid(&self) -> i32 {
        self.parent_pid
    }

    #[must_use]
    pub fn is_platform_binary(&self) -> bool {
        self.is_platform_binary
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn signing_id(&self) -> &str {
        &self.signing_id
    }

    #[must_use]
    pub fn props(&self) -> &BTreeMap<String, String> {
        &self.props
    }

    /// Returns a single property value.
    #[must_use]
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// True when the event belongs to the relayed file lifecycle set.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.event_type.is_some()
    }

    /// Encodes the event as UTF-8 JSON for transport.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the record cannot be encoded.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an event received from the monitor.
    ///
    /// # Errors
    ///
    /// Returns the deserializer error for malformed payloads.
    pub fn from_wire(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Multi-line, human-readable rendering of the event.
    #[must_use]
    pub fn description(&self) -> String {
        let mut out = format!(
            "Event Type: {}\nProcess: {}\nPid: {} (Parent) -> {}\nUser: {}\nTimestamp: {}\nPlatform Binary: {}\nSigning ID: {}\nProps:",
            self.event_type.map_or("", EventType::as_str),
            self.process_path,
            self.pid,
            self.parent_pid,
            self.username,
            self.timestamp,
            self.is_platform_binary,
            self.signing_id,
        );
        for (key, value) in &self.props {
            out.push_str(&format!("\n  {key}: {value}"));
        }
        out
    }
}

/// Serializes `Option<EventType>` as its label, with `""` for `None`.
mod event_type_label {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::EventType;

    pub fn serialize<S: Serializer>(value: &Option<EventType>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(value.map_or("", EventType::as_str))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<EventType>, D::Error> {
        let label = String::deserialize(d)?;
        if label.is_empty() {
            return Ok(None);
        }
        EventType::from_label(&label)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event type '{label}'")))
    }
}
