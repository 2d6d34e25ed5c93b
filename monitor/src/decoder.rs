//! Kernel message decoding.
//!
//! [`Decoder::decode`] turns one borrowed [`RawMessage`] into an owned
//! [`FileEvent`]. Decoding never fails: a missing sub-field only leaves the
//! matching `props` key out, and a zero-length string becomes `""`.
//!
//! | event type | `props` keys |
//! |---|---|
//! | open, close, create, clone, provider update | `path`, `size` |
//! | rename | `srcpath`, `srcsize`, `desttype`, `destfile`, `destdir` |
//! | unlink | `dir`, `path` |

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::kernel::{Destination, KernelTime, RawEvent, RawFile, RawMessage, StringToken};
use crate::types::{EventType, FileEvent, UNKNOWN_PID};
use crate::users::UserLookup;

const NANOS_PER_MILLI: i64 = 1_000_000;
const MILLIS_PER_SEC: i64 = 1_000;

/// Converts kernel messages into [`FileEvent`]s.
#[derive(Clone)]
pub struct Decoder {
    users: Arc<dyn UserLookup>,
}

impl Decoder {
    #[must_use]
    pub fn new(users: Arc<dyn UserLookup>) -> Self {
        Self { users }
    }

    /// Decodes `message`, copying every value out of the borrow.
    #[must_use]
    pub fn decode(&self, message: &RawMessage<'_>) -> FileEvent {
        let mut event = FileEvent {
            timestamp: timestamp_millis(message.time),
            ..FileEvent::default()
        };

        if let Some(process) = message.process {
            event.process_path = process
                .executable
                .map(|exe| token_string(&exe.path))
                .unwrap_or_default();
            event.pid = process.audit_token.pid;
            event.parent_pid = process.ppid;
            event.is_platform_binary = process.is_platform_binary;
            event.signing_id = token_string(&process.signing_id);
            event.username = self
                .users
                .username(process.audit_token.euid)
                .unwrap_or_default();
        } else {
            event.pid = UNKNOWN_PID;
            event.parent_pid = UNKNOWN_PID;
        }

        let (event_type, props) = decode_payload(&message.event);
        event.event_type = event_type;
        event.props = props;
        event
    }
}

/// Kernel time to milliseconds since the epoch; sub-millisecond nanoseconds
/// are truncated.
#[must_use]
pub fn timestamp_millis(time: KernelTime) -> i64 {
    time.tv_sec
        .saturating_mul(MILLIS_PER_SEC)
        .saturating_add(time.tv_nsec / NANOS_PER_MILLI)
}

/// Copies a kernel string token into an owned `String`.
///
/// A token that claims more bytes than it carries, or that is not UTF-8, is
/// malformed input: debug builds panic, release builds keep what is readable.
#[must_use]
pub fn token_string(token: &StringToken<'_>) -> String {
    if token.length() == 0 {
        return String::new();
    }

    let data = token.data();
    debug_assert!(
        token.length() <= data.len(),
        "string token claims {} bytes but carries {}",
        token.length(),
        data.len()
    );
    let bytes = &data[..token.length().min(data.len())];

    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_owned(),
        Err(err) => {
            if cfg!(debug_assertions) {
                panic!("string token is not valid UTF-8: {err}");
            }
            warn!(error = %err, "kernel string is not valid UTF-8");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

type Props = BTreeMap<String, String>;

fn decode_payload(event: &RawEvent<'_>) -> (Option<EventType>, Props) {
    let mut props = Props::new();

    let event_type = match *event {
        RawEvent::Open { file } => {
            insert_file(&mut props, file);
            EventType::FileOpen
        }
        RawEvent::Close { target } => {
            insert_file(&mut props, target);
            EventType::FileClose
        }
        RawEvent::Create { destination } => {
            match destination {
                Destination::ExistingFile(file) => insert_file(&mut props, file),
                Destination::NewPath { dir, filename } => {
                    props.insert("path".into(), join_path(dir, &filename));
                    // Nothing exists on disk yet.
                    props.insert("size".into(), "0".into());
                }
            }
            EventType::FileCreate
        }
        RawEvent::Clone {
            source,
            target_dir,
            target_name,
        } => {
            props.insert("path".into(), join_path(target_dir, &target_name));
            if let Some(source) = source {
                props.insert("size".into(), source.size.to_string());
            }
            EventType::FileClone
        }
        RawEvent::FileProviderUpdate {
            source,
            target_path,
        } => {
            props.insert("path".into(), token_string(&target_path));
            if let Some(source) = source {
                props.insert("size".into(), source.size.to_string());
            }
            EventType::FileProviderUpdate
        }
        RawEvent::Rename {
            source,
            destination,
        } => {
            decode_rename(&mut props, source, destination);
            EventType::FileRename
        }
        RawEvent::Unlink { target, parent_dir } => {
            if let Some(dir) = parent_dir {
                props.insert("dir".into(), token_string(&dir.path));
            }
            if let Some(target) = target {
                props.insert("path".into(), token_string(&target.path));
            }
            EventType::FileUnlink
        }
        RawEvent::Other { .. } => return (None, props),
    };

    (Some(event_type), props)
}

fn decode_rename(props: &mut Props, source: Option<&RawFile<'_>>, destination: Destination<'_>) {
    if let Some(source) = source {
        props.insert("srcpath".into(), token_string(&source.path));
        props.insert("srcsize".into(), source.size.to_string());
    }
    props.insert("desttype".into(), destination.type_code().to_string());

    match destination {
        Destination::NewPath { dir, filename } => {
            props.insert("destfile".into(), token_string(&filename));
            if let Some(dir) = dir {
                props.insert("destdir".into(), token_string(&dir.path));
            }
        }
        Destination::ExistingFile(Some(file)) => {
            let path = token_string(&file.path);
            let (dir, name) = split_path(&path);
            props.insert("destfile".into(), name.to_string());
            props.insert("destdir".into(), dir.to_string());
        }
        Destination::ExistingFile(None) => {}
    }
}

fn insert_file(props: &mut Props, file: Option<&RawFile<'_>>) {
    if let Some(file) = file {
        props.insert("path".into(), token_string(&file.path));
        props.insert("size".into(), file.size.to_string());
    }
}

fn join_path(dir: Option<&RawFile<'_>>, name: &StringToken<'_>) -> String {
    let name = token_string(name);
    match dir.map(|d| token_string(&d.path)) {
        Some(dir) if !dir.is_empty() => {
            if dir.ends_with('/') {
                format!("{dir}{name}")
            } else {
                format!("{dir}/{name}")
            }
        }
        _ => name,
    }
}

/// Splits `path` into its parent directory and final component.
fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => ("", path),
    }
}
