//! Best-effort resolution of user ids to account names.

use std::ffi::CStr;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use tracing::trace;

/// Initial `getpwuid_r` scratch buffer size.
const PASSWD_BUF_LEN: usize = 1024;

/// Upper bound for the scratch buffer when the system asks for more room.
const MAX_PASSWD_BUF_LEN: usize = 64 * 1024;

/// Maps a numeric user id to an account name.
///
/// `None` means the name could not be resolved; callers substitute an empty
/// string rather than failing.
pub trait UserLookup: Send + Sync {
    fn username(&self, uid: u32) -> Option<String>;
}

/// Resolves names through the system password database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUsers;

impl UserLookup for SystemUsers {
    fn username(&self, uid: u32) -> Option<String> {
        let mut buf: Vec<libc::c_char> = vec![0; PASSWD_BUF_LEN];

        loop {
            // SAFETY: `passwd` is plain old data; all-zero is a valid value.
            let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::passwd = std::ptr::null_mut();

            // SAFETY: every pointer refers to live, correctly sized storage
            // owned by this frame.
            let rc = unsafe {
                libc::getpwuid_r(
                    uid as libc::uid_t,
                    &mut pwd,
                    buf.as_mut_ptr(),
                    buf.len(),
                    &mut result,
                )
            };

            if rc == libc::ERANGE && buf.len() < MAX_PASSWD_BUF_LEN {
                buf.resize(buf.len() * 2, 0);
                continue;
            }
            if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
                trace!(uid, rc, "no passwd entry for uid");
                return None;
            }

            // SAFETY: on success `pw_name` points at a NUL-terminated string
            // inside `buf`, which is still alive.
            let name = unsafe { CStr::from_ptr(pwd.pw_name) };
            return Some(name.to_string_lossy().into_owned());
        }
    }
}

/// Memoizes another lookup in a bounded LRU cache.
///
/// Failed lookups are cached too, so an unknown uid does not hit the
/// password database on every event.
pub struct CachedUsers<L> {
    inner: L,
    cache: Mutex<LruCache<u32, Option<String>>>,
}

impl<L: UserLookup> CachedUsers<L> {
    #[must_use]
    pub fn new(inner: L, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl<L: UserLookup> UserLookup for CachedUsers<L> {
    fn username(&self, uid: u32) -> Option<String> {
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uid)
        {
            return hit.clone();
        }

        // Resolve outside the lock; a racing miss just resolves twice.
        let resolved = self.inner.username(uid);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(uid, resolved.clone());
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingUsers {
        names: HashMap<u32, String>,
        calls: AtomicUsize,
    }

    impl UserLookup for CountingUsers {
        fn username(&self, uid: u32) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.names.get(&uid).cloned()
        }
    }

    fn counting() -> CountingUsers {
        CountingUsers {
            names: HashMap::from([(501, "alice".to_string()), (502, "bob".to_string())]),
            calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn cache_serves_repeated_lookups() {
        let users = CachedUsers::new(counting(), NonZeroUsize::new(8).unwrap());

        assert_eq!(users.username(501).as_deref(), Some("alice"));
        assert_eq!(users.username(501).as_deref(), Some("alice"));
        assert_eq!(users.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_remembers_misses() {
        let users = CachedUsers::new(counting(), NonZeroUsize::new(8).unwrap());

        assert_eq!(users.username(9999), None);
        assert_eq!(users.username(9999), None);
        assert_eq!(users.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let users = CachedUsers::new(counting(), NonZeroUsize::new(1).unwrap());

        users.username(501);
        users.username(502);
        users.username(501);
        assert_eq!(users.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn system_lookup_resolves_root() {
        assert_eq!(SystemUsers.username(0).as_deref(), Some("root"));
    }
}
