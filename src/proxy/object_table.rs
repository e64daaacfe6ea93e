//! User attachments on a proxy.
//!
//! Callers can hang arbitrary data off a remote proxy, keyed by token. An
//! attachment may carry a cleanup function, run when the proxy is destroyed
//! (but not when the attachment is detached explicitly). The first attacher
//! under a key wins; later attaches do not overwrite.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::warn;

/// Value stored in an [`ObjectTable`].
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Cleanup run with the key and attachment when the owning proxy dies.
pub type CleanupFn = Box<dyn FnOnce(u64, &Attachment) + Send>;

struct ObjectEntry {
    object: Attachment,
    cleanup: Option<CleanupFn>,
}

/// Token-keyed attachments with optional destruction cleanups, plus a
/// weakly-held memoization table for caller-constructed companions.
#[derive(Default)]
pub struct ObjectTable {
    entries: HashMap<u64, ObjectEntry>,
    memoized: HashMap<u64, Weak<dyn Any + Send + Sync>>,
}

impl ObjectTable {
    /// Stores `object` under `key`.
    ///
    /// When the key is already occupied nothing is overwritten, the existing
    /// attachment is returned and the new cleanup never runs.
    pub fn attach(
        &mut self,
        key: u64,
        object: Attachment,
        cleanup: Option<CleanupFn>,
    ) -> Option<Attachment> {
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(ObjectEntry { object, cleanup });
                None
            }
            Entry::Occupied(existing) => {
                warn!(key, "attach on an occupied key, keeping the first attachment");
                Some(existing.get().object.clone())
            }
        }
    }

    /// Looks up the attachment under `key`.
    #[must_use]
    pub fn find(&self, key: u64) -> Option<Attachment> {
        self.entries.get(&key).map(|e| e.object.clone())
    }

    /// Removes and returns the attachment under `key` without running its
    /// cleanup.
    pub fn detach(&mut self, key: u64) -> Option<Attachment> {
        self.entries.remove(&key).map(|e| e.object)
    }

    /// Returns the live memoized companion under `key`, building one with
    /// `make` when none exists or the old one has been dropped.
    ///
    /// The table holds the companion weakly; it lives only as long as some
    /// caller keeps the returned strong reference. `make` runs under the
    /// owning proxy's lock and must not call back into the same proxy.
    pub fn lookup_or_create(
        &mut self,
        key: u64,
        make: impl FnOnce() -> Attachment,
    ) -> Attachment {
        if let Some(live) = self.memoized.get(&key).and_then(Weak::upgrade) {
            return live;
        }
        let fresh = make();
        self.memoized.insert(key, Arc::downgrade(&fresh));
        fresh
    }

    /// Runs every remaining cleanup and empties the table.
    pub(crate) fn kill(&mut self) {
        self.memoized.clear();
        for (key, entry) in self.entries.drain() {
            if let Some(cleanup) = entry.cleanup {
                cleanup(key, &entry.object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_first_attacher_wins() {
        let mut table = ObjectTable::default();
        assert!(table.attach(7, Arc::new("first"), None).is_none());
        let existing = table.attach(7, Arc::new("second"), None).unwrap();
        assert_eq!(*existing.downcast::<&str>().unwrap(), "first");

        let found = table.find(7).unwrap();
        assert_eq!(*found.downcast::<&str>().unwrap(), "first");

        assert!(table.detach(7).is_some());
        assert!(table.find(7).is_none());
    }

    #[test]
    fn test_lookup_or_create_memoizes_weakly() {
        let mut table = ObjectTable::default();
        let built = Arc::new(AtomicU64::new(0));

        let make = |b: &Arc<AtomicU64>| {
            let b = b.clone();
            move || -> Attachment {
                b.fetch_add(1, Ordering::SeqCst);
                Arc::new("companion")
            }
        };

        let first = table.lookup_or_create(9, make(&built));
        let again = table.lookup_or_create(9, make(&built));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(built.load(Ordering::SeqCst), 1);

        // Dropping every strong reference lets the entry lapse; the factory
        // runs again on the next lookup.
        drop(first);
        drop(again);
        let _fresh = table.lookup_or_create(9, make(&built));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_kill_runs_cleanups_detach_does_not() {
        let ran = Arc::new(AtomicU64::new(0));
        let mut table = ObjectTable::default();
        for key in [1u64, 2] {
            let ran = ran.clone();
            table.attach(
                key,
                Arc::new(key),
                Some(Box::new(move |k, _| {
                    ran.fetch_add(k, Ordering::SeqCst);
                })),
            );
        }

        table.detach(1);
        table.kill();
        // Only key 2's cleanup ran.
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
