//! In-process binder objects.
//!
//! A [`LocalObject`] services transactions arriving from other processes.
//! Objects never cross the driver as pointers; each registered object gets a
//! cookie from the [`NodeTable`], and the cookie is what travels in
//! transaction targets and refcount commands.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::error::IpcError;
use crate::parcel::Parcel;

/// An object hosted by this process and callable over binder.
pub trait LocalObject: Send + Sync + 'static {
    /// Interface descriptor reported to `INTERFACE_TRANSACTION` queries.
    fn descriptor(&self) -> &str;

    /// Handles one inbound transaction. `reply` is ignored for oneway calls.
    fn on_transact(&self, code: u32, data: &mut Parcel, reply: &mut Parcel)
        -> Result<(), IpcError>;
}

struct NodeEntry {
    object: Weak<dyn LocalObject>,
    /// Held while the driver holds a strong reference on the node, so the
    /// object outlives every remote strong reference.
    strong: Option<Arc<dyn LocalObject>>,
}

/// Cookie-keyed registry of objects exposed to the driver.
#[derive(Default)]
pub(crate) struct NodeTable {
    inner: Mutex<NodeTableInner>,
}

#[derive(Default)]
struct NodeTableInner {
    next_cookie: u64,
    nodes: HashMap<u64, NodeEntry>,
}

impl NodeTable {
    /// Registers `object`, returning its cookie. Re-registering the same
    /// object returns the existing cookie.
    pub(crate) fn register(&self, object: &Arc<dyn LocalObject>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        for (cookie, entry) in &inner.nodes {
            if std::ptr::addr_eq(entry.object.as_ptr(), Arc::as_ptr(object)) {
                return *cookie;
            }
        }
        inner.next_cookie += 1;
        let cookie = inner.next_cookie;
        inner.nodes.insert(
            cookie,
            NodeEntry {
                object: Arc::downgrade(object),
                strong: None,
            },
        );
        cookie
    }

    /// Resolves a cookie back to its object, if still alive.
    pub(crate) fn get(&self, cookie: u64) -> Option<Arc<dyn LocalObject>> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(&cookie)
            .and_then(|entry| entry.object.upgrade())
    }

    /// Pins the object while the driver holds a strong reference.
    pub(crate) fn acquire(&self, cookie: u64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get_mut(&cookie) {
            Some(entry) => match entry.object.upgrade() {
                Some(strong) => entry.strong = Some(strong),
                None => warn!(cookie, "strong reference requested for dead node"),
            },
            None => warn!(cookie, "strong reference requested for unknown node"),
        }
    }

    /// Releases the driver's strong reference.
    pub(crate) fn release(&self, cookie: u64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.get_mut(&cookie) {
            Some(entry) => entry.strong = None,
            None => warn!(cookie, "strong release for unknown node"),
        }
    }

    /// Drops the node entirely once the driver's last weak reference is gone.
    pub(crate) fn forget(&self, cookie: u64) {
        self.inner.lock().unwrap().nodes.remove(&cookie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl LocalObject for Echo {
        fn descriptor(&self) -> &str {
            "test.Echo"
        }

        fn on_transact(
            &self,
            _code: u32,
            data: &mut Parcel,
            reply: &mut Parcel,
        ) -> Result<(), IpcError> {
            reply.write_i32(data.read_i32()?);
            Ok(())
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let table = NodeTable::default();
        let obj: Arc<dyn LocalObject> = Arc::new(Echo);
        let cookie = table.register(&obj);
        assert_eq!(table.register(&obj), cookie);

        let other: Arc<dyn LocalObject> = Arc::new(Echo);
        assert_ne!(table.register(&other), cookie);
    }

    #[test]
    fn test_strong_reference_pins_object() {
        let table = NodeTable::default();
        let obj: Arc<dyn LocalObject> = Arc::new(Echo);
        let cookie = table.register(&obj);
        table.acquire(cookie);
        drop(obj);

        // The driver still holds a strong reference, so the node resolves.
        assert!(table.get(cookie).is_some());
        table.release(cookie);
        assert!(table.get(cookie).is_none());

        table.forget(cookie);
        let replacement: Arc<dyn LocalObject> = Arc::new(Echo);
        assert_ne!(table.register(&replacement), cookie);
    }
}
