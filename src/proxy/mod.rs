//! Remote object proxies.
//!
//! A [`BinderProxy`] is this process's sole representative of one remote
//! object, reached either through a driver handle or a socket session. The
//! proxy latches dead monotonically, caches the remote descriptor, carries
//! the object's declared stability level and owns the death/freeze
//! subscriptions for its remote.
//!
//! Every notification snapshot-then-dispatches: listener callbacks never run
//! while the proxy lock is held, so a callback may freely transact, link,
//! unlink or drop the proxy.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::{debug, error, warn};

use crate::error::IpcError;
use crate::parcel::Parcel;
use crate::process::ProcessState;
use crate::session::RpcSession;
use crate::stability::{self, Level};
use crate::{sys, thread_state};

pub(crate) mod tracker;

pub mod object_table;

use object_table::{Attachment, CleanupFn, ObjectTable};

/// Advisory census of live driver proxies across the process. Relaxed
/// ordering throughout; it only feeds logging.
static TOTAL_PROXIES: AtomicU32 = AtomicU32::new(0);
static TOTAL_WARNED_AT: AtomicU32 = AtomicU32::new(0);
const TOTAL_WARN_INTERVAL: u32 = 5000;

fn census_increment() {
    let total = TOTAL_PROXIES.fetch_add(1, Ordering::Relaxed) + 1;
    let warned_at = TOTAL_WARNED_AT.load(Ordering::Relaxed);
    if total >= warned_at.saturating_add(TOTAL_WARN_INTERVAL)
        && TOTAL_WARNED_AT
            .compare_exchange(warned_at, total, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        warn!(total, "unusually many live binder proxies in this process");
    }
}

/// Callback invoked when a proxy's remote dies. Registered through
/// [`BinderProxy::link_to_death`]; held weakly, so dropping the last strong
/// reference to the recipient silently cancels delivery.
pub trait DeathRecipient: Send + Sync {
    fn binder_died(&self, who: &Weak<BinderProxy>);
}

/// Callback invoked when the remote's hosting process freezes or unfreezes.
pub trait FrozenStateCallback: Send + Sync {
    fn on_state_changed(&self, who: &Weak<BinderProxy>, is_frozen: bool);
}

struct Obituary {
    recipient: Weak<dyn DeathRecipient>,
    cookie: usize,
    flags: u32,
}

#[derive(Default)]
struct FrozenState {
    /// Last state reported by the driver, delivered immediately to listeners
    /// added after the subscription exists.
    is_frozen: Option<bool>,
    listeners: Vec<Weak<dyn FrozenStateCallback>>,
}

enum ProxyIdentity {
    Driver {
        handle: u32,
        process: Arc<ProcessState>,
    },
    Session {
        session: Arc<RpcSession>,
        address: u64,
    },
}

#[derive(Default)]
struct ProxyInner {
    obituaries: Option<Vec<Obituary>>,
    obits_sent: bool,
    frozen: Option<FrozenState>,
    objects: ObjectTable,
}

/// Strong reference to a remote object.
pub struct BinderProxy {
    identity: ProxyIdentity,
    alive: AtomicBool,
    stability: AtomicI32,
    descriptor: OnceLock<String>,
    self_weak: Weak<BinderProxy>,
    /// UID charged in the proxy tracker, refunded on drop.
    tracked_uid: Option<u32>,
    inner: Mutex<ProxyInner>,
}

impl BinderProxy {
    pub(crate) fn new_driver(
        process: Arc<ProcessState>,
        handle: u32,
        stability: Level,
        tracked_uid: Option<u32>,
    ) -> Arc<BinderProxy> {
        census_increment();
        Arc::new_cyclic(|weak| BinderProxy {
            identity: ProxyIdentity::Driver { handle, process },
            alive: AtomicBool::new(true),
            stability: AtomicI32::new(stability as i32),
            descriptor: OnceLock::new(),
            self_weak: weak.clone(),
            tracked_uid,
            inner: Mutex::new(ProxyInner::default()),
        })
    }

    pub(crate) fn new_session(session: Arc<RpcSession>, address: u64) -> Arc<BinderProxy> {
        Arc::new_cyclic(|weak| BinderProxy {
            identity: ProxyIdentity::Session { session, address },
            alive: AtomicBool::new(true),
            // Session roots negotiate stability out of band.
            stability: AtomicI32::new(Level::Vintf as i32),
            descriptor: OnceLock::new(),
            self_weak: weak.clone(),
            tracked_uid: None,
            inner: Mutex::new(ProxyInner::default()),
        })
    }

    /// Driver handle behind this proxy, or `None` for session proxies.
    #[must_use]
    pub fn handle(&self) -> Option<u32> {
        match &self.identity {
            ProxyIdentity::Driver { handle, .. } => Some(*handle),
            ProxyIdentity::Session { .. } => None,
        }
    }

    /// False once the remote is known dead. Never flips back.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn set_stability(&self, level: Level) {
        self.stability.store(level as i32, Ordering::Relaxed);
    }

    /// Lowers the declared stability level, never raises it.
    ///
    /// A target the current level does not already cover is refused and
    /// logged; the stamp is unchanged.
    pub fn force_downgrade(&self, level: Level) {
        let current = self.stability.load(Ordering::Relaxed);
        match Level::from_raw(current) {
            Some(c) if c.satisfies(level) => {
                self.stability.store(level as i32, Ordering::Relaxed);
            }
            _ => warn!(
                current,
                target = %level,
                "refusing stability downgrade to a level the current one does not cover"
            ),
        }
    }

    /// Sends `code` with `data` to the remote.
    ///
    /// User-range codes are checked against the declared stability level
    /// before anything reaches the transport. A dead remote fails fast
    /// without a driver call.
    ///
    /// # Errors
    ///
    /// [`IpcError::DeadObject`] for a dead remote, [`IpcError::BadType`] on
    /// stability violations, otherwise whatever the transport reports.
    pub fn transact(
        &self,
        code: u32,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: u32,
    ) -> Result<(), IpcError> {
        if !self.is_alive() {
            return Err(IpcError::DeadObject);
        }

        if (sys::FIRST_CALL_TRANSACTION..=sys::LAST_CALL_TRANSACTION).contains(&code) {
            let required = if flags & sys::FLAG_PRIVATE_VENDOR != 0 {
                Level::Vendor
            } else {
                Level::LOCAL
            };
            let provided = self.stability.load(Ordering::Relaxed);
            if !stability::check(provided, required) {
                return Err(IpcError::BadType {
                    provided: Level::from_raw(provided)
                        .map_or_else(|| format!("unknown({provided})"), |l| l.to_string()),
                    required: required.to_string(),
                });
            }
        }

        // Strictly a local marker; it never crosses the process boundary on
        // either transport.
        let flags = flags & !sys::FLAG_PRIVATE_VENDOR;

        let status = match &self.identity {
            ProxyIdentity::Driver { handle, process } => {
                thread_state::transact(process, *handle, code, data, reply, flags)
            }
            ProxyIdentity::Session { session, address } => {
                session.transact(*address, code, data, reply, flags)
            }
        };
        if matches!(status, Err(IpcError::DeadObject)) {
            self.alive.store(false, Ordering::Release);
        }
        status
    }

    /// Round-trips a liveness probe to the remote.
    ///
    /// # Errors
    ///
    /// Fails like any synchronous [`BinderProxy::transact`].
    pub fn ping_binder(&self) -> Result<(), IpcError> {
        let mut reply = Parcel::new();
        self.transact(sys::PING_TRANSACTION, &Parcel::new(), Some(&mut reply), 0)
    }

    /// The remote's interface descriptor, fetched once and cached.
    ///
    /// # Errors
    ///
    /// Fails when the remote is unreachable and no cached value exists.
    /// Failures are not cached; a later call retries.
    pub fn interface_descriptor(&self) -> Result<&str, IpcError> {
        if let Some(cached) = self.descriptor.get() {
            return Ok(cached);
        }
        let mut reply = Parcel::new();
        self.transact(sys::INTERFACE_TRANSACTION, &Parcel::new(), Some(&mut reply), 0)?;
        let descriptor = reply.read_string()?;
        // Concurrent fetchers race to the same value; first store wins.
        Ok(self.descriptor.get_or_init(|| descriptor))
    }

    /// Registers `recipient` for death notification.
    ///
    /// The first link registers with the driver; later links share the
    /// registration. `cookie` and `flags` only participate in unlink
    /// matching.
    ///
    /// # Errors
    ///
    /// [`IpcError::DeadObject`] when the remote is already dead or its
    /// obituaries were already sent; [`IpcError::InvalidOperation`] on
    /// session proxies.
    pub fn link_to_death(
        &self,
        recipient: &Arc<dyn DeathRecipient>,
        cookie: usize,
        flags: u32,
    ) -> Result<(), IpcError> {
        let ProxyIdentity::Driver { handle, process } = &self.identity else {
            return Err(IpcError::InvalidOperation(
                "death notifications require the kernel driver",
            ));
        };
        if !self.is_alive() {
            return Err(IpcError::DeadObject);
        }
        if !process.pool_started() {
            // Nothing is parked in the driver yet, so a death could go
            // unnoticed until some thread waits.
            warn!(handle, "death link registered before the thread pool started");
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.obits_sent {
            return Err(IpcError::DeadObject);
        }
        if inner.obituaries.is_none() {
            inner.obituaries = Some(Vec::new());
            // Write-only flush; cannot dispatch events while we hold the
            // proxy lock.
            thread_state::request_death_notification(process, *handle);
        }
        inner
            .obituaries
            .as_mut()
            .ok_or(IpcError::NoMemory("obituary list"))?
            .push(Obituary {
                recipient: Arc::downgrade(recipient),
                cookie,
                flags,
            });
        Ok(())
    }

    /// Removes one obituary registration.
    ///
    /// An entry matches on the recipient when one is given; with `None`, it
    /// matches on `cookie` alone. `flags` must match in both forms.
    ///
    /// # Errors
    ///
    /// [`IpcError::NameNotFound`] when nothing matches,
    /// [`IpcError::DeadObject`] when obituaries were already delivered.
    pub fn unlink_to_death(
        &self,
        recipient: Option<&Arc<dyn DeathRecipient>>,
        cookie: usize,
        flags: u32,
    ) -> Result<(), IpcError> {
        let ProxyIdentity::Driver { handle, process } = &self.identity else {
            return Err(IpcError::InvalidOperation(
                "death notifications require the kernel driver",
            ));
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.obits_sent {
            return Err(IpcError::DeadObject);
        }
        let obits = inner.obituaries.as_mut().ok_or(IpcError::NameNotFound)?;
        let index = find_obituary(obits, recipient, cookie, flags).ok_or(IpcError::NameNotFound)?;
        obits.remove(index);
        if obits.is_empty() {
            inner.obituaries = None;
            thread_state::clear_death_notification(process, *handle);
        }
        Ok(())
    }

    /// Marks the remote dead and delivers obituaries, exactly once.
    pub(crate) fn send_obituary(&self) {
        self.alive.store(false, Ordering::Release);
        let obits = {
            let mut inner = self.inner.lock().unwrap();
            if inner.obits_sent {
                return;
            }
            inner.obits_sent = true;
            let obits = inner.obituaries.take();
            if obits.is_some() {
                if let ProxyIdentity::Driver { handle, process } = &self.identity {
                    thread_state::clear_death_notification(process, *handle);
                }
            }
            obits
        };
        let Some(obits) = obits else { return };
        debug!(handle = ?self.handle(), count = obits.len(), "remote died, delivering obituaries");
        for obituary in obits {
            if let Some(recipient) = obituary.recipient.upgrade() {
                recipient.binder_died(&self.self_weak);
            }
        }
    }

    /// Subscribes to freeze-state changes of the remote's hosting process.
    ///
    /// The driver reports the current state right after the first
    /// subscription; listeners added later receive the last known state
    /// immediately.
    ///
    /// # Errors
    ///
    /// [`IpcError::InvalidOperation`] on session proxies or when the driver
    /// lacks freeze notifications.
    pub fn add_frozen_state_listener(
        &self,
        listener: &Arc<dyn FrozenStateCallback>,
    ) -> Result<(), IpcError> {
        let ProxyIdentity::Driver { handle, process } = &self.identity else {
            return Err(IpcError::InvalidOperation(
                "freeze notifications require the kernel driver",
            ));
        };
        if !process.driver().supports_freeze_notification() {
            return Err(IpcError::InvalidOperation(
                "driver does not support freeze notifications",
            ));
        }

        let known_state = {
            let mut inner = self.inner.lock().unwrap();
            let first = inner.frozen.is_none();
            let frozen = inner.frozen.get_or_insert_with(FrozenState::default);
            frozen.listeners.push(Arc::downgrade(listener));
            if first {
                thread_state::request_freeze_notification(process, *handle);
            }
            frozen.is_frozen
        };
        if let Some(is_frozen) = known_state {
            listener.on_state_changed(&self.self_weak, is_frozen);
        }
        Ok(())
    }

    /// Drops one freeze-state subscription.
    ///
    /// # Errors
    ///
    /// [`IpcError::NameNotFound`] when the listener is not subscribed.
    pub fn remove_frozen_state_listener(
        &self,
        listener: &Arc<dyn FrozenStateCallback>,
    ) -> Result<(), IpcError> {
        let ProxyIdentity::Driver { handle, process } = &self.identity else {
            return Err(IpcError::InvalidOperation(
                "freeze notifications require the kernel driver",
            ));
        };
        let mut inner = self.inner.lock().unwrap();
        let frozen = inner.frozen.as_mut().ok_or(IpcError::NameNotFound)?;
        let index = frozen
            .listeners
            .iter()
            .position(|l| std::ptr::addr_eq(l.as_ptr(), Arc::as_ptr(listener)))
            .ok_or(IpcError::NameNotFound)?;
        frozen.listeners.remove(index);
        if frozen.listeners.is_empty() {
            inner.frozen = None;
            thread_state::clear_freeze_notification(process, *handle);
        }
        Ok(())
    }

    /// Records a freeze-state report from the driver and fans it out.
    /// A report matching the last known state is not re-delivered.
    pub(crate) fn notify_frozen_state(&self, is_frozen: bool) {
        let listeners: Vec<Arc<dyn FrozenStateCallback>> = {
            let mut inner = self.inner.lock().unwrap();
            let Some(frozen) = inner.frozen.as_mut() else {
                warn!(handle = ?self.handle(), "freeze report without subscription");
                return;
            };
            if frozen.is_frozen == Some(is_frozen) {
                return;
            }
            frozen.is_frozen = Some(is_frozen);
            frozen.listeners.retain(|l| l.upgrade().is_some());
            frozen.listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_state_changed(&self.self_weak, is_frozen);
        }
    }

    /// Attaches `object` under `key`; `cleanup` runs when the proxy is
    /// destroyed. Returns the existing attachment instead of overwriting
    /// when the key is already taken.
    pub fn attach_object(
        &self,
        key: u64,
        object: Attachment,
        cleanup: Option<CleanupFn>,
    ) -> Option<Attachment> {
        self.inner.lock().unwrap().objects.attach(key, object, cleanup)
    }

    /// Looks up an attachment.
    #[must_use]
    pub fn find_object(&self, key: u64) -> Option<Attachment> {
        self.inner.lock().unwrap().objects.find(key)
    }

    /// Removes an attachment without running its cleanup.
    pub fn detach_object(&self, key: u64) -> Option<Attachment> {
        self.inner.lock().unwrap().objects.detach(key)
    }

    /// Returns the live memoized companion under `key`, building one with
    /// `make` if needed. `make` must not call back into this proxy.
    pub fn lookup_or_create_object(
        &self,
        key: u64,
        make: impl FnOnce() -> Attachment,
    ) -> Attachment {
        self.inner.lock().unwrap().objects.lookup_or_create(key, make)
    }

    /// Advisory count of live driver proxies in this process.
    #[must_use]
    pub fn total_proxy_count() -> u32 {
        TOTAL_PROXIES.load(Ordering::Relaxed)
    }
}

fn find_obituary(
    obits: &[Obituary],
    recipient: Option<&Arc<dyn DeathRecipient>>,
    cookie: usize,
    flags: u32,
) -> Option<usize> {
    obits.iter().position(|ob| {
        let matched = match recipient {
            Some(recipient) => std::ptr::addr_eq(ob.recipient.as_ptr(), Arc::as_ptr(recipient)),
            None => ob.cookie == cookie,
        };
        matched && ob.flags == flags
    })
}

impl Drop for BinderProxy {
    fn drop(&mut self) {
        let self_ptr: *const BinderProxy = self;
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => {
                error!("proxy lock poisoned at drop");
                poisoned.into_inner()
            }
        };
        inner.objects.kill();
        if let ProxyIdentity::Driver { handle, process } = &self.identity {
            if inner.obituaries.is_some() && !inner.obits_sent {
                thread_state::clear_death_notification(process, *handle);
            }
            if inner.frozen.is_some() {
                thread_state::clear_freeze_notification(process, *handle);
            }
            process.expunge_handle(*handle, self_ptr);
            thread_state::release_handle(process, *handle);
            if let Some(uid) = self.tracked_uid {
                process.tracker().on_destroy(uid);
            }
            TOTAL_PROXIES.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for BinderProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinderProxy")
            .field("handle", &self.handle())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;
    use std::sync::atomic::AtomicU32;

    struct CountingRecipient(AtomicU32);

    impl CountingRecipient {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicU32::new(0)))
        }
        fn deaths(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl DeathRecipient for CountingRecipient {
        fn binder_died(&self, _who: &Weak<BinderProxy>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFreezeListener(Mutex<Vec<bool>>);

    impl CountingFreezeListener {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }
        fn states(&self) -> Vec<bool> {
            self.0.lock().unwrap().clone()
        }
    }

    impl FrozenStateCallback for CountingFreezeListener {
        fn on_state_changed(&self, _who: &Weak<BinderProxy>, is_frozen: bool) {
            self.0.lock().unwrap().push(is_frozen);
        }
    }

    #[test]
    fn test_one_proxy_per_handle() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());

        let a = process.strong_proxy_for_handle(7).unwrap();
        let b = process.strong_proxy_for_handle(7).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        drop(b);
        drop(a);
        // The handle slot is free again; a new proxy is a new object.
        let c = process.strong_proxy_for_handle(7).unwrap();
        assert!(c.is_alive());
    }

    #[test]
    fn test_drop_mirrors_refcounts_to_driver() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());

        let proxy = process.strong_proxy_for_handle(5).unwrap();
        assert_eq!(
            driver.refcount_commands(5),
            vec![sys::BC_INCREFS, sys::BC_ACQUIRE]
        );
        drop(proxy);
        assert_eq!(
            driver.refcount_commands(5),
            vec![
                sys::BC_INCREFS,
                sys::BC_ACQUIRE,
                sys::BC_RELEASE,
                sys::BC_DECREFS
            ]
        );
    }

    #[test]
    fn test_obituaries_delivered_exactly_once() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(9).unwrap();

        let first = CountingRecipient::new();
        let second = CountingRecipient::new();
        let first_dyn: Arc<dyn DeathRecipient> = first.clone();
        let second_dyn: Arc<dyn DeathRecipient> = second.clone();
        proxy.link_to_death(&first_dyn, 1, 0).unwrap();
        proxy.link_to_death(&second_dyn, 2, 0).unwrap();
        // One driver registration covers both links.
        assert_eq!(driver.death_requests(), vec![9]);

        proxy.send_obituary();
        proxy.send_obituary();
        assert_eq!(first.deaths(), 1);
        assert_eq!(second.deaths(), 1);
        assert!(!proxy.is_alive());

        // A dead proxy refuses everything without touching the driver.
        let calls = driver.write_read_calls();
        let err = proxy.ping_binder().unwrap_err();
        assert!(matches!(err, IpcError::DeadObject));
        assert_eq!(driver.write_read_calls(), calls);

        let late: Arc<dyn DeathRecipient> = CountingRecipient::new();
        let err = proxy.link_to_death(&late, 3, 0).unwrap_err();
        assert!(matches!(err, IpcError::DeadObject));
        let err = proxy.unlink_to_death(Some(&first_dyn), 1, 0).unwrap_err();
        assert!(matches!(err, IpcError::DeadObject));
    }

    #[test]
    fn test_concurrent_obituary_senders_deliver_once() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(9).unwrap();

        let recipients: Vec<_> = (0..3).map(|_| CountingRecipient::new()).collect();
        for (cookie, recipient) in recipients.iter().enumerate() {
            let recipient_dyn: Arc<dyn DeathRecipient> = recipient.clone();
            proxy.link_to_death(&recipient_dyn, cookie, 0).unwrap();
        }

        const SENDERS: usize = 8;
        let barrier = Arc::new(std::sync::Barrier::new(SENDERS));
        std::thread::scope(|s| {
            for _ in 0..SENDERS {
                let proxy = Arc::clone(&proxy);
                let barrier = Arc::clone(&barrier);
                s.spawn(move || {
                    barrier.wait();
                    proxy.send_obituary();
                });
            }
        });

        assert!(!proxy.is_alive());
        for recipient in &recipients {
            assert_eq!(recipient.deaths(), 1);
        }
    }

    #[test]
    fn test_death_notice_from_driver() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(4).unwrap();

        let recipient = CountingRecipient::new();
        let recipient_dyn: Arc<dyn DeathRecipient> = recipient.clone();
        proxy.link_to_death(&recipient_dyn, 0, 0).unwrap();

        // The death notice arrives ahead of the ping's own (dead) reply.
        driver.push_dead_binder(4);
        driver.push_dead_reply();
        proxy.ping_binder().unwrap_err();

        assert_eq!(recipient.deaths(), 1);
        assert!(!proxy.is_alive());
        crate::thread_state::flush_commands(&process);
        assert_eq!(driver.dead_binder_dones(), vec![4]);
    }

    #[test]
    fn test_unlink_matching_rules() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(3).unwrap();

        let a: Arc<dyn DeathRecipient> = CountingRecipient::new();
        let b: Arc<dyn DeathRecipient> = CountingRecipient::new();
        proxy.link_to_death(&a, 10, 0).unwrap();
        proxy.link_to_death(&b, 20, 0).unwrap();

        // With a recipient given, the cookie is not consulted.
        proxy.unlink_to_death(Some(&a), 999, 0).unwrap();
        // Without one, only the cookie matches.
        let err = proxy.unlink_to_death(None, 999, 0).unwrap_err();
        assert!(matches!(err, IpcError::NameNotFound));
        proxy.unlink_to_death(None, 20, 0).unwrap();

        // The last unlink cleared the driver registration.
        assert_eq!(driver.death_clears(), vec![3]);
    }

    #[test]
    fn test_stability_gates_user_transactions() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(2).unwrap();

        // Freshly minted proxies are undeclared; user calls are refused
        // before the driver sees anything.
        let calls = driver.write_read_calls();
        let err = proxy
            .transact(sys::FIRST_CALL_TRANSACTION, &Parcel::new(), None, sys::TF_ONE_WAY)
            .unwrap_err();
        assert!(matches!(err, IpcError::BadType { .. }));
        assert_eq!(driver.write_read_calls(), calls);

        // Control transactions bypass the check.
        driver.push_transaction_complete();
        driver.push_reply(&[]);
        proxy.ping_binder().unwrap();

        // A declared level satisfying the local requirement passes.
        proxy.set_stability(Level::Vintf);
        driver.push_transaction_complete();
        proxy
            .transact(sys::FIRST_CALL_TRANSACTION, &Parcel::new(), None, sys::TF_ONE_WAY)
            .unwrap();

        // Vendor-stable remotes are reachable only through the
        // private-vendor marker.
        proxy.set_stability(Level::Vendor);
        let err = proxy
            .transact(sys::FIRST_CALL_TRANSACTION, &Parcel::new(), None, sys::TF_ONE_WAY)
            .unwrap_err();
        assert!(matches!(err, IpcError::BadType { .. }));
        driver.push_transaction_complete();
        proxy
            .transact(
                sys::FIRST_CALL_TRANSACTION,
                &Parcel::new(),
                None,
                sys::TF_ONE_WAY | sys::FLAG_PRIVATE_VENDOR,
            )
            .unwrap();
        // The marker stays local; the driver sees the call without it.
        let sent = driver.sent_transactions();
        assert_eq!(sent.last().unwrap().flags & sys::FLAG_PRIVATE_VENDOR, 0);
    }

    #[test]
    fn test_descriptor_fetched_once() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(6).unwrap();

        let mut payload = Parcel::new();
        payload.write_string("android.os.IServiceManager");
        driver.push_transaction_complete();
        driver.push_reply(payload.data());

        assert_eq!(
            proxy.interface_descriptor().unwrap(),
            "android.os.IServiceManager"
        );
        let calls = driver.write_read_calls();
        // Cached; no further driver traffic.
        assert_eq!(
            proxy.interface_descriptor().unwrap(),
            "android.os.IServiceManager"
        );
        assert_eq!(driver.write_read_calls(), calls);
    }

    #[test]
    fn test_descriptor_race_converges_on_one_value() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(6).unwrap();

        // Every racing thread may run its own round trip before one of them
        // publishes the cached value, so script one reply per thread.
        const THREADS: usize = 4;
        let mut payload = Parcel::new();
        payload.write_string("android.os.IServiceManager");
        for _ in 0..THREADS {
            driver.push_transaction_complete();
            driver.push_reply(payload.data());
        }

        let barrier = Arc::new(std::sync::Barrier::new(THREADS));
        let fetched: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let proxy = Arc::clone(&proxy);
                    let barrier = Arc::clone(&barrier);
                    s.spawn(move || {
                        barrier.wait();
                        proxy.interface_descriptor().unwrap().to_string()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(fetched.iter().all(|d| d == "android.os.IServiceManager"));
        assert_eq!(
            proxy.interface_descriptor().unwrap(),
            "android.os.IServiceManager"
        );
    }

    #[test]
    fn test_freeze_subscription_lifecycle() {
        let driver = MockDriver::new();
        driver.set_freeze_notification_support(true);
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(8).unwrap();

        let first = CountingFreezeListener::new();
        let first_dyn: Arc<dyn FrozenStateCallback> = first.clone();
        proxy.add_frozen_state_listener(&first_dyn).unwrap();
        assert_eq!(driver.freeze_requests(), vec![8]);

        // Driver reports the current state after registration.
        driver.push_frozen_binder(8, true);
        driver.push_transaction_complete();
        let mut p = Parcel::new();
        p.write_i32(0);
        let _ = proxy.transact(sys::PING_TRANSACTION, &p, None, sys::TF_ONE_WAY);
        assert_eq!(first.states(), vec![true]);
        crate::thread_state::flush_commands(&process);
        assert_eq!(driver.freeze_notification_dones(), vec![8]);

        // A listener added later sees the last known state immediately.
        let second = CountingFreezeListener::new();
        let second_dyn: Arc<dyn FrozenStateCallback> = second.clone();
        proxy.add_frozen_state_listener(&second_dyn).unwrap();
        assert_eq!(second.states(), vec![true]);
        // Still only one driver registration.
        assert_eq!(driver.freeze_requests(), vec![8]);

        proxy.remove_frozen_state_listener(&first_dyn).unwrap();
        assert!(driver.freeze_clears().is_empty());
        proxy.remove_frozen_state_listener(&second_dyn).unwrap();
        assert_eq!(driver.freeze_clears(), vec![8]);
    }

    #[test]
    fn test_freeze_reports_deduplicated_by_state() {
        let driver = MockDriver::new();
        driver.set_freeze_notification_support(true);
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(12).unwrap();

        let listener = CountingFreezeListener::new();
        let listener_dyn: Arc<dyn FrozenStateCallback> = listener.clone();
        proxy.add_frozen_state_listener(&listener_dyn).unwrap();

        // A repeated report of the same state is swallowed; a toggle is
        // delivered.
        proxy.notify_frozen_state(true);
        proxy.notify_frozen_state(true);
        proxy.notify_frozen_state(false);
        assert_eq!(listener.states(), vec![true, false]);
    }

    #[test]
    fn test_stability_downgrade_never_raises() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(13).unwrap();

        proxy.set_stability(Level::Vintf);
        proxy.force_downgrade(Level::System);
        driver.push_transaction_complete();
        proxy
            .transact(sys::FIRST_CALL_TRANSACTION, &Parcel::new(), None, sys::TF_ONE_WAY)
            .unwrap();

        // System does not cover vendor; the stamp stays put.
        proxy.force_downgrade(Level::Vendor);
        driver.push_transaction_complete();
        proxy
            .transact(sys::FIRST_CALL_TRANSACTION, &Parcel::new(), None, sys::TF_ONE_WAY)
            .unwrap();
    }

    #[test]
    fn test_lookup_or_create_returns_same_companion() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(14).unwrap();

        let a = proxy.lookup_or_create_object(1, || Arc::new(5u32));
        let b = proxy.lookup_or_create_object(1, || Arc::new(6u32));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a.downcast::<u32>().unwrap(), 5);
    }

    #[test]
    fn test_freeze_listener_requires_driver_support() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(1).unwrap();

        let listener: Arc<dyn FrozenStateCallback> = CountingFreezeListener::new();
        let err = proxy.add_frozen_state_listener(&listener).unwrap_err();
        assert!(matches!(err, IpcError::InvalidOperation(_)));
    }

    #[test]
    fn test_attachments_cleaned_up_at_drop() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        let proxy = process.strong_proxy_for_handle(11).unwrap();

        let cleaned = Arc::new(AtomicU32::new(0));
        let c = cleaned.clone();
        proxy.attach_object(
            1,
            Arc::new("payload"),
            Some(Box::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert!(proxy.find_object(1).is_some());
        assert!(proxy.find_object(2).is_none());

        drop(proxy);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_proxy_throttling_through_process() {
        let driver = MockDriver::new();
        let process = ProcessState::for_testing(driver.clone());
        process.set_proxy_tracking_enabled(true);
        process.set_proxy_throttling_enabled(true);
        process.set_proxy_count_watermarks(tracker::TrackerConfig {
            high: 3,
            low: 1,
            warning: 2,
            warn_interval: 10,
        });

        let uid = unsafe { libc::geteuid() };
        let _proxies: Vec<_> = (1..=3)
            .map(|h| process.strong_proxy_for_handle(h).unwrap())
            .collect();
        assert_eq!(process.proxy_count_for_uid(uid), 3);

        let err = process.strong_proxy_for_handle(4).unwrap_err();
        assert!(matches!(err, IpcError::NoMemory(_)));
        assert_eq!(process.proxy_count_for_uid(uid), 3);
    }
}
