//! Per-process driver session.
//!
//! [`ProcessState`] owns the driver handle, the handle-to-proxy table, the
//! local node registry and the protocol thread pool. One instance exists per
//! process in normal use; tests build private instances around scripted
//! drivers.
//!
//! Proxy identity is the core invariant here: at most one live
//! [`BinderProxy`] exists per driver handle, enforced by re-checking the
//! table under its lock before inserting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock, Weak};

use tracing::{debug, error, info};

use crate::driver::{BinderDriver, KernelDriver, DEFAULT_MAX_THREADS};
use crate::error::IpcError;
use crate::local::{LocalObject, NodeTable};
use crate::parcel::Parcel;
use crate::proxy::tracker::{ProxyTracker, TrackerConfig};
use crate::proxy::BinderProxy;
use crate::stability::Level;
use crate::{sys, thread_state};

static GLOBAL: OnceLock<Arc<ProcessState>> = OnceLock::new();

/// Set in the child by the `atfork` handler. Driver state does not survive a
/// fork; any use of it in the child is a programming error.
static FORKED: AtomicBool = AtomicBool::new(false);

/// Held across session construction and by the pre-fork hook, so a fork can
/// never observe the singleton mid-initialization. A raw pthread mutex: the
/// lock taken in the prepare hook must be released by the parent and child
/// hooks, which std's RAII guards cannot express.
struct ForkLock(std::cell::UnsafeCell<libc::pthread_mutex_t>);

// Safety: pthread mutexes are made for cross-thread use; the cell is only
// handed to pthread_mutex_* calls.
unsafe impl Sync for ForkLock {}

static FORK_LOCK: ForkLock = ForkLock(std::cell::UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));

struct ForkLockGuard;

fn lock_fork() -> ForkLockGuard {
    // Safety: statically initialized mutex, locked and unlocked in pairs.
    unsafe {
        libc::pthread_mutex_lock(FORK_LOCK.0.get());
    }
    ForkLockGuard
}

impl Drop for ForkLockGuard {
    fn drop(&mut self) {
        // Safety: the guard exists only while the lock is held.
        unsafe {
            libc::pthread_mutex_unlock(FORK_LOCK.0.get());
        }
    }
}

extern "C" fn fork_prepare() {
    // Safety: async-signal-safe; blocks the fork until no thread is inside
    // session construction.
    unsafe {
        libc::pthread_mutex_lock(FORK_LOCK.0.get());
    }
}

extern "C" fn fork_parent() {
    // Safety: releases the lock taken by `fork_prepare` in this thread.
    unsafe {
        libc::pthread_mutex_unlock(FORK_LOCK.0.get());
    }
}

extern "C" fn fork_child() {
    // Safety: the child inherits the lock held by `fork_prepare`.
    unsafe {
        libc::pthread_mutex_unlock(FORK_LOCK.0.get());
    }
    FORKED.store(true, Ordering::SeqCst);
}

fn register_fork_guard() {
    static GUARD: Once = Once::new();
    GUARD.call_once(|| {
        // Safety: the handlers only touch the fork mutex and an atomic flag.
        unsafe {
            libc::pthread_atfork(
                Some(fork_prepare as unsafe extern "C" fn()),
                Some(fork_parent as unsafe extern "C" fn()),
                Some(fork_child as unsafe extern "C" fn()),
            );
        }
    });
}

/// Policy for synchronous calls made from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallRestriction {
    /// No restriction.
    #[default]
    None,
    /// Log an error for each synchronous call, but let it proceed.
    ErrorIfNotOneway,
    /// Abort the process on any synchronous call.
    FatalIfNotOneway,
}

/// Freeze bookkeeping for a peer process, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrozenProcessInfo {
    /// The peer received a synchronous transaction while frozen.
    pub sync_received: bool,
    /// The peer received an asynchronous transaction while frozen.
    pub async_received: bool,
    /// Synchronous transactions are still queued for the frozen peer.
    pub pending_sync_transactions: bool,
}

struct ThreadPool {
    started: bool,
    max_threads: u32,
    seq: u32,
}

/// Driver session shared by all proxies and protocol threads of a process.
pub struct ProcessState {
    driver: Arc<dyn BinderDriver>,
    driver_path: Option<PathBuf>,
    handles: Mutex<HashMap<u32, Weak<BinderProxy>>>,
    nodes: NodeTable,
    tracker: ProxyTracker,
    context_manager: Mutex<Option<Arc<dyn LocalObject>>>,
    pool: Mutex<ThreadPool>,
    call_restriction: Mutex<CallRestriction>,
}

impl ProcessState {
    /// Opens the binder device at `path` and installs the result as this
    /// process's session. Idempotent for the same path.
    ///
    /// # Errors
    ///
    /// Propagates [`KernelDriver::open`] failures.
    ///
    /// # Panics
    ///
    /// Panics when a session for a different device path already exists, or
    /// when called in the child of a fork.
    pub fn init(path: impl AsRef<Path>) -> Result<Arc<ProcessState>, IpcError> {
        let path = path.as_ref();
        register_fork_guard();
        // Construction happens entirely under the fork lock; a concurrent
        // fork waits in its prepare hook rather than snapshotting a
        // half-built singleton.
        let _fork = lock_fork();
        assert!(
            !FORKED.load(Ordering::SeqCst),
            "binder session used in the child of a fork"
        );
        if let Some(existing) = GLOBAL.get() {
            return Ok(Self::check_same_path(existing, path));
        }
        let driver = KernelDriver::open(path, DEFAULT_MAX_THREADS)?;
        let state = Arc::new(Self::new(Arc::new(driver), Some(path.to_path_buf())));
        match GLOBAL.set(Arc::clone(&state)) {
            Ok(()) => Ok(state),
            // Lost the init race; the winner's driver stays.
            Err(_) => Ok(Self::check_same_path(GLOBAL.get().unwrap(), path)),
        }
    }

    /// [`ProcessState::init`] with the default device path.
    ///
    /// # Errors
    ///
    /// Propagates [`KernelDriver::open`] failures.
    pub fn init_default() -> Result<Arc<ProcessState>, IpcError> {
        Self::init(crate::driver::DEFAULT_DEVICE)
    }

    /// The session installed by [`ProcessState::init`], if any.
    #[must_use]
    pub fn current() -> Option<Arc<ProcessState>> {
        GLOBAL.get().cloned()
    }

    fn check_same_path(existing: &Arc<ProcessState>, path: &Path) -> Arc<ProcessState> {
        assert_eq!(
            existing.driver_path.as_deref(),
            Some(path),
            "binder session already initialized for a different device"
        );
        Arc::clone(existing)
    }

    fn new(driver: Arc<dyn BinderDriver>, driver_path: Option<PathBuf>) -> Self {
        Self {
            driver,
            driver_path,
            handles: Mutex::new(HashMap::new()),
            nodes: NodeTable::default(),
            tracker: ProxyTracker::default(),
            context_manager: Mutex::new(None),
            pool: Mutex::new(ThreadPool {
                started: false,
                max_threads: DEFAULT_MAX_THREADS,
                seq: 0,
            }),
            call_restriction: Mutex::new(CallRestriction::None),
        }
    }

    /// Builds a private session around an arbitrary driver implementation.
    #[cfg(test)]
    pub(crate) fn for_testing(driver: Arc<dyn BinderDriver>) -> Arc<ProcessState> {
        Arc::new(Self::new(driver, None))
    }

    pub(crate) fn driver(&self) -> &Arc<dyn BinderDriver> {
        &self.driver
    }

    pub(crate) fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub(crate) fn tracker(&self) -> &ProxyTracker {
        &self.tracker
    }

    pub(crate) fn check_fork(&self) {
        assert!(
            !FORKED.load(Ordering::SeqCst),
            "binder session used in the child of a fork"
        );
    }

    /// Returns the live proxy for `handle`, creating one if needed.
    ///
    /// # Errors
    ///
    /// [`IpcError::NoMemory`] when per-UID throttling refuses the creation;
    /// for handle 0, any failure of the context-manager liveness ping.
    pub fn strong_proxy_for_handle(
        self: &Arc<Self>,
        handle: u32,
    ) -> Result<Arc<BinderProxy>, IpcError> {
        self.check_fork();
        {
            let handles = self.handles.lock().unwrap();
            if let Some(existing) = handles.get(&handle).and_then(Weak::upgrade) {
                return Ok(existing);
            }
        }

        // Handle 0 names the context manager. Minting a proxy for it before
        // any manager registered would hand out a broken object, so probe
        // with a ping first (unless this process is the manager itself).
        // The ping runs outside the table lock; it can pump arbitrary
        // protocol events.
        if handle == 0 && self.context_manager.lock().unwrap().is_none() {
            let mut reply = Parcel::new();
            thread_state::transact(
                self,
                0,
                sys::PING_TRANSACTION,
                &Parcel::new(),
                Some(&mut reply),
                0,
            )?;
        }

        let uid = thread_state::calling_uid(self);
        let (proxy, notices) = {
            let mut handles = self.handles.lock().unwrap();
            // Someone else may have created it while we were pinging.
            if let Some(existing) = handles.get(&handle).and_then(Weak::upgrade) {
                return Ok(existing);
            }
            let outcome = self
                .tracker
                .on_create(uid)
                .map_err(|()| IpcError::NoMemory("binder proxies for uid over limit"))?;
            let stability = if handle == 0 {
                // The root object never travels through a parcel, so its
                // level is stamped here.
                Level::LOCAL
            } else {
                Level::Undeclared
            };
            let proxy = BinderProxy::new_driver(
                Arc::clone(self),
                handle,
                stability,
                outcome.charged.then_some(uid),
            );
            handles.insert(handle, Arc::downgrade(&proxy));
            (proxy, outcome.notices)
        };
        for notice in notices {
            notice.deliver();
        }

        // Mirror the new userspace reference into the driver.
        thread_state::acquire_handle(self, handle);
        debug!(handle, uid, "created proxy");
        Ok(proxy)
    }

    /// Proxy for the context manager (handle 0).
    ///
    /// # Errors
    ///
    /// Fails when no context manager is registered with the driver.
    pub fn context_object(self: &Arc<Self>) -> Result<Arc<BinderProxy>, IpcError> {
        self.strong_proxy_for_handle(0)
    }

    /// Claims the context-manager role, serving `object` for handle 0.
    ///
    /// # Errors
    ///
    /// Propagates the driver's refusal (typically a permissions failure).
    pub fn become_context_manager(&self, object: Arc<dyn LocalObject>) -> Result<(), IpcError> {
        self.check_fork();
        let flat = sys::FlatBinderObject {
            flags: sys::FLAT_BINDER_FLAG_TXN_SECURITY_CTX,
            ..Default::default()
        };
        self.driver.set_context_manager(&flat)?;
        info!(descriptor = object.descriptor(), "became context manager");
        *self.context_manager.lock().unwrap() = Some(object);
        Ok(())
    }

    pub(crate) fn context_manager_object(&self) -> Option<Arc<dyn LocalObject>> {
        self.context_manager.lock().unwrap().clone()
    }

    /// Registers a local object for incoming references, returning its node
    /// cookie.
    pub fn register_local_object(&self, object: &Arc<dyn LocalObject>) -> u64 {
        self.nodes.register(object)
    }

    pub(crate) fn proxy_for_handle_if_live(&self, handle: u32) -> Option<Arc<BinderProxy>> {
        self.handles
            .lock()
            .unwrap()
            .get(&handle)
            .and_then(Weak::upgrade)
    }

    /// Drops `proxy`'s table entry, unless the handle was already reused by a
    /// newer proxy.
    pub(crate) fn expunge_handle(&self, handle: u32, proxy: *const BinderProxy) {
        let mut handles = self.handles.lock().unwrap();
        if let Some(entry) = handles.get(&handle) {
            if std::ptr::eq(entry.as_ptr(), proxy) {
                handles.remove(&handle);
            }
        }
    }

    /// Starts the protocol thread pool. Idempotent.
    pub fn start_thread_pool(self: &Arc<Self>) {
        self.check_fork();
        let mut pool = self.pool.lock().unwrap();
        if pool.started {
            return;
        }
        pool.started = true;
        self.spawn_pooled_thread_locked(&mut pool, true);
    }

    /// Spawns one additional pool thread, on driver request.
    pub(crate) fn spawn_pooled_thread(self: &Arc<Self>, is_main: bool) {
        let mut pool = self.pool.lock().unwrap();
        self.spawn_pooled_thread_locked(&mut pool, is_main);
    }

    fn spawn_pooled_thread_locked(self: &Arc<Self>, pool: &mut ThreadPool, is_main: bool) {
        if !pool.started {
            return;
        }
        pool.seq += 1;
        let name = format!("binder:{}_{:X}", std::process::id(), pool.seq);
        let process = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || thread_state::join_thread_pool(&process, is_main));
        match spawned {
            Ok(_) => debug!(thread = %name, is_main, "spawned pool thread"),
            Err(e) => error!(thread = %name, error = %e, "failed to spawn pool thread"),
        }
    }

    /// Runs the calling thread as a pool thread until the driver releases it.
    pub fn join_thread_pool(self: &Arc<Self>) {
        self.check_fork();
        thread_state::join_thread_pool(self, true);
    }

    /// Raises or lowers the driver-spawned thread limit.
    ///
    /// # Errors
    ///
    /// [`IpcError::InvalidOperation`] when shrinking a pool that has already
    /// started, or a driver error applying the limit.
    pub fn set_thread_pool_max_thread_count(&self, count: u32) -> Result<(), IpcError> {
        let mut pool = self.pool.lock().unwrap();
        if pool.started && count < pool.max_threads {
            return Err(IpcError::InvalidOperation(
                "cannot shrink a started thread pool",
            ));
        }
        self.driver.set_max_threads(count)?;
        pool.max_threads = count;
        Ok(())
    }

    /// Restricts synchronous calls process-wide.
    ///
    /// # Panics
    ///
    /// Panics when the thread pool has already started; restriction is a
    /// startup-time decision.
    pub fn set_call_restriction(&self, restriction: CallRestriction) {
        let pool = self.pool.lock().unwrap();
        assert!(
            !pool.started,
            "call restriction must be configured before the thread pool starts"
        );
        *self.call_restriction.lock().unwrap() = restriction;
    }

    pub(crate) fn pool_started(&self) -> bool {
        self.pool.lock().unwrap().started
    }

    pub(crate) fn call_restriction(&self) -> CallRestriction {
        *self.call_restriction.lock().unwrap()
    }

    /// Pushes any buffered protocol commands of the calling thread to the
    /// driver.
    pub fn flush_commands(self: &Arc<Self>) {
        thread_state::flush_commands(self);
    }

    /// Freezes or unfreezes binder delivery to `pid`.
    ///
    /// # Errors
    ///
    /// Propagates the driver's refusal.
    pub fn freeze(&self, pid: i32, enable: bool, timeout_ms: u32) -> Result<(), IpcError> {
        self.check_fork();
        self.driver.freeze(pid, enable, timeout_ms)
    }

    /// Queries freeze bookkeeping for `pid`.
    ///
    /// # Errors
    ///
    /// Propagates the driver's refusal.
    pub fn frozen_process_info(&self, pid: i32) -> Result<FrozenProcessInfo, IpcError> {
        let info = self.driver.frozen_status(pid)?;
        Ok(FrozenProcessInfo {
            sync_received: info.sync_recv & 1 != 0,
            async_received: info.async_recv & 1 != 0,
            pending_sync_transactions: info.sync_recv & 2 != 0,
        })
    }

    /// Toggles the driver's oneway spam detector for this process.
    ///
    /// # Errors
    ///
    /// Propagates the driver's refusal.
    pub fn set_oneway_spam_detection(&self, enable: bool) -> Result<(), IpcError> {
        self.check_fork();
        self.driver.set_oneway_spam_detection(enable)
    }

    /// Kernel-side reference counts behind `handle`.
    ///
    /// # Errors
    ///
    /// Propagates the driver's refusal.
    pub fn node_info_for_ref(&self, handle: u32) -> Result<sys::BinderNodeInfoForRef, IpcError> {
        self.driver.node_info_for_ref(handle)
    }

    /// Kernel-side debug view of this process's nodes; `cursor` advances the
    /// iteration.
    ///
    /// # Errors
    ///
    /// Propagates the driver's refusal.
    pub fn node_debug_info(&self, cursor: u64) -> Result<sys::BinderNodeDebugInfo, IpcError> {
        self.driver.node_debug_info(cursor)
    }

    // Per-UID proxy accounting knobs.

    /// Enables or disables per-UID proxy counting. Disabling clears counts.
    pub fn set_proxy_tracking_enabled(&self, enabled: bool) {
        self.tracker.set_enabled(enabled);
    }

    /// With throttling on, proxy creation fails for UIDs over the limit.
    pub fn set_proxy_throttling_enabled(&self, enabled: bool) {
        self.tracker.set_throttling(enabled);
    }

    /// Replaces the watermark configuration.
    pub fn set_proxy_count_watermarks(&self, config: TrackerConfig) {
        self.tracker.set_watermarks(config);
    }

    /// Callback run when a UID crosses the warning watermark.
    pub fn set_proxy_warning_callback(&self, callback: Arc<dyn Fn(u32) + Send + Sync>) {
        self.tracker.set_warning_callback(callback);
    }

    /// Callback run when a UID crosses the limit watermark.
    pub fn set_proxy_limit_callback(&self, callback: Arc<dyn Fn(u32) + Send + Sync>) {
        self.tracker.set_limit_callback(callback);
    }

    /// Live proxy count currently charged to `uid`.
    #[must_use]
    pub fn proxy_count_for_uid(&self, uid: u32) -> u32 {
        self.tracker.count_for_uid(uid)
    }
}

impl std::fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessState")
            .field("driver_path", &self.driver_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_flags_the_child_and_releases_the_lock() {
        register_fork_guard();
        // Safety: the child only reads an atomic and exits; everything else
        // happens in the parent.
        unsafe {
            let pid = libc::fork();
            assert!(pid >= 0, "fork failed");
            if pid == 0 {
                // The child-side hook must have flagged the session.
                let code = if FORKED.load(Ordering::SeqCst) { 0 } else { 1 };
                libc::_exit(code);
            }
            let mut status = 0;
            assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0);
        }
        // The parent is not flagged, and its hook released the fork lock, so
        // session construction can still take it.
        assert!(!FORKED.load(Ordering::SeqCst));
        drop(lock_fork());
    }
}
