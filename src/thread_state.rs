//! Per-thread transaction executor.
//!
//! Each thread that talks to the driver owns a [`ThreadState`]: an outbound
//! command buffer, an inbound return buffer and the calling identity of the
//! transaction currently being served. State lives in thread-local storage
//! keyed by session, so private test sessions on the same thread do not
//! interfere.
//!
//! The protocol loop is split in two layers on purpose. [`ThreadState`]
//! methods parse exactly one driver return while the thread-local borrow is
//! held and reduce it to a [`Step`]; everything that may run user code
//! (object callbacks, obituaries, freeze listeners) happens afterwards, with
//! no borrow and no locks held. Handlers are free to transact again or drop
//! proxies without re-entering this module's state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::{debug, error, warn};

use crate::driver::BinderDriver;
use crate::error::IpcError;
use crate::local::LocalObject;
use crate::parcel::Parcel;
use crate::process::{CallRestriction, ProcessState};
use crate::sys;
use crate::sys::BinderTransactionData;

/// Size of the inbound return buffer handed to the driver per read.
const READ_BUFFER_SIZE: usize = 256;

thread_local! {
    static STATES: RefCell<HashMap<usize, ThreadState>> = RefCell::new(HashMap::new());
}

fn with_ts<R>(process: &Arc<ProcessState>, f: impl FnOnce(&mut ThreadState) -> R) -> R {
    let key = Arc::as_ptr(process) as usize;
    STATES.with(|states| f(states.borrow_mut().entry(key).or_default()))
}

/// PID of the caller of the transaction this thread is currently serving,
/// or this process's own PID outside of a call.
#[must_use]
pub fn calling_pid(process: &Arc<ProcessState>) -> i32 {
    with_ts(process, |ts| ts.calling_pid)
}

/// Effective UID of the caller of the transaction this thread is currently
/// serving, or this process's own effective UID outside of a call.
#[must_use]
pub fn calling_uid(process: &Arc<ProcessState>) -> u32 {
    with_ts(process, |ts| ts.calling_uid)
}

struct ThreadState {
    out: Vec<u8>,
    input: Vec<u8>,
    in_pos: usize,
    calling_pid: i32,
    calling_uid: u32,
}

impl Default for ThreadState {
    fn default() -> Self {
        Self {
            out: Vec::new(),
            input: Vec::new(),
            in_pos: 0,
            calling_pid: std::process::id() as i32,
            // Safety: geteuid never fails.
            calling_uid: unsafe { libc::geteuid() },
        }
    }
}

/// One parsed driver return, reduced to what the wait loop needs.
enum Step {
    Noop,
    TransactionComplete,
    Reply(Parcel),
    StatusReply(i32),
    DeadReply,
    FailedReply,
    FrozenReply,
    Finished,
    Event(Event),
}

/// Work that must run outside the thread-state borrow.
enum Event {
    Transaction(IncomingTransaction),
    BinderDied { cookie: u64 },
    FrozenStateChanged { cookie: u64, is_frozen: bool },
    NodeRef { kind: RefKind, ptr: u64, cookie: u64 },
    SpawnLooper,
}

#[derive(Debug, Clone, Copy)]
enum RefKind {
    IncRefs,
    Acquire,
    Release,
    DecRefs,
}

struct IncomingTransaction {
    cookie: u64,
    code: u32,
    flags: u32,
    sender_pid: i32,
    sender_uid: u32,
    data: Parcel,
}

impl ThreadState {
    fn queue_cmd(&mut self, cmd: u32) {
        self.out.extend_from_slice(&cmd.to_ne_bytes());
    }

    fn queue_cmd_u32(&mut self, cmd: u32, arg: u32) {
        self.queue_cmd(cmd);
        self.out.extend_from_slice(&arg.to_ne_bytes());
    }

    fn queue_cmd_u64(&mut self, cmd: u32, arg: u64) {
        self.queue_cmd(cmd);
        self.out.extend_from_slice(&arg.to_ne_bytes());
    }

    fn queue_handle_cookie(&mut self, cmd: u32, handle: u32) {
        // The cookie mirrored back in BR_DEAD_BINDER / BR_FROZEN_BINDER is
        // the handle itself; no addresses cross the driver.
        let hc = sys::BinderHandleCookie {
            handle,
            cookie: u64::from(handle),
        };
        self.queue_cmd(cmd);
        sys::write_struct(&mut self.out, &hc);
    }

    /// Queues a BC_TRANSACTION or BC_REPLY referencing `data`'s buffers.
    /// The parcel must stay alive until the commands are flushed.
    fn queue_transaction(&mut self, cmd: u32, target: u64, code: u32, flags: u32, data: &Parcel) {
        let tr = BinderTransactionData {
            target,
            cookie: 0,
            code,
            flags,
            sender_pid: 0,
            sender_euid: 0,
            data_size: data.data_size() as u64,
            offsets_size: (data.object_offsets().len() * 8) as u64,
            data_buffer: data.data().as_ptr() as u64,
            data_offsets: data.object_offsets().as_ptr() as u64,
        };
        self.queue_cmd(cmd);
        sys::write_struct(&mut self.out, &tr);
    }

    fn take_u32(&mut self) -> Result<u32, IpcError> {
        let bytes: [u8; 4] = self.input[self.in_pos..]
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| IpcError::Protocol("truncated driver return".into()))?;
        self.in_pos += 4;
        Ok(u32::from_ne_bytes(bytes))
    }

    fn take_struct<T: Copy + Default>(&mut self) -> Result<T, IpcError> {
        let value = sys::read_struct::<T>(&self.input[self.in_pos..])
            .ok_or_else(|| IpcError::Protocol("truncated driver return".into()))?;
        self.in_pos += size_of::<T>();
        Ok(value)
    }

    /// Exchanges buffers with the driver. Writes whatever is queued; reads
    /// only when `do_read` is set and the inbound buffer is fully consumed.
    fn talk_with_driver(&mut self, driver: &dyn BinderDriver, do_read: bool) -> Result<(), IpcError> {
        let do_receive = do_read && self.in_pos >= self.input.len();
        if !do_receive && self.out.is_empty() {
            return Ok(());
        }
        let mut read_buf = vec![0u8; if do_receive { READ_BUFFER_SIZE } else { 0 }];
        let read_slice = do_receive.then_some(&mut read_buf[..]);
        let (write_consumed, read_consumed) = driver.write_read(&self.out, read_slice)?;
        self.out.drain(..write_consumed);
        if do_receive {
            read_buf.truncate(read_consumed);
            self.input = read_buf;
            self.in_pos = 0;
        }
        Ok(())
    }

    /// Produces the next protocol step, talking to the driver as needed.
    fn next_step(&mut self, driver: &dyn BinderDriver) -> Result<Step, IpcError> {
        while self.in_pos >= self.input.len() {
            self.talk_with_driver(driver, true)?;
        }
        let cmd = self.take_u32()?;
        Ok(match cmd {
            sys::BR_NOOP | sys::BR_OK => Step::Noop,
            sys::BR_TRANSACTION_COMPLETE => Step::TransactionComplete,
            sys::BR_ONEWAY_SPAM_SUSPECT => {
                warn!("driver flagged this process as a oneway spammer");
                Step::TransactionComplete
            }
            sys::BR_TRANSACTION_PENDING_FROZEN => {
                warn!("oneway transaction queued for a frozen process");
                Step::TransactionComplete
            }
            sys::BR_REPLY => {
                let tr = self.take_struct::<BinderTransactionData>()?;
                self.ingest_reply(&tr)
            }
            sys::BR_TRANSACTION => {
                let tr = self.take_struct::<BinderTransactionData>()?;
                Step::Event(Event::Transaction(self.ingest_transaction(&tr)))
            }
            sys::BR_ERROR => {
                let status = self.take_u32()? as i32;
                IpcError::check_status(status)?;
                Step::Noop
            }
            sys::BR_DEAD_REPLY => Step::DeadReply,
            sys::BR_FAILED_REPLY => Step::FailedReply,
            sys::BR_FROZEN_REPLY => Step::FrozenReply,
            sys::BR_ACQUIRE_RESULT => {
                let _ = self.take_u32()?;
                Step::Noop
            }
            sys::BR_INCREFS | sys::BR_ACQUIRE | sys::BR_RELEASE | sys::BR_DECREFS => {
                let pc = self.take_struct::<sys::BinderPtrCookie>()?;
                let kind = match cmd {
                    sys::BR_INCREFS => RefKind::IncRefs,
                    sys::BR_ACQUIRE => RefKind::Acquire,
                    sys::BR_RELEASE => RefKind::Release,
                    _ => RefKind::DecRefs,
                };
                Step::Event(Event::NodeRef {
                    kind,
                    ptr: pc.ptr,
                    cookie: pc.cookie,
                })
            }
            sys::BR_DEAD_BINDER => {
                let cookie = self.take_struct::<u64>()?;
                Step::Event(Event::BinderDied { cookie })
            }
            sys::BR_CLEAR_DEATH_NOTIFICATION_DONE => {
                let cookie = self.take_struct::<u64>()?;
                debug!(cookie, "death notification cleared");
                Step::Noop
            }
            sys::BR_FROZEN_BINDER => {
                let info = self.take_struct::<sys::BinderFrozenStateInfo>()?;
                Step::Event(Event::FrozenStateChanged {
                    cookie: info.cookie,
                    is_frozen: info.is_frozen != 0,
                })
            }
            sys::BR_CLEAR_FREEZE_NOTIFICATION_DONE => {
                let cookie = self.take_struct::<u64>()?;
                debug!(cookie, "freeze notification cleared");
                Step::Noop
            }
            sys::BR_SPAWN_LOOPER => Step::Event(Event::SpawnLooper),
            sys::BR_FINISHED => Step::Finished,
            other => {
                return Err(IpcError::Protocol(format!(
                    "unknown driver return 0x{other:08x}"
                )))
            }
        })
    }

    fn ingest_reply(&mut self, tr: &BinderTransactionData) -> Step {
        // Payloads live in the driver's receive mapping; copy out, then hand
        // the buffer back.
        let (data, offsets) = unsafe { copy_payload(tr) };
        self.queue_cmd_u64(sys::BC_FREE_BUFFER, tr.data_buffer);
        if tr.flags & sys::TF_STATUS_CODE != 0 {
            let status = data
                .get(..4)
                .and_then(|s| s.try_into().ok())
                .map_or(0, i32::from_le_bytes);
            Step::StatusReply(status)
        } else {
            Step::Reply(Parcel::from_raw(data, offsets))
        }
    }

    fn ingest_transaction(&mut self, tr: &BinderTransactionData) -> IncomingTransaction {
        let (data, offsets) = unsafe { copy_payload(tr) };
        self.queue_cmd_u64(sys::BC_FREE_BUFFER, tr.data_buffer);
        IncomingTransaction {
            cookie: tr.cookie,
            code: tr.code,
            flags: tr.flags,
            sender_pid: tr.sender_pid,
            sender_uid: tr.sender_euid,
            data: Parcel::from_raw(data, offsets),
        }
    }
}

/// Copies a delivered payload out of the driver's buffer.
///
/// # Safety
///
/// `tr` must describe a payload the driver just delivered to this process;
/// its buffer pointers are valid until the matching `BC_FREE_BUFFER`.
unsafe fn copy_payload(tr: &BinderTransactionData) -> (Vec<u8>, Vec<u64>) {
    let data = if tr.data_size == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(tr.data_buffer as *const u8, tr.data_size as usize).to_vec()
    };
    let offsets = if tr.offsets_size == 0 {
        Vec::new()
    } else {
        // Read bytewise; the offsets buffer is aligned in the kernel mapping
        // but test drivers make no such promise.
        std::slice::from_raw_parts(tr.data_offsets as *const u8, tr.offsets_size as usize)
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    };
    (data, offsets)
}

/// Sends one transaction to `handle` and waits for its completion.
pub(crate) fn transact(
    process: &Arc<ProcessState>,
    handle: u32,
    code: u32,
    data: &Parcel,
    reply: Option<&mut Parcel>,
    flags: u32,
) -> Result<(), IpcError> {
    process.check_fork();
    let flags = flags | sys::TF_ACCEPT_FDS;
    let oneway = flags & sys::TF_ONE_WAY != 0;
    if !oneway {
        match process.call_restriction() {
            CallRestriction::None => {}
            CallRestriction::ErrorIfNotOneway => {
                error!(code, "synchronous call while restricted to oneway");
            }
            CallRestriction::FatalIfNotOneway => {
                panic!("synchronous binder call while restricted to oneway")
            }
        }
    }
    with_ts(process, |ts| {
        ts.queue_transaction(sys::BC_TRANSACTION, u64::from(handle), code, flags, data);
    });
    if oneway {
        wait_for_response(process, None, true)
    } else {
        wait_for_response(process, reply, false)
    }
}

/// Pumps the protocol until the awaited terminal step arrives. Intervening
/// events (incoming transactions, deaths, freezes) are dispatched inline.
fn wait_for_response(
    process: &Arc<ProcessState>,
    mut reply: Option<&mut Parcel>,
    until_complete: bool,
) -> Result<(), IpcError> {
    loop {
        let step = with_ts(process, |ts| ts.next_step(process.driver().as_ref()))?;
        match step {
            Step::Noop => {}
            Step::TransactionComplete => {
                if until_complete {
                    return Ok(());
                }
            }
            Step::Reply(parcel) => {
                if let Some(slot) = reply.take() {
                    *slot = parcel;
                }
                return Ok(());
            }
            Step::StatusReply(status) => return IpcError::check_status(status),
            Step::DeadReply => return Err(IpcError::DeadObject),
            Step::FailedReply => return Err(IpcError::FailedTransaction),
            Step::FrozenReply => {
                warn!("transaction rejected: peer is frozen");
                return Err(IpcError::FailedTransaction);
            }
            Step::Finished => {
                return Err(IpcError::Protocol("driver finished this thread".into()))
            }
            Step::Event(event) => dispatch_event(process, event)?,
        }
    }
}

fn dispatch_event(process: &Arc<ProcessState>, event: Event) -> Result<(), IpcError> {
    match event {
        Event::Transaction(txn) => serve_transaction(process, txn),
        Event::BinderDied { cookie } => {
            match process.proxy_for_handle_if_live(cookie as u32) {
                Some(proxy) => proxy.send_obituary(),
                None => debug!(cookie, "death notice for an already-dropped proxy"),
            }
            with_ts(process, |ts| {
                ts.queue_cmd_u64(sys::BC_DEAD_BINDER_DONE, cookie);
            });
            Ok(())
        }
        Event::FrozenStateChanged { cookie, is_frozen } => {
            if let Some(proxy) = process.proxy_for_handle_if_live(cookie as u32) {
                proxy.notify_frozen_state(is_frozen);
            }
            with_ts(process, |ts| {
                ts.queue_cmd_u64(sys::BC_FREEZE_NOTIFICATION_DONE, cookie);
            });
            Ok(())
        }
        Event::NodeRef { kind, ptr, cookie } => {
            // Cookie 0 is the context-manager node, pinned by the registry.
            match kind {
                RefKind::IncRefs => {
                    with_ts(process, |ts| {
                        ts.queue_cmd(sys::BC_INCREFS_DONE);
                        sys::write_struct(&mut ts.out, &sys::BinderPtrCookie { ptr, cookie });
                    });
                }
                RefKind::Acquire => {
                    if cookie != 0 {
                        process.nodes().acquire(cookie);
                    }
                    with_ts(process, |ts| {
                        ts.queue_cmd(sys::BC_ACQUIRE_DONE);
                        sys::write_struct(&mut ts.out, &sys::BinderPtrCookie { ptr, cookie });
                    });
                }
                RefKind::Release => {
                    if cookie != 0 {
                        process.nodes().release(cookie);
                    }
                }
                RefKind::DecRefs => {
                    if cookie != 0 {
                        process.nodes().forget(cookie);
                    }
                }
            }
            Ok(())
        }
        Event::SpawnLooper => {
            process.spawn_pooled_thread(false);
            Ok(())
        }
    }
}

/// Runs a local object's handler and sends the reply for synchronous calls.
fn serve_transaction(
    process: &Arc<ProcessState>,
    mut txn: IncomingTransaction,
) -> Result<(), IpcError> {
    let target: Option<Arc<dyn LocalObject>> = if txn.cookie == 0 {
        process.context_manager_object()
    } else {
        process.nodes().get(txn.cookie)
    };

    let saved = with_ts(process, |ts| {
        let saved = (ts.calling_pid, ts.calling_uid);
        ts.calling_pid = txn.sender_pid;
        ts.calling_uid = txn.sender_uid;
        saved
    });

    let mut reply = Parcel::new();
    let result = match target {
        None => {
            error!(cookie = txn.cookie, code = txn.code, "transaction for unknown local object");
            Err(IpcError::DeadObject)
        }
        Some(object) => match txn.code {
            sys::PING_TRANSACTION => Ok(()),
            sys::INTERFACE_TRANSACTION => {
                reply.write_string(object.descriptor());
                Ok(())
            }
            code => object.on_transact(code, &mut txn.data, &mut reply),
        },
    };

    with_ts(process, |ts| {
        ts.calling_pid = saved.0;
        ts.calling_uid = saved.1;
    });

    if txn.flags & sys::TF_ONE_WAY != 0 {
        if let Err(e) = result {
            warn!(error = %e, code = txn.code, "oneway transaction handler failed");
        }
        return Ok(());
    }

    match result {
        Ok(()) => {
            with_ts(process, |ts| {
                ts.queue_transaction(sys::BC_REPLY, 0, 0, 0, &reply);
            });
            wait_for_response(process, None, true)
        }
        Err(e) => {
            let mut status_reply = Parcel::new();
            status_reply.write_i32(e.to_status());
            with_ts(process, |ts| {
                ts.queue_transaction(sys::BC_REPLY, 0, 0, sys::TF_STATUS_CODE, &status_reply);
            });
            wait_for_response(process, None, true)
        }
    }
}

/// Services the driver until it releases this thread.
pub(crate) fn join_thread_pool(process: &Arc<ProcessState>, is_main: bool) {
    debug!(is_main, "entering thread pool");
    with_ts(process, |ts| {
        ts.queue_cmd(if is_main {
            sys::BC_ENTER_LOOPER
        } else {
            sys::BC_REGISTER_LOOPER
        });
    });
    loop {
        let step = with_ts(process, |ts| ts.next_step(process.driver().as_ref()));
        match step {
            Ok(Step::Event(event)) => {
                if let Err(e) = dispatch_event(process, event) {
                    warn!(error = %e, "failed to service driver event");
                }
            }
            Ok(Step::Finished) => break,
            Ok(_) => {}
            // The driver refuses reads from looper threads it wants gone.
            Err(IpcError::Driver(Errno::ECONNREFUSED)) => break,
            Err(e) => {
                error!(error = %e, "protocol thread terminating");
                break;
            }
        }
    }
    with_ts(process, |ts| ts.queue_cmd(sys::BC_EXIT_LOOPER));
    flush_commands(process);
    if let Err(e) = process.driver().thread_exit() {
        debug!(error = %e, "thread exit notification failed");
    }
    debug!(is_main, "left thread pool");
}

/// Pushes buffered commands without reading.
pub(crate) fn flush_commands(process: &Arc<ProcessState>) {
    let result = with_ts(process, |ts| {
        ts.talk_with_driver(process.driver().as_ref(), false)
    });
    if let Err(e) = result {
        error!(error = %e, "failed to flush driver commands");
    }
}

/// Mirrors a new userspace reference to `handle` into the driver.
pub(crate) fn acquire_handle(process: &Arc<ProcessState>, handle: u32) {
    with_ts(process, |ts| {
        ts.queue_cmd_u32(sys::BC_INCREFS, handle);
        ts.queue_cmd_u32(sys::BC_ACQUIRE, handle);
    });
    flush_commands(process);
}

/// Returns the references taken by [`acquire_handle`].
pub(crate) fn release_handle(process: &Arc<ProcessState>, handle: u32) {
    with_ts(process, |ts| {
        ts.queue_cmd_u32(sys::BC_RELEASE, handle);
        ts.queue_cmd_u32(sys::BC_DECREFS, handle);
    });
    flush_commands(process);
}

pub(crate) fn request_death_notification(process: &Arc<ProcessState>, handle: u32) {
    with_ts(process, |ts| {
        ts.queue_handle_cookie(sys::BC_REQUEST_DEATH_NOTIFICATION, handle);
    });
    flush_commands(process);
}

pub(crate) fn clear_death_notification(process: &Arc<ProcessState>, handle: u32) {
    with_ts(process, |ts| {
        ts.queue_handle_cookie(sys::BC_CLEAR_DEATH_NOTIFICATION, handle);
    });
    flush_commands(process);
}

pub(crate) fn request_freeze_notification(process: &Arc<ProcessState>, handle: u32) {
    with_ts(process, |ts| {
        ts.queue_handle_cookie(sys::BC_REQUEST_FREEZE_NOTIFICATION, handle);
    });
    flush_commands(process);
}

pub(crate) fn clear_freeze_notification(process: &Arc<ProcessState>, handle: u32) {
    with_ts(process, |ts| {
        ts.queue_handle_cookie(sys::BC_CLEAR_FREEZE_NOTIFICATION, handle);
    });
    flush_commands(process);
}
