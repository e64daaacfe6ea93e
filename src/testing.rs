//! Scripted driver for protocol tests.
//!
//! [`MockDriver`] stands in for the kernel device: outbound commands are
//! parsed and recorded, and each read request delivers the next scripted
//! return chunk. Payload buffers for scripted replies live in an arena owned
//! by the driver, so the pointers handed out stay valid for the executor to
//! copy from, exactly like the kernel's receive mapping.
//!
//! The mock is strict: an unknown outbound command or an unscripted read
//! panics, pointing at the test that went off its script.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::driver::BinderDriver;
use crate::error::IpcError;
use crate::sys;
use crate::sys::BinderTransactionData;

/// One recorded BC_TRANSACTION.
pub(crate) struct SentTransaction {
    pub handle: u32,
    pub code: u32,
    pub flags: u32,
    pub payload: Vec<u8>,
}

/// One recorded BC_REPLY.
pub(crate) struct SentReply {
    pub flags: u32,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct MockInner {
    script: VecDeque<Vec<u8>>,
    arenas: Vec<Box<[u8]>>,
    write_read_calls: usize,
    transactions: Vec<SentTransaction>,
    replies: Vec<SentReply>,
    freed: Vec<u64>,
    refcounts: Vec<(u32, u32)>,
    death_requests: Vec<u32>,
    death_clears: Vec<u32>,
    freeze_requests: Vec<u32>,
    freeze_clears: Vec<u32>,
    dead_binder_dones: Vec<u64>,
    freeze_notification_dones: Vec<u64>,
    freeze_support: bool,
}

pub(crate) struct MockDriver {
    inner: Mutex<MockInner>,
}

impl MockDriver {
    pub(crate) fn new() -> Arc<MockDriver> {
        Arc::new(MockDriver {
            inner: Mutex::new(MockInner::default()),
        })
    }

    pub(crate) fn set_freeze_notification_support(&self, support: bool) {
        self.inner.lock().unwrap().freeze_support = support;
    }

    // Script construction. Each push becomes one read's worth of returns.

    fn push_chunk(&self, chunk: Vec<u8>) {
        self.inner.lock().unwrap().script.push_back(chunk);
    }

    fn alloc(&self, bytes: &[u8]) -> u64 {
        let arena: Box<[u8]> = bytes.to_vec().into_boxed_slice();
        let ptr = arena.as_ptr() as u64;
        self.inner.lock().unwrap().arenas.push(arena);
        ptr
    }

    pub(crate) fn push_transaction_complete(&self) {
        let mut chunk = Vec::new();
        put_cmd(&mut chunk, sys::BR_NOOP);
        put_cmd(&mut chunk, sys::BR_TRANSACTION_COMPLETE);
        self.push_chunk(chunk);
    }

    pub(crate) fn push_reply(&self, payload: &[u8]) {
        self.push_reply_with_flags(0, payload);
    }

    pub(crate) fn push_status_reply(&self, status: i32) {
        self.push_reply_with_flags(sys::TF_STATUS_CODE, &status.to_le_bytes());
    }

    fn push_reply_with_flags(&self, flags: u32, payload: &[u8]) {
        let tr = BinderTransactionData {
            flags,
            data_size: payload.len() as u64,
            data_buffer: self.alloc(payload),
            ..Default::default()
        };
        let mut chunk = Vec::new();
        put_cmd(&mut chunk, sys::BR_NOOP);
        put_cmd(&mut chunk, sys::BR_REPLY);
        sys::write_struct(&mut chunk, &tr);
        self.push_chunk(chunk);
    }

    pub(crate) fn push_dead_reply(&self) {
        let mut chunk = Vec::new();
        put_cmd(&mut chunk, sys::BR_NOOP);
        put_cmd(&mut chunk, sys::BR_DEAD_REPLY);
        self.push_chunk(chunk);
    }

    pub(crate) fn push_incoming_transaction(&self, cookie: u64, code: u32, flags: u32, payload: &[u8]) {
        self.push_incoming_transaction_from(cookie, code, flags, payload, 1000, 1000);
    }

    pub(crate) fn push_incoming_transaction_from(
        &self,
        cookie: u64,
        code: u32,
        flags: u32,
        payload: &[u8],
        sender_pid: i32,
        sender_uid: u32,
    ) {
        let tr = BinderTransactionData {
            cookie,
            code,
            flags,
            sender_pid,
            sender_euid: sender_uid,
            data_size: payload.len() as u64,
            data_buffer: self.alloc(payload),
            ..Default::default()
        };
        let mut chunk = Vec::new();
        put_cmd(&mut chunk, sys::BR_NOOP);
        put_cmd(&mut chunk, sys::BR_TRANSACTION);
        sys::write_struct(&mut chunk, &tr);
        self.push_chunk(chunk);
    }

    pub(crate) fn push_dead_binder(&self, cookie: u64) {
        let mut chunk = Vec::new();
        put_cmd(&mut chunk, sys::BR_NOOP);
        put_cmd(&mut chunk, sys::BR_DEAD_BINDER);
        chunk.extend_from_slice(&cookie.to_ne_bytes());
        self.push_chunk(chunk);
    }

    pub(crate) fn push_frozen_binder(&self, cookie: u64, is_frozen: bool) {
        let info = sys::BinderFrozenStateInfo {
            cookie,
            is_frozen: u32::from(is_frozen),
            reserved: 0,
        };
        let mut chunk = Vec::new();
        put_cmd(&mut chunk, sys::BR_NOOP);
        put_cmd(&mut chunk, sys::BR_FROZEN_BINDER);
        sys::write_struct(&mut chunk, &info);
        self.push_chunk(chunk);
    }

    // Inspection.

    pub(crate) fn write_read_calls(&self) -> usize {
        self.inner.lock().unwrap().write_read_calls
    }

    pub(crate) fn sent_transactions(&self) -> Vec<SentTransaction> {
        std::mem::take(&mut self.inner.lock().unwrap().transactions)
    }

    pub(crate) fn sent_replies(&self) -> Vec<SentReply> {
        std::mem::take(&mut self.inner.lock().unwrap().replies)
    }

    pub(crate) fn freed_buffers(&self) -> Vec<u64> {
        self.inner.lock().unwrap().freed.clone()
    }

    /// Refcount commands observed for `handle`, in order.
    pub(crate) fn refcount_commands(&self, handle: u32) -> Vec<u32> {
        self.inner
            .lock()
            .unwrap()
            .refcounts
            .iter()
            .filter(|(_, h)| *h == handle)
            .map(|(cmd, _)| *cmd)
            .collect()
    }

    pub(crate) fn death_requests(&self) -> Vec<u32> {
        self.inner.lock().unwrap().death_requests.clone()
    }

    pub(crate) fn death_clears(&self) -> Vec<u32> {
        self.inner.lock().unwrap().death_clears.clone()
    }

    pub(crate) fn freeze_requests(&self) -> Vec<u32> {
        self.inner.lock().unwrap().freeze_requests.clone()
    }

    pub(crate) fn freeze_clears(&self) -> Vec<u32> {
        self.inner.lock().unwrap().freeze_clears.clone()
    }

    pub(crate) fn dead_binder_dones(&self) -> Vec<u64> {
        self.inner.lock().unwrap().dead_binder_dones.clone()
    }

    pub(crate) fn freeze_notification_dones(&self) -> Vec<u64> {
        self.inner.lock().unwrap().freeze_notification_dones.clone()
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> bool {
        self.pos < self.bytes.len()
    }

    fn take_u32(&mut self) -> u32 {
        let bytes: [u8; 4] = self.bytes[self.pos..self.pos + 4].try_into().unwrap();
        self.pos += 4;
        u32::from_ne_bytes(bytes)
    }

    fn take_u64(&mut self) -> u64 {
        let bytes: [u8; 8] = self.bytes[self.pos..self.pos + 8].try_into().unwrap();
        self.pos += 8;
        u64::from_ne_bytes(bytes)
    }

    fn take_struct<T: Copy + Default>(&mut self) -> T {
        let value = sys::read_struct::<T>(&self.bytes[self.pos..]).unwrap();
        self.pos += size_of::<T>();
        value
    }
}

/// Copies the payload a queued transaction points at. Valid only while the
/// submitting call is still on the stack.
unsafe fn copy_queued_payload(tr: &BinderTransactionData) -> Vec<u8> {
    if tr.data_size == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(tr.data_buffer as *const u8, tr.data_size as usize).to_vec()
    }
}

impl BinderDriver for MockDriver {
    fn supports_freeze_notification(&self) -> bool {
        self.inner.lock().unwrap().freeze_support
    }

    fn set_context_manager(&self, _obj: &sys::FlatBinderObject) -> Result<(), IpcError> {
        Ok(())
    }

    fn write_read(&self, write: &[u8], read: Option<&mut [u8]>) -> Result<(usize, usize), IpcError> {
        let mut inner = self.inner.lock().unwrap();
        inner.write_read_calls += 1;

        let mut cursor = Cursor {
            bytes: write,
            pos: 0,
        };
        while cursor.remaining() {
            let cmd = cursor.take_u32();
            match cmd {
                sys::BC_TRANSACTION => {
                    let tr = cursor.take_struct::<BinderTransactionData>();
                    inner.transactions.push(SentTransaction {
                        handle: tr.target as u32,
                        code: tr.code,
                        flags: tr.flags,
                        payload: unsafe { copy_queued_payload(&tr) },
                    });
                }
                sys::BC_REPLY => {
                    let tr = cursor.take_struct::<BinderTransactionData>();
                    inner.replies.push(SentReply {
                        flags: tr.flags,
                        payload: unsafe { copy_queued_payload(&tr) },
                    });
                }
                sys::BC_FREE_BUFFER => {
                    let buffer = cursor.take_u64();
                    inner.freed.push(buffer);
                }
                sys::BC_INCREFS | sys::BC_ACQUIRE | sys::BC_RELEASE | sys::BC_DECREFS => {
                    let handle = cursor.take_u32();
                    inner.refcounts.push((cmd, handle));
                }
                sys::BC_INCREFS_DONE | sys::BC_ACQUIRE_DONE => {
                    let _ = cursor.take_struct::<sys::BinderPtrCookie>();
                }
                sys::BC_REQUEST_DEATH_NOTIFICATION => {
                    let hc = cursor.take_struct::<sys::BinderHandleCookie>();
                    inner.death_requests.push(hc.handle);
                }
                sys::BC_CLEAR_DEATH_NOTIFICATION => {
                    let hc = cursor.take_struct::<sys::BinderHandleCookie>();
                    inner.death_clears.push(hc.handle);
                }
                sys::BC_DEAD_BINDER_DONE => {
                    let cookie = cursor.take_u64();
                    inner.dead_binder_dones.push(cookie);
                }
                sys::BC_REQUEST_FREEZE_NOTIFICATION => {
                    let hc = cursor.take_struct::<sys::BinderHandleCookie>();
                    inner.freeze_requests.push(hc.handle);
                }
                sys::BC_CLEAR_FREEZE_NOTIFICATION => {
                    let hc = cursor.take_struct::<sys::BinderHandleCookie>();
                    inner.freeze_clears.push(hc.handle);
                }
                sys::BC_FREEZE_NOTIFICATION_DONE => {
                    let cookie = cursor.take_u64();
                    inner.freeze_notification_dones.push(cookie);
                }
                sys::BC_ENTER_LOOPER | sys::BC_REGISTER_LOOPER | sys::BC_EXIT_LOOPER => {}
                other => panic!("mock driver: unexpected command 0x{other:08x}"),
            }
        }

        let mut read_consumed = 0;
        if let Some(read) = read {
            let chunk = inner
                .script
                .pop_front()
                .expect("mock driver: read requested but the script is empty");
            assert!(
                chunk.len() <= read.len(),
                "mock driver: scripted chunk exceeds the read buffer"
            );
            read[..chunk.len()].copy_from_slice(&chunk);
            read_consumed = chunk.len();
        }
        Ok((write.len(), read_consumed))
    }
}

fn put_cmd(chunk: &mut Vec<u8>, cmd: u32) {
    chunk.extend_from_slice(&cmd.to_ne_bytes());
}
