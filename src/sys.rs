//! Raw binder driver ABI.
//!
//! Request codes, protocol command codes and the fixed-layout transfer
//! structs exchanged with the kernel driver over `ioctl`. The driver is an
//! external black box; everything here mirrors its wire contract exactly and
//! must never be "improved". Command codes use the generic Linux `_IOC`
//! encoding even though the `BC_*`/`BR_*` values are carried inside the
//! write/read buffers rather than issued as ioctls themselves.

/// Protocol version this crate speaks. The driver must report exactly this
/// value or the device is rejected at open time.
pub const BINDER_CURRENT_PROTOCOL_VERSION: i32 = 8;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

const fn io(ty: u8, nr: u8) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_WRITE, ty, nr, size)
}

const fn ior(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ, ty, nr, size)
}

const fn iowr(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

const fn pack_chars(c1: u8, c2: u8, c3: u8, c4: u8) -> u32 {
    ((c1 as u32) << 24) | ((c2 as u32) << 16) | ((c3 as u32) << 8) | c4 as u32
}

// ---------------------------------------------------------------------------
// ioctl request codes (magic 'b')

pub const BINDER_WRITE_READ: u32 = iowr(b'b', 1, size_of::<BinderWriteRead>());
pub const BINDER_SET_MAX_THREADS: u32 = iow(b'b', 5, size_of::<u32>());
pub const BINDER_SET_CONTEXT_MGR: u32 = iow(b'b', 7, size_of::<i32>());
pub const BINDER_THREAD_EXIT: u32 = iow(b'b', 8, size_of::<i32>());
pub const BINDER_VERSION: u32 = iowr(b'b', 9, size_of::<BinderVersion>());
pub const BINDER_GET_NODE_DEBUG_INFO: u32 = iowr(b'b', 11, size_of::<BinderNodeDebugInfo>());
pub const BINDER_GET_NODE_INFO_FOR_REF: u32 = iowr(b'b', 12, size_of::<BinderNodeInfoForRef>());
pub const BINDER_SET_CONTEXT_MGR_EXT: u32 = iow(b'b', 13, size_of::<FlatBinderObject>());
pub const BINDER_FREEZE: u32 = iow(b'b', 14, size_of::<BinderFreezeInfo>());
pub const BINDER_GET_FROZEN_INFO: u32 = iowr(b'b', 15, size_of::<BinderFrozenStatusInfo>());
pub const BINDER_ENABLE_ONEWAY_SPAM_DETECTION: u32 = iow(b'b', 16, size_of::<u32>());

// ---------------------------------------------------------------------------
// Commands written to the driver (magic 'c')

pub const BC_TRANSACTION: u32 = iow(b'c', 0, size_of::<BinderTransactionData>());
pub const BC_REPLY: u32 = iow(b'c', 1, size_of::<BinderTransactionData>());
pub const BC_FREE_BUFFER: u32 = iow(b'c', 3, size_of::<u64>());
pub const BC_INCREFS: u32 = iow(b'c', 4, size_of::<u32>());
pub const BC_ACQUIRE: u32 = iow(b'c', 5, size_of::<u32>());
pub const BC_RELEASE: u32 = iow(b'c', 6, size_of::<u32>());
pub const BC_DECREFS: u32 = iow(b'c', 7, size_of::<u32>());
pub const BC_INCREFS_DONE: u32 = iow(b'c', 8, size_of::<BinderPtrCookie>());
pub const BC_ACQUIRE_DONE: u32 = iow(b'c', 9, size_of::<BinderPtrCookie>());
pub const BC_REGISTER_LOOPER: u32 = io(b'c', 11);
pub const BC_ENTER_LOOPER: u32 = io(b'c', 12);
pub const BC_EXIT_LOOPER: u32 = io(b'c', 13);
pub const BC_REQUEST_DEATH_NOTIFICATION: u32 = iow(b'c', 14, size_of::<BinderHandleCookie>());
pub const BC_CLEAR_DEATH_NOTIFICATION: u32 = iow(b'c', 15, size_of::<BinderHandleCookie>());
pub const BC_DEAD_BINDER_DONE: u32 = iow(b'c', 16, size_of::<u64>());
pub const BC_REQUEST_FREEZE_NOTIFICATION: u32 = iow(b'c', 19, size_of::<BinderHandleCookie>());
pub const BC_CLEAR_FREEZE_NOTIFICATION: u32 = iow(b'c', 20, size_of::<BinderHandleCookie>());
pub const BC_FREEZE_NOTIFICATION_DONE: u32 = iow(b'c', 21, size_of::<u64>());

// ---------------------------------------------------------------------------
// Returns read from the driver (magic 'r')

pub const BR_ERROR: u32 = ior(b'r', 0, size_of::<i32>());
pub const BR_OK: u32 = io(b'r', 1);
pub const BR_TRANSACTION: u32 = ior(b'r', 2, size_of::<BinderTransactionData>());
pub const BR_REPLY: u32 = ior(b'r', 3, size_of::<BinderTransactionData>());
pub const BR_ACQUIRE_RESULT: u32 = ior(b'r', 4, size_of::<i32>());
pub const BR_DEAD_REPLY: u32 = io(b'r', 5);
pub const BR_TRANSACTION_COMPLETE: u32 = io(b'r', 6);
pub const BR_INCREFS: u32 = ior(b'r', 7, size_of::<BinderPtrCookie>());
pub const BR_ACQUIRE: u32 = ior(b'r', 8, size_of::<BinderPtrCookie>());
pub const BR_RELEASE: u32 = ior(b'r', 9, size_of::<BinderPtrCookie>());
pub const BR_DECREFS: u32 = ior(b'r', 10, size_of::<BinderPtrCookie>());
pub const BR_NOOP: u32 = io(b'r', 12);
pub const BR_SPAWN_LOOPER: u32 = io(b'r', 13);
pub const BR_FINISHED: u32 = io(b'r', 14);
pub const BR_DEAD_BINDER: u32 = ior(b'r', 15, size_of::<u64>());
pub const BR_CLEAR_DEATH_NOTIFICATION_DONE: u32 = ior(b'r', 16, size_of::<u64>());
pub const BR_FAILED_REPLY: u32 = io(b'r', 17);
pub const BR_FROZEN_REPLY: u32 = io(b'r', 18);
pub const BR_ONEWAY_SPAM_SUSPECT: u32 = io(b'r', 19);
pub const BR_TRANSACTION_PENDING_FROZEN: u32 = io(b'r', 20);
pub const BR_FROZEN_BINDER: u32 = ior(b'r', 21, size_of::<BinderFrozenStateInfo>());
pub const BR_CLEAR_FREEZE_NOTIFICATION_DONE: u32 = ior(b'r', 22, size_of::<u64>());

// ---------------------------------------------------------------------------
// Transaction code ranges and flags

/// First code available for user transactions.
pub const FIRST_CALL_TRANSACTION: u32 = 0x0000_0001;
/// Last code available for user transactions.
pub const LAST_CALL_TRANSACTION: u32 = 0x00ff_ffff;

/// Liveness check, handled by the remote without reaching user code.
pub const PING_TRANSACTION: u32 = pack_chars(b'_', b'P', b'N', b'G');
/// Interface-descriptor query.
pub const INTERFACE_TRANSACTION: u32 = pack_chars(b'_', b'N', b'T', b'F');

/// Asynchronous call; the caller does not wait for a reply.
pub const TF_ONE_WAY: u32 = 0x01;
/// Payload is a status code, not marshalled data.
pub const TF_STATUS_CODE: u32 = 0x08;
/// Allow file descriptors to cross in the payload.
pub const TF_ACCEPT_FDS: u32 = 0x10;
/// Ask the driver to scrub the transaction buffer after delivery.
pub const TF_CLEAR_BUF: u32 = 0x20;

/// Purely local marker requesting vendor-context stability enforcement.
/// Stripped before flags reach the driver.
pub const FLAG_PRIVATE_VENDOR: u32 = 0x1000_0000;

/// Flag on `FlatBinderObject` requesting the security context of callers.
pub const FLAT_BINDER_FLAG_TXN_SECURITY_CTX: u32 = 0x1000;

// ---------------------------------------------------------------------------
// Transfer structs

/// Argument block for `BINDER_WRITE_READ`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderWriteRead {
    pub write_size: u64,
    pub write_consumed: u64,
    pub write_buffer: u64,
    pub read_size: u64,
    pub read_consumed: u64,
    pub read_buffer: u64,
}

/// Fixed-layout transaction header. The `target`/`data_*` fields are unions
/// in the C header; both arms are 64-bit so plain `u64` fields preserve the
/// layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderTransactionData {
    /// Target handle (outbound) or object pointer (inbound).
    pub target: u64,
    pub cookie: u64,
    pub code: u32,
    pub flags: u32,
    pub sender_pid: i32,
    pub sender_euid: u32,
    pub data_size: u64,
    pub offsets_size: u64,
    pub data_buffer: u64,
    pub data_offsets: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderVersion {
    pub protocol_version: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderPtrCookie {
    pub ptr: u64,
    pub cookie: u64,
}

/// Packed in the kernel header; 12 bytes, not 16.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderHandleCookie {
    pub handle: u32,
    pub cookie: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderFrozenStateInfo {
    pub cookie: u64,
    pub is_frozen: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderNodeDebugInfo {
    pub ptr: u64,
    pub cookie: u64,
    pub has_strong_ref: u32,
    pub has_weak_ref: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderNodeInfoForRef {
    pub handle: u32,
    pub strong_count: u32,
    pub weak_count: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderFreezeInfo {
    pub pid: u32,
    pub enable: u32,
    pub timeout_ms: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BinderFrozenStatusInfo {
    pub pid: u32,
    pub sync_recv: u32,
    pub async_recv: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatBinderObject {
    pub hdr_type: u32,
    pub flags: u32,
    pub binder: u64,
    pub cookie: u64,
}

/// Reads a `repr(C)` transfer struct out of a byte slice.
///
/// Returns `None` if the slice is too short. Only the struct types above may
/// be used; they are all plain-old-data with no padding-sensitive reads.
pub(crate) fn read_struct<T: Copy + Default>(bytes: &[u8]) -> Option<T> {
    let size = size_of::<T>();
    if bytes.len() < size {
        return None;
    }
    let mut value = T::default();
    // Safety: T is a repr(C) POD struct and `value` is a valid destination of
    // exactly `size` bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            std::ptr::addr_of_mut!(value).cast::<u8>(),
            size,
        );
    }
    Some(value)
}

/// Appends the raw bytes of a `repr(C)` transfer struct to a buffer.
pub(crate) fn write_struct<T: Copy>(buf: &mut Vec<u8>, value: &T) {
    let size = size_of::<T>();
    // Safety: T is a repr(C) POD struct; reading `size` bytes from it is
    // always in bounds.
    let bytes = unsafe { std::slice::from_raw_parts(std::ptr::from_ref(value).cast::<u8>(), size) };
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioc_encoding_matches_kernel() {
        // BINDER_VERSION = _IOWR('b', 9, struct binder_version); the struct
        // is a single i32, so size 4.
        assert_eq!(BINDER_VERSION, 0xc004_6209);
        assert_eq!(BINDER_SET_MAX_THREADS, 0x4004_6205);
        assert_eq!(BC_ENTER_LOOPER, 0x0000_630c);
        assert_eq!(BR_NOOP, 0x0000_720c);
    }

    #[test]
    fn test_transaction_data_layout() {
        // Mirrors struct binder_transaction_data on 64-bit kernels.
        assert_eq!(size_of::<BinderTransactionData>(), 64);
        assert_eq!(size_of::<BinderWriteRead>(), 48);
        assert_eq!(size_of::<BinderHandleCookie>(), 12);
        assert_eq!(size_of::<BinderFrozenStateInfo>(), 16);
    }

    #[test]
    fn test_struct_round_trip() {
        let tr = BinderTransactionData {
            target: 42,
            code: PING_TRANSACTION,
            flags: TF_ACCEPT_FDS,
            data_size: 16,
            ..Default::default()
        };
        let mut buf = Vec::new();
        write_struct(&mut buf, &tr);
        let back: BinderTransactionData = read_struct(&buf).unwrap();
        assert_eq!(back.target, 42);
        assert_eq!(back.code, PING_TRANSACTION);
        assert_eq!(back.flags, TF_ACCEPT_FDS);
        assert_eq!(back.data_size, 16);
        assert!(read_struct::<BinderTransactionData>(&buf[..10]).is_none());
    }

    #[test]
    fn test_user_transaction_range() {
        assert!(PING_TRANSACTION > LAST_CALL_TRANSACTION);
        assert!(INTERFACE_TRANSACTION > LAST_CALL_TRANSACTION);
        assert!(FIRST_CALL_TRANSACTION <= LAST_CALL_TRANSACTION);
    }
}
