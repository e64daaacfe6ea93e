//! Error taxonomy for the IPC core.
//!
//! Transport-level failures travel as `Result` values up through
//! [`transact`](crate::proxy::BinderProxy::transact); lifecycle failures
//! (death, freeze) are delivered through listener callbacks, never as return
//! codes. Nothing in this crate retries; retry policy belongs to callers.

use nix::errno::Errno;
use thiserror::Error;

/// Errors surfaced by the IPC core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IpcError {
    /// The remote endpoint is gone. Permanent: the owning proxy latches dead
    /// and every later operation fails fast without touching the driver.
    #[error("remote object is dead")]
    DeadObject,

    /// A stability check rejected the transaction before any driver call.
    #[error("stability violation: {provided} object used in a {required} context")]
    BadType {
        /// Stability level stamped on the proxy.
        provided: String,
        /// Level required by the calling context.
        required: String,
    },

    /// The operation is unsupported in the current configuration.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// An internal list could not grow.
    #[error("out of memory while growing {0}")]
    NoMemory(&'static str),

    /// An unregister-style operation found nothing to remove. Not a fault of
    /// the system as a whole, just "nothing to do".
    #[error("no matching entry found")]
    NameNotFound,

    /// A listener argument was already dead at registration time.
    #[error("listener could not be promoted")]
    BadValue,

    /// The driver reported that the transaction could not be completed
    /// (failed or frozen peer).
    #[error("transaction failed")]
    FailedTransaction,

    /// The driver returned an errno on a critical path.
    #[error("driver error: {0}")]
    Driver(#[from] Errno),

    /// The device reported a protocol version other than the compiled-in one.
    #[error("driver protocol {driver} does not match expected protocol {expected}")]
    ProtocolMismatch {
        /// Version reported by the device.
        driver: i32,
        /// [`crate::sys::BINDER_CURRENT_PROTOCOL_VERSION`].
        expected: i32,
    },

    /// The device could not be opened or mapped.
    #[error("failed to open binder device {path}: {source}")]
    OpenFailed {
        /// Device path that was attempted.
        path: String,
        /// Underlying errno.
        source: Errno,
    },

    /// A malformed or short command arrived from the driver or a session
    /// peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O failure on a session transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Wire status codes, used where a status must cross a process boundary
// (reply parcels carrying TF_STATUS_CODE, session frames). Values are the
// negated errnos peers on the wire expect.
const STATUS_OK: i32 = 0;
const STATUS_NO_MEMORY: i32 = -libc::ENOMEM;
const STATUS_INVALID_OPERATION: i32 = -libc::ENOSYS;
const STATUS_BAD_VALUE: i32 = -libc::EINVAL;
const STATUS_NAME_NOT_FOUND: i32 = -libc::ENOENT;
const STATUS_DEAD_OBJECT: i32 = -libc::EPIPE;
const STATUS_BAD_TYPE: i32 = 0x8000_0001_u32 as i32;
const STATUS_FAILED_TRANSACTION: i32 = 0x8000_0002_u32 as i32;
const STATUS_UNKNOWN: i32 = 0x8000_0000_u32 as i32;

impl IpcError {
    /// Encodes this error as a wire status code.
    #[must_use]
    pub fn to_status(&self) -> i32 {
        match self {
            IpcError::DeadObject => STATUS_DEAD_OBJECT,
            IpcError::BadType { .. } => STATUS_BAD_TYPE,
            IpcError::InvalidOperation(_) => STATUS_INVALID_OPERATION,
            IpcError::NoMemory(_) => STATUS_NO_MEMORY,
            IpcError::NameNotFound => STATUS_NAME_NOT_FOUND,
            IpcError::BadValue => STATUS_BAD_VALUE,
            IpcError::FailedTransaction => STATUS_FAILED_TRANSACTION,
            IpcError::Driver(errno) => -(*errno as i32),
            _ => STATUS_UNKNOWN,
        }
    }

    /// Decodes a wire status code. `0` means success (`Ok(())`).
    pub fn check_status(status: i32) -> Result<(), IpcError> {
        match status {
            STATUS_OK => Ok(()),
            STATUS_DEAD_OBJECT => Err(IpcError::DeadObject),
            STATUS_NO_MEMORY => Err(IpcError::NoMemory("remote")),
            STATUS_INVALID_OPERATION => Err(IpcError::InvalidOperation("remote")),
            STATUS_NAME_NOT_FOUND => Err(IpcError::NameNotFound),
            STATUS_BAD_VALUE => Err(IpcError::BadValue),
            STATUS_FAILED_TRANSACTION => Err(IpcError::FailedTransaction),
            STATUS_BAD_TYPE => Err(IpcError::BadType {
                provided: "remote".to_string(),
                required: "remote".to_string(),
            }),
            STATUS_UNKNOWN => Err(IpcError::Protocol("unknown remote error".to_string())),
            n if n < 0 => Err(IpcError::Driver(Errno::from_raw(-n))),
            n => Err(IpcError::Protocol(format!("unexpected status {n}"))),
        }
    }

    /// True for the permanent "remote is gone" condition.
    #[must_use]
    pub fn is_dead_object(&self) -> bool {
        matches!(self, IpcError::DeadObject)
    }
}
