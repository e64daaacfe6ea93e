#![allow(clippy::doc_markdown)]

//! # binder-ipc
//!
//! Userspace core of the binder IPC transport: remote-object proxies, the
//! per-process driver session, and the per-thread command loop that speaks
//! the `BC_*`/`BR_*` protocol with the kernel.
//!
//! The central types mirror the shape of the protocol:
//!
//! - [`ProcessState`]: one per process, owns the driver fd, the handle table
//!   mapping driver handles to live proxies, and the remote-proxy accounting.
//! - [`BinderProxy`]: a strong reference to an object living in another
//!   process. Carries death notification (obituaries), freeze-state
//!   listeners, attached local objects, and an interface-stability mark that
//!   gates outgoing calls.
//! - [`thread_state`]: thread-local command buffers and the transaction
//!   loop. Incoming work is parsed under the thread-local borrow, then
//!   dispatched outside it so handlers may freely re-enter the transport.
//! - [`LocalObject`]: the callee side; implement it and register with
//!   [`ProcessState::register_local_object`] or
//!   [`ProcessState::become_context_manager`].
//! - [`RpcSession`]: socket transport carrying the same transaction shape to
//!   a peer without the kernel driver.
//!
//! ## Example
//!
//! ```rust,ignore
//! use binder_ipc::{Parcel, ProcessState};
//!
//! let process = ProcessState::init_default()?;
//! let manager = process.context_object()?;
//! let mut data = Parcel::new();
//! data.write_string("health.check");
//! let mut reply = Parcel::new();
//! manager.transact(binder_ipc::sys::FIRST_CALL_TRANSACTION, &data, Some(&mut reply), 0)?;
//! # Ok::<(), binder_ipc::IpcError>(())
//! ```
//!
//! Proxies hold real kernel references: creation sends `BC_INCREFS` and
//! `BC_ACQUIRE`, drop sends `BC_RELEASE` and `BC_DECREFS`, and the handle
//! table guarantees at most one live proxy per handle.

pub mod driver;
pub mod error;
pub mod local;
pub mod parcel;
pub mod process;
pub mod proxy;
pub mod session;
pub mod stability;
pub mod sys;
pub mod thread_state;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{BinderDriver, DriverFeature, KernelDriver, DEFAULT_DEVICE, DEFAULT_MAX_THREADS};
pub use error::IpcError;
pub use local::LocalObject;
pub use parcel::Parcel;
pub use process::{CallRestriction, FrozenProcessInfo, ProcessState};
pub use proxy::object_table::{Attachment, CleanupFn};
pub use proxy::tracker::TrackerConfig;
pub use proxy::{BinderProxy, DeathRecipient, FrozenStateCallback};
pub use session::RpcSession;
pub use stability::Level;
