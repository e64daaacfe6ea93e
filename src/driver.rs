//! Kernel driver handle.
//!
//! [`KernelDriver`] owns the character-device file descriptor and the
//! read-only receive mapping, and funnels every `ioctl` through one place.
//! The [`BinderDriver`] trait is the seam between the transaction machinery
//! and the device so the protocol loops can be exercised against a scripted
//! driver in tests.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::error::IpcError;
use crate::sys;

/// Threads the driver may ask this process to spawn, beyond the main thread.
pub const DEFAULT_MAX_THREADS: u32 = 15;

/// Device path used when the caller does not name one.
pub const DEFAULT_DEVICE: &str = "/dev/binder";

/// Directory binderfs exposes driver feature flags under.
const DRIVER_FEATURES_DIR: &str = "/dev/binderfs/features";

/// Optional driver capabilities, discovered through binderfs feature files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFeature {
    OnewaySpamDetection,
    FreezeNotification,
}

impl DriverFeature {
    fn file_name(self) -> &'static str {
        match self {
            DriverFeature::OnewaySpamDetection => "oneway_spam_detection",
            DriverFeature::FreezeNotification => "freeze_notification",
        }
    }
}

/// Returns true when the running driver advertises `feature`.
///
/// Missing binderfs or a missing feature file both read as "not supported".
#[must_use]
pub fn driver_feature_enabled(feature: DriverFeature) -> bool {
    feature_enabled_in(Path::new(DRIVER_FEATURES_DIR), feature.file_name())
}

fn feature_enabled_in(dir: &Path, name: &str) -> bool {
    let path = dir.join(name);
    let mut contents = String::new();
    match File::open(&path).and_then(|mut f| f.read_to_string(&mut contents)) {
        Ok(_) => contents.trim() == "1",
        Err(e) => {
            debug!(path = %path.display(), error = %e, "driver feature file unreadable");
            false
        }
    }
}

/// Low-level operations the transaction machinery needs from the driver.
///
/// Implemented by [`KernelDriver`] for the real device. Methods other than
/// [`BinderDriver::write_read`] default to rejecting the call so scripted
/// test drivers only implement what they exercise.
pub trait BinderDriver: Send + Sync {
    /// Issues one `BINDER_WRITE_READ`, submitting `write` and filling `read`
    /// when present. Returns `(write_consumed, read_consumed)`.
    fn write_read(&self, write: &[u8], read: Option<&mut [u8]>) -> Result<(usize, usize), IpcError>;

    /// Whether freeze-state notifications can be requested.
    fn supports_freeze_notification(&self) -> bool {
        false
    }

    /// Tells the driver this protocol thread is exiting.
    fn thread_exit(&self) -> Result<(), IpcError> {
        Ok(())
    }

    /// Raises or lowers the driver-spawned thread limit.
    fn set_max_threads(&self, _count: u32) -> Result<(), IpcError> {
        Ok(())
    }

    /// Toggles kernel-side oneway spam detection.
    fn set_oneway_spam_detection(&self, _enable: bool) -> Result<(), IpcError> {
        Err(IpcError::InvalidOperation(
            "driver does not support oneway spam detection",
        ))
    }

    /// Claims the context-manager role for this process.
    fn set_context_manager(&self, _obj: &sys::FlatBinderObject) -> Result<(), IpcError> {
        Err(IpcError::InvalidOperation("driver does not manage contexts"))
    }

    /// Freezes or unfreezes binder delivery to `pid`.
    fn freeze(&self, _pid: i32, _enable: bool, _timeout_ms: u32) -> Result<(), IpcError> {
        Err(IpcError::InvalidOperation("driver does not support freezing"))
    }

    /// Reports whether `pid` received transactions while frozen.
    fn frozen_status(&self, _pid: i32) -> Result<sys::BinderFrozenStatusInfo, IpcError> {
        Err(IpcError::InvalidOperation("driver does not support freezing"))
    }

    /// Kernel-side view of one of this process's nodes, keyed by cursor.
    fn node_debug_info(&self, _cursor: u64) -> Result<sys::BinderNodeDebugInfo, IpcError> {
        Err(IpcError::InvalidOperation("driver does not expose node info"))
    }

    /// Kernel-side reference counts behind a remote handle.
    fn node_info_for_ref(&self, _handle: u32) -> Result<sys::BinderNodeInfoForRef, IpcError> {
        Err(IpcError::InvalidOperation("driver does not expose node info"))
    }
}

/// Open binder device plus its mapped receive buffer.
///
/// The mapping is read-only for userspace; the driver writes transaction
/// payloads into it and hands out offsets, which this process returns with
/// `BC_FREE_BUFFER` once consumed.
pub struct KernelDriver {
    fd: OwnedFd,
    map_start: *mut libc::c_void,
    map_size: usize,
}

// Safety: the mapping pointer is never handed out mutably; all access to the
// fd goes through `ioctl`, which the kernel serializes.
unsafe impl Send for KernelDriver {}
unsafe impl Sync for KernelDriver {}

impl KernelDriver {
    /// Opens `path`, validates the protocol version, configures the thread
    /// limit and maps the receive buffer.
    ///
    /// # Errors
    ///
    /// [`IpcError::OpenFailed`] when the device cannot be opened,
    /// [`IpcError::ProtocolMismatch`] when the driver speaks a different
    /// protocol version, or [`IpcError::Driver`] for ioctl/mmap failures.
    pub fn open(path: &Path, max_threads: u32) -> Result<Self, IpcError> {
        let fd = open_device(path)?;

        let mut version = sys::BinderVersion::default();
        raw_ioctl(&fd, sys::BINDER_VERSION, std::ptr::addr_of_mut!(version).cast())?;
        if version.protocol_version != sys::BINDER_CURRENT_PROTOCOL_VERSION {
            return Err(IpcError::ProtocolMismatch {
                driver: version.protocol_version,
                expected: sys::BINDER_CURRENT_PROTOCOL_VERSION,
            });
        }

        let mut threads = max_threads;
        raw_ioctl(
            &fd,
            sys::BINDER_SET_MAX_THREADS,
            std::ptr::addr_of_mut!(threads).cast(),
        )?;

        if driver_feature_enabled(DriverFeature::OnewaySpamDetection) {
            let mut enable: u32 = 1;
            if let Err(e) = raw_ioctl(
                &fd,
                sys::BINDER_ENABLE_ONEWAY_SPAM_DETECTION,
                std::ptr::addr_of_mut!(enable).cast(),
            ) {
                warn!(error = %e, "could not enable oneway spam detection");
            }
        }

        let map_size = receive_buffer_size();
        // Safety: anonymous-length mapping of the device fd at a kernel-chosen
        // address; failure is reported as MAP_FAILED.
        let map_start = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_size,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                fd.as_raw_fd(),
                0,
            )
        };
        if map_start == libc::MAP_FAILED {
            return Err(IpcError::Driver(Errno::last()));
        }

        info!(path = %path.display(), map_size, max_threads, "binder driver opened");
        Ok(Self {
            fd,
            map_start,
            map_size,
        })
    }

    fn ioctl(&self, request: u32, arg: *mut libc::c_void) -> Result<(), IpcError> {
        raw_ioctl(&self.fd, request, arg)
    }
}

impl Drop for KernelDriver {
    fn drop(&mut self) {
        // Safety: the mapping was created in `open` and is unmapped once.
        unsafe {
            libc::munmap(self.map_start, self.map_size);
        }
    }
}

impl std::fmt::Debug for KernelDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelDriver")
            .field("fd", &self.fd.as_raw_fd())
            .field("map_size", &self.map_size)
            .finish()
    }
}

impl BinderDriver for KernelDriver {
    fn supports_freeze_notification(&self) -> bool {
        driver_feature_enabled(DriverFeature::FreezeNotification)
    }

    fn write_read(&self, write: &[u8], read: Option<&mut [u8]>) -> Result<(usize, usize), IpcError> {
        let mut bwr = sys::BinderWriteRead {
            write_size: write.len() as u64,
            write_buffer: write.as_ptr() as u64,
            ..Default::default()
        };
        if let Some(read) = read {
            bwr.read_size = read.len() as u64;
            bwr.read_buffer = read.as_mut_ptr() as u64;
        }
        self.ioctl(sys::BINDER_WRITE_READ, std::ptr::addr_of_mut!(bwr).cast())?;
        Ok((bwr.write_consumed as usize, bwr.read_consumed as usize))
    }

    fn thread_exit(&self) -> Result<(), IpcError> {
        let mut unused: i32 = 0;
        self.ioctl(sys::BINDER_THREAD_EXIT, std::ptr::addr_of_mut!(unused).cast())
    }

    fn set_max_threads(&self, count: u32) -> Result<(), IpcError> {
        let mut count = count;
        self.ioctl(
            sys::BINDER_SET_MAX_THREADS,
            std::ptr::addr_of_mut!(count).cast(),
        )
    }

    fn set_oneway_spam_detection(&self, enable: bool) -> Result<(), IpcError> {
        let mut enable: u32 = u32::from(enable);
        self.ioctl(
            sys::BINDER_ENABLE_ONEWAY_SPAM_DETECTION,
            std::ptr::addr_of_mut!(enable).cast(),
        )
    }

    fn set_context_manager(&self, obj: &sys::FlatBinderObject) -> Result<(), IpcError> {
        let mut obj = *obj;
        match self.ioctl(
            sys::BINDER_SET_CONTEXT_MGR_EXT,
            std::ptr::addr_of_mut!(obj).cast(),
        ) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Older drivers only know the original request.
                warn!(error = %e, "extended context-manager request failed, retrying plain");
                let mut unused: i32 = 0;
                self.ioctl(
                    sys::BINDER_SET_CONTEXT_MGR,
                    std::ptr::addr_of_mut!(unused).cast(),
                )
            }
        }
    }

    fn freeze(&self, pid: i32, enable: bool, timeout_ms: u32) -> Result<(), IpcError> {
        let mut info = sys::BinderFreezeInfo {
            pid: pid as u32,
            enable: u32::from(enable),
            timeout_ms,
        };
        self.ioctl(sys::BINDER_FREEZE, std::ptr::addr_of_mut!(info).cast())
    }

    fn frozen_status(&self, pid: i32) -> Result<sys::BinderFrozenStatusInfo, IpcError> {
        let mut info = sys::BinderFrozenStatusInfo {
            pid: pid as u32,
            ..Default::default()
        };
        self.ioctl(
            sys::BINDER_GET_FROZEN_INFO,
            std::ptr::addr_of_mut!(info).cast(),
        )?;
        Ok(info)
    }

    fn node_debug_info(&self, cursor: u64) -> Result<sys::BinderNodeDebugInfo, IpcError> {
        let mut info = sys::BinderNodeDebugInfo {
            ptr: cursor,
            ..Default::default()
        };
        self.ioctl(
            sys::BINDER_GET_NODE_DEBUG_INFO,
            std::ptr::addr_of_mut!(info).cast(),
        )?;
        Ok(info)
    }

    fn node_info_for_ref(&self, handle: u32) -> Result<sys::BinderNodeInfoForRef, IpcError> {
        let mut info = sys::BinderNodeInfoForRef {
            handle,
            ..Default::default()
        };
        self.ioctl(
            sys::BINDER_GET_NODE_INFO_FOR_REF,
            std::ptr::addr_of_mut!(info).cast(),
        )?;
        Ok(info)
    }
}

fn open_device(path: &Path) -> Result<OwnedFd, IpcError> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| IpcError::InvalidOperation("device path contains NUL"))?;
    // Safety: c_path is a valid NUL-terminated string for the duration of the
    // call.
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(IpcError::OpenFailed {
            path: path.display().to_string(),
            source: Errno::last(),
        });
    }
    // Safety: fd was just returned by open and is owned exclusively here.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn raw_ioctl(fd: &OwnedFd, request: u32, arg: *mut libc::c_void) -> Result<(), IpcError> {
    loop {
        // Safety: request codes and argument layouts come from `sys` and match
        // the driver ABI; the argument outlives the call.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request as libc::c_ulong, arg) };
        if rc >= 0 {
            return Ok(());
        }
        let err = Errno::last();
        if err != Errno::EINTR {
            return Err(IpcError::Driver(err));
        }
    }
}

/// Receive-mapping size: 1 MiB less two guard pages' worth.
fn receive_buffer_size() -> usize {
    // Safety: sysconf with a valid name has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    1024 * 1024 - page * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_feature_file_probing() {
        let dir = tempfile::tempdir().unwrap();
        let mut on = File::create(dir.path().join("oneway_spam_detection")).unwrap();
        writeln!(on, "1").unwrap();
        let mut off = File::create(dir.path().join("freeze_notification")).unwrap();
        writeln!(off, "0").unwrap();

        assert!(feature_enabled_in(dir.path(), "oneway_spam_detection"));
        assert!(!feature_enabled_in(dir.path(), "freeze_notification"));
        assert!(!feature_enabled_in(dir.path(), "missing_feature"));
    }

    #[test]
    fn test_receive_buffer_leaves_guard_room() {
        let size = receive_buffer_size();
        assert!(size < 1024 * 1024);
        assert!(size >= 1024 * 1024 - 2 * 65536);
    }

    #[test]
    fn test_open_missing_device() {
        let err = KernelDriver::open(Path::new("/dev/nonexistent-binder"), 4).unwrap_err();
        assert!(matches!(err, IpcError::OpenFailed { .. }));
    }
}
