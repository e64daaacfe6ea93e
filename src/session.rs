//! Socket-based session transport.
//!
//! An [`RpcSession`] reaches remote objects over a Unix-domain socket rather
//! than the kernel driver. Objects are addressed by 64-bit session-scoped
//! addresses; the root object lives at address 0. Framing is a 4-byte
//! big-endian length prefix. Requests carry address, code and flags; replies
//! carry a status word and the reply payload.
//!
//! Session proxies share [`BinderProxy`] with driver proxies, but death and
//! freeze notifications are driver facilities and are refused here.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::error::IpcError;
use crate::parcel::Parcel;
use crate::proxy::BinderProxy;
use crate::sys;

/// Upper bound on a single frame, matching the driver's receive mapping.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Connection to a remote process over a socket.
pub struct RpcSession {
    stream: Mutex<UnixStream>,
}

impl RpcSession {
    /// Connects to the socket at `path`.
    ///
    /// # Errors
    ///
    /// Propagates the connection failure.
    pub fn connect(path: impl AsRef<Path>) -> Result<Arc<RpcSession>, IpcError> {
        let stream = UnixStream::connect(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "session connected");
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already-connected stream.
    #[must_use]
    pub fn from_stream(stream: UnixStream) -> Arc<RpcSession> {
        Arc::new(RpcSession {
            stream: Mutex::new(stream),
        })
    }

    /// Proxy for the session's root object (address 0).
    #[must_use]
    pub fn root_object(self: &Arc<Self>) -> Arc<BinderProxy> {
        BinderProxy::new_session(Arc::clone(self), 0)
    }

    /// Sends one transaction over the socket.
    ///
    /// The stream lock serializes whole frames; a reply is read under the
    /// same lock so concurrent callers cannot interleave.
    pub(crate) fn transact(
        &self,
        address: u64,
        code: u32,
        data: &Parcel,
        reply: Option<&mut Parcel>,
        flags: u32,
    ) -> Result<(), IpcError> {
        let oneway = flags & sys::TF_ONE_WAY != 0;

        let mut body = Vec::with_capacity(16 + data.data_size());
        body.put_u64(address);
        body.put_u32(code);
        body.put_u32(flags);
        body.put_slice(data.data());

        let mut stream = self.stream.lock().unwrap();
        write_frame(&mut stream, &body).map_err(eof_is_death)?;
        if oneway {
            return Ok(());
        }

        let frame = read_frame(&mut stream)?;
        let mut frame = &frame[..];
        if frame.len() < 4 {
            return Err(IpcError::Protocol("reply frame too short".into()));
        }
        let status = frame.get_i32();
        IpcError::check_status(status)?;
        if let Some(slot) = reply {
            *slot = Parcel::from_raw(frame.to_vec(), Vec::new());
        }
        Ok(())
    }
}

fn write_frame(stream: &mut UnixStream, body: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>, IpcError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).map_err(eof_is_death)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::Protocol(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).map_err(eof_is_death)?;
    Ok(body)
}

/// A peer hanging up mid-conversation is a death, not an I/O fault.
fn eof_is_death(e: std::io::Error) -> IpcError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => IpcError::DeadObject,
        _ => IpcError::Io(e),
    }
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession").finish_non_exhaustive()
    }
}
