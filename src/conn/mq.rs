//! POSIX message queue backend.
//!
//! Two bounded kernel queues, one per direction. Each `read`/`write` maps
//! 1:1 to one queue message, so the OS provides the message boundary and no
//! extra framing is needed. Both sides open with `O_CREAT` (creation is
//! idempotent); only the host unlinks the names on drop.
//!
//! rustix has no mqueue surface, so this backend talks to `libc` directly.

use std::ffi::CString;

use rustix::io::Errno;
use tracing::{debug, warn};

use crate::protocol::ClientId;

use super::paths::ChannelDirs;
use super::{ReadError, SetupError, WriteError};

/// Queue depth. A full queue makes `write` report [`WriteError::NotReady`].
const MQ_MAX_MESSAGES: libc::c_long = 10;

/// Largest message one queue entry carries. Matches the default unprivileged
/// `msgsize_max` ceiling on Linux; a bigger value makes `mq_open` fail.
pub const MQ_MESSAGE_SIZE: usize = 8192;

/// One end of a message-queue pair.
#[derive(Debug)]
pub struct MqConn {
    id: ClientId,
    is_host: bool,
    in_queue: libc::mqd_t,
    out_queue: libc::mqd_t,
    in_name: CString,
    out_name: CString,
}

impl MqConn {
    /// Opens the host end, creating both queues.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if either queue cannot be opened; a queue
    /// created by the failed attempt is unlinked.
    pub fn host(id: ClientId, dirs: &ChannelDirs) -> Result<Self, SetupError> {
        Self::open(id, true, dirs.mq_c2h(id), dirs.mq_h2c(id))
    }

    /// Opens the client end. Creation is idempotent, so ordering against the
    /// host does not matter.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if either queue cannot be opened.
    pub fn client(id: ClientId, dirs: &ChannelDirs) -> Result<Self, SetupError> {
        Self::open(id, false, dirs.mq_h2c(id), dirs.mq_c2h(id))
    }

    fn open(
        id: ClientId,
        is_host: bool,
        in_name: String,
        out_name: String,
    ) -> Result<Self, SetupError> {
        let in_c = to_cstring(&in_name)?;
        let out_c = to_cstring(&out_name)?;

        let in_queue = mq_open(&in_c, libc::O_RDONLY)?;
        let out_queue = match mq_open(&out_c, libc::O_WRONLY) {
            Ok(q) => q,
            Err(e) => {
                // SAFETY: in_queue is a descriptor we just opened.
                unsafe { libc::mq_close(in_queue) };
                if is_host {
                    // SAFETY: name is a valid NUL-terminated string.
                    unsafe { libc::mq_unlink(in_c.as_ptr()) };
                }
                return Err(e);
            }
        };

        Ok(Self {
            id,
            is_host,
            in_queue,
            out_queue,
            in_name: in_c,
            out_name: out_c,
        })
    }

    /// Attempts to receive one queue message.
    ///
    /// # Errors
    ///
    /// See [`ReadError`].
    pub fn read(&mut self) -> Result<Vec<u8>, ReadError> {
        let mut buf = vec![0u8; MQ_MESSAGE_SIZE];
        // SAFETY: buf is valid for MQ_MESSAGE_SIZE bytes, which is at least
        // the queue's mq_msgsize.
        let n = unsafe {
            libc::mq_receive(
                self.in_queue,
                buf.as_mut_ptr().cast::<libc::c_char>(),
                buf.len(),
                std::ptr::null_mut(),
            )
        };
        if n < 0 {
            return match last_errno() {
                Errno::AGAIN => Err(ReadError::NoData),
                errno => Err(ReadError::Io(errno)),
            };
        }
        if n == 0 {
            return Err(ReadError::Closed);
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    /// Attempts to send one queue message.
    ///
    /// # Errors
    ///
    /// See [`WriteError`]. A full queue maps to [`WriteError::NotReady`].
    pub fn write(&mut self, message: &[u8]) -> Result<(), WriteError> {
        if message.len() > MQ_MESSAGE_SIZE {
            return Err(WriteError::TooLarge {
                len: message.len(),
            });
        }
        // SAFETY: message is valid for message.len() bytes.
        let rc = unsafe {
            libc::mq_send(
                self.out_queue,
                message.as_ptr().cast::<libc::c_char>(),
                message.len(),
                0,
            )
        };
        if rc == -1 {
            return match last_errno() {
                Errno::AGAIN => Err(WriteError::NotReady),
                errno => Err(WriteError::Io(errno)),
            };
        }
        Ok(())
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for MqConn {
    fn drop(&mut self) {
        // SAFETY: both descriptors were opened in `open` and are closed
        // exactly once here.
        unsafe {
            libc::mq_close(self.in_queue);
            libc::mq_close(self.out_queue);
        }
        if self.is_host {
            debug!(id = self.id, "closing message queue connection");
            // SAFETY: names are valid NUL-terminated strings.
            let rc_in = unsafe { libc::mq_unlink(self.in_name.as_ptr()) };
            let rc_out = unsafe { libc::mq_unlink(self.out_name.as_ptr()) };
            if rc_in == -1 || rc_out == -1 {
                warn!(id = self.id, errno = %last_errno(), "failed to unlink message queue");
            }
        }
    }
}

fn mq_open(name: &CString, direction: libc::c_int) -> Result<libc::mqd_t, SetupError> {
    let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
    attr.mq_maxmsg = MQ_MAX_MESSAGES;
    attr.mq_msgsize = MQ_MESSAGE_SIZE as libc::c_long;

    // SAFETY: name is NUL-terminated and attr outlives the call.
    let queue = unsafe {
        libc::mq_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_NONBLOCK | direction,
            0o666 as libc::mode_t,
            &attr as *const libc::mq_attr,
        )
    };
    if queue == -1 {
        return Err(SetupError::OpenQueue {
            name: name.to_string_lossy().into_owned(),
            errno: last_errno(),
        });
    }
    Ok(queue)
}

fn to_cstring(name: &str) -> Result<CString, SetupError> {
    CString::new(name).map_err(|_| SetupError::OpenQueue {
        name: name.to_owned(),
        errno: Errno::INVAL,
    })
}

fn last_errno() -> Errno {
    Errno::from_raw_os_error(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs(tag: &str) -> ChannelDirs {
        // Queue names are a kernel-global namespace; key them by pid so
        // parallel test runs do not collide.
        ChannelDirs::at("/tmp", format!("hearth-test-{}-{tag}", std::process::id()))
    }

    #[test]
    fn roundtrip_both_directions() {
        let dirs = dirs("rt");
        let mut host = MqConn::host(1, &dirs).unwrap();
        let mut client = MqConn::client(1, &dirs).unwrap();

        client.write(b"to host").unwrap();
        assert_eq!(host.read().unwrap(), b"to host");

        host.write(b"to client").unwrap();
        assert_eq!(client.read().unwrap(), b"to client");
    }

    #[test]
    fn message_boundaries_are_preserved() {
        let dirs = dirs("bounds");
        let mut host = MqConn::host(2, &dirs).unwrap();
        let mut client = MqConn::client(2, &dirs).unwrap();

        client.write(b"one").unwrap();
        client.write(b"two").unwrap();
        assert_eq!(host.read().unwrap(), b"one");
        assert_eq!(host.read().unwrap(), b"two");
    }

    #[test]
    fn empty_queue_reports_no_data() {
        let dirs = dirs("empty");
        let mut host = MqConn::host(3, &dirs).unwrap();
        assert_eq!(host.read().unwrap_err(), ReadError::NoData);
    }

    #[test]
    fn full_queue_reports_not_ready() {
        let dirs = dirs("full");
        let mut host = MqConn::host(4, &dirs).unwrap();
        for _ in 0..MQ_MAX_MESSAGES {
            host.write(b"x").unwrap();
        }
        assert_eq!(host.write(b"x").unwrap_err(), WriteError::NotReady);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let dirs = dirs("big");
        let mut host = MqConn::host(5, &dirs).unwrap();
        let big = vec![0u8; MQ_MESSAGE_SIZE + 1];
        assert!(matches!(
            host.write(&big).unwrap_err(),
            WriteError::TooLarge { .. }
        ));
    }
}
