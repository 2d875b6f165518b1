//! Named-pipe backend: two unidirectional fifos, one per direction.
//!
//! The host creates both fifos and unlinks them when the connection is
//! dropped; the client opens existing paths and only closes its own
//! descriptors. Framing is raw: one `read` syscall's worth of bytes is one
//! message, capped at [`MAX_MESSAGE_SIZE`].

use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use rustix::fs::{self, Mode, OFlags};
use rustix::io::Errno;
use tracing::{debug, warn};

use crate::protocol::ClientId;

use super::paths::ChannelDirs;
use super::{ReadError, SetupError, WriteError, MAX_MESSAGE_SIZE};

/// One end of a named-pipe pair.
#[derive(Debug)]
pub struct FifoConn {
    id: ClientId,
    is_host: bool,
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    read_path: PathBuf,
    write_path: PathBuf,
    /// Set once the peer has produced data. A reader-less non-blocking fifo
    /// reports EOF continuously, so EOF only means "closed" after this.
    connected: bool,
}

impl FifoConn {
    /// Creates both fifos and opens the host ends.
    ///
    /// The host's write end is opened `O_RDWR`: a write-only non-blocking
    /// open would fail with `ENXIO` until the client opens its read end.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if a fifo cannot be created or opened; any
    /// fifo already created is unlinked before returning.
    pub fn host(id: ClientId, dirs: &ChannelDirs) -> Result<Self, SetupError> {
        let read_path = dirs.fifo_c2h(id);
        let write_path = dirs.fifo_h2c(id);

        mkfifo(&read_path)?;
        if let Err(e) = mkfifo(&write_path) {
            let _ = fs::unlink(&read_path);
            return Err(e);
        }

        let opened = open_pair(&read_path, &write_path, OFlags::RDWR);
        match opened {
            Ok((read_fd, write_fd)) => Ok(Self {
                id,
                is_host: true,
                read_fd,
                write_fd,
                read_path,
                write_path,
                connected: false,
            }),
            Err(e) => {
                let _ = fs::unlink(&read_path);
                let _ = fs::unlink(&write_path);
                Err(e)
            }
        }
    }

    /// Opens the client ends of fifos the host already created.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if either fifo cannot be opened.
    pub fn client(id: ClientId, dirs: &ChannelDirs) -> Result<Self, SetupError> {
        let read_path = dirs.fifo_h2c(id);
        let write_path = dirs.fifo_c2h(id);
        let (read_fd, write_fd) = open_pair(&read_path, &write_path, OFlags::WRONLY)?;
        Ok(Self {
            id,
            is_host: false,
            read_fd,
            write_fd,
            read_path,
            write_path,
            connected: false,
        })
    }

    /// Attempts to read one message.
    ///
    /// # Errors
    ///
    /// See [`ReadError`].
    pub fn read(&mut self) -> Result<Vec<u8>, ReadError> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        match rustix::io::read(&self.read_fd, &mut *buf) {
            Ok(0) => {
                if self.connected {
                    Err(ReadError::Closed)
                } else {
                    // No writer has opened the far end yet.
                    Err(ReadError::NoData)
                }
            }
            Ok(n) => {
                if !self.connected {
                    debug!(id = self.id, "fifo peer connected");
                    self.connected = true;
                }
                buf.truncate(n);
                Ok(buf)
            }
            Err(Errno::AGAIN) => Err(ReadError::NoData),
            Err(errno) => Err(ReadError::Io(errno)),
        }
    }

    /// Writes one message, looping until the whole buffer is flushed.
    ///
    /// # Errors
    ///
    /// See [`WriteError`].
    pub fn write(&mut self, message: &[u8]) -> Result<(), WriteError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(WriteError::TooLarge {
                len: message.len(),
            });
        }
        let mut rest = message;
        while !rest.is_empty() {
            match rustix::io::write(&self.write_fd, rest) {
                Ok(0) => return Err(WriteError::Unknown),
                Ok(n) => rest = &rest[n..],
                Err(Errno::AGAIN) => return Err(WriteError::NotReady),
                Err(errno) => return Err(WriteError::Io(errno)),
            }
        }
        Ok(())
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for FifoConn {
    fn drop(&mut self) {
        if self.is_host {
            debug!(id = self.id, "closing fifo connection");
            if let Err(errno) = fs::unlink(&self.read_path) {
                warn!(id = self.id, %errno, "failed to unlink fifo");
            }
            if let Err(errno) = fs::unlink(&self.write_path) {
                warn!(id = self.id, %errno, "failed to unlink fifo");
            }
        }
    }
}

fn mkfifo(path: &Path) -> Result<(), SetupError> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| SetupError::CreateFifo {
        path: path.display().to_string(),
        errno: Errno::INVAL,
    })?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of
    // the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc == -1 {
        let errno = Errno::from_raw_os_error(
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        );
        if errno != Errno::EXIST {
            return Err(SetupError::CreateFifo {
                path: path.display().to_string(),
                errno,
            });
        }
    }
    Ok(())
}

fn open_pair(
    read_path: &Path,
    write_path: &Path,
    write_flags: OFlags,
) -> Result<(OwnedFd, OwnedFd), SetupError> {
    let read_fd = fs::open(
        read_path,
        OFlags::RDONLY | OFlags::NONBLOCK,
        Mode::empty(),
    )
    .map_err(|errno| SetupError::Open {
        path: read_path.display().to_string(),
        errno,
    })?;
    let write_fd = fs::open(write_path, write_flags | OFlags::NONBLOCK, Mode::empty()).map_err(
        |errno| SetupError::Open {
            path: write_path.display().to_string(),
            errno,
        },
    )?;
    Ok((read_fd, write_fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, ChannelDirs) {
        let dir = tempfile::tempdir().unwrap();
        let dirs = ChannelDirs::at(dir.path(), "hearth-test");
        (dir, dirs)
    }

    #[test]
    fn roundtrip_both_directions() {
        let (_dir, dirs) = scratch();
        let mut host = FifoConn::host(1, &dirs).unwrap();
        let mut client = FifoConn::client(1, &dirs).unwrap();

        client.write(b"to host").unwrap();
        assert_eq!(host.read().unwrap(), b"to host");

        host.write(b"to client").unwrap();
        assert_eq!(client.read().unwrap(), b"to client");
    }

    #[test]
    fn empty_fifo_reports_no_data() {
        let (_dir, dirs) = scratch();
        let mut host = FifoConn::host(2, &dirs).unwrap();
        let _client = FifoConn::client(2, &dirs).unwrap();
        assert_eq!(host.read().unwrap_err(), ReadError::NoData);
    }

    #[test]
    fn missing_peer_is_no_data_until_first_message() {
        let (_dir, dirs) = scratch();
        let mut host = FifoConn::host(3, &dirs).unwrap();
        // No client yet: the read end sees EOF, which must not count as a
        // closed peer before anyone connected.
        assert_eq!(host.read().unwrap_err(), ReadError::NoData);
    }

    #[test]
    fn peer_disappearing_after_data_is_closed() {
        let (_dir, dirs) = scratch();
        let mut host = FifoConn::host(4, &dirs).unwrap();
        {
            let mut client = FifoConn::client(4, &dirs).unwrap();
            client.write(b"hi").unwrap();
            assert_eq!(host.read().unwrap(), b"hi");
        }
        // Client dropped: its write end is closed, so the host sees EOF.
        assert_eq!(host.read().unwrap_err(), ReadError::Closed);
    }

    #[test]
    fn host_drop_unlinks_paths() {
        let (_dir, dirs) = scratch();
        let read_path = dirs.fifo_c2h(5);
        {
            let _host = FifoConn::host(5, &dirs).unwrap();
            assert!(read_path.exists());
        }
        assert!(!read_path.exists());
    }

    #[test]
    fn client_missing_fifos_fail_setup() {
        let (_dir, dirs) = scratch();
        assert!(FifoConn::client(99, &dirs).is_err());
    }
}
