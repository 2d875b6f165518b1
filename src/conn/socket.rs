//! UNIX domain stream socket backend.
//!
//! A stream has no inherent message boundary, so this backend frames every
//! message with a 4-byte big-endian length prefix. Reads go through a
//! resumable state machine (header bytes read so far, expected body length,
//! body bytes read so far) so a `read()` interrupted by `NoData` picks up
//! exactly where it left off, never re-reading or dropping partial data.
//!
//! The host listens and accepts lazily on first use (the client cannot
//! connect before the confirm signal arrives anyway); the client connects at
//! construction. mio's unix types are non-blocking from birth, which is
//! exactly the contract every operation here needs.

use std::io::{Read, Write};
use std::path::PathBuf;

use mio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::protocol::ClientId;

use super::paths::ChannelDirs;
use super::{
    read_error_from_io, write_error_from_io, ReadError, SetupError, WriteError, MAX_MESSAGE_SIZE,
};

use rustix::io::Errno;

const HEADER_LEN: usize = 4;

/// Resumable state of one in-flight inbound frame.
#[derive(Debug, Default)]
struct FrameProgress {
    in_progress: bool,
    header: [u8; HEADER_LEN],
    header_done: usize,
    expected: usize,
    body: Vec<u8>,
    body_done: usize,
}

impl FrameProgress {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One end of a stream-socket connection.
#[derive(Debug)]
pub struct SockConn {
    id: ClientId,
    is_host: bool,
    path: PathBuf,
    /// Present on the host until the client is accepted, then closed.
    listener: Option<UnixListener>,
    /// Present from construction on the client, from accept on the host.
    stream: Option<UnixStream>,
    frame: FrameProgress,
}

impl SockConn {
    /// Binds and listens on the derived path. Accepting is deferred to the
    /// first read/write attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Bind`] if the socket cannot be bound.
    pub fn host(id: ClientId, dirs: &ChannelDirs) -> Result<Self, SetupError> {
        let path = dirs.socket(id);
        // A stale socket file from a previous run must not block the bind.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(|source| SetupError::Bind {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            id,
            is_host: true,
            path,
            listener: Some(listener),
            stream: None,
            frame: FrameProgress::default(),
        })
    }

    /// Connects to the host's socket.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Connect`] if the connect fails.
    pub fn client(id: ClientId, dirs: &ChannelDirs) -> Result<Self, SetupError> {
        let path = dirs.socket(id);
        let stream = UnixStream::connect(&path).map_err(|source| SetupError::Connect {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            id,
            is_host: false,
            path,
            listener: None,
            stream: Some(stream),
            frame: FrameProgress::default(),
        })
    }

    /// Attempts to read one complete frame, resuming any partial frame from
    /// earlier calls.
    ///
    /// # Errors
    ///
    /// See [`ReadError`]; `NoData` leaves the partial-frame state intact.
    pub fn read(&mut self) -> Result<Vec<u8>, ReadError> {
        if !self.try_accept() {
            return Err(ReadError::NoData);
        }

        if !self.frame.in_progress {
            self.frame.reset();
            self.frame.in_progress = true;
        }

        // Phase 1: the length prefix.
        while self.frame.header_done < HEADER_LEN {
            let stream = self.stream.as_mut().ok_or(ReadError::Unknown)?;
            match stream.read(&mut self.frame.header[self.frame.header_done..]) {
                Ok(0) => {
                    self.frame.reset();
                    return Err(ReadError::Unknown);
                }
                Ok(n) => self.frame.header_done += n,
                Err(e) => {
                    let mapped = read_error_from_io(&e);
                    if mapped != ReadError::NoData {
                        self.frame.reset();
                    }
                    return Err(mapped);
                }
            }
        }

        // Header complete: size the body buffer once.
        if self.frame.expected == 0 {
            let expected = u32::from_be_bytes(self.frame.header) as usize;
            if expected == 0 {
                self.frame.reset();
                return Err(ReadError::Unknown);
            }
            if expected > MAX_MESSAGE_SIZE {
                self.frame.reset();
                return Err(ReadError::Io(Errno::MSGSIZE));
            }
            self.frame.expected = expected;
            self.frame.body = vec![0u8; expected];
            self.frame.body_done = 0;
        }

        // Phase 2: the body.
        while self.frame.body_done < self.frame.expected {
            let stream = self.stream.as_mut().ok_or(ReadError::Unknown)?;
            match stream.read(&mut self.frame.body[self.frame.body_done..]) {
                Ok(0) => {
                    self.frame.reset();
                    return Err(ReadError::Unknown);
                }
                Ok(n) => self.frame.body_done += n,
                Err(e) => {
                    let mapped = read_error_from_io(&e);
                    if mapped != ReadError::NoData {
                        self.frame.reset();
                    }
                    return Err(mapped);
                }
            }
        }

        self.frame.in_progress = false;
        Ok(std::mem::take(&mut self.frame.body))
    }

    /// Writes one frame: length prefix then payload, looping until flushed.
    ///
    /// # Errors
    ///
    /// See [`WriteError`].
    pub fn write(&mut self, message: &[u8]) -> Result<(), WriteError> {
        if !self.try_accept() {
            return Err(WriteError::NotReady);
        }
        if message.is_empty() {
            return Ok(());
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(WriteError::TooLarge {
                len: message.len(),
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + message.len());
        frame.extend_from_slice(&(message.len() as u32).to_be_bytes());
        frame.extend_from_slice(message);

        let stream = self.stream.as_mut().ok_or(WriteError::Unknown)?;
        let mut rest = frame.as_slice();
        while !rest.is_empty() {
            match stream.write(rest) {
                Ok(0) => return Err(WriteError::Unknown),
                Ok(n) => rest = &rest[n..],
                Err(e) => return Err(write_error_from_io(&e)),
            }
        }
        Ok(())
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Host side: accepts the pending client if one is waiting, closing the
    /// listener once a stream exists. Returns whether a stream is usable.
    fn try_accept(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        let Some(listener) = self.listener.as_ref() else {
            return false;
        };
        match listener.accept() {
            Ok((stream, _addr)) => {
                debug!(id = self.id, "socket client connected");
                self.stream = Some(stream);
                self.listener = None;
                true
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(e) => {
                warn!(id = self.id, error = %e, "accept failed");
                false
            }
        }
    }
}

impl Drop for SockConn {
    fn drop(&mut self) {
        if self.is_host {
            debug!(id = self.id, "closing socket connection");
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(id = self.id, error = %e, "failed to unlink socket path");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn scratch() -> (tempfile::TempDir, ChannelDirs) {
        let dir = tempfile::tempdir().unwrap();
        let dirs = ChannelDirs::at(dir.path(), "hearth-test");
        (dir, dirs)
    }

    /// Polls `read` until it yields data or a non-`NoData` error, with a
    /// deadline so a broken test fails instead of hanging.
    fn read_eventually(conn: &mut SockConn) -> Result<Vec<u8>, ReadError> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match conn.read() {
                Err(ReadError::NoData) => {
                    assert!(Instant::now() < deadline, "timed out waiting for frame");
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn roundtrip_both_directions() {
        let (_dir, dirs) = scratch();
        let mut host = SockConn::host(1, &dirs).unwrap();
        let mut client = SockConn::client(1, &dirs).unwrap();

        client.write(b"to host").unwrap();
        assert_eq!(read_eventually(&mut host).unwrap(), b"to host");

        host.write(b"to client").unwrap();
        assert_eq!(read_eventually(&mut client).unwrap(), b"to client");
    }

    #[test]
    fn frames_keep_boundaries() {
        let (_dir, dirs) = scratch();
        let mut host = SockConn::host(2, &dirs).unwrap();
        let mut client = SockConn::client(2, &dirs).unwrap();

        client.write(b"first").unwrap();
        client.write(b"second").unwrap();
        assert_eq!(read_eventually(&mut host).unwrap(), b"first");
        assert_eq!(read_eventually(&mut host).unwrap(), b"second");
    }

    #[test]
    fn partial_frame_resumes_across_no_data() {
        let (_dir, dirs) = scratch();
        let mut host = SockConn::host(3, &dirs).unwrap();

        // Raw std stream so the frame can be dribbled out in pieces.
        let mut raw = std::os::unix::net::UnixStream::connect(dirs.socket(3)).unwrap();

        let payload = b"split right down the middle";
        let header = (payload.len() as u32).to_be_bytes();

        // Half the header first.
        raw.write_all(&header[..2]).unwrap();
        raw.flush().unwrap();
        // Accept happens on the first read attempt; mid-header reads must
        // report NoData without losing the bytes already consumed.
        let deadline = Instant::now() + Duration::from_secs(2);
        while host.frame.header_done < 2 {
            assert_eq!(host.read().unwrap_err(), ReadError::NoData);
            assert!(Instant::now() < deadline, "header bytes never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }

        // Rest of the header and part of the body.
        raw.write_all(&header[2..]).unwrap();
        raw.write_all(&payload[..5]).unwrap();
        raw.flush().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while host.frame.body_done < 5 {
            assert_eq!(host.read().unwrap_err(), ReadError::NoData);
            assert!(Instant::now() < deadline, "body bytes never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }

        // Remainder completes the frame.
        raw.write_all(&payload[5..]).unwrap();
        raw.flush().unwrap();
        assert_eq!(read_eventually(&mut host).unwrap(), payload);
    }

    #[test]
    fn zero_length_frame_is_unknown() {
        let (_dir, dirs) = scratch();
        let mut host = SockConn::host(4, &dirs).unwrap();
        let mut raw = std::os::unix::net::UnixStream::connect(dirs.socket(4)).unwrap();
        raw.write_all(&0u32.to_be_bytes()).unwrap();
        raw.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match host.read() {
                Err(ReadError::NoData) => {
                    assert!(Instant::now() < deadline, "frame never arrived");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(ReadError::Unknown) => break,
                other => panic!("expected Unknown, got {other:?}"),
            }
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (_dir, dirs) = scratch();
        let mut host = SockConn::host(5, &dirs).unwrap();
        let mut raw = std::os::unix::net::UnixStream::connect(dirs.socket(5)).unwrap();
        raw.write_all(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes())
            .unwrap();
        raw.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match host.read() {
                Err(ReadError::NoData) => {
                    assert!(Instant::now() < deadline, "frame never arrived");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(ReadError::Io(errno)) => {
                    assert_eq!(errno, Errno::MSGSIZE);
                    break;
                }
                other => panic!("expected Io(EMSGSIZE), got {other:?}"),
            }
        }
    }

    #[test]
    fn no_client_yet_is_no_data() {
        let (_dir, dirs) = scratch();
        let mut host = SockConn::host(6, &dirs).unwrap();
        assert_eq!(host.read().unwrap_err(), ReadError::NoData);
        assert_eq!(host.write(b"x").unwrap_err(), WriteError::NotReady);
    }

    #[test]
    fn connect_without_host_fails_setup() {
        let (_dir, dirs) = scratch();
        assert!(SockConn::client(99, &dirs).is_err());
    }

    #[test]
    fn host_drop_unlinks_socket_path() {
        let (_dir, dirs) = scratch();
        let path = dirs.socket(7);
        {
            let _host = SockConn::host(7, &dirs).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
