//! Non-blocking transport abstraction.
//!
//! A [`Transport`] carries opaque byte messages between the host and one
//! client. Three interchangeable backends implement the same contract:
//!
//! - [`fifo::FifoConn`]: a pair of named pipes, one per direction;
//! - [`mq::MqConn`]: a pair of POSIX message queues;
//! - [`socket::SockConn`]: a UNIX domain stream socket with an explicit
//!   4-byte length prefix.
//!
//! Every operation is non-blocking end-to-end: `read` returns
//! [`ReadError::NoData`] and `write` returns [`WriteError::NotReady`] when
//! the channel is not ready, and the caller retries on its next poll tick.
//! The backend set is closed, fixed by the handshake payload encoding
//! (1 = pipe, 2 = queue, 3 = socket), so [`Transport`] is an enum, not an
//! open trait object.

pub mod fifo;
pub mod mq;
pub mod paths;
pub mod socket;

use rustix::io::Errno;
use thiserror::Error;

use crate::protocol::ClientId;

use self::fifo::FifoConn;
use self::mq::MqConn;
use self::paths::ChannelDirs;
use self::socket::SockConn;

/// Ceiling on a single message for the pipe and socket backends.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Outcome of a non-blocking read attempt.
///
/// `NoData` is not a failure, it means "try again later". Everything else
/// is terminal for the connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Nothing available right now; retry on the next poll tick.
    #[error("no data available")]
    NoData,
    /// The read syscall failed.
    #[error("read failed: {0}")]
    Io(Errno),
    /// The channel is in a state the protocol cannot recover from
    /// (peer vanished mid-frame, zero-length frame header).
    #[error("channel in unrecoverable state")]
    Unknown,
    /// The peer closed its end.
    #[error("peer closed the channel")]
    Closed,
}

/// Outcome of a non-blocking write attempt.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The channel cannot accept data right now; retry later.
    #[error("channel temporarily not ready")]
    NotReady,
    /// The write syscall failed.
    #[error("write failed: {0}")]
    Io(Errno),
    /// A zero-byte write made no progress; the channel is wedged.
    #[error("write made no progress")]
    Unknown,
    /// The message exceeds [`MAX_MESSAGE_SIZE`] (or the queue's limit).
    #[error("message of {len} bytes exceeds the channel limit")]
    TooLarge { len: usize },
}

/// Failure to construct a transport end: resource acquisition during
/// mkfifo/mq_open/bind/connect. Terminal for the handshake of the one
/// client involved; the peer's visible symptom is its own timeout.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to create fifo {path}: {errno}")]
    CreateFifo { path: String, errno: Errno },
    #[error("failed to open {path}: {errno}")]
    Open { path: String, errno: Errno },
    #[error("failed to open message queue {name}: {errno}")]
    OpenQueue { name: String, errno: Errno },
    #[error("failed to bind socket {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The transport kind a client requests in its handshake signal.
///
/// The discriminants are the on-the-wire handshake codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Kind {
    Fifo = 1,
    Queue = 2,
    Socket = 3,
}

impl Kind {
    /// Decodes a handshake payload. Unknown codes yield `None`; the host
    /// ignores such requests and the client times out.
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Fifo),
            2 => Some(Self::Queue),
            3 => Some(Self::Socket),
            _ => None,
        }
    }

    /// The handshake code for this kind.
    #[must_use]
    pub fn code(self) -> i64 {
        self as i64
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fifo => f.write_str("fifo"),
            Self::Queue => f.write_str("mqueue"),
            Self::Socket => f.write_str("socket"),
        }
    }
}

/// One end of a connection, over whichever backend the handshake chose.
#[derive(Debug)]
pub enum Transport {
    Fifo(FifoConn),
    Queue(MqConn),
    Socket(SockConn),
}

impl Transport {
    /// Opens the host-side end for connection `id`, creating the underlying
    /// OS resources.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if any resource cannot be created or opened.
    pub fn open_host(kind: Kind, id: ClientId, dirs: &ChannelDirs) -> Result<Self, SetupError> {
        match kind {
            Kind::Fifo => FifoConn::host(id, dirs).map(Self::Fifo),
            Kind::Queue => MqConn::host(id, dirs).map(Self::Queue),
            Kind::Socket => SockConn::host(id, dirs).map(Self::Socket),
        }
    }

    /// Opens the client-side end for connection `id`, attaching to resources
    /// the host already created.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] if the resources cannot be opened.
    pub fn open_client(kind: Kind, id: ClientId, dirs: &ChannelDirs) -> Result<Self, SetupError> {
        match kind {
            Kind::Fifo => FifoConn::client(id, dirs).map(Self::Fifo),
            Kind::Queue => MqConn::client(id, dirs).map(Self::Queue),
            Kind::Socket => SockConn::client(id, dirs).map(Self::Socket),
        }
    }

    /// Attempts to read one message.
    ///
    /// # Errors
    ///
    /// [`ReadError::NoData`] when nothing is ready; any other error is
    /// terminal for the connection.
    pub fn read(&mut self) -> Result<Vec<u8>, ReadError> {
        match self {
            Self::Fifo(c) => c.read(),
            Self::Queue(c) => c.read(),
            Self::Socket(c) => c.read(),
        }
    }

    /// Attempts to write one message.
    ///
    /// # Errors
    ///
    /// [`WriteError::NotReady`] when the channel cannot accept data yet;
    /// any other error is terminal for the connection.
    pub fn write(&mut self, message: &[u8]) -> Result<(), WriteError> {
        match self {
            Self::Fifo(c) => c.write(message),
            Self::Queue(c) => c.write(message),
            Self::Socket(c) => c.write(message),
        }
    }

    /// The connection id this transport is keyed by.
    #[must_use]
    pub fn id(&self) -> ClientId {
        match self {
            Self::Fifo(c) => c.id(),
            Self::Queue(c) => c.id(),
            Self::Socket(c) => c.id(),
        }
    }

    /// The backend kind, mostly for logging.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Fifo(_) => Kind::Fifo,
            Self::Queue(_) => Kind::Queue,
            Self::Socket(_) => Kind::Socket,
        }
    }
}

/// Maps an `std::io::Error` from a non-blocking call onto the read taxonomy.
pub(crate) fn read_error_from_io(err: &std::io::Error) -> ReadError {
    if err.kind() == std::io::ErrorKind::WouldBlock {
        ReadError::NoData
    } else {
        ReadError::Io(errno_of(err))
    }
}

/// Maps an `std::io::Error` from a non-blocking call onto the write taxonomy.
pub(crate) fn write_error_from_io(err: &std::io::Error) -> WriteError {
    if err.kind() == std::io::ErrorKind::WouldBlock {
        WriteError::NotReady
    } else {
        WriteError::Io(errno_of(err))
    }
}

pub(crate) fn errno_of(err: &std::io::Error) -> Errno {
    Errno::from_raw_os_error(err.raw_os_error().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_the_handshake_values() {
        assert_eq!(Kind::Fifo.code(), 1);
        assert_eq!(Kind::Queue.code(), 2);
        assert_eq!(Kind::Socket.code(), 3);
    }

    #[test]
    fn unknown_codes_are_rejected() {
        assert_eq!(Kind::from_code(0), None);
        assert_eq!(Kind::from_code(4), None);
        assert_eq!(Kind::from_code(-1), None);
        assert_eq!(Kind::from_code(2), Some(Kind::Queue));
    }
}
