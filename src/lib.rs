//! Single-host IPC chat.
//!
//! A `hearth` host brokers chat envelopes between client processes on the
//! same machine. Clients bootstrap with a real-time-signal handshake, then
//! exchange envelopes over one of three interchangeable transports: a
//! named-pipe pair, a POSIX message queue pair, or a UNIX domain stream
//! socket.
//!
//! The crate is organized leaf-first:
//!
//! - [`timing`]: one-shot timers driven by a shared tick thread.
//! - [`scheduler`]: worker pool plus dedicated repeating-task threads.
//! - [`conn`]: the non-blocking transport abstraction and its backends.
//! - [`signals`]: the out-of-band handshake channel.
//! - [`host`] / [`client`]: the broker and the peer session built on top.

pub mod client;
pub mod conn;
pub mod console;
pub mod host;
pub mod protocol;
pub mod scheduler;
pub mod signals;
pub mod timing;

mod trace;

pub use trace::init_tracing;
