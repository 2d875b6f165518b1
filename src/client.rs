//! Client-side session: handshake, inbound display loop, outbound sends.
//!
//! A session moves through three phases. It starts in `Handshake` after
//! queueing the begin signal at the host; the confirm signal carries the
//! assigned id and flips it to `Active` with an open transport; anything
//! fatal (handshake timeout, transport setup failure, a read error, the
//! host's own leave notice) lands it in `Terminated`, which is final.
//!
//! All phase transitions happen on the serve task's thread or the timer
//! tick thread, serialized by the state mutex. The owner polls
//! [`ClientSession::is_terminated`] to know when to exit.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::conn::paths::ChannelDirs;
use crate::conn::{Kind, ReadError, Transport};
use crate::console::Console;
use crate::protocol::{self, ClientId, Envelope, Payload, HOST_ID};
use crate::scheduler::TaskScheduler;
use crate::signals::handler::SingleSignalHandler;
use crate::signals::{self, SignalError};
use crate::timing::Timer;

/// How long to wait for the host's confirm before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Cadence of the serve loop.
const SERVE_INTERVAL: Duration = Duration::from_millis(1);

enum Phase {
    Handshake,
    Active { id: ClientId, conn: Transport },
    Terminated,
}

struct ClientInner {
    kind: Kind,
    dirs: ChannelDirs,
    console: Arc<dyn Console>,
    phase: Mutex<Phase>,
    timeout: Timer,
}

impl ClientInner {
    /// Confirm received: open our end of the transport the host created.
    ///
    /// The payload travels as a raw signal word; anything that is not a
    /// positive id is ignored, like an unknown kind on the host side.
    fn confirmed(&self, value: i64) {
        let Some(id) = ClientId::try_from(value).ok().filter(|&id| id != HOST_ID) else {
            warn!(value, "confirm with invalid id ignored");
            return;
        };
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(*phase, Phase::Handshake) {
            debug!(id, "stale confirm ignored");
            return;
        }
        self.timeout.stop();
        match Transport::open_client(self.kind, id, &self.dirs) {
            Ok(conn) => {
                info!(id, kind = %self.kind, "connected");
                self.console.info(&format!("connected as client {id}"));
                *phase = Phase::Active { id, conn };
            }
            Err(err) => {
                warn!(id, %err, "transport setup failed");
                self.console.info("could not open the channel, giving up");
                *phase = Phase::Terminated;
            }
        }
    }

    fn handshake_timed_out(&self) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*phase, Phase::Handshake) {
            warn!("handshake timed out");
            self.console.info("no answer from the host, giving up");
            *phase = Phase::Terminated;
        }
    }

    /// One serve tick: try to read and display a message.
    fn step(&self) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        let Phase::Active { id, ref mut conn } = *phase else {
            return;
        };
        let bytes = match conn.read() {
            Ok(bytes) => bytes,
            Err(ReadError::NoData) => return,
            Err(err) => {
                warn!(%err, "connection lost");
                self.console.info("connection to the host lost");
                *phase = Phase::Terminated;
                return;
            }
        };
        match protocol::decode(&bytes) {
            Ok(envelope) => {
                if self.display(id, &envelope) {
                    *phase = Phase::Terminated;
                }
            }
            Err(err) => {
                warn!(%err, "malformed message from the host");
                *phase = Phase::Terminated;
            }
        }
    }

    /// Shows one inbound envelope. Returns true if the session should end.
    fn display(&self, my_id: ClientId, envelope: &Envelope) -> bool {
        match envelope.payload {
            Payload::Broadcast { from_id, ref text } => {
                self.console.broadcast_msg(from_id, text);
            }
            Payload::Private { from_id, ref text, .. } => {
                self.console.private_msg(from_id, text);
            }
            Payload::Join { client_id } => {
                self.console.system(&format!("client {client_id} joined"));
            }
            Payload::Leave { client_id } if client_id == HOST_ID => {
                self.console.system("the host shut down");
                return true;
            }
            Payload::Leave { client_id } => {
                self.console.system(&format!("client {client_id} left"));
            }
            Payload::KillNotice { client_id } if client_id == my_id => {
                self.console.system("removed by the host");
                return true;
            }
            Payload::KillNotice { client_id } => {
                self.console
                    .system(&format!("client {client_id} was removed"));
            }
        }
        false
    }

    /// Best-effort send of one envelope over the active transport.
    fn send(&self, envelope: &Envelope) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        let Phase::Active { ref mut conn, .. } = *phase else {
            self.console.info("not connected");
            return;
        };
        let bytes = match protocol::encode(envelope) {
            Ok(b) => b,
            Err(err) => {
                warn!(%err, "failed to encode message");
                return;
            }
        };
        if let Err(err) = conn.write(&bytes) {
            warn!(%err, "send failed, message dropped");
        }
    }

    fn id(&self) -> Option<ClientId> {
        match *self.phase.lock().unwrap_or_else(|e| e.into_inner()) {
            Phase::Active { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Client-side error surface.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// A running client session. Dropping it stops its threads.
pub struct ClientSession {
    inner: Arc<ClientInner>,
    scheduler: Arc<TaskScheduler>,
    // Keeps the confirm-signal disposition alive; polled by the serve task.
    _confirm: Arc<SingleSignalHandler>,
}

impl ClientSession {
    /// Starts a handshake with the host at `host_pid` over `kind`, using
    /// the environment's runtime directory.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the confirm handler cannot be installed
    /// or the begin signal cannot be queued.
    pub fn connect(
        host_pid: libc::pid_t,
        kind: Kind,
        console: Arc<dyn Console>,
    ) -> Result<Self, ClientError> {
        Self::connect_in(host_pid, kind, ChannelDirs::from_env(), console)
    }

    /// Same as [`ClientSession::connect`] with an explicit directory layout.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the confirm handler cannot be installed
    /// or the begin signal cannot be queued.
    pub fn connect_in(
        host_pid: libc::pid_t,
        kind: Kind,
        dirs: ChannelDirs,
        console: Arc<dyn Console>,
    ) -> Result<Self, ClientError> {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let watcher = weak.clone();
            let timeout = Timer::new(CONNECT_TIMEOUT, move || {
                if let Some(inner) = watcher.upgrade() {
                    inner.handshake_timed_out();
                }
            });
            ClientInner {
                kind,
                dirs,
                console,
                phase: Mutex::new(Phase::Handshake),
                timeout,
            }
        });

        // Install the confirm handler before the begin signal leaves, so a
        // fast host answer cannot be missed.
        let confirm = {
            let inner = Arc::clone(&inner);
            Arc::new(SingleSignalHandler::install(
                signals::confirm_signo(),
                move |_pid, value| inner.confirmed(value),
            )?)
        };
        inner.timeout.start();
        signals::send_begin(host_pid, kind)?;
        info!(host_pid, %kind, "handshake started");

        let scheduler = Arc::new(TaskScheduler::with_workers(1));
        {
            let inner = Arc::clone(&inner);
            let handler = Arc::clone(&confirm);
            scheduler.spawn_repeated("serve", SERVE_INTERVAL, move || {
                handler.poll();
                inner.step();
            });
        }

        Ok(Self {
            inner,
            scheduler,
            _confirm: confirm,
        })
    }

    /// The id the host assigned, once active.
    #[must_use]
    pub fn id(&self) -> Option<ClientId> {
        self.inner.id()
    }

    /// Whether the session reached its final state.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(
            *self.inner.phase.lock().unwrap_or_else(|e| e.into_inner()),
            Phase::Terminated
        )
    }

    /// Sends a broadcast, echoing it locally first.
    pub fn send_broadcast(&self, text: &str) {
        let Some(id) = self.inner.id() else {
            self.inner.console.info("not connected");
            return;
        };
        self.inner.console.broadcast_msg(id, text);
        self.inner.send(&Envelope::broadcast(id, text));
    }

    /// Sends a private message to one peer.
    pub fn send_private(&self, to: ClientId, text: &str) {
        let Some(id) = self.inner.id() else {
            self.inner.console.info("not connected");
            return;
        };
        self.inner.console.info(&format!("to client {to}: {text}"));
        self.inner.send(&Envelope::private(id, to, text));
    }

    /// Announces departure to the host and ends the session.
    pub fn leave(&self) {
        if let Some(id) = self.inner.id() {
            self.inner.send(&Envelope::leave(id));
        }
        let mut phase = self.inner.phase.lock().unwrap_or_else(|e| e.into_inner());
        *phase = Phase::Terminated;
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;

    struct RecordingConsole {
        lines: Mutex<Vec<String>>,
    }

    impl RecordingConsole {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                lines: Mutex::new(Vec::new()),
            })
        }

        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
    }

    impl Console for RecordingConsole {
        fn info(&self, line: &str) {
            self.lines.lock().unwrap().push(format!("info:{line}"));
        }
        fn system(&self, line: &str) {
            self.lines.lock().unwrap().push(format!("system:{line}"));
        }
        fn private_msg(&self, from: ClientId, text: &str) {
            self.lines.lock().unwrap().push(format!("pm:{from}:{text}"));
        }
        fn broadcast_msg(&self, from: ClientId, text: &str) {
            self.lines.lock().unwrap().push(format!("bc:{from}:{text}"));
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        console: Arc<RecordingConsole>,
        inner: ClientInner,
        host_conn: Transport,
    }

    impl Fixture {
        /// A handshake-phase inner with the host side of the transport
        /// already in place, so `confirmed` can attach to it.
        fn new(id: ClientId) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let dirs = ChannelDirs::at(dir.path(), "hearth-test");
            let host_conn = Transport::open_host(Kind::Fifo, id, &dirs).unwrap();
            let console = RecordingConsole::new();
            let inner = ClientInner {
                kind: Kind::Fifo,
                dirs,
                console: console.clone(),
                phase: Mutex::new(Phase::Handshake),
                timeout: Timer::new(CONNECT_TIMEOUT, || {}),
            };
            Self {
                _dir: dir,
                console,
                inner,
                host_conn,
            }
        }

        fn push(&mut self, envelope: &Envelope) {
            self.host_conn.write(&encode(envelope).unwrap()).unwrap();
        }

        fn terminated(&self) -> bool {
            matches!(*self.inner.phase.lock().unwrap(), Phase::Terminated)
        }
    }

    #[test]
    fn confirm_activates_the_session() {
        let fx = Fixture::new(5);
        fx.inner.confirmed(5);
        assert_eq!(fx.inner.id(), Some(5));
    }

    #[test]
    fn invalid_confirm_payloads_are_ignored() {
        let fx = Fixture::new(5);
        fx.inner.confirmed(-3);
        fx.inner.confirmed(0);
        assert!(matches!(*fx.inner.phase.lock().unwrap(), Phase::Handshake));
        assert_eq!(fx.inner.id(), None);
    }

    #[test]
    fn confirm_without_host_resources_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let console = RecordingConsole::new();
        let inner = ClientInner {
            kind: Kind::Fifo,
            dirs: ChannelDirs::at(dir.path(), "hearth-test"),
            console: console.clone(),
            phase: Mutex::new(Phase::Handshake),
            timeout: Timer::new(CONNECT_TIMEOUT, || {}),
        };
        inner.confirmed(9);
        assert!(matches!(*inner.phase.lock().unwrap(), Phase::Terminated));
    }

    #[test]
    fn inbound_messages_are_displayed() {
        let mut fx = Fixture::new(5);
        fx.inner.confirmed(5);

        fx.push(&Envelope::broadcast(2, "hello"));
        fx.inner.step();
        fx.push(&Envelope::private(3, 5, "psst"));
        fx.inner.step();
        fx.push(&Envelope::join(7));
        fx.inner.step();

        let lines = fx.console.lines();
        assert!(lines.contains(&"bc:2:hello".to_owned()));
        assert!(lines.contains(&"pm:3:psst".to_owned()));
        assert!(lines.contains(&"system:client 7 joined".to_owned()));
        assert!(!fx.terminated());
    }

    #[test]
    fn host_leave_ends_the_session() {
        let mut fx = Fixture::new(5);
        fx.inner.confirmed(5);
        fx.push(&Envelope::leave(HOST_ID));
        fx.inner.step();
        assert!(fx.terminated());
    }

    #[test]
    fn own_kill_notice_ends_the_session() {
        let mut fx = Fixture::new(5);
        fx.inner.confirmed(5);
        fx.push(&Envelope::kill_notice(5));
        fx.inner.step();
        assert!(fx.terminated());
    }

    #[test]
    fn malformed_inbound_ends_the_session() {
        let mut fx = Fixture::new(5);
        fx.inner.confirmed(5);
        fx.host_conn.write(&[0xff, 0xff, 0xff]).unwrap();
        fx.inner.step();
        assert!(fx.terminated());
    }

    #[test]
    fn timeout_in_handshake_terminates() {
        let fx = Fixture::new(5);
        fx.inner.handshake_timed_out();
        assert!(fx.terminated());
    }

    #[test]
    fn timeout_after_activation_is_ignored() {
        let fx = Fixture::new(5);
        fx.inner.confirmed(5);
        fx.inner.handshake_timed_out();
        assert!(!fx.terminated());
    }

    #[test]
    fn outbound_reaches_the_host() {
        let mut fx = Fixture::new(5);
        fx.inner.confirmed(5);
        fx.inner.send(&Envelope::broadcast(5, "hi"));
        let bytes = fx.host_conn.read().unwrap();
        assert!(matches!(
            protocol::decode(&bytes).unwrap().payload,
            Payload::Broadcast { from_id: 5, .. }
        ));
    }
}
