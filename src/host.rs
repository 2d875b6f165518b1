//! The broker: handshake acceptance, client registry, message routing.
//!
//! A [`ChatHost`] owns the begin-signal handler and three repeating
//! scheduler tasks: one polls the handshake queue, one polls every client
//! connection for inbound bytes, one prunes doomed clients. Successful reads
//! are handed to the pool as one-shot decode-and-route jobs so a slow
//! decode never stalls the poll cadence.
//!
//! Removal is two-phase. Anything that condemns a client (its own `Leave`,
//! a dead or misbehaving connection, the inactivity timer) only marks it in
//! the doomed map; the prune task later swaps that map out and erases the
//! entries under the registry write lock. The first condemnation wins, and
//! only host-initiated removals escalate to `SIGKILL`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::conn::{Kind, ReadError, Transport, WriteError};
use crate::console::Console;
use crate::protocol::{self, ClientId, Envelope, Payload, HOST_ID};
use crate::scheduler::TaskScheduler;
use crate::signals::handler::MultiSignalHandler;
use crate::signals::{self, SignalError};
use crate::timing::Timer;

use crate::conn::paths::ChannelDirs;

/// Cadence of the handshake-queue poll.
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Cadence of the per-connection read poll.
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Cadence of the doomed-client sweep.
const PRUNE_INTERVAL: Duration = Duration::from_millis(500);
/// Silence threshold after which a client is presumed dead.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Who condemned a client. Host-initiated removals also kill the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeleteOrigin {
    Client,
    Host,
}

pub(crate) struct ClientEntry {
    id: ClientId,
    pid: libc::pid_t,
    conn: Mutex<Transport>,
    inactivity: Timer,
}

impl ClientEntry {
    /// Best-effort write; routing never fails the caller over one slow peer.
    fn write(&self, bytes: &[u8]) {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match conn.write(bytes) {
            Ok(()) => {}
            Err(WriteError::NotReady) => {
                warn!(id = self.id, "peer not accepting data, message dropped");
            }
            Err(err) => {
                warn!(id = self.id, %err, "write to peer failed, message dropped");
            }
        }
    }
}

pub(crate) struct HostInner {
    dirs: ChannelDirs,
    console: Arc<dyn Console>,
    scheduler: Arc<TaskScheduler>,
    next_id: AtomicU64,
    clients: RwLock<HashMap<ClientId, Arc<ClientEntry>>>,
    doomed: Mutex<HashMap<ClientId, DeleteOrigin>>,
}

impl HostInner {
    /// Handles one handshake begin event.
    fn accept(self: &Arc<Self>, pid: libc::pid_t, code: i64) {
        let Some(kind) = Kind::from_code(code) else {
            // Unknown transport code: no reply, the requester times out.
            warn!(pid, code, "handshake with unknown transport code ignored");
            return;
        };
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let transport = match Transport::open_host(kind, id, &self.dirs) {
            Ok(t) => t,
            Err(err) => {
                error!(pid, id, %kind, %err, "failed to set up transport, rejecting client");
                return;
            }
        };
        self.insert_entry(id, pid, transport);
        info!(id, pid, %kind, "client connected");

        if let Err(err) = signals::send_confirm(pid, id) {
            warn!(id, pid, %err, "could not confirm handshake, dropping client");
            self.mark_doomed(id, DeleteOrigin::Host);
            return;
        }
        self.console.system(&format!("client {id} joined"));
        self.fan_out(&Envelope::join(id), id);
    }

    fn insert_entry(self: &Arc<Self>, id: ClientId, pid: libc::pid_t, transport: Transport) {
        let watcher = Arc::downgrade(self);
        let inactivity = Timer::new(INACTIVITY_TIMEOUT, move || {
            if let Some(inner) = watcher.upgrade() {
                inner.expire(id);
            }
        });
        inactivity.start();
        let entry = Arc::new(ClientEntry {
            id,
            pid,
            conn: Mutex::new(transport),
            inactivity,
        });
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, entry);
    }

    /// Inactivity deadline hit: announce the kill and condemn the client.
    fn expire(&self, id: ClientId) {
        info!(id, "client inactive, scheduling removal");
        self.console.system(&format!("client {id} timed out"));
        self.fan_out(&Envelope::kill_notice(id), id);
        self.mark_doomed(id, DeleteOrigin::Host);
    }

    fn mark_doomed(&self, id: ClientId, origin: DeleteOrigin) {
        self.doomed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_insert(origin);
    }

    /// One read attempt per client; successful reads become one-shot
    /// decode-and-route jobs.
    fn poll_connections(self: &Arc<Self>) {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        for entry in clients.values() {
            let outcome = entry
                .conn
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .read();
            match outcome {
                Ok(bytes) => {
                    entry.inactivity.reset();
                    let inner = Arc::clone(self);
                    let from = entry.id;
                    self.scheduler.spawn(move || inner.route(from, &bytes));
                }
                Err(ReadError::NoData) => {}
                Err(ReadError::Closed) => {
                    debug!(id = entry.id, "peer closed its channel");
                    self.mark_doomed(entry.id, DeleteOrigin::Client);
                }
                Err(err) => {
                    warn!(id = entry.id, %err, "connection failed, removing client");
                    self.mark_doomed(entry.id, DeleteOrigin::Client);
                }
            }
        }
    }

    /// Decodes one inbound message and applies the routing rules.
    pub(crate) fn route(&self, from: ClientId, bytes: &[u8]) {
        let envelope = match protocol::decode(bytes) {
            Ok(env) => env,
            Err(err) => {
                warn!(from, %err, "malformed message, removing client");
                self.mark_doomed(from, DeleteOrigin::Client);
                return;
            }
        };
        match envelope.payload {
            Payload::Broadcast { from_id, ref text } => {
                self.console.broadcast_msg(from_id, text);
                self.fan_out(&envelope, from_id);
            }
            Payload::Private { to_id, .. } if to_id == HOST_ID => {
                // Clients cannot address the host privately.
                debug!(from, "private message to the host id dropped");
            }
            Payload::Private { to_id, .. } => {
                if !self.send_to(to_id, &envelope) {
                    warn!(from, to_id, "private message to unknown client dropped");
                }
            }
            Payload::Leave { client_id } => {
                info!(client_id, "client left");
                self.console.system(&format!("client {client_id} left"));
                self.fan_out(&envelope, client_id);
                // Removal is keyed by the announced id, not the connection
                // the notice arrived on.
                self.mark_doomed(client_id, DeleteOrigin::Client);
            }
            Payload::Join { .. } | Payload::KillNotice { .. } => {
                debug!(from, "ignoring host-only message kind from client");
            }
        }
    }

    /// Delivers `envelope` to every client except `exclude`.
    fn fan_out(&self, envelope: &Envelope, exclude: ClientId) {
        let bytes = match protocol::encode(envelope) {
            Ok(b) => b,
            Err(err) => {
                error!(%err, "failed to encode envelope");
                return;
            }
        };
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        for (id, entry) in clients.iter() {
            if *id != exclude {
                entry.write(&bytes);
            }
        }
    }

    /// Delivers `envelope` to one client. Returns whether the id was known.
    fn send_to(&self, to: ClientId, envelope: &Envelope) -> bool {
        let bytes = match protocol::encode(envelope) {
            Ok(b) => b,
            Err(err) => {
                error!(%err, "failed to encode envelope");
                return true;
            }
        };
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        match clients.get(&to) {
            Some(entry) => {
                entry.write(&bytes);
                true
            }
            None => false,
        }
    }

    /// Erases condemned clients. Host-initiated removals kill the process
    /// behind the connection; resource cleanup happens in the transport drop.
    pub(crate) fn prune(&self) {
        let doomed = std::mem::take(&mut *self.doomed.lock().unwrap_or_else(|e| e.into_inner()));
        if doomed.is_empty() {
            return;
        }
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        for (id, origin) in doomed {
            let Some(entry) = clients.remove(&id) else {
                continue;
            };
            entry.inactivity.stop();
            if origin == DeleteOrigin::Host {
                // SAFETY: plain kill syscall on a pid we recorded at
                // handshake time; failure is tolerated.
                let rc = unsafe { libc::kill(entry.pid, libc::SIGKILL) };
                if rc == -1 {
                    warn!(id, pid = entry.pid, "failed to kill removed client");
                }
            }
            info!(id, "client removed");
        }
    }
}

/// Broker-side error surface.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// The running broker. Dropping it shuts the chat down.
pub struct ChatHost {
    inner: Arc<HostInner>,
    scheduler: Arc<TaskScheduler>,
    // Kept alive so the begin-signal disposition stays registered; polled by
    // the handshake task.
    _handshake: Arc<MultiSignalHandler>,
    stopped: AtomicBool,
}

impl ChatHost {
    /// Starts a broker using the environment's runtime directory.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the handshake signal handler cannot be
    /// installed.
    pub fn start(console: Arc<dyn Console>) -> Result<Self, HostError> {
        Self::start_in(ChannelDirs::from_env(), console)
    }

    /// Starts a broker with an explicit channel directory layout.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the handshake signal handler cannot be
    /// installed.
    pub fn start_in(dirs: ChannelDirs, console: Arc<dyn Console>) -> Result<Self, HostError> {
        let scheduler = Arc::new(TaskScheduler::new());
        let inner = Arc::new(HostInner {
            dirs,
            console,
            scheduler: Arc::clone(&scheduler),
            next_id: AtomicU64::new(1),
            clients: RwLock::new(HashMap::new()),
            doomed: Mutex::new(HashMap::new()),
        });

        let handshake = {
            let inner = Arc::clone(&inner);
            Arc::new(MultiSignalHandler::install(
                signals::begin_signo(),
                move |pid, code| inner.accept(pid, code),
            )?)
        };

        {
            let handler = Arc::clone(&handshake);
            scheduler.spawn_repeated("handshake", HANDSHAKE_POLL_INTERVAL, move || {
                handler.poll();
            });
        }
        {
            let inner = Arc::clone(&inner);
            scheduler.spawn_repeated("connections", CONNECTION_POLL_INTERVAL, move || {
                inner.poll_connections();
            });
        }
        {
            let inner = Arc::clone(&inner);
            scheduler.spawn_repeated("prune", PRUNE_INTERVAL, move || inner.prune());
        }

        info!(pid = std::process::id(), "chat host running");
        Ok(Self {
            inner,
            scheduler,
            _handshake: handshake,
            stopped: AtomicBool::new(false),
        })
    }

    /// The pid clients address their begin signal to.
    #[must_use]
    pub fn pid(&self) -> libc::pid_t {
        std::process::id() as libc::pid_t
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Sends an operator broadcast to every client, echoing it locally.
    pub fn send_broadcast(&self, text: &str) {
        self.inner.console.broadcast_msg(HOST_ID, text);
        self.inner.fan_out(&Envelope::broadcast(HOST_ID, text), HOST_ID);
    }

    /// Sends an operator private message to one client.
    pub fn send_private(&self, to: ClientId, text: &str) {
        let envelope = Envelope::private(HOST_ID, to, text);
        if self.inner.send_to(to, &envelope) {
            self.inner.console.private_msg(HOST_ID, text);
        } else {
            self.inner.console.info(&format!("no such client: {to}"));
        }
    }

    /// Announces shutdown to every client and stops the scheduler.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("chat host shutting down");
        self.inner.fan_out(&Envelope::leave(HOST_ID), HOST_ID);
        self.scheduler.stop();
        self.inner
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Drop for ChatHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}
