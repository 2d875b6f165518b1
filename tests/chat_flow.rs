//! End-to-end chat flow over real OS transports and real signals.
//!
//! Host and clients run in this one process: the begin/confirm signals are
//! queued to our own pid, and each side installs its own handler. Signal
//! dispositions are process-global, so the tests serialize on a lock.

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use hearth::client::ClientSession;
use hearth::conn::paths::ChannelDirs;
use hearth::conn::Kind;
use hearth::console::Console;
use hearth::host::ChatHost;
use hearth::protocol::ClientId;
use hearth::signals::handler::MultiSignalHandler;

static INIT: Once = Once::new();
static SIGNAL_LOCK: Mutex<()> = Mutex::new(());

fn setup() -> std::sync::MutexGuard<'static, ()> {
    INIT.call_once(hearth::init_tracing);
    SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn wait_until(what: &str, deadline: Duration, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(cond(), "timed out waiting for {what}");
}

/// Console that records every line it is asked to show.
#[derive(Default)]
struct RecordingConsole {
    lines: Mutex<Vec<String>>,
}

impl RecordingConsole {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l == needle)
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

fn scratch_dirs(tag: &str) -> (tempfile::TempDir, ChannelDirs) {
    let dir = tempfile::tempdir().unwrap();
    let dirs = ChannelDirs::at(
        dir.path(),
        format!("hearth-it-{}-{tag}", std::process::id()),
    );
    (dir, dirs)
}

fn own_pid() -> libc::pid_t {
    std::process::id() as libc::pid_t
}

fn join(
    dirs: &ChannelDirs,
    kind: Kind,
    host: &ChatHost,
    expected_count: usize,
) -> (ClientSession, Arc<RecordingConsole>) {
    let console = RecordingConsole::new();
    let session =
        ClientSession::connect_in(own_pid(), kind, dirs.clone(), console.clone()).unwrap();
    wait_until("client to activate", Duration::from_secs(5), || {
        session.id().is_some()
    });
    wait_until("host to register the client", Duration::from_secs(5), || {
        host.client_count() == expected_count
    });
    (session, console)
}

#[test]
fn broadcast_private_leave_and_shutdown() {
    let _guard = setup();
    let (_dir, dirs) = scratch_dirs("flow");
    let host_console = RecordingConsole::new();
    let host = ChatHost::start_in(dirs.clone(), host_console.clone()).unwrap();

    // One client per transport backend. Sequential joins, so ids are 1/2/3.
    let (a, a_console) = join(&dirs, Kind::Fifo, &host, 1);
    let (b, b_console) = join(&dirs, Kind::Queue, &host, 2);
    let (c, c_console) = join(&dirs, Kind::Socket, &host, 3);
    let (a_id, b_id, c_id) = (a.id().unwrap(), b.id().unwrap(), c.id().unwrap());
    assert_eq!((a_id, b_id, c_id), (1, 2, 3));

    // A broadcast reaches B, C, and the host console, but not A itself.
    a.send_broadcast("hello room");
    let expected = format!("bc:{a_id}:hello room");
    wait_until("B to see the broadcast", Duration::from_secs(5), || {
        b_console.contains(&expected)
    });
    wait_until("C to see the broadcast", Duration::from_secs(5), || {
        c_console.contains(&expected)
    });
    assert!(host_console.contains(&expected));
    let echoes = a_console
        .lines()
        .iter()
        .filter(|l| *l == &expected)
        .count();
    assert_eq!(echoes, 1, "A must only have its local echo");

    // A private to B stays private.
    a.send_private(b_id, "just for you");
    wait_until("B to see the private", Duration::from_secs(5), || {
        b_console.contains(&format!("pm:{a_id}:just for you"))
    });
    assert!(!c_console.contains(&format!("pm:{a_id}:just for you")));

    // C leaves: peers are told, the host prunes the entry.
    c.leave();
    let left = format!("system:client {c_id} left");
    wait_until("A to see the leave", Duration::from_secs(5), || {
        a_console.contains(&left)
    });
    wait_until("B to see the leave", Duration::from_secs(5), || {
        b_console.contains(&left)
    });
    wait_until("host to prune the entry", Duration::from_secs(5), || {
        host.client_count() == 2
    });

    // Host shutdown terminates the remaining sessions.
    host.shutdown();
    wait_until("A to terminate", Duration::from_secs(5), || {
        a.is_terminated()
    });
    wait_until("B to terminate", Duration::from_secs(5), || {
        b.is_terminated()
    });
    assert!(a_console.contains("system:the host shut down"));
}

#[test]
fn operator_messages_reach_clients() {
    let _guard = setup();
    let (_dir, dirs) = scratch_dirs("operator");
    let host_console = RecordingConsole::new();
    let host = ChatHost::start_in(dirs.clone(), host_console.clone()).unwrap();

    let (a, a_console) = join(&dirs, Kind::Fifo, &host, 1);
    let (_b, b_console) = join(&dirs, Kind::Fifo, &host, 2);
    let a_id = a.id().unwrap();

    host.send_broadcast("welcome everyone");
    wait_until("A to see the host broadcast", Duration::from_secs(5), || {
        a_console.contains("bc:0:welcome everyone")
    });
    wait_until("B to see the host broadcast", Duration::from_secs(5), || {
        b_console.contains("bc:0:welcome everyone")
    });

    host.send_private(a_id, "you specifically");
    wait_until("A to see the host private", Duration::from_secs(5), || {
        a_console.contains("pm:0:you specifically")
    });
    assert!(!b_console.contains("pm:0:you specifically"));

    host.send_private(999, "nobody home");
    assert!(host_console.contains("info:no such client: 999"));

    host.shutdown();
}

#[test]
fn unanswered_handshake_times_out() {
    let _guard = setup();
    let (_dir, dirs) = scratch_dirs("timeout");

    // Swallow the begin signal so no confirm ever comes back, like a host
    // that is wedged.
    let _mute = MultiSignalHandler::install(hearth::signals::begin_signo(), |_, _| {}).unwrap();

    let console = RecordingConsole::new();
    let session =
        ClientSession::connect_in(own_pid(), Kind::Fifo, dirs, console.clone()).unwrap();

    wait_until("the handshake to time out", Duration::from_secs(8), || {
        session.is_terminated()
    });
    assert!(session.id().is_none());
    assert!(console.contains("info:no answer from the host, giving up"));
}
