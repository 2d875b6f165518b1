//! Signal-based out-of-band handshake channel.
//!
//! Before any transport exists, host and client rendezvous through queued
//! real-time signals carrying a machine-word payload: the client sends
//! "begin" (payload = requested transport kind) to the host's pid, and the
//! host answers "confirm" (payload = assigned id) to the client's pid.
//!
//! OS signal delivery has no per-instance context, so dispatch goes through
//! process-scoped state: a fixed-size table of [`AtomicPtr`]s indexed by
//! signal number, populated when a handler is installed and cleared when it
//! is uninstalled. A single trampoline looks up the table entry and records
//! the event into its buffer; nothing else happens in the signal-delivery
//! context, and the table is only ever touched with atomic operations,
//! never a lock, because that context must not block.

pub mod buffer;
pub mod handler;

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use rustix::io::Errno;
use thiserror::Error;

use crate::conn::Kind;
use crate::protocol::ClientId;

use self::buffer::EventBuffer;

/// Linux delivers signals 1..=64; slot 0 is unused.
const TABLE_LEN: usize = 65;

/// Signal number → recording buffer for the installed handler, if any.
///
/// Entries hold a raw pointer obtained from `Arc::into_raw`; see
/// [`uninstall`] for the ownership story.
static TABLE: [AtomicPtr<EventBuffer>; TABLE_LEN] =
    [const { AtomicPtr::new(std::ptr::null_mut()) }; TABLE_LEN];

/// The client→host "begin" signal.
#[must_use]
pub fn begin_signo() -> libc::c_int {
    libc::SIGRTMIN()
}

/// The host→client "confirm" signal.
#[must_use]
pub fn confirm_signo() -> libc::c_int {
    libc::SIGRTMIN() + 1
}

/// Signal-layer failures.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal number {0} out of range")]
    InvalidSigno(libc::c_int),
    #[error("sigaction failed for signal {signo}: {errno}")]
    Install { signo: libc::c_int, errno: Errno },
    #[error("sigqueue to pid {pid} failed: {errno}")]
    Send { pid: libc::pid_t, errno: Errno },
}

/// Sends the handshake "begin" signal to the host.
///
/// # Errors
///
/// Returns [`SignalError::Send`] if the signal cannot be queued (host gone,
/// queue limit reached).
pub fn send_begin(host_pid: libc::pid_t, kind: Kind) -> Result<(), SignalError> {
    sigqueue(host_pid, begin_signo(), kind.code() as usize)
}

/// Sends the handshake "confirm" signal to a client.
///
/// # Errors
///
/// Returns [`SignalError::Send`] if the signal cannot be queued.
pub fn send_confirm(client_pid: libc::pid_t, id: ClientId) -> Result<(), SignalError> {
    sigqueue(client_pid, confirm_signo(), id as usize)
}

fn sigqueue(pid: libc::pid_t, signo: libc::c_int, value: usize) -> Result<(), SignalError> {
    let payload = libc::sigval {
        sival_ptr: value as *mut libc::c_void,
    };
    // SAFETY: plain syscall; payload is passed by value.
    let rc = unsafe { libc::sigqueue(pid, signo, payload) };
    if rc == -1 {
        return Err(SignalError::Send {
            pid,
            errno: last_errno(),
        });
    }
    Ok(())
}

/// Registers `buffer` as the recorder for `signo` and installs the
/// trampoline with `SA_SIGINFO`.
///
/// One handler instance per signal number: installing over an occupied slot
/// replaces it (the displaced buffer reference is leaked, same as on
/// uninstall).
pub(crate) fn install(signo: libc::c_int, buffer: &Arc<EventBuffer>) -> Result<(), SignalError> {
    let slot = table_slot(signo)?;
    let raw = Arc::into_raw(Arc::clone(buffer)).cast_mut();
    slot.store(raw, Ordering::Release);

    // SAFETY: sa_mask is initialized by sigemptyset before sigaction reads
    // the struct; the trampoline has the signature SA_SIGINFO requires.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_flags = libc::SA_SIGINFO;
        action.sa_sigaction = trampoline as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signo, &action, std::ptr::null_mut()) == -1 {
            slot.store(std::ptr::null_mut(), Ordering::Release);
            return Err(SignalError::Install {
                signo,
                errno: last_errno(),
            });
        }
    }
    Ok(())
}

/// Clears the table entry for `signo` if it still points at `buffer`.
///
/// The swapped-out reference is deliberately leaked rather than dropped: a
/// delivery on another thread may be dereferencing it right now, and there
/// is no way to wait for the signal context from here. The leak is bounded
/// by one buffer per handler lifetime.
pub(crate) fn uninstall(signo: libc::c_int, buffer: &Arc<EventBuffer>) {
    let Ok(slot) = table_slot(signo) else {
        return;
    };
    let expected = Arc::as_ptr(buffer).cast_mut();
    let _ = slot.compare_exchange(
        expected,
        std::ptr::null_mut(),
        Ordering::AcqRel,
        Ordering::Relaxed,
    );
}

fn table_slot(signo: libc::c_int) -> Result<&'static AtomicPtr<EventBuffer>, SignalError> {
    usize::try_from(signo)
        .ok()
        .filter(|&n| n > 0)
        .and_then(|n| TABLE.get(n))
        .ok_or(SignalError::InvalidSigno(signo))
}

/// The one handler the OS ever calls. Async-signal-safe: a table load, a
/// couple of atomic stores in the buffer, nothing more.
unsafe extern "C" fn trampoline(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    if info.is_null() {
        return;
    }
    let Ok(slot) = table_slot(signo) else {
        return;
    };
    let buffer = slot.load(Ordering::Acquire);
    if buffer.is_null() {
        return;
    }
    // SAFETY: a non-null entry came from Arc::into_raw and is never freed
    // (uninstall leaks it), so the pointee is alive. siginfo fields are
    // valid for a queued signal.
    unsafe {
        let pid = (*info).si_pid();
        let value = (*info).si_value().sival_ptr as usize as i64;
        (*buffer).record(pid, value);
    }
}

fn last_errno() -> Errno {
    Errno::from_raw_os_error(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
}
