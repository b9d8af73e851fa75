//! Cooperative signal handling.
//!
//! A signal handler only ever does one thing: store the signal number
//! into a process-local atomic cell. Each worker's main loop drains that
//! cell once per iteration via [`last_signal`] and reacts to it outside
//! of signal-handler context, where it is safe to log, tear down shared
//! memory, or exit.

use std::sync::atomic::{AtomicI32, Ordering};

static LAST_SIGNAL: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handler(sig: libc::c_int) {
    LAST_SIGNAL.store(sig, Ordering::SeqCst);
}

/// Install `handler` for `sig`, masking all other signals while it runs.
pub fn trap(sig: libc::c_int) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) == -1 {
            panic!("sigaction({sig}) failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Explicitly ignore `sig` (used by workers other than the one that
/// should act on SIGINT, matching each process's narrow signal set).
pub fn ignore(sig: libc::c_int) {
    unsafe {
        libc::signal(sig, libc::SIG_IGN);
    }
}

/// Returns the most recently received trapped signal and resets the
/// cell, or `None` if nothing has arrived since the last call.
pub fn last_signal() -> Option<libc::c_int> {
    let sig = LAST_SIGNAL.swap(-1, Ordering::SeqCst);
    if sig == -1 {
        None
    } else {
        Some(sig)
    }
}
