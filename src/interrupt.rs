//! Ctrl-C handling
//!
//! The first SIGINT only raises a flag: the running phase stops at its next
//! poll or apply, and the run is finalized and saved. A second SIGINT gets the
//! default behaviour and terminates the process.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Process-wide interrupt flag, for `CancelToken::with_signal`
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    // SAFETY: signal() is async-signal-safe; restores the default handler
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

/// Install the SIGINT handler
#[cfg(unix)]
pub fn install() {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    // SAFETY: the handler only touches an atomic and calls signal()
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        log::warn!("could not install SIGINT handler; Ctrl-C will abort immediately");
    }
}

#[cfg(not(unix))]
pub fn install() {}
