//! Signal handling and the process-wide quit flag
//!
//! The handlers do the absolute minimum that is async-signal-safe:
//! store a flag and `write(2)` a constant message. Everything else --
//! draining workers, restoring dataset codecs -- happens on the main
//! thread after the pool has joined. `SIGBUS`/`SIGSEGV` re-raise with
//! the default disposition after announcing that no codec restoration
//! will be attempted: the process state is not to be trusted.

use std::sync::atomic::{AtomicBool, Ordering};

static QUIT: AtomicBool = AtomicBool::new(false);

const SOFT_MSG: &[u8] = b"Received quit request: zfsrecomp will exit (please be patient!)\n";
const BUS_MSG: &[u8] = b"Going down on BUS error; dataset compression will NOT be reset!\n";
const SEGV_MSG: &[u8] = b"Going down on SEGV error; dataset compression will NOT be reset!\n";

/// Whether a soft quit has been requested.
pub fn quit_requested() -> bool {
    QUIT.load(Ordering::SeqCst)
}

/// Request a soft quit programmatically.
pub fn request_quit() {
    QUIT.store(true, Ordering::SeqCst);
}

#[cfg(test)]
pub(crate) fn reset_quit() {
    QUIT.store(false, Ordering::SeqCst);
}

extern "C" fn handle_soft(_sig: libc::c_int) {
    QUIT.store(true, Ordering::SeqCst);
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            SOFT_MSG.as_ptr() as *const libc::c_void,
            SOFT_MSG.len(),
        );
    }
}

extern "C" fn handle_hard(sig: libc::c_int) {
    let msg = if sig == libc::SIGBUS { BUS_MSG } else { SEGV_MSG };
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
        );
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

fn set_handler(sig: libc::c_int, handler: extern "C" fn(libc::c_int)) {
    unsafe {
        libc::signal(sig, handler as libc::sighandler_t);
    }
}

/// Install all handlers for the run.
pub fn install() {
    set_handler(libc::SIGHUP, handle_soft);
    set_handler(libc::SIGINT, handle_soft);
    set_handler(libc::SIGTERM, handle_soft);
    set_handler(libc::SIGBUS, handle_hard);
    set_handler(libc::SIGSEGV, handle_hard);
    // exceeding CPU or file size limits must not kill a rewrite
    unsafe {
        libc::signal(libc::SIGXCPU, libc::SIG_IGN);
        libc::signal(libc::SIGXFSZ, libc::SIG_IGN);
    }
}
