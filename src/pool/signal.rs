//! SIGCHLD scoping and process liveness probing.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::error::{Error, Result};

/// Scoped `SIGCHLD` ignore.
///
/// While the guard is alive, `SIGCHLD` is set to `SIG_IGN`, which makes the
/// kernel reap exiting children automatically: the supervisor never
/// accumulates zombies and never has to call `waitpid`. The previous
/// disposition is restored when the guard drops, on every exit path.
pub(crate) struct SigchldGuard {
    prev: SigAction,
    armed: bool,
}

impl SigchldGuard {
    /// Install the ignore disposition, saving the previous one.
    pub fn install() -> Result<Self> {
        let ignore = SigAction::new(
            SigHandler::SigIgn,
            // Restart interrupted system calls.
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: SIG_IGN involves no user handler that could violate
        // async-signal-safety.
        let prev = unsafe { signal::sigaction(Signal::SIGCHLD, &ignore) }
            .map_err(|errno| Error::sys("sigaction(SIGCHLD)", errno))?;
        Ok(Self { prev, armed: true })
    }

    /// Restore the saved disposition now, consuming the guard.
    pub fn restore(mut self) {
        self.restore_now();
    }

    fn restore_now(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        // SAFETY: restoring the disposition captured at install time.
        if let Err(errno) = unsafe { signal::sigaction(Signal::SIGCHLD, &self.prev) } {
            tracing::error!(%errno, "failed to restore SIGCHLD disposition");
        }
    }
}

impl Drop for SigchldGuard {
    fn drop(&mut self) {
        self.restore_now();
    }
}

/// Probe whether `pid` is alive and signalable by this user.
///
/// Sends signal 0, which performs the permission and existence checks
/// without delivering anything. `ESRCH` means the process is gone; any
/// other failure is treated as gone too.
pub(crate) fn process_alive(pid: Pid) -> bool {
    signal::kill(pid, None).is_ok()
}
