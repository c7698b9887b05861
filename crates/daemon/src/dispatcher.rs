// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server-wide `SIGCHLD` dispatch: routes a reaped child's exit back to the
//! session that launched it, without races against pid reuse.
//!
//! One task per daemon owns this loop. Every session registers (or
//! overwrites) its `pid -> sender` entry when it successfully launches a
//! child; the dispatcher removes the entry before notifying so a pid that
//! the OS immediately recycles into a *new* child can be re-registered by a
//! racing `attempt_launch` without colliding with a stale notification.

use std::collections::HashMap;
use std::sync::Arc;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::runner::ExitOutcome;

/// Shared pid -> session-notification registry.
///
/// The dispatcher is the *only* caller of `waitpid` for session-launched
/// children (see `runner`'s module doc), so it is also the only place that
/// ever learns a child's real exit status -- once reaped, the kernel's
/// record of it is gone. The decoded [`ExitOutcome`] is carried on the
/// notification itself; the runner never calls `waitpid` again.
#[derive(Default)]
pub struct SignalDispatcher {
    registry: Mutex<HashMap<i32, mpsc::UnboundedSender<ExitOutcome>>>,
}

impl SignalDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers (or overwrites) the notification channel for `pid`. Called
    /// by a session immediately after a successful launch.
    pub fn register(&self, pid: i32, sender: mpsc::UnboundedSender<ExitOutcome>) {
        self.registry.lock().insert(pid, sender);
    }

    /// Runs the `SIGCHLD`-driven reap loop until the process receives no
    /// further signals (i.e. forever, in practice -- this task is spawned
    /// once and lives for the daemon's lifetime).
    pub async fn run(self: Arc<Self>) {
        let mut sigchld = match signal(SignalKind::child()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGCHLD handler: {e}");
                return;
            }
        };

        loop {
            if sigchld.recv().await.is_none() {
                warn!("SIGCHLD stream ended, signal dispatcher exiting");
                return;
            }
            self.drain();
        }
    }

    /// Reaps every currently-waitable child with `WNOHANG`, since a single
    /// `SIGCHLD` delivery can represent more than one exited child (signals
    /// of the same kind coalesce while the process is busy).
    fn drain(&self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => self.notify(pid, ExitOutcome::Exited(code)),
                Ok(WaitStatus::Signaled(pid, sig, _core_dumped)) => {
                    self.notify(pid, ExitOutcome::Killed(128 + sig as i32))
                }
                Ok(WaitStatus::StillAlive) => return,
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => return,
                Err(e) => {
                    error!("waitpid failed: {e}");
                    return;
                }
            }
        }
    }

    fn notify(&self, pid: Pid, exit: ExitOutcome) {
        let sender = self.registry.lock().remove(&pid.as_raw());
        match sender {
            Some(sender) => {
                // A send error means the session has already dropped its
                // receiver; its exit code no longer matters to anyone.
                let _ = sender.send(exit);
            }
            None => debug!(pid = pid.as_raw(), "reaped untracked pid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_removes_before_sending() {
        let dispatcher = SignalDispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(4242, tx);

        dispatcher.notify(Pid::from_raw(4242), ExitOutcome::Exited(0));

        assert!(dispatcher.registry.lock().get(&4242).is_none());
        assert!(matches!(rx.try_recv(), Ok(ExitOutcome::Exited(0))));
    }

    #[test]
    fn reused_pid_after_reap_goes_to_new_registrant() {
        let dispatcher = SignalDispatcher::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        dispatcher.register(777, tx1);
        dispatcher.notify(Pid::from_raw(777), ExitOutcome::Exited(0));
        assert!(matches!(rx1.try_recv(), Ok(ExitOutcome::Exited(0))));

        // OS recycles the pid into a brand-new child for a different session.
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        dispatcher.register(777, tx2);
        dispatcher.notify(Pid::from_raw(777), ExitOutcome::Killed(137));

        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(ExitOutcome::Killed(137))));
    }

    #[test]
    fn notify_on_untracked_pid_is_a_noop() {
        let dispatcher = SignalDispatcher::default();
        // Must not panic -- a session can disconnect (and deregister,
        // implicitly, by being dropped) between launch and reap.
        dispatcher.notify(Pid::from_raw(99999), ExitOutcome::Exited(0));
    }
}
