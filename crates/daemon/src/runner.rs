// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session child process lifecycle: buffering inbound command lines,
//! launching at most one child at a time, and reaping its result.
//!
//! Deliberately spawns with `std::process::Command`, not
//! `tokio::process::Command`: tokio's process backend installs its own
//! internal `SIGCHLD` reaper for every child it spawns, which would race
//! with [`crate::dispatcher::SignalDispatcher`] -- the explicit,
//! spec-mandated dispatch table this daemon relies on to route exits back to
//! the right session without losing the race against pid reuse. Using
//! `std::process::Command` means the dispatcher is the *only* caller of
//! `waitpid` for these children.

use std::collections::VecDeque;
use std::io::Read;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rrd_core::{tokenize, Whitelist};
use thiserror::Error;

/// Failure launching a child process (pipe/fork/exec failure). Folded into
/// the same client-visible "invalid command" path as a whitelist miss.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn child: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result of a single `attempt_launch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStatus {
    /// A launch was attempted (the queue was non-empty and no child was
    /// already running).
    pub attempted: bool,
    /// The attempted launch actually started a child.
    pub launched: bool,
    /// The runner's task id at the time of this call.
    pub task_id: u64,
}

/// Decoded result of a reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Clean `exit()`/`return` with the given code.
    Exited(i32),
    /// Terminated by a signal; the code follows the shell convention of
    /// `128 + signal number`.
    Killed(i32),
}

impl ExitOutcome {
    /// `None` for a successful (code 0) exit, `Some(code)` otherwise --
    /// matches the banner's "Execution is successful" / "Exit code: N" split.
    pub fn as_banner_code(self) -> Option<i32> {
        match self {
            ExitOutcome::Exited(0) => None,
            ExitOutcome::Exited(code) => Some(code),
            ExitOutcome::Killed(code) => Some(code),
        }
    }
}

/// Per-session command queue and single-child-at-a-time execution state.
pub struct ChildRunner {
    inbound: Vec<u8>,
    queue: VecDeque<String>,
    running: bool,
    child_pid: Option<u32>,
    task_id: u64,
    stdout_pipe: Option<ChildStdout>,
    stderr_pipe: Option<ChildStderr>,
    process_buffer_bytes: usize,
}

impl ChildRunner {
    pub fn new(process_buffer_bytes: usize) -> Self {
        Self {
            inbound: Vec::new(),
            queue: VecDeque::new(),
            running: false,
            child_pid: None,
            task_id: 0,
            stdout_pipe: None,
            stderr_pipe: None,
            process_buffer_bytes,
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Appends `bytes` to the inbound buffer, then extracts every complete,
    /// newline-terminated command currently buffered (not just the first)
    /// and enqueues each non-empty, trimmed one. Returns the commands that
    /// were enqueued, for logging.
    ///
    /// This differs from the original C++, which extracted at most one
    /// command per call -- a client pipelining several commands in a single
    /// write would silently stall until more bytes arrived. Extracting every
    /// complete line per call avoids that latent stall.
    pub fn commit_data(&mut self, bytes: &[u8]) -> Vec<String> {
        self.inbound.extend_from_slice(bytes);

        let mut enqueued = Vec::new();
        while let Some(pos) = self.inbound.iter().position(|&b| b == b'\n') {
            let line = self.inbound.drain(..=pos).collect::<Vec<u8>>();
            let cmd = String::from_utf8_lossy(&line[..line.len() - 1]);
            let cmd = cmd.trim().to_string();
            if cmd.is_empty() {
                continue;
            }
            self.queue.push_back(cmd.clone());
            enqueued.push(cmd);
        }
        enqueued
    }

    /// Attempts to launch the next queued command, if any and if no child is
    /// already running.
    pub fn attempt_launch(&mut self, whitelist: &Whitelist) -> AttemptStatus {
        if self.running {
            return AttemptStatus {
                attempted: false,
                launched: false,
                task_id: self.task_id,
            };
        }
        let Some(cmd) = self.queue.pop_front() else {
            return AttemptStatus {
                attempted: false,
                launched: false,
                task_id: self.task_id,
            };
        };

        let mut args = tokenize(&cmd);
        if args.is_empty() || args[0].is_empty() {
            return AttemptStatus {
                attempted: true,
                launched: false,
                task_id: self.task_id,
            };
        }

        let Some(program) = whitelist.lookup(&args[0]) else {
            return AttemptStatus {
                attempted: true,
                launched: false,
                task_id: self.task_id,
            };
        };
        args[0] = program;

        match self.spawn(&args) {
            Ok(pid) => {
                self.running = true;
                self.child_pid = Some(pid);
                AttemptStatus {
                    attempted: true,
                    launched: true,
                    task_id: self.task_id,
                }
            }
            Err(_) => AttemptStatus {
                attempted: true,
                launched: false,
                task_id: self.task_id,
            },
        }
    }

    fn spawn(&mut self, args: &[String]) -> Result<u32, LaunchError> {
        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        self.stdout_pipe = child.stdout.take();
        self.stderr_pipe = child.stderr.take();
        Ok(child.id())
    }

    /// Drains the exited child's stdout/stderr to completion and resets
    /// state for the next launch. `outcome` is the already-decoded exit
    /// status the dispatcher obtained from its own `waitpid` call -- by the
    /// time a session learns a child has exited, the dispatcher has already
    /// reaped it, so this never calls `waitpid` itself (the kernel's record
    /// of the exit is gone the moment the dispatcher reaps it).
    ///
    /// Blocking: pipe reads here block until the child's write end closes,
    /// which happens promptly once the process has exited, but callers must
    /// still run this inside `tokio::task::spawn_blocking` so a slow drain
    /// never stalls a reactor worker thread.
    pub fn write_execution_result(&mut self, outcome: ExitOutcome) -> (ExitOutcome, Vec<u8>, Vec<u8>) {
        self.child_pid = None;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut staging = vec![0u8; self.process_buffer_bytes];

        if let Some(mut pipe) = self.stdout_pipe.take() {
            drain_to(&mut pipe, &mut staging, &mut stdout_buf);
        }
        if let Some(mut pipe) = self.stderr_pipe.take() {
            drain_to(&mut pipe, &mut staging, &mut stderr_buf);
        }

        self.running = false;
        self.task_id += 1;

        (outcome, stdout_buf, stderr_buf)
    }

    /// Kills the running child, but only if `task_id` still names the
    /// runner's current task -- a timer that fired after the child already
    /// exited and a new one launched must not kill the wrong child.
    pub fn kill_task(&self, task_id: u64) {
        if task_id != self.task_id {
            return;
        }
        if let Some(pid) = self.child_pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

fn drain_to(reader: &mut impl Read, staging: &mut [u8], out: &mut Vec<u8>) {
    loop {
        match reader.read(staging) {
            Ok(0) => return,
            Ok(n) => out.extend_from_slice(&staging[..n]),
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::waitpid;

    fn whitelist_with(entries: &[(&str, &str)]) -> Whitelist {
        let mut contents = String::new();
        for (name, path) in entries {
            contents.push_str(name);
            contents.push(' ');
            contents.push_str(path);
            contents.push('\n');
        }
        let file = tempfile::NamedTempFile::new().expect("tmp");
        std::fs::write(file.path(), contents).expect("write");
        Whitelist::from_file(file.path()).expect("load")
    }

    #[test]
    fn commit_data_enqueues_all_complete_lines_in_one_call() {
        let mut runner = ChildRunner::new(1024);
        let enqueued = runner.commit_data(b"ls\nuptime\nincomple");
        assert_eq!(enqueued, vec!["ls".to_string(), "uptime".to_string()]);
        // the trailing partial line stays buffered
        assert_eq!(runner.commit_data(b"te\n"), vec!["incomplete".to_string()]);
    }

    #[test]
    fn commit_data_trims_and_drops_empty_lines() {
        let mut runner = ChildRunner::new(1024);
        let enqueued = runner.commit_data(b"   \nls  \n\n");
        assert_eq!(enqueued, vec!["ls".to_string()]);
    }

    #[test]
    fn attempt_launch_on_empty_queue_is_a_noop() {
        let wl = whitelist_with(&[("ls", "/bin/ls")]);
        let mut runner = ChildRunner::new(1024);
        let status = runner.attempt_launch(&wl);
        assert_eq!(
            status,
            AttemptStatus {
                attempted: false,
                launched: false,
                task_id: 0
            }
        );
    }

    #[test]
    fn attempt_launch_rejects_unwhitelisted_command() {
        let wl = whitelist_with(&[("ls", "/bin/ls")]);
        let mut runner = ChildRunner::new(1024);
        runner.commit_data(b"rm -rf /\n");
        let status = runner.attempt_launch(&wl);
        assert_eq!(
            status,
            AttemptStatus {
                attempted: true,
                launched: false,
                task_id: 0
            }
        );
    }

    #[test]
    fn kill_task_is_noop_for_stale_task_id() {
        let mut runner = ChildRunner::new(1024);
        // no child running; stale id should just not panic or touch anything
        runner.kill_task(999);
        assert_eq!(runner.child_pid(), None);
    }

    #[test]
    fn as_banner_code_maps_clean_exit_to_none() {
        assert_eq!(ExitOutcome::Exited(0).as_banner_code(), None);
        assert_eq!(ExitOutcome::Exited(2).as_banner_code(), Some(2));
        assert_eq!(ExitOutcome::Killed(137).as_banner_code(), Some(137));
    }

    /// Stands in for the dispatcher: blocks until `pid` is reapable and
    /// returns the decoded outcome, the way `SignalDispatcher::drain` would.
    fn reap(pid: u32) -> ExitOutcome {
        use nix::sys::wait::WaitStatus;
        match waitpid(Pid::from_raw(pid as i32), None).expect("waitpid") {
            WaitStatus::Exited(_, code) => ExitOutcome::Exited(code),
            WaitStatus::Signaled(_, sig, _) => ExitOutcome::Killed(128 + sig as i32),
            other => panic!("unexpected wait status: {other:?}"),
        }
    }

    #[test]
    fn attempt_launch_real_child_succeeds_and_reports_task_id() {
        let wl = whitelist_with(&[("t", "/bin/true")]);
        let mut runner = ChildRunner::new(1024);
        runner.commit_data(b"t\n");
        let status = runner.attempt_launch(&wl);
        assert!(status.launched);
        assert_eq!(status.task_id, 0);
        let pid = runner.child_pid().expect("launched");

        // A second command queued while the first runs does not launch yet.
        runner.commit_data(b"t\n");
        let status2 = runner.attempt_launch(&wl);
        assert_eq!(
            status2,
            AttemptStatus {
                attempted: false,
                launched: false,
                task_id: 0
            }
        );

        let outcome = reap(pid);
        let (outcome, _out, _err) = runner.write_execution_result(outcome);
        assert_eq!(outcome, ExitOutcome::Exited(0));
        assert_eq!(runner.task_id(), 1);

        let status3 = runner.attempt_launch(&wl);
        assert!(status3.launched);
        assert_eq!(status3.task_id, 1);
        let pid3 = runner.child_pid().expect("launched");
        reap(pid3);
    }
}
