// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection session: the "strand" from the original design, realized
//! as a single tokio task running one `tokio::select!` loop. Because exactly
//! one task drains the socket, the child-exit channel, and the timeout
//! timer, all three event sources execute one at a time in the order their
//! events become ready -- the FIFO, non-overlapping contract the original's
//! `boost::asio::strand` provided.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rrd_core::Whitelist;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tracing::{debug, warn};

use crate::dispatcher::SignalDispatcher;
use crate::protocol;
use crate::runner::{ChildRunner, ExitOutcome};

/// Drives one client connection to completion (until EOF or an I/O error).
pub struct Session<R, W> {
    reader: R,
    writer: W,
    runner: Arc<Mutex<ChildRunner>>,
    whitelist: Arc<Whitelist>,
    dispatcher: Arc<SignalDispatcher>,
    timeout: Duration,
    exit_rx: mpsc::UnboundedReceiver<ExitOutcome>,
    exit_tx: mpsc::UnboundedSender<ExitOutcome>,
    read_buf: Vec<u8>,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: R,
        writer: W,
        whitelist: Arc<Whitelist>,
        dispatcher: Arc<SignalDispatcher>,
        timeout: Duration,
        session_buffer_bytes: usize,
        process_buffer_bytes: usize,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            reader,
            writer,
            runner: Arc::new(Mutex::new(ChildRunner::new(process_buffer_bytes))),
            whitelist,
            dispatcher,
            timeout,
            exit_rx,
            exit_tx,
            read_buf: vec![0u8; session_buffer_bytes],
        }
    }

    /// Runs the session to completion. A clean EOF or read error ends the
    /// loop; any child still running at that point is left to the OS and
    /// reaped normally by the dispatcher, its output simply discarded (the
    /// channel send in that case finds no receiver and is ignored).
    pub async fn run(mut self) {
        let mut timer: ArmedTimer = None;

        loop {
            tokio::select! {
                biased;

                exit = self.exit_rx.recv() => {
                    let Some(outcome) = exit else { return };
                    timer = None;
                    self.handle_child_exit(outcome, &mut timer).await;
                }

                () = sleep_or_pending(&mut timer) => {
                    // The armed timer is stamped with the task id of the
                    // child it was armed for; pass that stamped id, not the
                    // runner's live one, so a timer that loses the race
                    // against a fast exit-and-relaunch can never kill the
                    // wrong (newer) child.
                    if let Some((task_id, _)) = timer.take() {
                        debug!(task_id, "child timed out, killing");
                        self.runner.lock().kill_task(task_id);
                    }
                }

                n = self.reader.read(&mut self.read_buf) => {
                    match n {
                        Ok(0) => return,
                        Ok(n) => {
                            let bytes = self.read_buf[..n].to_vec();
                            self.handle_inbound(&bytes, &mut timer).await;
                        }
                        Err(e) => {
                            warn!("session read error: {e}");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_inbound(&mut self, bytes: &[u8], timer: &mut ArmedTimer) {
        let enqueued = self.runner.lock().commit_data(bytes);
        for cmd in &enqueued {
            debug!(command = %cmd, "enqueued command");
        }
        self.try_launch(timer).await;
    }

    /// Keeps attempting to launch until a child actually starts running or
    /// the queue is drained (or a child is already running). A batch of
    /// buffered commands can contain more than one invalid entry in a row --
    /// `commit_data` enqueues every complete line from a single inbound
    /// event, not just the first, so a single bad command in the middle of a
    /// batch must not strand everything queued behind it.
    async fn try_launch(&mut self, timer: &mut ArmedTimer) {
        loop {
            // Registration happens while still holding the runner's lock,
            // right after spawn returns a pid. There is an unavoidable
            // window between fork() and this insert during which a
            // pathologically fast-exiting child's SIGCHLD could be drained
            // by the dispatcher before the entry exists; such an exit is
            // logged as "untracked" and its result is lost. The original
            // C++ has the same window (the pid is only known after fork, so
            // it cannot be pre-registered).
            let status = {
                let mut runner = self.runner.lock();
                let status = runner.attempt_launch(&self.whitelist);
                if status.launched {
                    if let Some(pid) = runner.child_pid() {
                        self.dispatcher.register(pid as i32, self.exit_tx.clone());
                    }
                }
                status
            };

            if status.launched {
                *timer = Some((status.task_id, Box::pin(tokio::time::sleep(self.timeout))));
                return;
            }

            if !status.attempted {
                return;
            }

            if self.writer.write_all(protocol::INVALID_COMMAND.as_bytes()).await.is_err() {
                return;
            }
            // Queue may still hold more commands behind this invalid one --
            // keep draining instead of waiting for an event that may never
            // come.
        }
    }

    async fn handle_child_exit(&mut self, outcome: ExitOutcome, timer: &mut ArmedTimer) {
        // Pipe draining blocks on I/O until the child's write end closes, so
        // it runs off the reactor thread rather than inline in this task.
        let runner = Arc::clone(&self.runner);
        let drained = tokio::task::spawn_blocking(move || runner.lock().write_execution_result(outcome)).await;
        let (outcome, stdout, stderr) = match drained {
            Ok(result) => result,
            Err(e) => {
                warn!("pipe-drain task panicked: {e}");
                (outcome, Vec::new(), Vec::new())
            }
        };

        let banner = protocol::execution_result(outcome.as_banner_code(), &stdout, &stderr);
        if self.writer.write_all(&banner).await.is_err() {
            return;
        }

        // Go on launching any queued commands; arms a fresh timer if one
        // starts running.
        self.try_launch(timer).await;
    }
}

/// A timer armed for a specific task id, so the task it fires for can be
/// identified without consulting the runner's (possibly already-advanced)
/// live task id.
type ArmedTimer = Option<(u64, Pin<Box<Sleep>>)>;

fn sleep_or_pending(timer: &mut ArmedTimer) -> SleepOrPending<'_> {
    SleepOrPending { timer }
}

struct SleepOrPending<'a> {
    timer: &'a mut ArmedTimer,
}

impl<'a> std::future::Future for SleepOrPending<'a> {
    type Output = ();

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.get_mut();
        match this.timer.as_mut() {
            Some((_, sleep)) => sleep.as_mut().poll(cx),
            None => std::task::Poll::Pending,
        }
    }
}
