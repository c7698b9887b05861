// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owns the whitelist, the signal dispatcher, and both acceptors. Installs
//! `SIGHUP` (reload) and `SIGINT`/`SIGTERM`/`SIGQUIT` (shutdown) handlers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rrd_core::Whitelist;
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatcher::SignalDispatcher;
use crate::session::Session;

/// Fatal startup failure: binding a socket.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind TCP port {port}: {source}")]
    Tcp { port: u16, source: std::io::Error },

    #[error("failed to bind local socket {path}: {source}")]
    Local { path: String, source: std::io::Error },
}

pub struct Server {
    config: Config,
    whitelist: Arc<Whitelist>,
    dispatcher: Arc<SignalDispatcher>,
}

impl Server {
    /// Loads the whitelist (fatal on failure -- there is no previous map to
    /// fall back to) and constructs a server ready to `run`.
    pub fn new(config: Config) -> Result<Self, rrd_core::ConfigError> {
        let whitelist = Arc::new(Whitelist::from_file(&config.config_path)?);
        Ok(Self {
            config,
            whitelist,
            dispatcher: SignalDispatcher::new(),
        })
    }

    /// Binds both acceptors, spawns the dispatcher and accept loops, installs
    /// signal handlers, and blocks until a shutdown signal arrives.
    pub async fn run(self) -> Result<(), BindError> {
        let tcp = bind_tcp(self.config.tcp_port).await?;
        let uds = bind_local(&self.config.local_socket_path)?;

        info!(
            port = self.config.tcp_port,
            socket = %self.config.local_socket_path.display(),
            "remote-runnerd listening"
        );

        tokio::spawn(Arc::clone(&self.dispatcher).run());

        let shutdown = Arc::new(Notify::new());
        self.spawn_tcp_acceptor(tcp, Arc::clone(&shutdown));
        self.spawn_uds_acceptor(uds, Arc::clone(&shutdown));
        self.spawn_reload_handler();
        self.spawn_shutdown_handler(Arc::clone(&shutdown));

        shutdown.notified().await;
        info!("shutdown signal received, no longer accepting new connections");
        // In-flight sessions and their children are left running -- the OS
        // reaps orphaned children, matching spec.md §7.
        Ok(())
    }

    fn spawn_tcp_acceptor(&self, listener: TcpListener, shutdown: Arc<Notify>) {
        let whitelist = Arc::clone(&self.whitelist);
        let dispatcher = Arc::clone(&self.dispatcher);
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let session_buf = self.config.session_buffer_bytes;
        let process_buf = self.config.process_buffer_bytes;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.notified() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                info!(%addr, "tcp connection accepted");
                                let (reader, writer) = stream.into_split();
                                spawn_session(reader, writer, &whitelist, &dispatcher, timeout, session_buf, process_buf);
                            }
                            Err(e) => error!("tcp accept error: {e}"),
                        }
                    }
                }
            }
        });
    }

    fn spawn_uds_acceptor(&self, listener: UnixListener, shutdown: Arc<Notify>) {
        let whitelist = Arc::clone(&self.whitelist);
        let dispatcher = Arc::clone(&self.dispatcher);
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let session_buf = self.config.session_buffer_bytes;
        let process_buf = self.config.process_buffer_bytes;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.notified() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                info!("unix socket connection accepted");
                                let (reader, writer) = stream.into_split();
                                spawn_session(reader, writer, &whitelist, &dispatcher, timeout, session_buf, process_buf);
                            }
                            Err(e) => error!("unix accept error: {e}"),
                        }
                    }
                }
            }
        });
    }

    fn spawn_reload_handler(&self) {
        let whitelist = Arc::clone(&self.whitelist);
        let config_path = self.config.config_path.clone();

        tokio::spawn(async move {
            let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to install SIGHUP handler: {e}");
                    return;
                }
            };
            loop {
                if sighup.recv().await.is_none() {
                    return;
                }
                match whitelist.reload(&config_path) {
                    Ok(()) => info!("whitelist reloaded"),
                    Err(e) => warn!("whitelist reload failed, keeping previous config: {e}"),
                }
            }
        });
    }

    fn spawn_shutdown_handler(&self, shutdown: Arc<Notify>) {
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else { return };
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else { return };
            let Ok(mut sigquit) = signal(SignalKind::quit()) else { return };

            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigquit.recv() => info!("received SIGQUIT"),
            }
            shutdown.notify_waiters();
        });
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_session<R, W>(
    reader: R,
    writer: W,
    whitelist: &Arc<Whitelist>,
    dispatcher: &Arc<SignalDispatcher>,
    timeout: Duration,
    session_buffer_bytes: usize,
    process_buffer_bytes: usize,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let whitelist = Arc::clone(whitelist);
    let dispatcher = Arc::clone(dispatcher);
    tokio::spawn(async move {
        let session = Session::new(
            reader,
            writer,
            whitelist,
            dispatcher,
            timeout,
            session_buffer_bytes,
            process_buffer_bytes,
        );
        session.run().await;
    });
}

async fn bind_tcp(port: u16) -> Result<TcpListener, BindError> {
    let socket = tokio::net::TcpSocket::new_v4().map_err(|source| BindError::Tcp { port, source })?;
    socket
        .set_reuseaddr(true)
        .map_err(|source| BindError::Tcp { port, source })?;
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(addr).map_err(|source| BindError::Tcp { port, source })?;
    socket.listen(1024).map_err(|source| BindError::Tcp { port, source })
}

fn bind_local(path: &Path) -> Result<UnixListener, BindError> {
    // Unbind a stale socket left by a previous, uncleanly-terminated run.
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).map_err(|source| BindError::Local {
        path: path.display().to_string(),
        source,
    })
}
