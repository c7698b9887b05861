// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration: fixed defaults matching the original C++
//! `settings.h`, each overridable via environment variable so tests (and
//! non-root operators) do not need `/etc` or privileged ports.

use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/remote-runnerd.conf";
const DEFAULT_LOCAL_SOCKET_PATH: &str = "/tmp/simple-telnetd";
const DEFAULT_TCP_PORT: u16 = 12345;
const DEFAULT_WORKER_THREADS: usize = 5;
const DEFAULT_BUFFER_BYTES: usize = 1024;

/// Resolved daemon configuration: fixed defaults, overridable via env.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the whitelist config file.
    pub config_path: PathBuf,
    /// TCP port to listen on.
    pub tcp_port: u16,
    /// UNIX-domain socket path to listen on.
    pub local_socket_path: PathBuf,
    /// Number of tokio worker threads (the reactor's thread pool).
    pub worker_threads: usize,
    /// Size of the per-session inbound read buffer.
    pub session_buffer_bytes: usize,
    /// Size of the staging buffer used to drain a child's stdout/stderr.
    pub process_buffer_bytes: usize,
    /// Wall-clock seconds a child is allowed to run before being killed.
    pub timeout_seconds: u64,
}

impl Config {
    /// Resolves configuration from environment variables (falling back to
    /// the original C++ `settings.h` defaults) plus the CLI's timeout.
    pub fn from_env(timeout_seconds: u64) -> Self {
        Self {
            config_path: env_path("RRD_CONFIG_PATH", DEFAULT_CONFIG_PATH),
            tcp_port: env_parsed("RRD_TCP_PORT", DEFAULT_TCP_PORT),
            local_socket_path: env_path("RRD_LOCAL_SOCKET_PATH", DEFAULT_LOCAL_SOCKET_PATH),
            worker_threads: env_parsed("RRD_WORKER_THREADS", DEFAULT_WORKER_THREADS),
            session_buffer_bytes: env_parsed("RRD_SESSION_BUFFER_BYTES", DEFAULT_BUFFER_BYTES),
            process_buffer_bytes: env_parsed("RRD_PROCESS_BUFFER_BYTES", DEFAULT_BUFFER_BYTES),
            timeout_seconds,
        }
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var_os(var).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default))
}

fn env_parsed<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_settings() {
        // Run in isolation from the process environment: construct directly
        // rather than going through from_env, which would be racy under
        // parallel test execution if other tests set RRD_* vars.
        let cfg = Config {
            config_path: env_path("RRD_CONFIG_PATH_UNSET_PROBE", DEFAULT_CONFIG_PATH),
            tcp_port: DEFAULT_TCP_PORT,
            local_socket_path: PathBuf::from(DEFAULT_LOCAL_SOCKET_PATH),
            worker_threads: DEFAULT_WORKER_THREADS,
            session_buffer_bytes: DEFAULT_BUFFER_BYTES,
            process_buffer_bytes: DEFAULT_BUFFER_BYTES,
            timeout_seconds: 30,
        };
        assert_eq!(cfg.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cfg.tcp_port, 12345);
        assert_eq!(cfg.worker_threads, 5);
    }
}
