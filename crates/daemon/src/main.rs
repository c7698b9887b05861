// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! remote-runnerd: multi-user remote command-execution daemon.
//!
//! USAGE: remote-runnerd <timeout-seconds>

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rrd_daemon::{Config, Server};

fn usage() {
    println!("remote-runnerd {}", env!("CARGO_PKG_VERSION"));
    println!("Multi-user remote command-execution daemon");
    println!();
    println!("USAGE:");
    println!("    remote-runnerd <timeout-seconds>");
    println!();
    println!("The whitelist config file, listening port, and local socket path are");
    println!("fixed by settings (overridable for testing via RRD_CONFIG_PATH,");
    println!("RRD_TCP_PORT, RRD_LOCAL_SOCKET_PATH).");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print help information");
    println!("    -v, --version    Print version information");
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

fn main() -> std::process::ExitCode {
    let arg = std::env::args().nth(1);

    let timeout_seconds: u64 = match arg.as_deref() {
        None => {
            usage();
            return std::process::ExitCode::SUCCESS;
        }
        Some("--help") | Some("-h") | Some("help") => {
            usage();
            return std::process::ExitCode::SUCCESS;
        }
        Some("--version") | Some("-v") | Some("-V") => {
            println!("remote-runnerd {}", env!("CARGO_PKG_VERSION"));
            return std::process::ExitCode::SUCCESS;
        }
        Some(value) => match value.parse() {
            Ok(timeout) => timeout,
            Err(_) => {
                eprintln!("Bad timeout value: '{value}'");
                return std::process::ExitCode::FAILURE;
            }
        },
    };

    setup_logging();

    let config = Config::from_env(timeout_seconds);

    if !config.config_path.exists() {
        eprintln!("Config file does not exist: {}", config.config_path.display());
        return std::process::ExitCode::FAILURE;
    }

    // Worker pool size is only known at runtime (env-overridable), so the
    // tokio runtime is built by hand instead of via #[tokio::main] -- the
    // same fixed-size-thread-pool role `settings::server_thread_pool_size`
    // played in the original.
    let worker_threads = config.worker_threads;
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> std::process::ExitCode {
    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {e}");
            eprintln!("failed to start: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("server error: {e}");
        eprintln!("server error: {e}");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}
