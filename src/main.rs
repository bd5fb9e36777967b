//! conveyor: a multi-listener TCP dispatch server.
//!
//! N listener threads accept connections on N ports and feed them through a
//! shared queue to M worker threads. Each worker reads one framed request,
//! hands it to the configured request handler, writes the framed response
//! back, and closes the connection.
//!
//! Features:
//! - Sequential (port-hint) or explicit per-listener port assignment
//! - Chunked request framing with an optional NUL response terminator
//! - Configuration via CLI arguments, PROXYSERVER_* environment variables,
//!   or a TOML file
//! - Coordinated startup and shutdown across all listener and worker threads

mod config;
mod framer;
mod handler;
mod listener;
mod server;
mod worker;

use config::Config;
use handler::echo_with_healthcheck;
use server::Server;
use std::fs::File;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; the subscriber serializes writes to the sink
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_file {
        Some(path) => {
            let log_file = File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(log_file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }

    let server_config = config.server_config();

    if let Err(violations) = server_config.validate() {
        for violation in &violations {
            error!("{violation}");
        }
        return Err("invalid server configuration".into());
    }

    info!(
        listeners = server_config.num_listeners,
        workers = server_config.num_workers,
        chunk_size = server_config.chunk_size,
        auto_append = server_config.auto_append,
        timeout_ms = server_config.timeout_ms,
        "Starting conveyor server"
    );

    // Mask termination signals before any threads spawn so every thread
    // inherits the mask and sigwait below sees the signal.
    block_termination_signals();

    let mut server = Server::new(server_config)?;
    server.setup(Arc::new(echo_with_healthcheck))?;
    server.run()?;

    info!(ports = ?server.ports(), "Server up");

    wait_for_termination_signal();
    info!("termination signal received; shutting down");

    server.stop();
    server.wait_for_termination();

    // All listeners and workers have signaled the barrier once this
    // returns; only then is the log sink released with process exit.
    server.await_shutdown();

    Ok(())
}

fn termination_sigset() -> libc::sigset_t {
    // SAFETY: plain libc sigset manipulation on a zeroed, owned set.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        set
    }
}

/// Block SIGINT/SIGTERM for this thread and all threads spawned after it.
fn block_termination_signals() {
    let set = termination_sigset();
    // SAFETY: the set outlives the call; a null old-set is allowed.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        warn!(rc, "failed to mask termination signals");
    }
}

/// Block the calling thread until SIGINT or SIGTERM arrives.
fn wait_for_termination_signal() {
    let set = termination_sigset();
    let mut signal: libc::c_int = 0;
    // SAFETY: sigwait only writes the received signal number.
    let rc = unsafe { libc::sigwait(&set, &mut signal) };
    if rc != 0 {
        warn!(rc, "sigwait failed");
    }
}
