//! Listener: owns one bound listening socket and feeds accepted connections
//! into the shared work queue.

use crate::config::ListenerConfig;
use crossbeam_channel::Sender;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A listener bound to one port.
///
/// Lifecycle: `bind` enters the bound state, `run` is the accept loop, and
/// the listener is stopped either by [`ListenerHandle::stop`] or by the
/// accept loop exiting on its own. Stopping shuts the socket down, which
/// unblocks a pending accept; the loop treats that as a clean exit.
pub struct Listener {
    config: ListenerConfig,
    socket: Arc<TcpListener>,
    stopped: Arc<AtomicBool>,
    queue: Sender<TcpStream>,
}

/// Control handle for a listener, usable from any thread.
#[derive(Clone)]
pub struct ListenerHandle {
    port: u16,
    socket: Arc<TcpListener>,
    stopped: Arc<AtomicBool>,
}

impl Listener {
    /// Bind the listening socket. Failure here is fatal to server setup.
    pub fn bind(config: ListenerConfig, queue: Sender<TcpStream>) -> io::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;

        info!(port = config.port, "listener bound");

        Ok(Self {
            config,
            socket: Arc::new(socket.into()),
            stopped: Arc::new(AtomicBool::new(false)),
            queue,
        })
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            port: self.config.port,
            socket: Arc::clone(&self.socket),
            stopped: Arc::clone(&self.stopped),
        }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// The address the socket actually bound, which differs from the
    /// configured port when that port was 0.
    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The accept loop. Blocks until a connection arrives or the socket is
    /// shut down, and enqueues every accepted connection.
    pub fn run(self) {
        let port = self.config.port;

        loop {
            match self.socket.accept() {
                Ok((stream, peer)) => {
                    // Enqueue before logging so a worker can pick the
                    // connection up with as little added latency as possible.
                    if self.queue.send(stream).is_err() {
                        // Every worker is gone; nothing can drain the queue.
                        error!(port, "work queue disconnected");
                        break;
                    }

                    info!(port, peer = %peer, "accepted connection");
                }
                Err(e) if self.stopped.load(Ordering::SeqCst) => {
                    // stop() shut the socket down under us; not an error.
                    debug!(port, error = %e, "accept interrupted by stop");
                    break;
                }
                Err(e) => {
                    error!(port, error = %e, "accept failed");
                    break;
                }
            }
        }

        // Close the socket on every exit path before signaling shutdown.
        self.handle().stop();
    }
}

impl ListenerHandle {
    /// Shut the listening socket down, unblocking a pending accept.
    /// Idempotent: stopping an already-stopped listener is a no-op.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        // SAFETY: the fd stays valid for as long as the shared socket lives.
        unsafe {
            libc::shutdown(self.socket.as_raw_fd(), libc::SHUT_RDWR);
        }
        info!(port = self.port, "listener going down");
    }
}
