//! Server orchestration: builds the listener and worker fleets around one
//! shared work queue and coordinates startup and shutdown.
//!
//! The `Server` doubles as the lifecycle controller: the caller owns it and
//! drives `setup` -> `run` -> `stop` -> `await_shutdown` /
//! `wait_for_termination` explicitly, instead of relying on process-wide
//! exit hooks.

use crate::config::{ConfigError, ListenerConfig, ServerConfig};
use crate::handler::Handler;
use crate::listener::{Listener, ListenerHandle};
use crate::worker::{Worker, WorkerHandle};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossbeam_utils::sync::WaitGroup;
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// The dispatch server: N listeners feeding M workers through one
/// unbounded FIFO queue.
pub struct Server {
    config: ServerConfig,
    ports: Vec<u16>,
    listeners: Vec<Listener>,
    workers: Vec<Worker>,
    listener_handles: Vec<ListenerHandle>,
    worker_handles: Vec<WorkerHandle>,
    threads: Vec<JoinHandle<()>>,
    shutdown: Option<WaitGroup>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("ports", &self.ports)
            .field("listeners", &self.listeners.len())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server for the given configuration. Fails if the port
    /// specification cannot produce one port per listener.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        let ports = config.ports()?;

        Ok(Self {
            config,
            ports,
            listeners: Vec::new(),
            workers: Vec::new(),
            listener_handles: Vec::new(),
            worker_handles: Vec::new(),
            threads: Vec::new(),
            shutdown: None,
        })
    }

    /// Bind every listener and construct every worker, all wired to one
    /// shared queue and the same handler. A single bind failure aborts the
    /// whole setup.
    pub fn setup(&mut self, task: Arc<dyn Handler>) -> io::Result<()> {
        let (queue_tx, queue_rx) = unbounded();
        self.setup_listeners(&queue_tx)?;
        self.setup_workers(queue_rx, task);

        // The listeners now hold the only senders, so the queue disconnects
        // (releasing blocked workers) once the last listener exits.
        Ok(())
    }

    fn setup_listeners(&mut self, queue: &Sender<TcpStream>) -> io::Result<()> {
        for &port in &self.ports {
            let listener = Listener::bind(ListenerConfig { port }, queue.clone())?;
            self.listener_handles.push(listener.handle());
            self.listeners.push(listener);
        }
        Ok(())
    }

    fn setup_workers(&mut self, queue: Receiver<TcpStream>, task: Arc<dyn Handler>) {
        for id in 0..self.config.num_workers {
            let worker = Worker::new(
                id,
                self.config.worker_config(),
                queue.clone(),
                Arc::clone(&task),
            );
            self.worker_handles.push(worker.handle());
            self.workers.push(worker);
        }
    }

    /// Start every listener and worker on its own named thread and return
    /// immediately. The shutdown barrier is sized to the thread count: each
    /// thread carries one token and drops it exactly once on exit, panics
    /// included.
    pub fn run(&mut self) -> io::Result<()> {
        let barrier = WaitGroup::new();

        for listener in self.listeners.drain(..) {
            let token = barrier.clone();
            self.threads.push(
                thread::Builder::new()
                    .name(format!("listener-{}", listener.port()))
                    .spawn(move || {
                        listener.run();
                        drop(token);
                    })?,
            );
        }

        for worker in self.workers.drain(..) {
            worker.start();
            let token = barrier.clone();
            self.threads.push(
                thread::Builder::new()
                    .name(format!("worker-{}", worker.id()))
                    .spawn(move || {
                        worker.run();
                        drop(token);
                    })?,
            );
        }

        self.shutdown = Some(barrier);

        info!(
            listeners = self.listener_handles.len(),
            workers = self.worker_handles.len(),
            "server up"
        );

        Ok(())
    }

    /// Ask every listener and worker to stop. Idempotent per component:
    /// stopping twice is a no-op.
    ///
    /// Closing the listening sockets unblocks pending accepts; the exiting
    /// listeners drop their queue senders, which in turn releases any worker
    /// still blocked on the queue.
    pub fn stop(&self) {
        for listener in &self.listener_handles {
            listener.stop();
        }

        for worker in &self.worker_handles {
            worker.stop();
        }
    }

    /// Block until every listener and worker has signaled the shutdown
    /// barrier. Consumes the barrier; later calls return immediately.
    pub fn await_shutdown(&mut self) {
        if let Some(barrier) = self.shutdown.take() {
            barrier.wait();
        }
    }

    /// Block until every listener and worker thread has exited, independent
    /// of the shutdown barrier.
    pub fn wait_for_termination(&mut self) {
        for handle in self.threads.drain(..) {
            let name = handle
                .thread()
                .name()
                .unwrap_or("<unnamed>")
                .to_string();
            if handle.join().is_err() {
                error!(thread = %name, "thread terminated by panic");
            }
        }
    }

    /// The ports this server's listeners bind, in listener order.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Get the worker control handles for testing
    #[cfg(test)]
    pub fn worker_handles(&self) -> &[WorkerHandle] {
        &self.worker_handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config(port_hint: u16, num_listeners: usize, num_workers: usize) -> ServerConfig {
        ServerConfig {
            num_listeners,
            num_workers,
            port_hint,
            port_list: None,
            chunk_size: 1024,
            auto_append: false,
            timeout_ms: 200,
            log_file: None,
        }
    }

    fn echo_task() -> Arc<dyn Handler> {
        Arc::new(|request: &[u8]| String::from_utf8_lossy(request).into_owned())
    }

    fn roundtrip(port: u16, payload: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(payload).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        response
    }

    #[test]
    fn test_end_to_end_echo() {
        let mut server = Server::new(test_config(18000, 1, 1)).unwrap();
        server.setup(echo_task()).unwrap();
        server.run().unwrap();

        assert_eq!(roundtrip(18000, b"ping"), b"ping");

        server.stop();
        server.wait_for_termination();
    }

    #[test]
    fn test_listeners_bind_sequential_ports() {
        let mut server = Server::new(test_config(18010, 3, 2)).unwrap();
        assert_eq!(server.ports(), &[18010, 18011, 18012]);

        server.setup(echo_task()).unwrap();
        server.run().unwrap();

        for port in [18010, 18011, 18012] {
            assert_eq!(roundtrip(port, b"hello"), b"hello");
        }

        server.stop();
        server.wait_for_termination();
    }

    #[test]
    fn test_explicit_port_list_binds_positionally() {
        let config = ServerConfig {
            port_list: Some("18021,18020".to_string()),
            ..test_config(0, 2, 1)
        };
        let mut server = Server::new(config).unwrap();
        assert_eq!(server.ports(), &[18021, 18020]);

        server.setup(echo_task()).unwrap();
        server.run().unwrap();

        assert_eq!(roundtrip(18020, b"a"), b"a");
        assert_eq!(roundtrip(18021, b"b"), b"b");

        server.stop();
        server.wait_for_termination();
    }

    #[test]
    fn test_mismatched_port_list_fails_construction() {
        let config = ServerConfig {
            port_list: Some("18030,18031".to_string()),
            ..test_config(0, 3, 1)
        };
        assert!(matches!(
            Server::new(config).unwrap_err(),
            ConfigError::PortCountMismatch { .. }
        ));
    }

    #[test]
    fn test_connection_handled_by_exactly_one_worker() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&invocations);
        let task: Arc<dyn Handler> = Arc::new(move |request: &[u8]| {
            counted.fetch_add(1, Ordering::SeqCst);
            String::from_utf8_lossy(request).into_owned()
        });

        let mut server = Server::new(test_config(18040, 1, 2)).unwrap();
        server.setup(task).unwrap();
        server.run().unwrap();

        assert_eq!(roundtrip(18040, b"once"), b"once");
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        server.stop();
        server.wait_for_termination();
    }

    #[test]
    fn test_stop_terminates_all_threads() {
        let mut server = Server::new(test_config(18050, 2, 3)).unwrap();
        server.setup(echo_task()).unwrap();
        server.run().unwrap();

        server.stop();
        server.stop(); // second stop is a no-op

        // Neither wait may hang: the listeners exit on socket shutdown and
        // the queue disconnect releases the blocked workers.
        server.wait_for_termination();
        server.await_shutdown();
        server.await_shutdown(); // barrier already consumed
    }

    #[test]
    fn test_worker_active_flag_visible_through_server() {
        let mut server = Server::new(test_config(18060, 1, 1)).unwrap();
        server.setup(echo_task()).unwrap();
        server.run().unwrap();

        // Active while blocked on the empty queue.
        assert!(server.worker_handles()[0].is_active());

        server.stop();
        assert!(!server.worker_handles()[0].is_active());

        server.wait_for_termination();
    }

    #[test]
    fn test_bind_conflict_aborts_setup() {
        let mut first = Server::new(test_config(18070, 1, 1)).unwrap();
        first.setup(echo_task()).unwrap();

        // Same port again: setup must surface the bind failure.
        let mut second = Server::new(test_config(18070, 1, 1)).unwrap();
        assert!(second.setup(echo_task()).is_err());

        first.run().unwrap();
        first.stop();
        first.wait_for_termination();
    }
}
