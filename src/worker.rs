//! Worker: drains the shared work queue and runs the request/response cycle
//! for each connection.

use crate::config::WorkerConfig;
use crate::framer::{ChunkedFramer, Framer};
use crate::handler::Handler;
use crossbeam_channel::Receiver;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A worker that processes queued connections end to end.
///
/// The worker owns each connection from the moment it leaves the queue
/// until the stream drops at the end of the iteration, so stopping never
/// has to reach into another thread to close a socket.
pub struct Worker {
    id: usize,
    config: WorkerConfig,
    framer: ChunkedFramer,
    queue: Receiver<TcpStream>,
    task: Arc<dyn Handler>,
    active: Arc<AtomicBool>,
}

/// Control handle for a worker, usable from any thread.
#[derive(Clone)]
pub struct WorkerHandle {
    id: usize,
    active: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: WorkerConfig,
        queue: Receiver<TcpStream>,
        task: Arc<dyn Handler>,
    ) -> Self {
        Self {
            id,
            framer: ChunkedFramer::new(config.chunk_size, config.auto_append),
            config,
            queue,
            task,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id,
            active: Arc::clone(&self.active),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Mark the worker active. Called once before the loop is spawned.
    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// The processing loop. Runs until stopped or until the queue
    /// disconnects, which can only happen once every listener is gone.
    pub fn run(self) {
        while self.active.load(Ordering::SeqCst) {
            let stream = match self.queue.recv() {
                Ok(stream) => stream,
                Err(_) => {
                    debug!(worker = self.id, "work queue disconnected");
                    break;
                }
            };

            self.process(stream);
        }

        self.handle().stop();
    }

    /// Run one connection end to end. Per-connection failures abandon the
    /// connection and leave the loop running.
    fn process(&self, mut stream: TcpStream) {
        if let Err(e) = stream.set_read_timeout(Some(self.config.timeout)) {
            warn!(worker = self.id, error = %e, "failed to set read timeout");
            return;
        }

        let request = match self.framer.read_request(&mut stream) {
            Ok(request) => request,
            Err(e) => {
                warn!(worker = self.id, error = %e, "failed to read request");
                return;
            }
        };

        // Runs synchronously on this thread. A panicking handler unwinds
        // this worker and the pool shrinks.
        let response = self.task.handle(&request);

        if let Err(e) = self.framer.write_response(&mut stream, response.as_bytes()) {
            warn!(worker = self.id, error = %e, "failed to write response");
        }

        // Dropping the stream closes the connection.
    }
}

impl WorkerHandle {
    /// Ask the worker to stop. The current or next loop iteration exits
    /// once the flag is observed. Idempotent.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!(worker = self.id, "worker going down");
        }
    }

    /// Whether the worker is between `start` and `stop`, independent of
    /// whether it is currently blocked on the queue.
    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
