//! Fixed-size worker pool for connection-terminal processing.
//!
//! The event loop submits one task per connection; the receiving worker
//! parses the message, writes the acknowledgment, and closes the socket.
//! Nothing is ever reported back to the event loop.

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::TcpStream;
use std::io::{self, Write};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// A unit of work handed off by the event loop.
///
/// Carries the stream by value: once a task exists, the worker is the sole
/// owner of the connection until it closes it.
pub struct Task {
    pub stream: TcpStream,
    pub message: String,
    pub conn_id: usize,
}

/// Pool of worker threads consuming tasks from a shared queue.
///
/// The queue is unbounded, so `submit` never blocks the event loop. Under
/// sustained overload tasks pile up in memory; bounding the queue would need
/// a rejection response, which this server does not define.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `pool_size` worker threads.
    pub fn new(pool_size: usize) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let mut handles = Vec::with_capacity(pool_size);

        for worker_id in 0..pool_size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver))?;
            handles.push(handle);
        }

        info!(workers = pool_size, "Worker pool started");
        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    /// Enqueue a task without blocking.
    ///
    /// Returns `false` if the pool has shut down; the caller drops the
    /// stream, which closes the connection.
    pub fn submit(&self, task: Task) -> bool {
        match &self.sender {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        }
    }

    /// Close the queue and wait for workers to drain in-flight tasks.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Task>) {
    // Exits when the pool drops its sender and the queue drains.
    while let Ok(task) = receiver.recv() {
        let conn_id = task.conn_id;
        match respond(task) {
            Ok(()) => debug!(worker = worker_id, conn_id, "Connection completed"),
            // Best-effort cleanup: the socket is closed either way.
            Err(e) => debug!(worker = worker_id, conn_id, error = %e, "Response write failed"),
        }
    }
}

/// Write the acknowledgment for a task's message and close the connection.
fn respond(task: Task) -> io::Result<()> {
    let reply = render_response(&task.message);
    let mut stream = into_blocking(task.stream)?;
    stream.write_all(reply.as_bytes())?;
    Ok(())
}

/// Render the response line for a decoded message.
///
/// The message parses as a decimal integer or it doesn't; either way the
/// client gets exactly one line back.
pub fn render_response(message: &str) -> String {
    match message.parse::<i64>() {
        Ok(n) => format!("Received number: {n}\n"),
        Err(_) => "Invalid number\n".to_string(),
    }
}

/// Reconstitute the mio stream as a plain blocking socket.
///
/// The reactor registered the stream non-blocking; the worker wants its
/// write to suspend this thread only, so flip it back before responding.
fn into_blocking(stream: TcpStream) -> io::Result<std::net::TcpStream> {
    // Safety: into_raw_fd transfers ownership of a valid open descriptor.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
    std_stream.set_nonblocking(false)?;
    Ok(std_stream)
}
