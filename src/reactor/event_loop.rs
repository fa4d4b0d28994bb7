//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking accept/read syscalls. Uses epoll on Linux, kqueue
//! on macOS.
//!
//! This thread owns the only readiness wait point in the process. It never
//! parses messages and never writes responses (the accept greeting is the
//! one best-effort exception); a connection with a complete line is
//! deregistered and handed to the worker pool, after which the loop has no
//! way to reach it again.

use crate::config::Config;
use crate::reactor::connection::{ConnState, Connection, ConnectionRegistry};
use crate::worker::{Task, WorkerPool};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Write};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;
const MAX_CONNECTIONS: usize = 1024;

/// Single-threaded readiness poller with worker-pool offload.
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    registry: ConnectionRegistry,
    pool: WorkerPool,
    buffer_capacity: usize,
}

impl EventLoop {
    /// Bind the listener, register it, and spawn the worker pool.
    pub fn new(config: &Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = create_listener(addr)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let pool = WorkerPool::new(config.pool_size)?;

        Ok(Self {
            poll,
            listener,
            registry: ConnectionRegistry::new(MAX_CONNECTIONS),
            pool,
            buffer_capacity: config.buffer_capacity,
        })
    }

    /// Address the listener is bound to. Useful when binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the loop until a fatal poll or listener error.
    pub fn run(mut self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "Server listening");

        let result = self.poll_loop();
        if let Err(ref e) = result {
            error!(error = %e, "Event loop terminated");
        }

        // Let workers finish in-flight responses before reporting.
        self.pool.shutdown();
        result
    }

    fn poll_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready()?,
                    Token(conn_id) => self.read_ready(conn_id),
                }
            }
        }
    }

    /// Drain the accept queue. Peer-caused accept errors are logged and the
    /// loop keeps serving; an error from the listening socket itself is
    /// fatal and terminates the service.
    fn accept_ready(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register_connection(stream, peer)?,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if is_transient_accept_error(e) => {
                    warn!(error = %e, "Accept failed, continuing");
                }
                Err(e) => {
                    error!(error = %e, "Listener unusable");
                    return Err(e);
                }
            }
        }
    }

    fn register_connection(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let conn = Connection::new(stream, peer, self.buffer_capacity);
        let conn_id = match self.registry.insert(conn) {
            Some(id) => id,
            None => {
                warn!(%peer, "Connection limit reached, dropping");
                return Ok(());
            }
        };

        if let Some(conn) = self.registry.get_mut(conn_id) {
            self.poll
                .registry()
                .register(&mut conn.stream, Token(conn_id), Interest::READABLE)?;

            debug!(conn_id, %peer, "Accepted connection");

            // Best-effort greeting: fire and forget, never retried. A
            // partial or failed write here must not stall the loop.
            let greeting = format!("Hello {peer}\n");
            if let Err(e) = conn.stream.write(greeting.as_bytes()) {
                debug!(conn_id, error = %e, "Greeting write skipped");
            }
        }

        Ok(())
    }

    /// Handle read readiness for one connection token.
    fn read_ready(&mut self, conn_id: usize) {
        // Tokens can go stale within a poll cycle; ignore them.
        if !self.registry.contains(conn_id) {
            return;
        }

        if let Err(e) = self.try_read(conn_id) {
            debug!(conn_id, error = %e, "Closing connection");
            self.close_connection(conn_id);
        }
    }

    /// Perform exactly one non-blocking read, then dispatch if a complete
    /// line is buffered. Errors mean the connection is done for.
    fn try_read(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.registry.get_mut(conn_id) {
            Some(conn) => conn,
            None => return Ok(()),
        };

        // Only Polling connections belong to the event loop.
        if conn.state() != ConnState::Polling {
            return Ok(());
        }

        let n = match conn.buf.read_from(&mut conn.stream) {
            // A readable socket returning zero bytes means the peer closed.
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "peer closed",
                ))
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };

        debug!(conn_id, bytes = n, buffered = conn.buf.len(), "Read");

        let line = conn.buf.take_line();

        // Full with no newline means the line can never complete. Close on
        // this event: the registration is edge-triggered, so the burst that
        // filled the buffer may have been the last wake-up this socket
        // ever produces.
        if line.is_none() && conn.buf.is_full() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "line exceeds buffer capacity",
            ));
        }

        if let Some(message) = line {
            self.dispatch(conn_id, message);
        }

        Ok(())
    }

    /// Transfer the connection to the worker pool.
    ///
    /// The registry entry is removed and the stream deregistered before the
    /// task is queued, so no further readiness event can reference it.
    fn dispatch(&mut self, conn_id: usize, message: String) {
        // Transition while still registered, then remove; the state check
        // in try_read keeps a Dispatched connection untouchable even if a
        // stale token surfaces in the same poll cycle.
        match self.registry.get_mut(conn_id) {
            Some(conn) => conn.begin_dispatch(),
            None => return,
        }

        let conn = match self.registry.remove(conn_id) {
            Some(conn) => conn,
            None => return,
        };

        let mut stream = conn.into_stream();
        if let Err(e) = self.poll.registry().deregister(&mut stream) {
            // Dropping the stream still closes it; the worker never sees it.
            warn!(conn_id, error = %e, "Deregister failed, dropping connection");
            return;
        }

        debug!(conn_id, message = %message, "Dispatching to worker pool");

        if !self.pool.submit(Task {
            stream,
            message,
            conn_id,
        }) {
            warn!(conn_id, "Worker pool unavailable, dropping connection");
        }
    }

    /// Close a connection from the event-loop side: EOF, read error, or an
    /// overlong line. No task was or will be created for it.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.registry.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            conn.mark_closed();
            debug!(conn_id, peer = %conn.peer, active = self.registry.len(), "Connection closed");
        }
    }
}

/// Errors raised by the remote end of a pending connection rather than by
/// the listening socket itself. Anything else means the listener is broken
/// and the service cannot continue.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
    )
}

/// Create a non-blocking TCP listener via socket2.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn start_server(pool_size: usize) -> SocketAddr {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            pool_size,
            buffer_capacity: 1024,
            log_level: "info".to_string(),
        };
        let event_loop = EventLoop::new(&config).unwrap();
        let addr = event_loop.local_addr().unwrap();
        thread::spawn(move || {
            let _ = event_loop.run();
        });
        addr
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send one payload, then read every line the server produces until it
    /// closes the connection.
    fn exchange(addr: SocketAddr, payload: &[u8]) -> Vec<String> {
        let mut stream = connect(addr);
        stream.write_all(payload).unwrap();

        let reader = BufReader::new(stream);
        reader.lines().map(|l| l.unwrap()).collect()
    }

    #[test]
    fn test_round_trip() {
        let addr = start_server(2);
        let lines = exchange(addr, b"42\n");

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Hello 127.0.0.1:"));
        assert_eq!(lines[1], "Received number: 42");
    }

    #[test]
    fn test_invalid_input() {
        let addr = start_server(2);
        let lines = exchange(addr, b"not-a-number\n");

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "Invalid number");
    }

    #[test]
    fn test_eof_before_message() {
        let addr = start_server(2);
        let stream = connect(addr);
        stream.shutdown(Shutdown::Write).unwrap();

        let mut data = String::new();
        let mut stream = stream;
        stream.read_to_string(&mut data).unwrap();

        // Greeting only; no response was ever attempted.
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Hello"));
    }

    #[test]
    fn test_partial_read_accumulation() {
        let addr = start_server(2);
        let mut stream = connect(addr);

        stream.write_all(b"4").unwrap();
        thread::sleep(Duration::from_millis(100));
        stream.write_all(b"2\n").unwrap();

        let reader = BufReader::new(stream);
        let lines: Vec<String> = reader.lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines.last().unwrap(), "Received number: 42");
    }

    #[test]
    fn test_overlong_line_closes_without_response() {
        let addr = start_server(2);
        let mut stream = connect(addr);

        // Two kilobytes without a newline overrun the 1024-byte buffer in
        // a single burst, so the close must happen on that same readiness
        // event rather than wait for another one.
        stream.write_all(&[b'9'; 2048]).unwrap();

        let mut data = String::new();
        // The server must actually terminate the connection: either a clean
        // EOF or a reset for the unread tail. A read timeout here means the
        // connection was leaked instead.
        match stream.read_to_string(&mut data) {
            Ok(_) => {}
            Err(e) => assert_eq!(
                e.kind(),
                io::ErrorKind::ConnectionReset,
                "connection was not closed: {e}"
            ),
        }
        assert!(!data.contains("Received number"));
        assert!(!data.contains("Invalid number"));
    }

    #[test]
    fn test_accept_error_classification() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::Interrupted,
        ] {
            assert!(is_transient_accept_error(&io::Error::from(kind)));
        }

        // A broken listening socket is not something to retry.
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::Other,
            "bad fd"
        )));
    }

    #[test]
    fn test_concurrent_clients_exceeding_pool() {
        let addr = start_server(2);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || {
                    let payload = format!("{}\n", i * 11);
                    let lines = exchange(addr, payload.as_bytes());
                    assert_eq!(
                        lines.last().unwrap(),
                        &format!("Received number: {}", i * 11)
                    );
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
