//! Connection state machine and registry.
//!
//! A connection belongs to exactly one owner at a time: the event-loop
//! thread while `Polling`, one worker after it becomes `Dispatched`. The
//! transfer is one-directional and happens at most once per connection.

use crate::reactor::buffer::LineBuffer;
use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered with the poll, accumulating bytes on readiness events.
    Polling,
    /// Handed to a worker; the event loop must never see it again.
    Dispatched,
    /// Closed by the event loop before any dispatch (EOF or read error).
    Closed,
}

/// A single client connection owned by the event loop.
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub buf: LineBuffer,
    state: ConnState,
}

impl Connection {
    /// Create a new connection in the initial polling state.
    pub fn new(stream: TcpStream, peer: SocketAddr, buffer_capacity: usize) -> Self {
        Self {
            stream,
            peer,
            buf: LineBuffer::new(buffer_capacity),
            state: ConnState::Polling,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Begin the Polling → Dispatched transition.
    ///
    /// Called while the connection still sits in the registry, so the read
    /// path can observe the state and refuse to touch a connection that is
    /// already on its way to a worker.
    pub fn begin_dispatch(&mut self) {
        debug_assert_eq!(self.state, ConnState::Polling, "double dispatch");
        self.state = ConnState::Dispatched;
    }

    /// Surrender the stream to the worker. Only valid after
    /// `begin_dispatch`; the buffer is dropped here because the worker
    /// receives the already-decoded message.
    pub fn into_stream(self) -> TcpStream {
        debug_assert_eq!(
            self.state,
            ConnState::Dispatched,
            "stream taken without dispatch transition"
        );
        self.stream
    }

    /// Terminate the connection on the event-loop side. Dropping the
    /// connection closes the socket; the buffered bytes are discarded.
    pub fn mark_closed(&mut self) {
        debug_assert_eq!(self.state, ConnState::Polling, "close after dispatch");
        self.state = ConnState::Closed;
    }
}

/// Registry of connections currently owned by the event loop.
///
/// Mutated exclusively by the event-loop thread. Slab keys double as poll
/// tokens, so a removed connection can never reappear in a readiness set.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
