//! Readiness-based reactor runtime.
//!
//! One event-loop thread multiplexes accept and read readiness across all
//! connections; completed messages are offloaded to the worker pool so the
//! loop never blocks on response writes.

mod buffer;
mod connection;
mod event_loop;

pub use event_loop::EventLoop;

use crate::config::Config;
use std::io;

/// Bind and run the server. Returns only on a fatal poll or listener error.
pub fn run(config: &Config) -> io::Result<()> {
    EventLoop::new(config)?.run()
}
