//! numberline: a non-blocking TCP demo server.
//!
//! A single event-loop thread multiplexes accept/read readiness across all
//! connections. Once a client has sent a complete newline-terminated line,
//! the connection is handed to a fixed pool of worker threads that parse
//! the line as a decimal integer, write the acknowledgment, and close the
//! socket. Configuration via CLI arguments or TOML file.

mod config;
mod reactor;
mod worker;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        pool_size = config.pool_size,
        buffer_capacity = config.buffer_capacity,
        "Starting numberline server"
    );

    reactor::run(&config)?;
    Ok(())
}
