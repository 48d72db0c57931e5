//! echo-server: echoes every byte it receives back to the sender.
//!
//! Runs the completion-queue engine with echo callbacks until a line (or
//! EOF) arrives on stdin.
//!
//! Configuration via CLI arguments or TOML file, see `--help`.

mod config;

use completion_server::Server;
use config::Config;
use std::io::BufRead;
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
        address = %config.address,
        port = config.port,
        workers = config.options.workers,
        accept_pool = config.options.accept_pool_size,
        recv_buffer_size = config.options.recv_buffer_size,
        "Starting echo server"
    );

    let server = Server::new(config.address, config.port)
        .with_options(config.options)
        .on_connected(|session| {
            info!(
                socket = %session.id(),
                local = session.local_addr(),
                remote = session.remote_addr(),
                "Client connected"
            );
        })
        .on_message(|session, buf| {
            let data = buf.peek().to_vec();
            buf.retrieve_all();
            session.send(&data);
        })
        .on_disconnected(|session| {
            info!(socket = %session.id(), remote = session.remote_addr(), "Client disconnected");
        });

    server.start()?;
    info!("Press Enter to stop");

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    server.stop();
    Ok(())
}
