//! Sink daemon, client session and the TCP dispatcher that joins them.

mod area;
pub mod config;
pub mod dispatcher;
mod error;
pub mod sink;
pub mod source;

use std::sync::Arc;

pub use area::EXIT_TIMEOUT;
pub use config::{ClientConfig, SinkConfig, DEFAULT_PORT};
pub use dispatcher::{Dispatcher, EndpointFactory};
pub use error::DaemonError;
pub use sink::{SinkEndpoint, SinkService};
pub use source::{LaunchIo, SourceClient, SourceSession};

/// Serve a Sink on a multi-threaded runtime until Ctrl-C.
pub fn start_blocking(config: SinkConfig) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| error::io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Serve a Sink until Ctrl-C (or SIGTERM on Unix).
pub async fn run(config: SinkConfig) -> Result<(), DaemonError> {
    let sink = SinkService::open(&config.root)?;
    let dispatcher = Dispatcher::for_sink(config.host.clone(), config.port, Arc::clone(&sink));
    let addr = dispatcher.open().await?;
    tracing::info!(addr = %addr, root = %config.root.display(), "sink ready");

    wait_for_signal().await?;
    tracing::info!("shutting down sink");

    dispatcher.close().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).map_err(|e| error::io_err("SIGTERM handler", e))?;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.map_err(|e| error::io_err("ctrl-c handler", e)),
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<(), DaemonError> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| error::io_err("ctrl-c handler", e))
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` filter. Safe to call more than once.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
