pub mod areas;
pub mod exec;
pub mod sink;

use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use remex_daemon::{ClientConfig, SourceClient, DEFAULT_PORT};

/// Where to find the Sink.
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Sink host name or address.
    #[arg(long, env = "REMEX_HOST", default_value = "localhost")]
    pub host: String,

    /// Sink port.
    #[arg(long, env = "REMEX_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl ConnectArgs {
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.host.clone(), self.port)
    }

    pub async fn connect(&self, cwd: &Path) -> Result<SourceClient> {
        let config = self.config();
        SourceClient::connect(&config, cwd)
            .await
            .with_context(|| format!("could not connect to sink at {}", config.connect_addr()))
    }
}

/// Run `future` to completion on a fresh runtime.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

/// Close the connection, logging rather than failing on errors.
pub async fn disconnect(client: SourceClient) {
    if let Err(err) = client.close().await {
        tracing::debug!(error = %err, "closing connection failed");
    }
}
