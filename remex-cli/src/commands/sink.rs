//! `remex sink`: serve Areas in the foreground.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use remex_daemon::config::{default_root, ANY_HOST};
use remex_daemon::{start_blocking, SinkConfig, DEFAULT_PORT};

#[derive(Args, Debug)]
pub struct SinkArgs {
    /// State directory for Areas and the blob cache. Defaults to `~/.remex`.
    #[arg(long, env = "REMEX_ROOT")]
    pub root: Option<PathBuf>,

    /// Interface to bind; `*` binds all of them.
    #[arg(long, env = "REMEX_HOST", default_value = ANY_HOST)]
    pub host: String,

    #[arg(long, env = "REMEX_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl SinkArgs {
    pub fn run(self) -> Result<()> {
        let root = match self.root {
            Some(root) => root,
            None => {
                let home = dirs::home_dir().context("could not determine home directory")?;
                default_root(&home)
            }
        };
        let config = SinkConfig::new(root)
            .with_host(self.host)
            .with_port(self.port);
        start_blocking(config).context("sink exited with error")
    }
}
