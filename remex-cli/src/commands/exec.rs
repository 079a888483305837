//! `remex exec`: run one command remotely.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;

use remex_core::AreaId;
use remex_daemon::LaunchIo;

use super::{block_on, disconnect, ConnectArgs};

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Reuse (or create) the Area with this id instead of allocating one.
    #[arg(long)]
    pub area: Option<String>,

    /// Local working directory the command's paths are relative to.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Text file whose embedded paths are rewritten before it is sent.
    #[arg(long = "transform", value_name = "FILE")]
    pub transforms: Vec<PathBuf>,

    /// Extra environment for the remote command, as KEY=VALUE.
    #[arg(long = "env", short = 'e', value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Forward local stdin even when it is not a terminal. End of input
    /// cancels the remote command.
    #[arg(long)]
    pub stdin: bool,

    /// Command and arguments.
    #[arg(last = true, required = true, value_name = "CMD")]
    pub command: Vec<String>,
}

impl ExecArgs {
    /// Returns the remote exit code.
    pub fn run(self) -> Result<i32> {
        if self.command.is_empty() {
            bail!("no command given");
        }
        let cwd = match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir().context("could not determine current directory")?,
        };
        let cwd = cwd
            .canonicalize()
            .with_context(|| format!("invalid working directory {}", cwd.display()))?;

        block_on(self.execute(cwd))?
    }

    async fn execute(self, cwd: PathBuf) -> Result<i32> {
        let client = self.connect.connect(&cwd).await?;
        let session = client.session().clone();

        let info = session
            .open(self.area.map(AreaId::from))
            .await
            .context("could not open area")?;
        tracing::debug!(area = %info.id, cwd = %info.cwd.display(), "area ready");

        for file in &self.transforms {
            let file = absolute(&cwd, file);
            session
                .mark_transform(&file)
                .with_context(|| format!("could not register {}", file.display()))?;
        }

        let forward_stdin = self.stdin || std::io::stdin().is_terminal();
        let env: BTreeMap<String, String> = self.env.into_iter().collect();
        session
            .launch(env, self.command, LaunchIo::inherit(forward_stdin))
            .await
            .context("launch failed")?;

        let code = tokio::select! {
            code = session.join() => code.context("lost track of the remote command")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(area = %info.id, "interrupted, cancelling");
                session.cancel().await.context("cancel failed")?;
                session.join().await.context("lost track of the remote command")?
            }
        };

        disconnect(client).await;
        Ok(code)
    }
}

fn absolute(cwd: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        cwd.join(file)
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
