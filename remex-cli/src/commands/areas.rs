//! `remex areas`, `view`, `remove-area`, `clear-cache`: Sink housekeeping.

use std::future::Future;
use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use remex_core::{AreaId, AreaInfo, AreaState, Sink, SinkProxy};

use super::{block_on, disconnect, ConnectArgs};

#[derive(Args, Debug)]
pub struct AreasArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ViewArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[arg(long)]
    pub area: String,

    /// Path relative to the Area cwd; `.` lists the cwd itself.
    #[arg(default_value = ".")]
    pub path: String,
}

#[derive(Args, Debug)]
pub struct RemoveAreaArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    pub area: String,
}

#[derive(Args, Debug)]
pub struct ClearCacheArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Tabled)]
struct AreaRow {
    #[tabled(rename = "area")]
    id: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "exit")]
    exit: String,
    #[tabled(rename = "launched")]
    launched: String,
    #[tabled(rename = "cwd")]
    cwd: String,
}

impl AreasArgs {
    pub fn run(self) -> Result<()> {
        let mut areas = with_sink(&self.connect, |sink| async move {
            sink.get_areas().await.context("could not list areas")
        })?;
        areas.sort_by(|a, b| a.id.cmp(&b.id));

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&areas).context("failed to serialize areas JSON")?
            );
            return Ok(());
        }
        print_table(areas);
        Ok(())
    }
}

impl ViewArgs {
    pub fn run(self) -> Result<()> {
        let area = AreaId::from(self.area.as_str());
        let path = self.path;
        let content = with_sink(&self.connect, |sink| async move {
            sink.view(&area, &path)
                .await
                .with_context(|| format!("could not view '{path}' in area {area}"))
                .map(|content| (area, path, content))
        })?;

        match content {
            (_, _, Some(bytes)) => {
                let mut out = std::io::stdout().lock();
                out.write_all(&bytes).context("failed to write to stdout")?;
                out.flush().context("failed to write to stdout")?;
            }
            (area, path, None) => println!("{}", format!("'{path}' does not exist in area {area}").yellow()),
        }
        Ok(())
    }
}

impl RemoveAreaArgs {
    pub fn run(self) -> Result<()> {
        let area = AreaId::from(self.area.as_str());
        let removed = with_sink(&self.connect, |sink| {
            let area = area.clone();
            async move {
                sink.remove_area(&area)
                    .await
                    .with_context(|| format!("could not remove area {area}"))
            }
        })?;
        if removed {
            println!("removed area {area}");
        } else {
            println!("no area {area}");
        }
        Ok(())
    }
}

impl ClearCacheArgs {
    pub fn run(self) -> Result<()> {
        with_sink(&self.connect, |sink| async move {
            sink.clear_cache().await.context("could not clear cache")
        })?;
        println!("blob cache cleared");
        Ok(())
    }
}

/// Connect, run `call` against the Sink, and disconnect.
fn with_sink<T, F, Fut>(connect: &ConnectArgs, call: F) -> Result<T>
where
    F: FnOnce(SinkProxy) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let cwd = std::env::current_dir().context("could not determine current directory")?;
    block_on(async {
        let client = connect.connect(&cwd).await?;
        let result = call(client.sink().clone()).await;
        disconnect(client).await;
        result
    })?
}

fn print_table(areas: Vec<AreaInfo>) {
    if areas.is_empty() {
        println!("No areas.");
        return;
    }
    let running = areas.iter().filter(|area| area.running).count();
    println!("{} areas | {} running", areas.len(), running);

    let rows: Vec<AreaRow> = areas
        .into_iter()
        .map(|area| AreaRow {
            state: state_label(&area),
            exit: area
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string()),
            launched: area.launched_at.map(format_age).unwrap_or_else(|| "never".to_string()),
            cwd: area.cwd.display().to_string(),
            id: area.id.0,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn state_label(area: &AreaInfo) -> String {
    let label = match area.state {
        AreaState::Exited if area.canceled => "exited (canceled)".to_string(),
        state => state.to_string(),
    };
    match area.state {
        AreaState::Running | AreaState::Launching => label.green().bold().to_string(),
        AreaState::Exited if area.error.is_some() || area.exit_code != Some(0) => {
            label.red().to_string()
        }
        AreaState::Exited => label.normal().to_string(),
        _ => label.bright_black().to_string(),
    }
}

fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
