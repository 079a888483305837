//! remex: run a command on a remote Sink with local files and stdio.
//!
//! # Usage
//!
//! ```text
//! remex sink [--root <dir>] [--host <host>] [--port <port>]
//! remex exec [--host ..] [--port ..] [--area <id>] [--cwd <dir>] [--transform <file>]... -- <cmd> [args]...
//! remex areas [--json]
//! remex view --area <id> <path>
//! remex remove-area <id>
//! remex clear-cache
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    areas::{AreasArgs, ClearCacheArgs, RemoveAreaArgs, ViewArgs},
    exec::ExecArgs,
    sink::SinkArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "remex",
    version,
    about = "Execute commands on a remote machine against your local files",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve Areas to Sources until interrupted.
    Sink(SinkArgs),

    /// Run a command in a remote Area with local stdio.
    Exec(ExecArgs),

    /// List the Areas a Sink holds.
    Areas(AreasArgs),

    /// Print a file or directory listing from an Area.
    View(ViewArgs),

    /// Stop and delete an Area.
    RemoveArea(RemoveAreaArgs),

    /// Drop every blob from the Sink's content cache.
    ClearCache(ClearCacheArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    remex_daemon::init_tracing();
    match cli.command {
        Commands::Sink(args) => args.run(),
        Commands::Exec(args) => {
            let code = args.run()?;
            std::process::exit(code);
        }
        Commands::Areas(args) => args.run(),
        Commands::View(args) => args.run(),
        Commands::RemoveArea(args) => args.run(),
        Commands::ClearCache(args) => args.run(),
    }
}
