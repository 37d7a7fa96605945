//! # QuestCycle
//!
//! Runs the quest renewal system with a developer console on stdin.
//!
//! Usage: `questcycle [config-file]` (defaults to `questcycle.toml`).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

use anyhow::Result;
use questcycle_engine::console::{execute, Command, Reply, HELP};
use questcycle_engine::{Hooks, QuestCycle, CONFIG_FILE};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Main entry point.
fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("questcycle=info".parse()?))
        .init();

    info!("QuestCycle starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from);
    let mut cycle = QuestCycle::enable(&config_path, Hooks::default())?;

    println!("{HELP}");
    run_console(&mut cycle)?;

    cycle.disable();
    info!("QuestCycle shutdown complete");
    Ok(())
}

fn run_console(cycle: &mut QuestCycle) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut lines = stdin.lock().lines();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;

        // End of input stops like `exit`.
        let Some(line) = lines.next() else {
            return Ok(());
        };
        let command = match Command::parse(&line?) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            },
        };

        match execute(cycle, command) {
            Ok(Reply::Output(text)) => println!("{text}"),
            Ok(Reply::Exit) => return Ok(()),
            Err(e) => {
                warn!("Command failed: {e:#}");
                println!("error: {e:#}");
            },
        }
    }
}
