//! StudyDeck CLI: summaries, flashcards, and reports from saved pages.
//!
//! Drives the on-device generation service through a bridge subprocess.

mod commands;
mod progress;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
