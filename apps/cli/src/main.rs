//! ContentSift CLI: duplicate detection and AI enrichment for scraped content.
//!
//! Reads a JSON array of scraped items, groups duplicates, runs each item
//! through cleaning, analysis, summarization and extraction, and writes a
//! ranked result.

mod commands;

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
