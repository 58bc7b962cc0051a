//! rowforge CLI: run declarative multi-step LLM pipelines over rows of data.
//!
//! Each input row flows through the pipeline's steps (plugins, generation,
//! validation) and the results land in an output directory.

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
