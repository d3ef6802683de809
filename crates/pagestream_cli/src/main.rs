//! `pagestream`: crawl URLs with the external engine and optionally stream
//! the results to a message broker.
use anyhow::Result;
use clap::Parser;
use engine_logging::{level_from_verbosity, LogDestination};

mod args;
mod run;

use args::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let destination = match &cli.log_file {
        Some(path) => LogDestination::Both(path.clone()),
        None => LogDestination::Terminal,
    };
    engine_logging::initialize(level_from_verbosity(cli.verbose, cli.quiet), &destination);

    run::execute(cli).await
}
