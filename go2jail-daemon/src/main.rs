//! go2jail — a daemon used to ban hosts attempting to attack your server.

mod cli;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            logging::init_tracing(&args.log)?;
            commands::run::run(args).await
        }
        Command::Test(args) => {
            logging::init_tracing(&args.log)?;
            commands::test::run(args).await
        }
        Command::TestConfig(args) => commands::test_config::run(args),
        Command::Regex(args) => commands::regex::run(args),
        Command::TestMail(args) => {
            logging::init_tracing(&args.log)?;
            commands::mail::run(args).await
        }
    }
}
