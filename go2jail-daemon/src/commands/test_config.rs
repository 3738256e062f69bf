//! `go2jail test-config` — load and validate the configuration.

use anyhow::Result;

use crate::cli::TestConfigArgs;
use crate::commands::load_config;

pub fn run(args: TestConfigArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    println!(
        "config ok: {} watches, {} disciplines, {} jails, {} allows",
        config.watches.len(),
        config.disciplines.len(),
        config.jails.len(),
        config.allows.len(),
    );
    Ok(())
}
