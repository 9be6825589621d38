//! coresim binary entry point.

use anyhow::Context;
use coresim::shell::{MemMode, Shell};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    log::info!("starting coresim v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.txt".to_string());
    let mut shell = Shell::new(config_path, MemMode::Contiguous);
    shell.run().context("shell exited with an error")?;
    Ok(())
}
