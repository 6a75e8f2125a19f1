//! The `config` subcommand.

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{config::Config, prelude::*};

/// Config command line arguments.
#[derive(Debug, Args)]
pub struct ConfigOpts {
    /// Also print the configuration as JSON on standard output.
    #[clap(long)]
    pub json: bool,
}

/// The `config` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_config(config: &Config, opts: &ConfigOpts) -> Result<()> {
    config.log_config();
    match config.machine_id() {
        Some(id) => info!("machine id: {} (from {})", id, config.machine_env_var),
        None => warn!("{} is not set", config.machine_env_var),
    }

    if opts.json {
        let json =
            serde_json::to_string_pretty(config).context("failed to serialize config")?;
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{json}\n").as_bytes())
            .await
            .context("failed to write config")?;
        stdout.flush().await.context("failed to flush config")?;
    }
    Ok(())
}
