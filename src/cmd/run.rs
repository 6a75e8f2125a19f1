//! The `run` subcommand.

use clap::Args;

use crate::{allocation, config::Config, pipeline::BatchRunner, prelude::*, ui::Ui};

/// Run command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Max number of OCR processes to run at a time. Overrides
    /// `worker_count` from the config file.
    #[clap(short = 'j', long = "jobs")]
    pub job_count: Option<usize>,
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, mut config: Config, opts: &RunOpts) -> Result<()> {
    if let Some(job_count) = opts.job_count {
        if job_count == 0 {
            return Err(anyhow!("--jobs must be at least 1"));
        }
        config.worker_count = job_count;
    }
    config.log_config();

    let machine_id = config.machine_id();
    let batches = allocation::load(
        &config.allocation_path,
        machine_id.as_deref(),
        &config.pdf_dir,
    )?;
    info!("Found {} batches for this machine", batches.len());

    let runner = BatchRunner::with_defaults(config, ui)?;
    runner.run_batches(&batches).await?.check()
}
