//! The `allocation` subcommand.

use std::io;

use clap::Args;

use crate::{allocation, config::Config, pipeline::working_dir::is_locked, prelude::*};

/// Allocation command line arguments.
#[derive(Debug, Args)]
pub struct AllocationOpts {}

/// One line of the allocation report.
#[derive(Debug, Serialize)]
struct BatchReport {
    batch_id: u32,
    documents: usize,
    missing: usize,
    locked: bool,
}

/// The `allocation` subcommand. Writes a CSV summary of this machine's
/// batches to standard output, without processing anything.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_allocation(config: &Config, _opts: &AllocationOpts) -> Result<()> {
    let machine_id = config.machine_id();
    let batches = allocation::load(
        &config.allocation_path,
        machine_id.as_deref(),
        &config.pdf_dir,
    )?;

    let mut wtr = csv::Writer::from_writer(io::stdout());
    for batch in &batches {
        wtr.serialize(BatchReport {
            batch_id: batch.batch_id(),
            documents: batch.len(),
            missing: batch.missing().len(),
            locked: is_locked(&config.working_dir, batch.batch_id()),
        })
        .context("cannot write allocation report")?;
    }
    wtr.flush().context("cannot flush allocation report")?;
    Ok(())
}
