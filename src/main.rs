use std::{fs::OpenOptions, str::FromStr, sync::Mutex};

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::Config, prelude::*, ui::Ui};

mod allocation;
mod async_utils;
mod cmd;
mod config;
mod cpu_limit;
mod engines;
mod errors;
mod images;
mod pipeline;
mod prelude;
mod table;
#[cfg(test)]
mod test_support;
mod ui;

/// Run Tesseract OCR over batches of scanned PDFs, shared between machines.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OCR_MACHINE_ID: This machine's name in the allocation manifest's
    `machine_allocation` column. The variable name can be changed with
    `machine_env_var` in the config file.
  - OMP_THREAD_LIMIT: Should be 1, since we run one tesseract per worker.
  - RUST_LOG: Log filter, defaulting to "info".

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// Config file to use instead of `~/config/ocr_runner.toml`.
    #[clap(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Also append logs to this file.
    #[clap(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR every unlocked batch allocated to this machine.
    Run(cmd::run::RunOpts),
    /// Print a CSV summary of the batches allocated to this machine.
    Allocation(cmd::allocation::AllocationOpts),
    /// Show the effective configuration.
    Config(cmd::config::ConfigOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(_) => false,
            Cmd::Allocation(_) => true,
            Cmd::Config(opts) => opts.json,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Build our log filter from `RUST_LOG`, defaulting to `info`.
fn env_filter() -> EnvFilter {
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy()
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    let ui = Ui::init();

    // Initialize tracing.
    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter());

    // Optionally, a second copy of our logs in a file.
    let file_subscriber = match &opts.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(env_filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(subscriber)
        .with(file_subscriber)
        .init();

    // Call our real `main` function now that logging is set up.
    real_main(ui, opts).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, opts: Opts) -> Result<()> {
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Run(run_opts) => {
            let config = Config::load(opts.config.as_deref())?;
            cmd::run::cmd_run(ui, config, run_opts).await?;
        }
        Cmd::Allocation(allocation_opts) => {
            let config = Config::load(opts.config.as_deref())?;
            cmd::allocation::cmd_allocation(&config, allocation_opts).await?;
        }
        Cmd::Config(config_opts) => {
            let config = Config::load(opts.config.as_deref())?;
            cmd::config::cmd_config(&config, config_opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
