use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use oval_facter::{run, Opts, RunOutcome};
use rand::Rng;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();

    if let Err(e) = init_logging(&opts.logfile, opts.quiet) {
        eprintln!(
            "could not set up logging at {}: {e:#}",
            opts.logfile.display()
        );
        return ExitCode::FAILURE;
    }

    if let Some(max) = opts.sleep {
        log::info!("sleeping up to {max} seconds");
        let secs = rand::thread_rng().gen_range(0..=max);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    match run(&opts).await {
        Ok(RunOutcome::Published | RunOutcome::Abandoned) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!(
                "was not able to write to {}: {e:#}",
                opts.factfile.display()
            );
            ExitCode::FAILURE
        }
    }
}

/// Logs everything at info to the logfile; the stderr copy drops to errors
/// only under --quiet.
fn init_logging(logfile: &Path, quiet: bool) -> anyhow::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logfile)?;
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .with_filter(LevelFilter::INFO);

    let stderr_level = if quiet {
        LevelFilter::ERROR
    } else {
        LevelFilter::INFO
    };
    let stderr_layer = fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(stderr_level);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}
