use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use ctcalib_core::{find_calib_error, severity_of, CalibConfig, CalibError, CalibParamManager, Severity};
use ctcalib_pipeline::run_calibration;
use log::{error, info, warn};

/// Continuous-time spatiotemporal calibration of IMUs, radars, LiDARs and
/// cameras.
#[derive(Debug, Parser)]
#[command(author, version, about = "Continuous-time multi-sensor calibration")]
struct Args {
    /// Configuration file, JSON or TOML by extension.
    config: PathBuf,

    /// Seconds skipped at the start of the log; overrides the configuration.
    #[arg(long)]
    begin_time: Option<f64>,

    /// Seconds of log used after the begin time; overrides the configuration.
    #[arg(long)]
    duration: Option<f64>,

    /// Output directory; overrides the configuration.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Calibrated,
    /// Stopped until an external reconstruction is available.
    AwaitingReconstruction,
}

fn load_config(args: &Args) -> Result<CalibConfig> {
    let mut config = CalibConfig::load(&args.config)?;
    if let Some(begin) = args.begin_time {
        config.data_stream.begin_time = begin;
    }
    if let Some(duration) = args.duration {
        config.data_stream.duration = duration;
    }
    if let Some(output) = &args.output {
        config.data_stream.output_path = output.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Recoverable stops are not failures of the run.
fn classify(result: Result<CalibParamManager>) -> Result<Outcome> {
    match result {
        Ok(params) => {
            params.log_status();
            Ok(Outcome::Calibrated)
        }
        Err(e) if matches!(severity_of(&e), Severity::Recoverable) => {
            warn!("{e:#}");
            if let Some(CalibError::SfmReconstructionRequired { command_file, .. }) =
                find_calib_error(&e)
            {
                warn!(
                    "run the commands in '{}', then start the calibration again",
                    command_file.display()
                );
            }
            Ok(Outcome::AwaitingReconstruction)
        }
        Err(e) => Err(e),
    }
}

fn run(args: &Args) -> Result<Outcome> {
    let config = load_config(args)?;
    info!("output directory: '{}'", config.output_dir().display());
    let outcome = classify(run_calibration(&config))?;
    if outcome == Outcome::Calibrated {
        info!(
            "calibration finished, parameters in '{}'",
            config.final_param_file().display()
        );
    }
    Ok(outcome)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
