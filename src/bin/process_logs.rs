use ::clap::Parser;
use ::eyre::{Result, WrapErr};
use ::std::path::PathBuf;
use tracing::info;

use servo_bench::analysis::{process_directory, ProcessParams};
use servo_bench::arm::ArmModel;
use servo_bench::constants::*;
use servo_bench::initialize_logging;

/// Smooths raw 2R logs and adds inverse dynamics torques.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory of raw logs
    #[arg(long, default_value = "logs_2R")]
    src: PathBuf,
    /// Directory receiving the `processed_<name>` files
    #[arg(long, default_value = "processed_logs_2R")]
    dst: PathBuf,
    /// Skip logs whose name contains one of these, comma separated
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
    /// Arm model JSON, the 2R bench by default
    #[arg(long)]
    arm: Option<PathBuf>,
    #[arg(long, default_value_t = SPLINE_WINDOW_SIZE)]
    window_size: usize,
    #[arg(long, default_value_t = SPLINE_DEGREE)]
    degree: usize,
    #[arg(long, default_value_t = SPLINE_INTERSECTED_VALUES)]
    intersected_values: usize,
    /// Hz
    #[arg(long, default_value_t = SAMPLE_RATE)]
    sample_rate: f64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging()?;

    let arm = match &args.arm {
        Some(path) => ArmModel::load(path)?,
        None => ArmModel::two_r(),
    };
    let params = ProcessParams {
        window_size: args.window_size,
        degree: args.degree,
        intersected_values: args.intersected_values,
        sample_rate: args.sample_rate,
    };

    std::fs::create_dir_all(&args.dst)
        .wrap_err_with(|| format!("creating {}", args.dst.display()))?;
    let written = process_directory(&args.src, &args.dst, &args.exclude, &arm, &params)?;
    info!("{} logs processed into {}", written.len(), args.dst.display());
    Ok(())
}
