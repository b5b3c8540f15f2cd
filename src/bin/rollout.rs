use ::clap::Parser;
use ::eyre::Result;
use ::std::path::PathBuf;
use burn::backend::ndarray::NdArrayDevice;
use tracing::info;

use servo_bench::dataset::Logs;
use servo_bench::initialize_logging;
use servo_bench::model::{InferenceBackend, Mlp};
use servo_bench::training::rollout;

/// Plays a trained model open loop against a recorded log.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Checkpoint written by `train`, without extension
    #[arg(long)]
    model: PathBuf,
    /// Log providing the initial window and the actions
    #[arg(long)]
    log: PathBuf,
    /// Start of the initial window, s
    #[arg(long, default_value_t = 1.0)]
    start: f64,
    /// Number of predicted steps
    #[arg(long, default_value_t = 500)]
    horizon: usize,
    #[arg(long, default_value_t = 0.01)]
    dt: f64,
    #[arg(long, default_value_t = 5)]
    length: usize,
    #[arg(long, default_value = "rollout.csv")]
    csv: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging()?;

    let device = NdArrayDevice::default();
    let model = Mlp::<InferenceBackend>::load(&args.model, &device)?;
    let logs = Logs::load(&[&args.log], None)?;

    let result = rollout(&model, &logs, 0, args.start, args.horizon, args.dt, args.length)?;
    for (entry, real) in &result.real {
        if let Some(predicted) = result.predicted.get(entry) {
            let mse = real
                .iter()
                .zip(predicted)
                .map(|(r, p)| (r - p).powi(2))
                .sum::<f64>()
                / real.len().max(1) as f64;
            info!("{}: rollout MSE {:.6}", entry, mse);
        }
    }
    result.write_csv(&args.csv)?;
    info!("Rollout written to {}", args.csv.display());
    Ok(())
}
