use ::clap::Parser;
use ::eyre::{eyre, Result};
use ::std::path::PathBuf;
use tracing::info;

use servo_bench::dataset::Logs;
use servo_bench::initialize_file_and_console_logging;
use servo_bench::training::{best_model_path, train, TrainingConfig};

/// Learns the motor dynamics from experiment logs.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Training logs
    #[arg(long, value_delimiter = ',', required = true)]
    train: Vec<PathBuf>,
    /// Validation logs, the training logs by default
    #[arg(long, value_delimiter = ',')]
    valid: Vec<PathBuf>,
    /// Directory receiving the checkpoint and the losses
    #[arg(long, default_value = "models")]
    output_dir: PathBuf,
    /// Window sample spacing, s
    #[arg(long, default_value_t = 0.01)]
    dt: f64,
    /// Window length in samples
    #[arg(long, default_value_t = 5)]
    length: usize,
    #[arg(long, default_value_t = 256)]
    batch_size: usize,
    #[arg(long, default_value_t = 50)]
    epochs: usize,
    #[arg(long, default_value_t = 100)]
    batches_per_epoch: usize,
    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f64,
    #[arg(long, default_value_t = 10)]
    validation_batches: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    std::fs::create_dir_all(&args.output_dir)?;
    let _guard = initialize_file_and_console_logging(&args.output_dir)?;

    let config = TrainingConfig {
        dt: args.dt,
        length: args.length,
        batch_size: args.batch_size,
        epochs: args.epochs,
        batches_per_epoch: args.batches_per_epoch,
        learning_rate: args.learning_rate,
        validation_batches: args.validation_batches,
        seed: args.seed,
    };

    let mut train_logs = Logs::load(&args.train, Some(args.seed))?;
    let valid_paths = if args.valid.is_empty() {
        &args.train
    } else {
        &args.valid
    };
    let mut valid_logs = Logs::load(valid_paths, Some(args.seed.wrapping_add(1)))?;
    info!(
        "{} training and {} validation logs",
        train_logs.len(),
        valid_logs.len()
    );

    let history = train(&mut train_logs, &mut valid_logs, &config, &args.output_dir)?;
    let best = history
        .iter()
        .min_by(|a, b| a.validation_loss.total_cmp(&b.validation_loss))
        .ok_or_else(|| eyre!("No epoch was run"))?;
    info!(
        "Best model from epoch {} (validation loss {:.6}) in {}",
        best.epoch,
        best.validation_loss,
        best_model_path(&args.output_dir).display()
    );
    Ok(())
}
