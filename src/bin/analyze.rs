use ::clap::{Parser, Subcommand, ValueEnum};
use ::eyre::{eyre, Result};
use ::std::path::PathBuf;
use tracing::info;

use servo_bench::analysis::{torque_and_current, velocity_vs_torque};
use servo_bench::arm::{ArmModel, TorqueEstimator};
use servo_bench::initialize_logging;
use servo_bench::recording::{write_csv_columns, ExperimentLog};
use servo_bench::signal::timestamp_jitter;

/// Offline analysis of 1R bench logs.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Estimator {
    Model,
    GravityCos,
    GravitySin,
}

impl From<Estimator> for TorqueEstimator {
    fn from(estimator: Estimator) -> Self {
        match estimator {
            Estimator::Model => TorqueEstimator::Model,
            Estimator::GravityCos => TorqueEstimator::GravityCos,
            Estimator::GravitySin => TorqueEstimator::GravitySin,
        }
    }
}

#[derive(clap::Args, Debug)]
struct ArmArgs {
    /// Arm model JSON, the 1R bench by default
    #[arg(long)]
    arm: Option<PathBuf>,
    /// Mass added at the tip, kg
    #[arg(long, default_value_t = 0.0)]
    payload: f64,
    /// Rotation of the base, rad
    #[arg(long, default_value_t = 0.0)]
    base_orientation: f64,
}

impl ArmArgs {
    fn model(&self) -> Result<ArmModel> {
        let arm = match &self.arm {
            Some(path) => ArmModel::load(path)?,
            None => ArmModel::one_r(),
        };
        Ok(arm
            .with_payload(self.payload)
            .with_base_orientation(self.base_orientation))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Regression of the read current against the estimated torque
    TorqueCurrent {
        log: PathBuf,
        #[command(flatten)]
        arm: ArmArgs,
        #[arg(long, value_enum, default_value_t = Estimator::Model)]
        estimator: Estimator,
        /// Export the series as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Read velocity against the estimated torque
    VelocityTorque {
        log: PathBuf,
        #[command(flatten)]
        arm: ArmArgs,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Loop period statistics
    Jitter {
        log: PathBuf,
        #[arg(long, default_value_t = 300.0)]
        framerate: f64,
    },
    /// Selected series of a log as CSV
    Export {
        log: PathBuf,
        /// Series to export, comma separated; all of them by default
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,
        #[arg(long)]
        csv: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging()?;

    match args.command {
        Command::TorqueCurrent {
            log,
            arm,
            estimator,
            csv,
        } => {
            let log = ExperimentLog::load(&log)?;
            let result = torque_and_current(&log, &arm.model()?, estimator.into())?;
            info!(
                "Ki = {:.4} A/Nm over {} samples",
                result.ki_a_per_nm(),
                result.timestamps.len()
            );
            if let Some(csv) = csv {
                let fitted: Vec<f64> = result
                    .estimated_torque
                    .iter()
                    .map(|tau| result.slope * tau)
                    .collect();
                write_csv_columns(
                    &csv,
                    &[
                        "timestamps",
                        "estimated_acceleration",
                        "estimated_torque",
                        "current",
                        "fitted_current",
                    ],
                    &[
                        &result.timestamps,
                        &result.estimated_acceleration,
                        &result.estimated_torque,
                        &result.current,
                        &fitted,
                    ],
                )?;
                info!("Series written to {}", csv.display());
            }
        }
        Command::VelocityTorque { log, arm, csv } => {
            let log = ExperimentLog::load(&log)?;
            let (torque, velocity) = velocity_vs_torque(&log, &arm.model()?)?;
            info!("{} torque/velocity pairs", torque.len());
            if let Some(csv) = csv {
                write_csv_columns(&csv, &["torque", "velocity"], &[&torque, &velocity])?;
                info!("Series written to {}", csv.display());
            }
        }
        Command::Jitter { log, framerate } => {
            let log = ExperimentLog::load(&log)?;
            let jitter = timestamp_jitter(&log.timestamps, framerate)
                .ok_or_else(|| eyre!("Need at least two timestamps"))?;
            info!(
                "Goal period {:.6}s: mean {:.6}s, std {:.6}s, min {:.6}s, max {:.6}s",
                jitter.goal,
                jitter.mean,
                jitter.std,
                jitter.min,
                jitter.max
            );
        }
        Command::Export { log, keys, csv } => {
            let log = ExperimentLog::load(&log)?;
            let keys: Vec<&str> = if keys.is_empty() {
                log.series.keys().map(|k| k.as_str()).collect()
            } else {
                keys.iter().map(|k| k.as_str()).collect()
            };
            log.write_csv(&csv, &keys)?;
            info!("{} series written to {}", keys.len(), csv.display());
        }
    }
    Ok(())
}
