//! Supervised learning of the motor dynamics and open-loop rollouts of the
//! learned model.

use burn::backend::ndarray::NdArrayDevice;
use burn::module::AutodiffModule;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::Backend;
use burn::tensor::ElementConversion;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::dataset::Logs;
use crate::model::{to_tensor, InferenceBackend, Mlp, MlpConfig, TrainingBackend};
use crate::recording::write_csv_columns;

pub const BEST_MODEL_NAME: &str = "best_model";
pub const LOSSES_FILE_NAME: &str = "losses.csv";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Spacing of the window samples (s).
    pub dt: f64,
    /// Number of (state, action) pairs in one input window.
    pub length: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub batches_per_epoch: usize,
    pub learning_rate: f64,
    pub validation_batches: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            length: 5,
            batch_size: 256,
            epochs: 50,
            batches_per_epoch: 100,
            learning_rate: 1e-3,
            validation_batches: 10,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochLoss {
    pub epoch: usize,
    pub train_loss: f64,
    pub validation_loss: f64,
}

fn validation_loss(
    model: &Mlp<InferenceBackend>,
    logs: &mut Logs,
    config: &TrainingConfig,
    device: &NdArrayDevice,
) -> Result<f64> {
    let mut total = 0.0;
    for _ in 0..config.validation_batches {
        let (x, y) = logs.sample_batch(config.dt, config.length, config.batch_size)?;
        let prediction = model.forward(to_tensor::<InferenceBackend>(&x, device));
        let loss = MseLoss::new().forward(prediction, to_tensor(&y, device), Reduction::Mean);
        total += loss.into_scalar().elem::<f64>();
    }
    Ok(total / config.validation_batches as f64)
}

/// Trains a fresh model on `train_logs`, keeping in `out_dir` the checkpoint
/// with the lowest validation loss and the per-epoch losses.
pub fn train(
    train_logs: &mut Logs,
    valid_logs: &mut Logs,
    config: &TrainingConfig,
    out_dir: &Path,
) -> Result<Vec<EpochLoss>> {
    if config.epochs == 0 || config.batches_per_epoch == 0 || config.validation_batches == 0 {
        return Err(eyre!("Training needs at least one epoch, batch and validation batch"));
    }
    fs::create_dir_all(out_dir)?;

    let device = NdArrayDevice::default();
    <TrainingBackend as Backend>::seed(config.seed);

    let mlp_config = MlpConfig::new(
        train_logs.input_dimension(config.length),
        train_logs.output_dimension(),
    );
    let mut model = Mlp::<TrainingBackend>::new(mlp_config, &device);
    let mut optim = AdamConfig::new().init::<TrainingBackend, Mlp<TrainingBackend>>();
    let best_path = out_dir.join(BEST_MODEL_NAME);

    info!(
        "Training {} -> {} for {} epochs of {} batches",
        mlp_config.input_dimension, mlp_config.output_dimension, config.epochs, config.batches_per_epoch
    );

    let mut history = Vec::with_capacity(config.epochs);
    let mut best = f64::INFINITY;
    for epoch in 0..config.epochs {
        let mut train_total = 0.0;
        for _ in 0..config.batches_per_epoch {
            let (x, y) = train_logs.sample_batch(config.dt, config.length, config.batch_size)?;
            let prediction = model.forward(to_tensor(&x, &device));
            let loss = MseLoss::new().forward(prediction, to_tensor(&y, &device), Reduction::Mean);
            train_total += loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);
        }

        let valid_model = model.valid();
        let validation_loss = validation_loss(&valid_model, valid_logs, config, &device)?;
        let train_loss = train_total / config.batches_per_epoch as f64;
        history.push(EpochLoss {
            epoch,
            train_loss,
            validation_loss,
        });

        if validation_loss < best {
            best = validation_loss;
            valid_model.save(&best_path)?;
            debug!("Saved checkpoint at epoch {}", epoch);
        }
        info!(
            "Epoch {}: train loss {:.6}, validation loss {:.6}",
            epoch, train_loss, validation_loss
        );
    }

    let epochs: Vec<f64> = history.iter().map(|l| l.epoch as f64).collect();
    let train_losses: Vec<f64> = history.iter().map(|l| l.train_loss).collect();
    let validation_losses: Vec<f64> = history.iter().map(|l| l.validation_loss).collect();
    write_csv_columns(
        &out_dir.join(LOSSES_FILE_NAME),
        &["epoch", "train_loss", "validation_loss"],
        &[&epochs, &train_losses, &validation_losses],
    )?;
    info!("Best validation loss {:.6}", best);
    Ok(history)
}

pub fn best_model_path(out_dir: &Path) -> PathBuf {
    out_dir.join(BEST_MODEL_NAME)
}

/// Real and predicted states over a rollout, keyed by state entry.
#[derive(Debug, Clone, Default)]
pub struct Rollout {
    pub timestamps: Vec<f64>,
    pub real: BTreeMap<String, Vec<f64>>,
    pub predicted: BTreeMap<String, Vec<f64>>,
}

impl Rollout {
    /// Columns `t`, then `real_<entry>` and `predicted_<entry>` per state.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut header = vec!["t".to_string()];
        let mut columns: Vec<&[f64]> = vec![&self.timestamps];
        for (entry, real) in &self.real {
            let predicted = self
                .predicted
                .get(entry)
                .ok_or_else(|| eyre!("No prediction for '{}'", entry))?;
            header.push(format!("real_{}", entry));
            columns.push(real);
            header.push(format!("predicted_{}", entry));
            columns.push(predicted);
        }
        let header: Vec<&str> = header.iter().map(|h| h.as_str()).collect();
        write_csv_columns(path, &header, &columns)
    }
}

/// Plays the model open loop from `start` in collection `collection`.
///
/// The first window comes from the log. Each prediction then replaces the
/// oldest state of the window while actions keep coming from the log.
pub fn rollout(
    model: &Mlp<InferenceBackend>,
    logs: &Logs,
    collection: usize,
    start: f64,
    horizon: usize,
    dt: f64,
    length: usize,
) -> Result<Rollout> {
    let history = logs
        .collection(collection)
        .ok_or_else(|| eyre!("No collection {} among {}", collection, logs.len()))?;
    let expected = logs.input_dimension(length);
    if model.config().input_dimension != expected {
        return Err(eyre!(
            "Model expects {} inputs, windows of {} steps give {}",
            model.config().input_dimension,
            length,
            expected
        ));
    }
    if model.config().output_dimension != logs.output_dimension() {
        return Err(eyre!(
            "Model predicts {} values, logs have {} state entries",
            model.config().output_dimension,
            logs.output_dimension()
        ));
    }
    let device = NdArrayDevice::default();

    let mut states = Vec::with_capacity(length);
    let mut actions = Vec::with_capacity(length);
    for k in 0..length {
        let t = start + k as f64 * dt;
        states.push(logs.history_state(history, t)?);
        actions.push(logs.history_action(history, t)?);
    }

    let mut result = Rollout::default();
    for step in 0..horizon {
        let input: Vec<f32> = states
            .iter()
            .zip(&actions)
            .flat_map(|(s, a)| s.iter().chain(a))
            .map(|v| *v as f32)
            .collect();
        let predicted: Vec<f64> = model
            .predict(&input, &device)?
            .into_iter()
            .map(f64::from)
            .collect();

        let t = start + (length + step) as f64 * dt;
        let real = logs.history_state(history, t)?;
        result.timestamps.push(t);
        for (i, entry) in logs.state_entries().iter().enumerate() {
            result.real.entry(entry.clone()).or_default().push(real[i]);
            result.predicted.entry(entry.clone()).or_default().push(predicted[i]);
        }

        states.remove(0);
        states.push(predicted);
        actions.remove(0);
        actions.push(logs.history_action(history, t)?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::ExperimentLog;

    fn linear_logs(seed: u64) -> Logs {
        let rate = 100.0;
        let t: Vec<f64> = (0..300).map(|i| i as f64 / rate).collect();
        let mut log = ExperimentLog::new(t.clone());
        log.insert("read_position", t.iter().map(|t| 0.5 * t).collect()).unwrap();
        log.insert("read_velocity", vec![0.5; t.len()]).unwrap();
        log.insert("goal_pwm", t.iter().map(|t| (3.0 * t).sin()).collect()).unwrap();
        let mut logs = Logs::new(Some(seed));
        logs.push_log(&log).unwrap();
        logs
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            batch_size: 16,
            epochs: 2,
            batches_per_epoch: 3,
            validation_batches: 2,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn training_writes_checkpoint_and_losses() {
        let dir = tempfile::tempdir().unwrap();
        let mut train_logs = linear_logs(1);
        let mut valid_logs = linear_logs(2);
        let history = train(&mut train_logs, &mut valid_logs, &small_config(), dir.path()).unwrap();

        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|l| l.train_loss.is_finite() && l.validation_loss.is_finite()));
        assert!(dir.path().join("best_model.bin").exists());
        let csv = fs::read_to_string(dir.path().join(LOSSES_FILE_NAME)).unwrap();
        assert_eq!(csv.lines().count(), 3);

        let device = NdArrayDevice::default();
        let model = Mlp::<InferenceBackend>::load(&best_model_path(dir.path()), &device).unwrap();
        assert_eq!(model.config().input_dimension, 15);
    }

    #[test]
    fn rollout_produces_one_prediction_per_step() {
        let device = NdArrayDevice::default();
        let logs = linear_logs(0);
        let model = Mlp::<InferenceBackend>::new(MlpConfig::new(15, 2), &device);
        let rollout = rollout(&model, &logs, 0, 0.5, 20, 0.01, 5).unwrap();

        assert_eq!(rollout.timestamps.len(), 20);
        assert!((rollout.timestamps[0] - 0.55).abs() < 1e-9);
        assert_eq!(rollout.real["read_position"].len(), 20);
        assert_eq!(rollout.predicted["read_velocity"].len(), 20);
        assert!((rollout.real["read_position"][0] - 0.275).abs() < 1e-9);
    }

    #[test]
    fn rollout_rejects_mismatched_model() {
        let device = NdArrayDevice::default();
        let logs = linear_logs(0);
        let model = Mlp::<InferenceBackend>::new(MlpConfig::new(9, 2), &device);
        assert!(rollout(&model, &logs, 0, 0.5, 5, 0.01, 5).is_err());
        assert!(rollout(&model, &logs, 3, 0.5, 5, 0.01, 3).is_err());
    }

    #[test]
    fn rollout_rejects_mismatched_output() {
        let device = NdArrayDevice::default();
        let logs = linear_logs(0);
        let model = Mlp::<InferenceBackend>::new(MlpConfig::new(15, 1), &device);
        let err = rollout(&model, &logs, 0, 0.5, 5, 0.01, 5).unwrap_err();
        assert!(err.to_string().contains("state entries"));
    }
}
