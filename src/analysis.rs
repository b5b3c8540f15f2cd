use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::arm::{ArmModel, TorqueEstimator};
use crate::constants::*;
use crate::polyfit::WindowedPolyFit;
use crate::recording::{write_json, ExperimentLog};
use crate::signal::{apply_butter_lowpass, derivative, find_zeros, timestamp_jitter};

/// Window of the moving average used before looking for zero crossings.
pub const ZERO_CROSSING_WINDOW: usize = 21;

/// Low-pass applied to the read current before plotting it against torque.
pub const CURRENT_FILTER_CUTOFF: f64 = 10.0;
pub const CURRENT_FILTER_ORDER: usize = 2;

/// Least squares slope of `y = k x`.
pub fn regression_through_origin(x: &[f64], y: &[f64]) -> Result<f64> {
    if x.len() != y.len() {
        return Err(eyre!("{} abscissas for {} values", x.len(), y.len()));
    }
    let sxx: f64 = x.iter().map(|v| v * v).sum();
    if sxx == 0.0 {
        return Err(eyre!("Regression needs at least one non-zero abscissa"));
    }
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    Ok(sxy / sxx)
}

#[derive(Clone, Debug, Serialize)]
pub struct TorqueCurrent {
    /// Interior timestamps, one per torque estimate.
    pub timestamps: Vec<f64>,
    pub estimated_acceleration: Vec<f64>,
    pub estimated_torque: Vec<f64>,
    /// Read current at the interior samples, mA.
    pub current: Vec<f64>,
    /// Low-passed read current over the whole log, mA.
    pub filtered_current: Vec<f64>,
    /// Slope of current against torque, mA/Nm.
    pub slope: f64,
}

impl TorqueCurrent {
    pub fn ki_a_per_nm(&self) -> f64 {
        self.slope / 1000.0
    }
}

/// Torque estimated from the 1R log and regressed against the read current.
pub fn torque_and_current(
    log: &ExperimentLog,
    arm: &ArmModel,
    estimator: TorqueEstimator,
) -> Result<TorqueCurrent> {
    let timestamps = log.series("timestamps")?;
    let position = log.series("read_position")?;
    let velocity = log.series("read_velocity")?;
    let current = log.series("read_current")?;
    if timestamps.len() < 3 {
        return Err(eyre!("Need at least 3 samples, got {}", timestamps.len()));
    }

    let estimated_acceleration = derivative(velocity, timestamps)?;
    let estimated_torque = (1..timestamps.len() - 1)
        .map(|i| {
            arm.estimate_torque(
                estimator,
                position[i],
                velocity[i],
                estimated_acceleration[i - 1],
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let interior_current = current[1..current.len() - 1].to_vec();
    let slope = regression_through_origin(&estimated_torque, &interior_current)?;
    info!("Linear regression coefficient: {} A/Nm", slope / 1000.0);

    let fs = match timestamp_jitter(timestamps, 1.0) {
        Some(jitter) if jitter.mean > 0.0 => 1.0 / jitter.mean,
        _ => return Err(eyre!("Timestamps must increase to filter the current")),
    };
    let filtered_current =
        apply_butter_lowpass(current, fs, CURRENT_FILTER_CUTOFF, CURRENT_FILTER_ORDER)
            .wrap_err_with(|| format!("filtering read current sampled at {:.1} Hz", fs))?;

    Ok(TorqueCurrent {
        timestamps: timestamps[1..timestamps.len() - 1].to_vec(),
        estimated_acceleration,
        estimated_torque,
        current: interior_current,
        filtered_current,
        slope,
    })
}

/// `(estimated torque, read velocity)` pairs at the interior samples.
pub fn velocity_vs_torque(log: &ExperimentLog, arm: &ArmModel) -> Result<(Vec<f64>, Vec<f64>)> {
    let timestamps = log.series("timestamps")?;
    let position = log.series("read_position")?;
    let velocity = log.series("read_velocity")?;
    if timestamps.len() < 3 {
        return Err(eyre!("Need at least 3 samples, got {}", timestamps.len()));
    }

    let acceleration = derivative(velocity, timestamps)?;
    let torque = (1..timestamps.len() - 1)
        .map(|i| {
            arm.estimate_torque(
                TorqueEstimator::Model,
                position[i],
                velocity[i],
                acceleration[i - 1],
            )
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((torque, velocity[1..velocity.len() - 1].to_vec()))
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Delays {
    /// Read position lag behind the goal, s.
    pub position: f64,
    /// Read velocity lag behind the real velocity, s.
    pub velocity: f64,
}

fn mean_zero_delay(log: &ExperimentLog, read_key: &str, goal_key: &str) -> Result<f64> {
    let timestamps = log.series("timestamps")?;
    let read_zeros = find_zeros(log.series(read_key)?, timestamps, ZERO_CROSSING_WINDOW)?;
    let goal_zeros = find_zeros(log.series(goal_key)?, timestamps, ZERO_CROSSING_WINDOW)?;

    if read_zeros.len() != goal_zeros.len() {
        return Err(eyre!(
            "Different number of zeros in {} ({}) and {} ({})",
            read_key,
            read_zeros.len(),
            goal_key,
            goal_zeros.len()
        ));
    }
    if read_zeros.is_empty() {
        return Err(eyre!("No zero crossing found in {}", goal_key));
    }

    let total: f64 = read_zeros.iter().zip(&goal_zeros).map(|(r, g)| r - g).sum();
    Ok(total / read_zeros.len() as f64)
}

/// Delays from the zero crossings of a sinus log.
///
/// The goal-to-read delay of the position is assumed to hold for the
/// velocity too, so whatever the velocity lags beyond it comes from the
/// velocity estimation inside the motor.
pub fn identify_delay(log: &ExperimentLog) -> Result<Delays> {
    let position = mean_zero_delay(log, "read_position", "goal_position")?;
    let velocity = mean_zero_delay(log, "read_velocity", "goal_velocity")? - position;
    Ok(Delays { position, velocity })
}

/// Smoothed and resampled 2R log with inverse dynamics torques.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedLog {
    pub timestamps: Vec<f64>,
    pub goal_positions: BTreeMap<String, Vec<f64>>,
    pub read_positions: BTreeMap<String, Vec<f64>>,
    pub speeds: BTreeMap<String, Vec<f64>>,
    pub accelerations: BTreeMap<String, Vec<f64>>,
    pub torques: BTreeMap<String, Vec<f64>>,
}

impl ProcessedLog {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .wrap_err_with(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProcessParams {
    pub window_size: usize,
    pub degree: usize,
    pub intersected_values: usize,
    pub sample_rate: f64,
}

impl Default for ProcessParams {
    fn default() -> Self {
        Self {
            window_size: SPLINE_WINDOW_SIZE,
            degree: SPLINE_DEGREE,
            intersected_values: SPLINE_INTERSECTED_VALUES,
            sample_rate: SAMPLE_RATE,
        }
    }
}

impl ProcessParams {
    fn fit(&self, x: &[f64], y: &[f64]) -> Result<WindowedPolyFit> {
        let mut fit = WindowedPolyFit::new(self.window_size, self.degree, self.intersected_values)?;
        fit.fit(x, y)?;
        Ok(fit)
    }
}

/// Resamples a 2R position log on a regular grid, with speeds and
/// accelerations taken from the fitted polynomials.
pub fn process_log(
    log: &ExperimentLog,
    arm: &ArmModel,
    params: &ProcessParams,
) -> Result<ProcessedLog> {
    if arm.dof() != 2 {
        return Err(eyre!("Log processing needs a 2R arm model"));
    }
    let raw_timestamps = log.series("timestamps")?;
    let (first, last) = match (raw_timestamps.first(), raw_timestamps.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Err(eyre!("Empty log")),
    };
    let step = 1.0 / params.sample_rate;
    let count = ((last - first) / step).ceil().max(0.0) as usize;
    let timestamps: Vec<f64> = (0..count).map(|k| first + k as f64 * step).collect();

    let mut processed = ProcessedLog {
        timestamps,
        ..Default::default()
    };

    for (joint, suffix) in [("r1", "1"), ("r2", "2")] {
        debug!("Fitting polynomials for {}", joint);
        let goal = params.fit(raw_timestamps, log.series(&format!("goal_position_{}", suffix))?)?;
        let read = params.fit(raw_timestamps, log.series(&format!("read_position_{}", suffix))?)?;

        let evaluate = |fit: &WindowedPolyFit, der: usize| -> Result<Vec<f64>> {
            processed.timestamps.iter().map(|t| fit.value(*t, der)).collect()
        };
        let goal_positions = evaluate(&goal, 0)?;
        let read_positions = evaluate(&read, 0)?;
        let speeds = evaluate(&read, 1)?;
        let accelerations = evaluate(&read, 2)?;

        processed.goal_positions.insert(joint.to_string(), goal_positions);
        processed.read_positions.insert(joint.to_string(), read_positions);
        processed.speeds.insert(joint.to_string(), speeds);
        processed.accelerations.insert(joint.to_string(), accelerations);
    }

    let column = |map: &BTreeMap<String, Vec<f64>>, key: &str| -> Result<Vec<f64>> {
        map.get(key)
            .cloned()
            .ok_or_else(|| eyre!("missing processed series {}", key))
    };
    let (q1, q2) = (column(&processed.read_positions, "r1")?, column(&processed.read_positions, "r2")?);
    let (v1, v2) = (column(&processed.speeds, "r1")?, column(&processed.speeds, "r2")?);
    let (a1, a2) = (column(&processed.accelerations, "r1")?, column(&processed.accelerations, "r2")?);

    let mut torques_1 = Vec::with_capacity(q1.len());
    let mut torques_2 = Vec::with_capacity(q1.len());
    for i in 0..q1.len() {
        let tau = arm.inverse_dynamics(&[q1[i], q2[i]], &[v1[i], v2[i]], &[a1[i], a2[i]])?;
        torques_1.push(tau[0]);
        torques_2.push(tau[1]);
    }
    processed.torques.insert("r1".to_string(), torques_1);
    processed.torques.insert("r2".to_string(), torques_2);

    Ok(processed)
}

pub fn process_file(src: &Path, dst: &Path, arm: &ArmModel, params: &ProcessParams) -> Result<()> {
    let log = ExperimentLog::load(src)?;
    process_log(&log, arm, params)
        .wrap_err_with(|| format!("processing {}", src.display()))?
        .save(dst)
}

/// Processes every log of `src_dir` into `dst_dir/processed_<name>`, skipping
/// names containing one of `excluded` and outputs that already exist.
pub fn process_directory(
    src_dir: &Path,
    dst_dir: &Path,
    excluded: &[String],
    arm: &ArmModel,
    params: &ProcessParams,
) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(src_dir)
        .wrap_err_with(|| format!("listing {}", src_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    let mut written = vec![];
    for src in entries {
        let Some(name) = src.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if excluded.iter().any(|content| name.contains(content.as_str())) {
            debug!("Excluded {}", name);
            continue;
        }
        let dst = dst_dir.join(format!("processed_{}", name));
        if dst.is_file() {
            debug!("Already processed {}", name);
            continue;
        }

        info!("Processing {}...", name);
        process_file(&src, &dst, arm, params)?;
        written.push(dst);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::SinusProfile;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn timeline(n: usize, rate: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 / rate).collect()
    }

    #[test]
    fn regression_recovers_slope() {
        let x = [1.0, 2.0, -3.0];
        let y = [0.48, 0.96, -1.44];
        assert_relative_eq!(regression_through_origin(&x, &y).unwrap(), 0.48, epsilon = 1e-12);
        assert!(regression_through_origin(&[0.0], &[1.0]).is_err());
    }

    #[test]
    fn torque_current_slope_from_synthetic_log() {
        let t = timeline(600, 300.0);
        let position: Vec<f64> = t.iter().map(|t| (2.0 * t).sin()).collect();
        let velocity: Vec<f64> = t.iter().map(|t| 2.0 * (2.0 * t).cos()).collect();
        let current: Vec<f64> = position.iter().map(|p| 480.0 * crate::arm::alternative_torque_cos(*p)).collect();

        let mut log = ExperimentLog::new(t);
        log.insert("read_position", position).unwrap();
        log.insert("read_velocity", velocity).unwrap();
        log.insert("read_current", current).unwrap();

        let fit = torque_and_current(&log, &ArmModel::one_r(), TorqueEstimator::GravityCos).unwrap();
        assert_eq!(fit.estimated_torque.len(), 598);
        assert_eq!(fit.filtered_current.len(), 600);
        assert_relative_eq!(fit.ki_a_per_nm(), 0.48, epsilon = 1e-9);
    }

    #[test]
    fn torque_current_fails_when_current_cannot_be_filtered() {
        // 8 Hz puts the filter cutoff above Nyquist.
        let t = timeline(40, 8.0);
        let mut log = ExperimentLog::new(t);
        log.insert("read_position", vec![0.3; 40]).unwrap();
        log.insert("read_velocity", vec![0.0; 40]).unwrap();
        log.insert("read_current", vec![50.0; 40]).unwrap();

        let err = torque_and_current(&log, &ArmModel::one_r(), TorqueEstimator::GravityCos).unwrap_err();
        assert!(err.to_string().contains("filtering read current"));
        assert!(err.chain().any(|cause| cause.to_string().contains("Cutoff")));
    }

    #[test]
    fn torque_current_requires_current() {
        let mut log = ExperimentLog::new(timeline(10, 100.0));
        log.insert("read_position", vec![0.0; 10]).unwrap();
        log.insert("read_velocity", vec![0.0; 10]).unwrap();
        let err = torque_and_current(&log, &ArmModel::one_r(), TorqueEstimator::Model).unwrap_err();
        assert!(err.to_string().contains("read_current"));
    }

    #[test]
    fn velocity_pairs_drop_the_edges() {
        let mut log = ExperimentLog::new(timeline(50, 100.0));
        log.insert("read_position", vec![0.1; 50]).unwrap();
        log.insert("read_velocity", (0..50).map(|i| i as f64).collect()).unwrap();
        let (torque, velocity) = velocity_vs_torque(&log, &ArmModel::one_r()).unwrap();
        assert_eq!(torque.len(), 48);
        assert_eq!(velocity[0], 1.0);
    }

    #[test]
    fn delay_of_shifted_sinus_is_identified() {
        let t = timeline(2400, 300.0);
        let shift = 0.02;
        let velocity_lag = 0.01;
        let profile = SinusProfile::Centered;
        let mut log = ExperimentLog::new(t.clone());
        log.insert("goal_position", t.iter().map(|t| profile.position(*t)).collect()).unwrap();
        log.insert("read_position", t.iter().map(|t| profile.position(t - shift)).collect()).unwrap();
        log.insert("goal_velocity", t.iter().map(|t| profile.velocity(*t)).collect()).unwrap();
        log.insert(
            "read_velocity",
            t.iter().map(|t| profile.velocity(t - shift - velocity_lag)).collect(),
        )
        .unwrap();

        let delays = identify_delay(&log).unwrap();
        assert!((delays.position - shift).abs() < 2.0 / 300.0, "{:?}", delays);
        assert!((delays.velocity - velocity_lag).abs() < 2.0 / 300.0, "{:?}", delays);
    }

    #[test]
    fn mismatched_zero_counts_are_an_error() {
        let t = timeline(900, 300.0);
        let mut log = ExperimentLog::new(t.clone());
        log.insert("goal_position", t.iter().map(|t| (PI * t).sin()).collect()).unwrap();
        log.insert("read_position", t.iter().map(|t| 1.0 + (PI * t).sin() * 0.1).collect()).unwrap();
        log.insert("goal_velocity", vec![0.0; 900]).unwrap();
        log.insert("read_velocity", vec![0.0; 900]).unwrap();
        assert!(identify_delay(&log).is_err());
    }

    fn two_r_log(n: usize) -> ExperimentLog {
        let t = timeline(n, 300.0);
        let mut log = ExperimentLog::new(t.clone());
        for suffix in ["1", "2"] {
            let q: Vec<f64> = t.iter().map(|t| 0.5 * t).collect();
            log.insert(&format!("goal_position_{}", suffix), q.clone()).unwrap();
            log.insert(&format!("read_position_{}", suffix), q).unwrap();
        }
        log
    }

    #[test]
    fn processed_log_resamples_and_differentiates() {
        let log = two_r_log(300);
        let processed = process_log(&log, &ArmModel::two_r(), &ProcessParams::default()).unwrap();
        let n = processed.timestamps.len();
        assert_eq!(n, 299);
        for key in ["r1", "r2"] {
            assert_eq!(processed.torques[key].len(), n);
            assert_relative_eq!(processed.speeds[key][100], 0.5, epsilon = 1e-6);
            assert_relative_eq!(processed.accelerations[key][100], 0.0, epsilon = 1e-4);
        }
        assert!(process_log(&log, &ArmModel::one_r(), &ProcessParams::default()).is_err());
    }

    #[test]
    fn directory_processing_skips_done_and_excluded() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        two_r_log(100).save(&src.path().join("R2_a.json")).unwrap();
        two_r_log(100).save(&src.path().join("R2_test.json")).unwrap();
        two_r_log(100).save(&src.path().join("R2_b.json")).unwrap();
        std::fs::write(dst.path().join("processed_R2_b.json"), "{}").unwrap();

        let written = process_directory(
            src.path(),
            dst.path(),
            &["test".to_string()],
            &ArmModel::two_r(),
            &ProcessParams::default(),
        )
        .unwrap();
        assert_eq!(written, vec![dst.path().join("processed_R2_a.json")]);
        let processed = ProcessedLog::load(&written[0]).unwrap();
        assert!(!processed.timestamps.is_empty());
    }
}
