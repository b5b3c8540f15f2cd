use eyre::{eyre, Result, WrapErr};
use ndarray::Array2;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tracing::debug;

use crate::constants::{ACTION_ENTRIES, STATE_ENTRIES};
use crate::history::HistoryCollection;
use crate::recording::ExperimentLog;

/// Experiment logs turned into history collections, sampled as fixed-length
/// (state, action) windows for learning the motor dynamics.
pub struct Logs {
    collections: Vec<HistoryCollection>,
    state_entries: Vec<String>,
    action_entries: Vec<String>,
    rng: StdRng,
}

impl Logs {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            collections: vec![],
            state_entries: STATE_ENTRIES.iter().map(|s| s.to_string()).collect(),
            action_entries: ACTION_ENTRIES.iter().map(|s| s.to_string()).collect(),
            rng,
        }
    }

    pub fn load<P: AsRef<Path>>(paths: &[P], seed: Option<u64>) -> Result<Self> {
        let mut logs = Self::new(seed);
        for path in paths {
            let path = path.as_ref();
            let log = ExperimentLog::load(path)?;
            logs.push_log(&log)
                .wrap_err_with(|| format!("loading {}", path.display()))?;
        }
        Ok(logs)
    }

    pub fn push_log(&mut self, log: &ExperimentLog) -> Result<()> {
        let mut collection = HistoryCollection::new();
        for key in self.state_entries.iter().chain(&self.action_entries) {
            let values = log.series(key)?;
            for (t, v) in log.timestamps.iter().zip(values) {
                collection.push_number(key, *t, *v);
            }
        }
        debug!("Loaded log of {:.2}s", collection.duration());
        self.collections.push(collection);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn collection(&self, index: usize) -> Option<&HistoryCollection> {
        self.collections.get(index)
    }

    pub fn state_entries(&self) -> &[String] {
        &self.state_entries
    }

    pub fn action_entries(&self) -> &[String] {
        &self.action_entries
    }

    /// Width of one `x` sample for windows of `length` steps.
    pub fn input_dimension(&self, length: usize) -> usize {
        length * (self.state_entries.len() + self.action_entries.len())
    }

    pub fn output_dimension(&self) -> usize {
        self.state_entries.len()
    }

    /// Index of a collection drawn with probability proportional to its
    /// duration.
    pub fn random_collection(&mut self) -> Result<usize> {
        let durations: Vec<f64> = self.collections.iter().map(|c| c.duration()).collect();
        let weights = WeightedIndex::new(&durations)
            .map_err(|e| eyre!("Cannot weight {} collections: {}", durations.len(), e))?;
        Ok(weights.sample(&mut self.rng))
    }

    pub fn history_state(&self, collection: &HistoryCollection, t: f64) -> Result<Vec<f64>> {
        self.state_entries
            .iter()
            .map(|entry| collection.number(entry, t))
            .collect()
    }

    pub fn history_action(&self, collection: &HistoryCollection, t: f64) -> Result<Vec<f64>> {
        self.action_entries
            .iter()
            .map(|entry| collection.number(entry, t))
            .collect()
    }

    /// Interleaved `[state, action]` for `length` steps from `start`, and the
    /// state reached `length` steps later.
    pub fn window(
        &self,
        collection: &HistoryCollection,
        start: f64,
        dt: f64,
        length: usize,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut x = Vec::with_capacity(self.input_dimension(length));
        for k in 0..length {
            let t = start + k as f64 * dt;
            x.extend(self.history_state(collection, t)?);
            x.extend(self.history_action(collection, t)?);
        }
        let y = self.history_state(collection, start + length as f64 * dt)?;
        Ok((x, y))
    }

    pub fn sample(&mut self, dt: f64, length: usize) -> Result<(Vec<f64>, Vec<f64>)> {
        let margin = (length * 2) as f64 * dt;
        let index = self.random_collection()?;
        let collection = &self.collections[index];
        let (smallest, biggest) = match (collection.smallest_timestamp(), collection.biggest_timestamp()) {
            (Some(smallest), Some(biggest)) => (smallest + margin, biggest - margin),
            _ => return Err(eyre!("Collection {} is empty", index)),
        };
        if smallest >= biggest {
            return Err(eyre!(
                "Collection {} lasts {:.3}s, too short for a {:.3}s margin",
                index,
                collection.duration(),
                margin
            ));
        }
        let start = self.rng.gen_range(smallest..biggest);
        self.window(&self.collections[index], start, dt, length)
    }

    /// `batch_size` samples stacked row-wise.
    pub fn sample_batch(
        &mut self,
        dt: f64,
        length: usize,
        batch_size: usize,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let inputs = self.input_dimension(length);
        let outputs = self.output_dimension();
        let mut x = Array2::<f32>::zeros((batch_size, inputs));
        let mut y = Array2::<f32>::zeros((batch_size, outputs));

        for row in 0..batch_size {
            let (xs, ys) = self.sample(dt, length)?;
            for (cell, v) in x.row_mut(row).iter_mut().zip(xs) {
                *cell = v as f32;
            }
            for (cell, v) in y.row_mut(row).iter_mut().zip(ys) {
                *cell = v as f32;
            }
        }
        Ok((x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_log(duration: f64, rate: f64, pwm: f64) -> ExperimentLog {
        let n = (duration * rate) as usize;
        let t: Vec<f64> = (0..n).map(|i| i as f64 / rate).collect();
        let mut log = ExperimentLog::new(t.clone());
        log.insert("read_position", t.clone()).unwrap();
        log.insert("read_velocity", vec![1.0; n]).unwrap();
        log.insert("goal_pwm", vec![pwm; n]).unwrap();
        log
    }

    #[test]
    fn sample_interleaves_state_and_action() {
        let mut logs = Logs::new(Some(1));
        logs.push_log(&ramp_log(2.0, 100.0, 30.0)).unwrap();
        let (x, y) = logs.sample(0.01, 5).unwrap();
        assert_eq!(x.len(), 15);
        assert_eq!(y.len(), 2);

        let start = x[0];
        assert!(start >= 0.1 - 1e-9 && start <= 1.99 - 0.1 + 1e-9, "{}", start);
        for k in 0..5 {
            assert_relative_eq!(x[3 * k], start + k as f64 * 0.01, epsilon = 1e-9);
            assert_relative_eq!(x[3 * k + 1], 1.0);
            assert_relative_eq!(x[3 * k + 2], 30.0);
        }
        assert_relative_eq!(y[0], start + 0.05, epsilon = 1e-9);
    }

    #[test]
    fn collections_are_weighted_by_duration() {
        let mut logs = Logs::new(Some(42));
        logs.push_log(&ramp_log(9.0, 50.0, 0.0)).unwrap();
        logs.push_log(&ramp_log(1.0, 50.0, 0.0)).unwrap();
        let long = (0..2000)
            .filter(|_| logs.random_collection().unwrap() == 0)
            .count();
        assert!((1700..1900).contains(&long), "{}", long);
    }

    #[test]
    fn batch_has_one_row_per_sample() {
        let mut logs = Logs::new(Some(5));
        logs.push_log(&ramp_log(3.0, 100.0, -20.0)).unwrap();
        let (x, y) = logs.sample_batch(0.01, 4, 16).unwrap();
        assert_eq!(x.dim(), (16, 12));
        assert_eq!(y.dim(), (16, 2));
        assert!(x.column(2).iter().all(|v| *v == -20.0));
    }

    #[test]
    fn too_short_logs_cannot_be_sampled() {
        let mut logs = Logs::new(Some(0));
        assert!(logs.sample(0.01, 5).is_err());
        logs.push_log(&ramp_log(0.15, 100.0, 0.0)).unwrap();
        assert!(logs.sample(0.01, 5).is_err());
    }

    #[test]
    fn logs_without_action_are_rejected() {
        let mut log = ExperimentLog::new(vec![0.0, 1.0]);
        log.insert("read_position", vec![0.0, 1.0]).unwrap();
        log.insert("read_velocity", vec![0.0, 1.0]).unwrap();
        let mut logs = Logs::new(None);
        assert!(logs.push_log(&log).is_err());
    }
}
