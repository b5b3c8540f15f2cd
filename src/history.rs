use eyre::{eyre, Result};
use std::collections::BTreeMap;

/// Timestamped samples of several named signals.
///
/// Lookups interpolate linearly between the two surrounding samples and
/// clamp to the first or last value outside the recorded range.
#[derive(Clone, Debug, Default)]
pub struct HistoryCollection {
    entries: BTreeMap<String, Vec<(f64, f64)>>,
}

impl HistoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples may arrive out of order; they are kept sorted by time.
    pub fn push_number(&mut self, key: &str, timestamp: f64, value: f64) {
        let samples = self.entries.entry(key.to_string()).or_default();
        match samples.last() {
            Some(&(last, _)) if timestamp < last => {
                let index = samples.partition_point(|(t, _)| *t <= timestamp);
                samples.insert(index, (timestamp, value));
            }
            _ => samples.push((timestamp, value)),
        }
    }

    pub fn number(&self, key: &str, timestamp: f64) -> Result<f64> {
        let samples = self
            .entries
            .get(key)
            .ok_or_else(|| eyre!("History has no entry '{}'", key))?;
        let (first, last) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(eyre!("History entry '{}' is empty", key)),
        };
        if timestamp <= first.0 {
            return Ok(first.1);
        }
        if timestamp >= last.0 {
            return Ok(last.1);
        }

        let index = samples.partition_point(|(t, _)| *t <= timestamp);
        let (t0, v0) = samples[index - 1];
        let (t1, v1) = samples[index];
        if t1 == t0 {
            return Ok(v1);
        }
        let alpha = (timestamp - t0) / (t1 - t0);
        Ok(v0 + alpha * (v1 - v0))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn smallest_timestamp(&self) -> Option<f64> {
        self.entries
            .values()
            .filter_map(|samples| samples.first().map(|(t, _)| *t))
            .reduce(f64::min)
    }

    pub fn biggest_timestamp(&self) -> Option<f64> {
        self.entries
            .values()
            .filter_map(|samples| samples.last().map(|(t, _)| *t))
            .reduce(f64::max)
    }

    pub fn duration(&self) -> f64 {
        match (self.smallest_timestamp(), self.biggest_timestamp()) {
            (Some(small), Some(big)) => big - small,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn interpolates_between_samples() {
        let mut history = HistoryCollection::new();
        history.push_number("x", 0.0, 0.0);
        history.push_number("x", 1.0, 10.0);
        history.push_number("x", 3.0, -10.0);
        assert_relative_eq!(history.number("x", 0.25).unwrap(), 2.5);
        assert_relative_eq!(history.number("x", 2.0).unwrap(), 0.0);
        assert_relative_eq!(history.number("x", 1.0).unwrap(), 10.0);
    }

    #[test]
    fn clamps_outside_the_range() {
        let mut history = HistoryCollection::new();
        history.push_number("x", 1.0, 4.0);
        history.push_number("x", 2.0, 8.0);
        assert_eq!(history.number("x", -5.0).unwrap(), 4.0);
        assert_eq!(history.number("x", 50.0).unwrap(), 8.0);
    }

    #[test]
    fn out_of_order_samples_are_sorted() {
        let mut history = HistoryCollection::new();
        history.push_number("x", 2.0, 2.0);
        history.push_number("x", 0.0, 0.0);
        history.push_number("x", 1.0, 1.0);
        assert_relative_eq!(history.number("x", 1.5).unwrap(), 1.5);
        assert_eq!(history.smallest_timestamp(), Some(0.0));
    }

    #[test]
    fn range_spans_all_entries() {
        let mut history = HistoryCollection::new();
        assert_eq!(history.smallest_timestamp(), None);
        history.push_number("a", 0.5, 1.0);
        history.push_number("a", 3.0, 1.0);
        history.push_number("b", 0.2, 1.0);
        assert_eq!(history.smallest_timestamp(), Some(0.2));
        assert_eq!(history.biggest_timestamp(), Some(3.0));
        assert_relative_eq!(history.duration(), 2.8);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let history = HistoryCollection::new();
        assert!(history.number("goal_pwm", 0.0).is_err());
    }
}
