use eyre::{eyre, Result};
use std::f64::consts::PI;

fn convolve(x: &[f64], y: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; x.len() + y.len() - 1];
    for (i, a) in x.iter().enumerate() {
        for (j, b) in y.iter().enumerate() {
            out[i + j] += a * b;
        }
    }
    out
}

/// Digital Butterworth low-pass `(b, a)` through the bilinear transform with
/// a prewarped cutoff, coefficient for coefficient what scipy's
/// `butter(order, cutoff / nyquist)` returns.
pub fn butter_lowpass(order: usize, cutoff: f64, fs: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    if order == 0 {
        return Err(eyre!("Filter order must be at least 1"));
    }
    if !(cutoff > 0.0 && cutoff < fs / 2.0) {
        return Err(eyre!(
            "Cutoff {} Hz must lie in (0, {}) for a {} Hz signal",
            cutoff,
            fs / 2.0,
            fs
        ));
    }

    let k = 2.0 * fs;
    let wc = k * (PI * cutoff / fs).tan();
    let (k2, wc2) = (k * k, wc * wc);

    let mut b = vec![1.0];
    let mut a = vec![1.0];
    for pair in 0..order / 2 {
        let zeta = (PI * (2 * pair + 1) as f64 / (2 * order) as f64).sin();
        let a0 = k2 + 2.0 * zeta * wc * k + wc2;
        b = convolve(&b, &[wc2 / a0, 2.0 * wc2 / a0, wc2 / a0]);
        a = convolve(
            &a,
            &[1.0, 2.0 * (wc2 - k2) / a0, (k2 - 2.0 * zeta * wc * k + wc2) / a0],
        );
    }
    if order % 2 == 1 {
        let gain = wc / (k + wc);
        b = convolve(&b, &[gain, gain]);
        a = convolve(&a, &[1.0, (wc - k) / (k + wc)]);
    }
    Ok((b, a))
}

/// Direct form II transposed IIR filter, zero initial state.
pub fn lfilter(b: &[f64], a: &[f64], x: &[f64]) -> Result<Vec<f64>> {
    let a0 = *a.first().ok_or_else(|| eyre!("Empty denominator"))?;
    if a0 == 0.0 {
        return Err(eyre!("Leading denominator coefficient is zero"));
    }
    if b.is_empty() {
        return Err(eyre!("Empty numerator"));
    }

    let n = a.len().max(b.len());
    let coef = |c: &[f64], i: usize| c.get(i).copied().unwrap_or(0.0) / a0;
    let mut state = vec![0.0; n];
    let mut y = Vec::with_capacity(x.len());

    for &xi in x {
        let yi = coef(b, 0) * xi + state[0];
        for i in 1..n {
            let next = if i + 1 < n { state[i] } else { 0.0 };
            state[i - 1] = coef(b, i) * xi - coef(a, i) * yi + next;
        }
        y.push(yi);
    }
    Ok(y)
}

pub fn apply_butter_lowpass(data: &[f64], fs: f64, cutoff: f64, order: usize) -> Result<Vec<f64>> {
    let (b, a) = butter_lowpass(order, cutoff, fs)?;
    lfilter(&b, &a, data)
}

/// Central differences; the output is two samples shorter than the input.
pub fn derivative(data: &[f64], timestamps: &[f64]) -> Result<Vec<f64>> {
    if data.len() != timestamps.len() {
        return Err(eyre!(
            "{} values for {} timestamps",
            data.len(),
            timestamps.len()
        ));
    }
    if data.len() < 3 {
        return Ok(vec![]);
    }
    Ok((1..data.len() - 1)
        .map(|i| (data[i + 1] - data[i - 1]) / (timestamps[i + 1] - timestamps[i - 1]))
        .collect())
}

/// Boxcar average over full windows only: `len - window + 1` outputs.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    if window == 0 || values.len() < window {
        return vec![];
    }
    values
        .windows(window)
        .map(|w| w.iter().sum::<f64>() / window as f64)
        .collect()
}

/// Timestamps where the moving average of `values` crosses zero, reported
/// at the centre of the window.
pub fn find_zeros(values: &[f64], timestamps: &[f64], window: usize) -> Result<Vec<f64>> {
    if values.len() != timestamps.len() {
        return Err(eyre!(
            "{} values for {} timestamps",
            values.len(),
            timestamps.len()
        ));
    }
    let averaged = moving_average(values, window);
    let Some(&first) = averaged.first() else {
        return Ok(vec![]);
    };

    let mut zeros = vec![];
    let mut last = first;
    for (i, &value) in averaged.iter().enumerate() {
        if value == 0.0 || value * last < 0.0 {
            zeros.push(timestamps[i + window / 2]);
        }
        last = value;
    }
    Ok(zeros)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Jitter {
    pub goal: f64,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Statistics of the timestamp differences against the goal period.
pub fn timestamp_jitter(timestamps: &[f64], framerate: f64) -> Option<Jitter> {
    if timestamps.len() < 2 || !(framerate > 0.0) {
        return None;
    }
    let diffs: Vec<f64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
    let n = diffs.len() as f64;
    let mean = diffs.iter().sum::<f64>() / n;
    let variance = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
    Some(Jitter {
        goal: 1.0 / framerate,
        mean,
        std: variance.sqrt(),
        min: diffs.iter().copied().fold(f64::INFINITY, f64::min),
        max: diffs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}
