use eyre::{eyre, Result};
use nalgebra::{DMatrix, DVector};

use crate::constants::{SPLINE_DEGREE, SPLINE_INTERSECTED_VALUES, SPLINE_WINDOW_SIZE};

#[derive(Clone, Debug)]
struct Window {
    center: f64,
    /// Ascending powers of `t - center`.
    coefficients: Vec<f64>,
}

/// Piecewise least-squares polynomials on overlapping windows of samples.
///
/// Consecutive windows share `intersected_values` samples, so they start
/// every `window_size - intersected_values` samples. A query is answered by
/// the window whose centre is closest.
#[derive(Clone, Debug)]
pub struct WindowedPolyFit {
    window_size: usize,
    degree: usize,
    intersected_values: usize,
    windows: Vec<Window>,
}

impl Default for WindowedPolyFit {
    fn default() -> Self {
        Self {
            window_size: SPLINE_WINDOW_SIZE,
            degree: SPLINE_DEGREE,
            intersected_values: SPLINE_INTERSECTED_VALUES,
            windows: vec![],
        }
    }
}

impl WindowedPolyFit {
    pub fn new(window_size: usize, degree: usize, intersected_values: usize) -> Result<Self> {
        if window_size <= degree {
            return Err(eyre!(
                "Window of {} samples cannot fit a degree {} polynomial",
                window_size,
                degree
            ));
        }
        if intersected_values >= window_size {
            return Err(eyre!(
                "Windows must advance: {} shared values for a window of {}",
                intersected_values,
                window_size
            ));
        }
        Ok(Self {
            window_size,
            degree,
            intersected_values,
            windows: vec![],
        })
    }

    pub fn stride(&self) -> usize {
        self.window_size - self.intersected_values
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    fn fit_window(&self, x: &[f64], y: &[f64]) -> Result<Window> {
        let center = (x[0] + x[x.len() - 1]) / 2.0;
        let design = DMatrix::from_fn(x.len(), self.degree + 1, |row, col| {
            (x[row] - center).powi(col as i32)
        });
        let target = DVector::from_column_slice(y);
        let solution = design
            .svd(true, true)
            .solve(&target, 1e-12)
            .map_err(|e| eyre!("Least squares failed around t={}: {}", center, e))?;
        Ok(Window {
            center,
            coefficients: solution.iter().copied().collect(),
        })
    }

    /// Fits every window. The last window is aligned on the final sample so
    /// the whole range is covered.
    pub fn fit(&mut self, x: &[f64], y: &[f64]) -> Result<()> {
        if x.len() != y.len() {
            return Err(eyre!("{} abscissas for {} values", x.len(), y.len()));
        }
        if x.len() < self.window_size {
            return Err(eyre!(
                "Need at least {} samples, got {}",
                self.window_size,
                x.len()
            ));
        }

        let mut starts: Vec<usize> = (0..=x.len() - self.window_size)
            .step_by(self.stride())
            .collect();
        let last_start = x.len() - self.window_size;
        if starts.last() != Some(&last_start) {
            starts.push(last_start);
        }

        self.windows = starts
            .into_iter()
            .map(|start| {
                let end = start + self.window_size;
                self.fit_window(&x[start..end], &y[start..end])
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Value (`der = 0`) or derivative of order `der` at `t`.
    pub fn value(&self, t: f64, der: usize) -> Result<f64> {
        if der > self.degree {
            return Err(eyre!(
                "Derivative {} requested from a degree {} fit",
                der,
                self.degree
            ));
        }
        // Centres are increasing.
        let index = self.windows.partition_point(|w| w.center < t);
        let window = match (index.checked_sub(1).map(|i| &self.windows[i]), self.windows.get(index)) {
            (Some(before), Some(after)) => {
                if t - before.center <= after.center - t {
                    before
                } else {
                    after
                }
            }
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => return Err(eyre!("Polynomial fit has not been computed")),
        };

        let dt = t - window.center;
        let value = window
            .coefficients
            .iter()
            .enumerate()
            .skip(der)
            .map(|(power, c)| {
                let falling: f64 = ((power - der + 1)..=power).map(|k| k as f64).product();
                c * falling * dt.powi((power - der) as i32)
            })
            .sum();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn recovers_quadratic_and_its_derivatives() {
        let x: Vec<f64> = (0..200).map(|i| i as f64 / 300.0).collect();
        let y: Vec<f64> = x.iter().map(|t| 3.0 * t * t - 2.0 * t + 1.0).collect();
        let mut fit = WindowedPolyFit::default();
        fit.fit(&x, &y).unwrap();

        for t in [0.01, 0.2, 0.5, 0.66] {
            assert_relative_eq!(fit.value(t, 0).unwrap(), 3.0 * t * t - 2.0 * t + 1.0, epsilon = 1e-8);
            assert_relative_eq!(fit.value(t, 1).unwrap(), 6.0 * t - 2.0, epsilon = 1e-6);
            assert_relative_eq!(fit.value(t, 2).unwrap(), 6.0, epsilon = 1e-4);
        }
        assert!(fit.value(0.2, 3).is_err());
    }

    #[test]
    fn windows_advance_by_stride_and_cover_the_end() {
        let mut fit = WindowedPolyFit::new(10, 1, 6).unwrap();
        assert_eq!(fit.stride(), 4);
        let x: Vec<f64> = (0..25).map(|i| i as f64).collect();
        fit.fit(&x, &x).unwrap();
        // starts 0, 4, 8, 12, then 15 for the tail
        assert_eq!(fit.window_count(), 5);
        assert_relative_eq!(fit.value(24.0, 0).unwrap(), 24.0, epsilon = 1e-9);
    }

    #[test]
    fn smooths_noise() {
        let x: Vec<f64> = (0..300).map(|i| i as f64 / 300.0).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, t)| t.sin() + if i % 2 == 0 { 1e-3 } else { -1e-3 })
            .collect();
        let mut fit = WindowedPolyFit::default();
        fit.fit(&x, &y).unwrap();
        assert!((fit.value(0.5, 0).unwrap() - 0.5f64.sin()).abs() < 5e-4);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(WindowedPolyFit::new(2, 2, 0).is_err());
        assert!(WindowedPolyFit::new(10, 2, 10).is_err());
        let mut fit = WindowedPolyFit::default();
        assert!(fit.fit(&[0.0, 1.0], &[0.0, 1.0]).is_err());
        assert!(fit.value(0.0, 0).is_err());
    }
}
