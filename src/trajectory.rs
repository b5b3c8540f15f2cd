use eyre::{eyre, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::arm::ArmModel;

/// Height of the cartesian trajectories above the first joint, m.
pub const CARTESIAN_Z_OFFSET: f64 = 0.2;
pub const CIRCLE_DIAMETER: f64 = 0.04;
pub const LINE_LENGTH: f64 = 0.05;

/// Joint limit used by the random articular trajectory, rad.
pub const ARTICULAR_LIMIT: f64 = PI / 2.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinusProfile {
    /// Swings between 0 and π/2 starting from π/2.
    Offset,
    /// `π/3 sin(tπ/2)`
    Centered,
    /// `π/3 sin(t²)`, frequency rising with time.
    Chirp,
}

impl SinusProfile {
    pub fn position(self, t: f64) -> f64 {
        match self {
            SinusProfile::Offset => PI / 2.0 + PI / 4.0 * ((t * PI / 2.0 + PI / 2.0).sin() - 1.0),
            SinusProfile::Centered => PI / 3.0 * (t * PI / 2.0).sin(),
            SinusProfile::Chirp => PI / 3.0 * (t * t).sin(),
        }
    }

    pub fn velocity(self, t: f64) -> f64 {
        match self {
            SinusProfile::Offset => PI.powi(2) / 8.0 * (t * PI / 2.0 + PI / 2.0).cos(),
            SinusProfile::Centered => PI.powi(2) / 6.0 * (t * PI / 2.0).cos(),
            SinusProfile::Chirp => 2.0 * t * PI / 3.0 * (t * t).cos(),
        }
    }

    pub fn acceleration(self, t: f64) -> f64 {
        match self {
            SinusProfile::Offset => -PI.powi(3) / 16.0 * (t * PI / 2.0 + PI / 2.0).sin(),
            SinusProfile::Centered => -PI.powi(3) / 12.0 * (t * PI / 2.0).sin(),
            SinusProfile::Chirp => {
                2.0 * PI / 3.0 * (t * t).cos() - 4.0 * t * t * PI / 3.0 * (t * t).sin()
            }
        }
    }
}

/// `max · sin(ω t)`
pub fn amplitude_sinus(max: f64, omega: f64, t: f64) -> f64 {
    max * (omega * t).sin()
}

/// Random PWM targets held for `pwm_duration`, pushed back towards the
/// centre when the arm leaves ±π/3.
pub struct RandomPwmSchedule {
    max: f64,
    pwm_duration: f64,
    target: f64,
    last_switch: f64,
    rng: StdRng,
}

impl RandomPwmSchedule {
    pub const POSITION_LIMIT: f64 = PI / 3.0;

    pub fn new(max: f64, pwm_duration: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            max,
            pwm_duration,
            target: 0.0,
            last_switch: 0.0,
            rng,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Returns the new target when one was drawn at time `t`.
    pub fn update(&mut self, t: f64, position: f64) -> Option<f64> {
        let held = t - self.last_switch;
        let target = if position > Self::POSITION_LIMIT {
            self.rng.gen_range(-self.max..=0.0)
        } else if position < -Self::POSITION_LIMIT {
            self.rng.gen_range(0.0..=self.max)
        } else if held > self.pwm_duration {
            self.rng.gen_range(-self.max..=self.max)
        } else {
            return None;
        };
        self.target = target;
        self.last_switch = t;
        Some(target)
    }
}

/// Value `k` is applied during `[k·d, (k+1)·d)`.
#[derive(Clone, Debug, PartialEq)]
pub struct StepSchedule {
    pub values: Vec<f64>,
    pub step_duration: f64,
}

impl StepSchedule {
    pub fn new(values: Vec<f64>, step_duration: f64) -> Result<Self> {
        if values.is_empty() {
            return Err(eyre!("Step schedule needs at least one value"));
        }
        if !(step_duration > 0.0) {
            return Err(eyre!("Step duration must be positive"));
        }
        Ok(Self {
            values,
            step_duration,
        })
    }

    pub fn total_duration(&self) -> f64 {
        self.step_duration * self.values.len() as f64
    }

    pub fn index_at(&self, t: f64) -> usize {
        let index = (t.max(0.0) / self.step_duration).floor() as usize;
        index.min(self.values.len() - 1)
    }

    pub fn value_at(&self, t: f64) -> f64 {
        self.values[self.index_at(t)]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartesianKind {
    Circle,
    Line,
}

/// End point target `(x, z)` at time `t`.
pub fn cartesian_target(kind: CartesianKind, t: f64, period: f64) -> (f64, f64) {
    let phase = 2.0 * PI * t / period;
    match kind {
        CartesianKind::Circle => (
            CIRCLE_DIAMETER / 2.0 * phase.sin(),
            CIRCLE_DIAMETER / 2.0 * ((phase + PI).cos() + 1.0) + CARTESIAN_Z_OFFSET,
        ),
        CartesianKind::Line => (LINE_LENGTH / 2.0 * phase.sin(), CARTESIAN_Z_OFFSET),
    }
}

/// Joint targets sampled every `dt` over `[0, duration)`.
pub fn motor_positions(
    arm: &ArmModel,
    duration: f64,
    period: f64,
    kind: CartesianKind,
    dt: f64,
) -> Result<Vec<[f64; 2]>> {
    if !(dt > 0.0) {
        return Err(eyre!("Sampling step must be positive"));
    }
    let samples = (duration / dt).ceil() as usize;
    (0..samples)
        .map(|k| {
            let (x, z) = cartesian_target(kind, k as f64 * dt, period);
            arm.inverse_geometry(x, z, 1.0)
        })
        .collect()
}

/// Smooth random moves in joint space: each move blends from the current
/// configuration to a random one with a half cosine, slow enough that no
/// joint exceeds `max_speed` rad/s.
pub fn random_2r_trajectory<R: Rng + ?Sized>(
    duration: f64,
    max_speed: f64,
    dt: f64,
    rng: &mut R,
) -> Result<Vec<[f64; 2]>> {
    if !(max_speed > 0.0) || !(dt > 0.0) {
        return Err(eyre!("max_speed and dt must be positive"));
    }
    let samples = (duration / dt).ceil() as usize;
    let mut positions = Vec::with_capacity(samples);
    let mut from = [0.0, 0.0];

    while positions.len() < samples {
        let to = [
            rng.gen_range(-ARTICULAR_LIMIT..=ARTICULAR_LIMIT),
            rng.gen_range(-ARTICULAR_LIMIT..=ARTICULAR_LIMIT),
        ];
        let delta = [to[0] - from[0], to[1] - from[1]];
        let largest = delta[0].abs().max(delta[1].abs());
        // Peak speed of a half cosine blend is |Δ| π / (2 T).
        let move_duration = (largest * PI / (2.0 * max_speed)).max(dt);
        let move_samples = (move_duration / dt).ceil() as usize;

        for k in 1..=move_samples {
            if positions.len() >= samples {
                break;
            }
            let s = k as f64 / move_samples as f64;
            let blend = (1.0 - (PI * s).cos()) / 2.0;
            positions.push([from[0] + delta[0] * blend, from[1] + delta[1] * blend]);
        }
        from = to;
    }
    Ok(positions)
}

/// Sum of sinusoids with random amplitude, frequency and phase.
#[derive(Clone, Debug, PartialEq)]
pub struct SinusoidSum {
    /// `(amplitude, frequency in Hz, phase)`
    pub components: Vec<(f64, f64, f64)>,
}

impl SinusoidSum {
    pub fn random<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Self {
        let components = (0..count)
            .map(|_| {
                (
                    rng.gen_range(0.1..=1.0),
                    rng.gen_range(0.5..=2.0),
                    rng.gen_range(0.0..2.0 * PI),
                )
            })
            .collect();
        Self { components }
    }

    pub fn value(&self, t: f64) -> f64 {
        self.components
            .iter()
            .map(|(amplitude, frequency, phase)| {
                amplitude * (2.0 * PI * frequency * t + phase).sin()
            })
            .sum()
    }
}
