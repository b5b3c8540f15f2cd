//! Planar model of the 1R and 2R benches.
//!
//! Joint angles are measured from the base x axis in the x/z plane. The base
//! may be rotated about y by `base_orientation`, which shifts the angle seen
//! by gravity: a point at distance `r` along angle `q` sits at height
//! `r sin(q - base_orientation)`.

use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::constants::{GRAVITY, LINK_LENGTH_M, LINK_MASS_KG};
use crate::recording::write_json;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// kg
    pub mass: f64,
    /// Joint to next joint (or end point), m.
    pub length: f64,
    /// Joint to centre of mass, m.
    pub com: f64,
    /// About the centre of mass, kg.m².
    pub inertia: f64,
}

impl Link {
    /// Adds a point mass at the far end of the link.
    fn with_tip_mass(self, payload: f64) -> Link {
        let mass = self.mass + payload;
        let com = (self.mass * self.com + payload * self.length) / mass;
        let inertia = self.inertia
            + self.mass * (self.com - com).powi(2)
            + payload * (self.length - com).powi(2);
        Link {
            mass,
            length: self.length,
            com,
            inertia,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorqueEstimator {
    /// Full inverse dynamics of the model.
    Model,
    /// `m g l cos θ`
    GravityCos,
    /// `m g l sin θ`
    GravitySin,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArmModel {
    pub links: Vec<Link>,
    /// Rotation of the base about y, rad.
    #[serde(default)]
    pub base_orientation: f64,
    #[serde(default = "default_gravity")]
    pub gravity: f64,
}

fn default_gravity() -> f64 {
    GRAVITY
}

impl ArmModel {
    pub fn one_r() -> Self {
        Self {
            links: vec![Link {
                mass: LINK_MASS_KG,
                length: LINK_LENGTH_M,
                com: LINK_LENGTH_M,
                inertia: 1.0e-4,
            }],
            base_orientation: 0.0,
            gravity: GRAVITY,
        }
    }

    pub fn two_r() -> Self {
        Self {
            links: vec![
                Link {
                    mass: 0.12,
                    length: 0.15,
                    com: 0.075,
                    inertia: 2.5e-4,
                },
                Link {
                    mass: 0.1,
                    length: 0.15,
                    com: 0.075,
                    inertia: 2.0e-4,
                },
            ],
            base_orientation: 0.0,
            gravity: GRAVITY,
        }
    }

    pub fn with_base_orientation(mut self, base_orientation: f64) -> Self {
        self.base_orientation = base_orientation;
        self
    }

    /// Adds `payload` kg at the end of the last link.
    pub fn with_payload(mut self, payload: f64) -> Self {
        if let Some(last) = self.links.last_mut() {
            *last = last.with_tip_mass(payload);
        }
        self
    }

    pub fn dof(&self) -> usize {
        self.links.len()
    }

    fn check(&self) -> Result<()> {
        match self.links.len() {
            1 | 2 => Ok(()),
            n => Err(eyre!("Only 1R and 2R arms are modeled, got {} links", n)),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
        let model: ArmModel = serde_json::from_reader(BufReader::new(file))
            .wrap_err_with(|| format!("parsing {}", path.display()))?;
        model.check()?;
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// End point `(x, z)` in the base frame.
    pub fn forward_geometry(&self, q: &[f64]) -> Result<(f64, f64)> {
        self.check()?;
        if q.len() != self.dof() {
            return Err(eyre!("Expected {} joint angles, got {}", self.dof(), q.len()));
        }
        let mut angle = 0.0;
        let (mut x, mut z) = (0.0, 0.0);
        for (link, qi) in self.links.iter().zip(q) {
            angle += qi;
            x += link.length * angle.cos();
            z += link.length * angle.sin();
        }
        Ok((x, z))
    }

    /// Joint angles reaching `(x, z)` with a 2R arm. `elbow` picks the sign
    /// of the second joint.
    pub fn inverse_geometry(&self, x: f64, z: f64, elbow: f64) -> Result<[f64; 2]> {
        let [l1, l2] = match self.links.as_slice() {
            [a, b] => [a.length, b.length],
            _ => return Err(eyre!("Inverse geometry needs a 2R arm")),
        };
        let c2 = (x * x + z * z - l1 * l1 - l2 * l2) / (2.0 * l1 * l2);
        if !(-1.0..=1.0).contains(&c2) {
            return Err(eyre!("Point ({:.4}, {:.4}) is out of reach", x, z));
        }
        let q2 = elbow.signum() * c2.acos();
        let q1 = z.atan2(x) - (l2 * q2.sin()).atan2(l1 + l2 * q2.cos());
        Ok([q1, q2])
    }

    /// Joint torques for the given state: `M(q) qdd + C(q, qd) qd + G(q)`.
    pub fn inverse_dynamics(&self, q: &[f64], qd: &[f64], qdd: &[f64]) -> Result<Vec<f64>> {
        let n = self.dof();
        if q.len() != n || qd.len() != n || qdd.len() != n {
            return Err(eyre!("Expected {} values for q, qd and qdd", n));
        }
        let g = self.gravity;
        let phi = self.base_orientation;

        match self.links.as_slice() {
            [link] => {
                let inertia = link.inertia + link.mass * link.com.powi(2);
                let gravity = link.mass * g * link.com * (q[0] - phi).cos();
                Ok(vec![inertia * qdd[0] + gravity])
            }
            [l1, l2] => {
                let (c2, s2) = (q[1].cos(), q[1].sin());
                let m11 = l1.inertia
                    + l2.inertia
                    + l1.mass * l1.com.powi(2)
                    + l2.mass * (l1.length.powi(2) + l2.com.powi(2) + 2.0 * l1.length * l2.com * c2);
                let m12 = l2.inertia + l2.mass * (l2.com.powi(2) + l1.length * l2.com * c2);
                let m22 = l2.inertia + l2.mass * l2.com.powi(2);
                let h = -l2.mass * l1.length * l2.com * s2;

                let a1 = q[0] - phi;
                let a12 = a1 + q[1];
                let g2 = l2.mass * g * l2.com * a12.cos();
                let g1 = (l1.mass * l1.com + l2.mass * l1.length) * g * a1.cos() + g2;

                let tau1 = m11 * qdd[0]
                    + m12 * qdd[1]
                    + h * (2.0 * qd[0] * qd[1] + qd[1].powi(2))
                    + g1;
                let tau2 = m12 * qdd[0] + m22 * qdd[1] - h * qd[0].powi(2) + g2;
                Ok(vec![tau1, tau2])
            }
            links => Err(eyre!("Only 1R and 2R arms are modeled, got {} links", links.len())),
        }
    }

    /// Torque on the first joint using `estimator`.
    pub fn estimate_torque(
        &self,
        estimator: TorqueEstimator,
        position: f64,
        velocity: f64,
        acceleration: f64,
    ) -> Result<f64> {
        match estimator {
            TorqueEstimator::Model => {
                Ok(self.inverse_dynamics(&[position], &[velocity], &[acceleration])?[0])
            }
            TorqueEstimator::GravityCos => Ok(alternative_torque_cos(position)),
            TorqueEstimator::GravitySin => Ok(alternative_torque_sin(position)),
        }
    }
}

pub fn alternative_torque_cos(theta: f64) -> f64 {
    LINK_MASS_KG * GRAVITY * LINK_LENGTH_M * theta.cos()
}

pub fn alternative_torque_sin(theta: f64) -> f64 {
    LINK_MASS_KG * GRAVITY * LINK_LENGTH_M * theta.sin()
}
