//! Bench procedures run by [`ControlLoop`](crate::runtime::ControlLoop).
//!
//! Every experiment records the signals it reads at each step and builds an
//! [`ExperimentLog`] with the usual keys (`read_position`, `goal_pwm`, ...).
//! Two-motor experiments suffix their keys with `_1` and `_2`.

use eyre::{eyre, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::actuators::ActuatorCommand;
use crate::arm::ArmModel;
use crate::constants::{
    CURRENT_THRESHOLD_MA, FRAMERATE_1R_POSITION, FRAMERATE_BENCH, KI_A_PER_NM,
};
use crate::motor::{MotorController, MotorReading, OperatingMode, ReadSelection};
use crate::recording::ExperimentLog;
use crate::runtime::{Clock, Experiment};
use crate::trajectory::{
    amplitude_sinus, motor_positions, random_2r_trajectory, CartesianKind, RandomPwmSchedule,
    SinusProfile, SinusoidSum, StepSchedule,
};

/// Time given to the motors to reach a start or park position.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);
const SETTLE_STEPS: usize = 50;

/// Switches `ids` to `mode`. Torque has to be off while the mode changes.
fn switch_mode(motors: &mut MotorController, ids: &[u8], mode: OperatingMode) {
    motors.disable_torque(ids);
    motors.set_control_mode(ids, mode);
    motors.enable_torque(ids);
}

/// Eases every motor to its target position over [`SETTLE_DELAY`].
fn reach(motors: &mut MotorController, clock: &mut dyn Clock, targets: &[(u8, f64)]) -> Result<()> {
    let commands: Vec<ActuatorCommand> = targets
        .iter()
        .map(|&(id, position)| ActuatorCommand::position(id, position))
        .collect();
    let results = motors.move_to(clock, &commands, SETTLE_DELAY, SETTLE_STEPS)?;
    for result in results.iter().filter(|r| !r.success) {
        warn!(
            "Motor {} did not take its position command: {}",
            result.actuator_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Named series filled one value per step.
#[derive(Default)]
struct Record {
    series: BTreeMap<String, Vec<f64>>,
}

impl Record {
    fn push(&mut self, key: &str, value: f64) {
        self.series.entry(key.to_string()).or_default().push(value);
    }

    fn push_reading(&mut self, reading: &MotorReading, suffix: &str) {
        let signals = [
            ("read_position", reading.position),
            ("read_velocity", reading.velocity),
            ("read_current", reading.current),
            ("read_pwm", reading.pwm),
        ];
        for (name, value) in signals {
            if let Some(value) = value {
                self.push(&format!("{}{}", name, suffix), value);
            }
        }
    }

    /// Log of the recorded series, truncated to the number of completed
    /// steps.
    fn into_log(self, timestamps: Vec<f64>) -> Result<ExperimentLog> {
        let steps = timestamps.len();
        let mut log = ExperimentLog::new(timestamps);
        for (key, mut values) in self.series {
            values.truncate(steps);
            log.insert(&key, values)?;
        }
        Ok(log)
    }
}

/// 1R arm in position mode following one of the [`SinusProfile`]s.
pub struct PositionSinus {
    id: u8,
    profile: SinusProfile,
    duration: f64,
    framerate: f64,
    record: Record,
}

impl PositionSinus {
    /// The offset profile runs on the fast 1R position bench, the others at
    /// the common bench rate.
    pub fn new(id: u8, profile: SinusProfile, duration: f64) -> Self {
        let framerate = match profile {
            SinusProfile::Offset => FRAMERATE_1R_POSITION,
            SinusProfile::Centered | SinusProfile::Chirp => FRAMERATE_BENCH,
        };
        Self {
            id,
            profile,
            duration,
            framerate,
            record: Record::default(),
        }
    }
}

impl Experiment for PositionSinus {
    fn name(&self) -> &str {
        match self.profile {
            SinusProfile::Chirp => "position_chirp",
            SinusProfile::Offset | SinusProfile::Centered => "position_sinus",
        }
    }

    fn framerate(&self) -> f64 {
        self.framerate
    }

    fn setup(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()> {
        switch_mode(motors, &[self.id], OperatingMode::Position);
        reach(motors, clock, &[(self.id, self.profile.position(0.0))])
    }

    fn is_finished(&self, t_sum: f64) -> bool {
        t_sum >= self.duration
    }

    fn step(&mut self, motors: &mut MotorController, t: f64) -> Result<()> {
        let reading = motors.read_data(self.id, ReadSelection::POSITION_VELOCITY_CURRENT)?;
        self.record.push_reading(&reading, "");
        motors.set_position(self.id, self.profile.position(t))
    }

    fn teardown(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()> {
        let parked = reach(motors, clock, &[(self.id, self.profile.position(0.0))]);
        motors.disable_torque(&[self.id]);
        parked
    }

    fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog> {
        let profile = self.profile;
        let goal = |f: fn(SinusProfile, f64) -> f64| -> Vec<f64> {
            timestamps.iter().map(|t| f(profile, *t)).collect()
        };
        let goal_position = goal(SinusProfile::position);
        let goal_velocity = goal(SinusProfile::velocity);
        let goal_acceleration = goal(SinusProfile::acceleration);

        let mut log = self.record.into_log(timestamps)?;
        log.insert("goal_position", goal_position)?;
        log.insert("goal_velocity", goal_velocity)?;
        log.insert("goal_acceleration", goal_acceleration)?;
        Ok(log)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SinusGoal {
    Current,
    Pwm,
}

/// 1R arm driven open loop by `max · sin(ω t)` in current or PWM mode.
/// Only meant for the horizontal bench.
pub struct AmplitudeSinus {
    id: u8,
    goal: SinusGoal,
    max: f64,
    omega: f64,
    duration: f64,
    record: Record,
}

impl AmplitudeSinus {
    /// Current sinus, `max_current` in mA.
    pub fn current(id: u8, max_current: f64, omega: f64, duration: f64) -> Self {
        Self::new(id, SinusGoal::Current, max_current, omega, duration)
    }

    /// PWM sinus, `max_pwm` in %.
    pub fn pwm(id: u8, max_pwm: f64, omega: f64, duration: f64) -> Self {
        Self::new(id, SinusGoal::Pwm, max_pwm, omega, duration)
    }

    fn new(id: u8, goal: SinusGoal, max: f64, omega: f64, duration: f64) -> Self {
        Self {
            id,
            goal,
            max,
            omega,
            duration,
            record: Record::default(),
        }
    }
}

impl Experiment for AmplitudeSinus {
    fn name(&self) -> &str {
        match self.goal {
            SinusGoal::Current => "current_sinus",
            SinusGoal::Pwm => "pwm_sinus",
        }
    }

    fn framerate(&self) -> f64 {
        FRAMERATE_BENCH
    }

    fn setup(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()> {
        switch_mode(motors, &[self.id], OperatingMode::Position);
        reach(motors, clock, &[(self.id, 0.0)])?;
        let mode = match self.goal {
            SinusGoal::Current => OperatingMode::Current,
            SinusGoal::Pwm => OperatingMode::Pwm,
        };
        switch_mode(motors, &[self.id], mode);
        Ok(())
    }

    fn is_finished(&self, t_sum: f64) -> bool {
        t_sum >= self.duration
    }

    fn step(&mut self, motors: &mut MotorController, t: f64) -> Result<()> {
        let reading = motors.read_data(self.id, ReadSelection::ALL)?;
        self.record.push_reading(&reading, "");
        let value = amplitude_sinus(self.max, self.omega, t);
        match self.goal {
            SinusGoal::Current => motors.set_current(self.id, value),
            SinusGoal::Pwm => motors.set_pwm(self.id, value),
        }
    }

    fn teardown(&mut self, motors: &mut MotorController, _: &mut dyn Clock) -> Result<()> {
        motors.disable_torque(&[self.id]);
        Ok(())
    }

    fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog> {
        let goal: Vec<f64> = timestamps
            .iter()
            .map(|t| amplitude_sinus(self.max, self.omega, *t))
            .collect();
        let key = match self.goal {
            SinusGoal::Current => "goal_current",
            SinusGoal::Pwm => "goal_pwm",
        };
        let mut log = self.record.into_log(timestamps)?;
        log.insert(key, goal)?;
        Ok(log)
    }
}

/// 1R arm tracking the offset sinus in current mode. Each step sends the
/// torque the arm model needs for the goal state, converted with Ki.
pub struct CurrentFeedforwardSinus {
    id: u8,
    arm: ArmModel,
    duration: f64,
    record: Record,
}

impl CurrentFeedforwardSinus {
    const PROFILE: SinusProfile = SinusProfile::Offset;

    pub fn new(id: u8, arm: ArmModel, duration: f64) -> Result<Self> {
        if arm.dof() != 1 {
            return Err(eyre!("Feedforward sinus needs a 1R arm, got {} links", arm.dof()));
        }
        Ok(Self {
            id,
            arm,
            duration,
            record: Record::default(),
        })
    }

    /// Goal current in mA at time `t`.
    pub fn feedforward_current(&self, t: f64) -> Result<f64> {
        let profile = Self::PROFILE;
        let torque = self.arm.inverse_dynamics(
            &[profile.position(t)],
            &[profile.velocity(t)],
            &[profile.acceleration(t)],
        )?[0];
        Ok(torque * KI_A_PER_NM * 1000.0)
    }
}

impl Experiment for CurrentFeedforwardSinus {
    fn name(&self) -> &str {
        "current_feedforward_sinus"
    }

    fn framerate(&self) -> f64 {
        FRAMERATE_1R_POSITION
    }

    fn setup(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()> {
        switch_mode(motors, &[self.id], OperatingMode::Position);
        reach(motors, clock, &[(self.id, Self::PROFILE.position(0.0))])?;
        switch_mode(motors, &[self.id], OperatingMode::Current);
        Ok(())
    }

    fn is_finished(&self, t_sum: f64) -> bool {
        t_sum >= self.duration
    }

    fn step(&mut self, motors: &mut MotorController, t: f64) -> Result<()> {
        let reading = motors.read_data(self.id, ReadSelection::POSITION_VELOCITY_CURRENT)?;
        self.record.push_reading(&reading, "");
        let current = self.feedforward_current(t)?;
        self.record.push("goal_position", Self::PROFILE.position(t));
        self.record.push("goal_current", current);
        motors.set_current(self.id, current)
    }

    fn teardown(&mut self, motors: &mut MotorController, _: &mut dyn Clock) -> Result<()> {
        motors.disable_torque(&[self.id]);
        Ok(())
    }

    fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog> {
        self.record.into_log(timestamps)
    }
}

/// 1R arm in PWM mode with random targets, kept within ±π/3.
pub struct RandomPwm {
    id: u8,
    duration: f64,
    schedule: RandomPwmSchedule,
    record: Record,
}

impl RandomPwm {
    pub fn new(id: u8, duration: f64, pwm_duration: f64, max_pwm: f64, seed: Option<u64>) -> Self {
        Self {
            id,
            duration,
            schedule: RandomPwmSchedule::new(max_pwm, pwm_duration, seed),
            record: Record::default(),
        }
    }
}

impl Experiment for RandomPwm {
    fn name(&self) -> &str {
        "random_pwm"
    }

    fn framerate(&self) -> f64 {
        FRAMERATE_BENCH
    }

    fn setup(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()> {
        switch_mode(motors, &[self.id], OperatingMode::Position);
        reach(motors, clock, &[(self.id, 0.0)])?;
        switch_mode(motors, &[self.id], OperatingMode::Pwm);
        Ok(())
    }

    fn is_finished(&self, t_sum: f64) -> bool {
        t_sum >= self.duration
    }

    fn step(&mut self, motors: &mut MotorController, t: f64) -> Result<()> {
        let reading = motors.read_data(self.id, ReadSelection::ALL)?;
        self.record.push_reading(&reading, "");
        let position = reading.position.unwrap_or_default();
        if let Some(target) = self.schedule.update(t, position) {
            debug!("New PWM target {:.1}% at t={:.3}s", target, t);
            motors.set_pwm(self.id, target)?;
        }
        self.record.push("goal_pwm", self.schedule.target());
        Ok(())
    }

    fn teardown(&mut self, motors: &mut MotorController, _: &mut dyn Clock) -> Result<()> {
        motors.disable_torque(&[self.id]);
        Ok(())
    }

    fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog> {
        self.record.into_log(timestamps)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SteppedGoal {
    Pwm,
    Velocity { use_rpm: bool },
}

/// 1R motor held at each value of a [`StepSchedule`] in turn, in PWM or
/// velocity mode.
pub struct ConstantSteps {
    id: u8,
    goal: SteppedGoal,
    schedule: StepSchedule,
    applied: Option<usize>,
    record: Record,
}

impl ConstantSteps {
    /// PWM values in %.
    pub fn pwm(id: u8, values: Vec<f64>, step_duration: f64) -> Result<Self> {
        Self::new(id, SteppedGoal::Pwm, values, step_duration)
    }

    /// Velocities in rad/s, or rpm when `use_rpm` is set.
    pub fn velocity(id: u8, values: Vec<f64>, step_duration: f64, use_rpm: bool) -> Result<Self> {
        Self::new(id, SteppedGoal::Velocity { use_rpm }, values, step_duration)
    }

    fn new(id: u8, goal: SteppedGoal, values: Vec<f64>, step_duration: f64) -> Result<Self> {
        Ok(Self {
            id,
            goal,
            schedule: StepSchedule::new(values, step_duration)?,
            applied: None,
            record: Record::default(),
        })
    }

    fn goal_key(&self) -> &'static str {
        match self.goal {
            SteppedGoal::Pwm => "goal_pwm",
            SteppedGoal::Velocity { .. } => "goal_velocity",
        }
    }
}

impl Experiment for ConstantSteps {
    fn name(&self) -> &str {
        match self.goal {
            SteppedGoal::Pwm => "constant_pwm",
            SteppedGoal::Velocity { .. } => "constant_velocity",
        }
    }

    fn framerate(&self) -> f64 {
        FRAMERATE_BENCH
    }

    fn setup(&mut self, motors: &mut MotorController, _: &mut dyn Clock) -> Result<()> {
        let mode = match self.goal {
            SteppedGoal::Pwm => OperatingMode::Pwm,
            SteppedGoal::Velocity { .. } => OperatingMode::Velocity,
        };
        switch_mode(motors, &[self.id], mode);
        self.applied = None;
        Ok(())
    }

    fn is_finished(&self, t_sum: f64) -> bool {
        t_sum >= self.schedule.total_duration()
    }

    fn step(&mut self, motors: &mut MotorController, t: f64) -> Result<()> {
        let reading = motors.read_data(self.id, ReadSelection::VELOCITY_CURRENT)?;
        self.record.push_reading(&reading, "");

        let index = self.schedule.index_at(t);
        let value = self.schedule.values[index];
        if self.applied != Some(index) {
            info!("Step {}: {} = {}", index, self.goal_key(), value);
            match self.goal {
                SteppedGoal::Pwm => motors.set_pwm(self.id, value)?,
                SteppedGoal::Velocity { use_rpm } => motors.set_velocity(self.id, value, use_rpm)?,
            }
            self.applied = Some(index);
        }
        let key = self.goal_key();
        self.record.push(key, value);
        Ok(())
    }

    fn teardown(&mut self, motors: &mut MotorController, _: &mut dyn Clock) -> Result<()> {
        motors.disable_torque(&[self.id]);
        Ok(())
    }

    fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog> {
        self.record.into_log(timestamps)
    }
}

/// Applies the smallest current able to move the arm from rest and records
/// whether it does.
pub struct CurrentThreshold {
    id: u8,
    current: f64,
    duration: f64,
    record: Record,
}

impl CurrentThreshold {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            current: CURRENT_THRESHOLD_MA + 1e-5,
            duration: 1.0,
            record: Record::default(),
        }
    }
}

impl Experiment for CurrentThreshold {
    fn name(&self) -> &str {
        "current_threshold"
    }

    fn framerate(&self) -> f64 {
        FRAMERATE_BENCH
    }

    fn setup(&mut self, motors: &mut MotorController, _: &mut dyn Clock) -> Result<()> {
        switch_mode(motors, &[self.id], OperatingMode::Current);
        motors.set_current(self.id, self.current)
    }

    fn is_finished(&self, t_sum: f64) -> bool {
        t_sum >= self.duration
    }

    fn step(&mut self, motors: &mut MotorController, _: f64) -> Result<()> {
        let position = motors.get_position(self.id)?;
        self.record.push("read_position", position);
        Ok(())
    }

    fn teardown(&mut self, motors: &mut MotorController, _: &mut dyn Clock) -> Result<()> {
        motors.disable_torque(&[self.id]);
        Ok(())
    }

    fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog> {
        let goal = vec![self.current; timestamps.len()];
        let mut log = self.record.into_log(timestamps)?;
        log.insert("goal_current", goal)?;
        Ok(log)
    }
}

/// 2R arm playing a precomputed joint trajectory one sample per step.
pub struct ArmPositionTrajectory {
    name: &'static str,
    ids: [u8; 2],
    trajectory: Vec<[f64; 2]>,
    index: usize,
    record: Record,
}

impl ArmPositionTrajectory {
    pub fn new(name: &'static str, ids: [u8; 2], trajectory: Vec<[f64; 2]>) -> Result<Self> {
        if trajectory.len() < 2 {
            return Err(eyre!(
                "Trajectory '{}' needs at least 2 samples, got {}",
                name,
                trajectory.len()
            ));
        }
        Ok(Self {
            name,
            ids,
            trajectory,
            index: 0,
            record: Record::default(),
        })
    }

    /// Circle or line drawn by the end point, sampled at the bench rate.
    pub fn cartesian(
        ids: [u8; 2],
        arm: &ArmModel,
        kind: CartesianKind,
        duration: f64,
        period: f64,
    ) -> Result<Self> {
        let trajectory = motor_positions(arm, duration, period, kind, 1.0 / FRAMERATE_BENCH)?;
        let name = match kind {
            CartesianKind::Circle => "arm_circle",
            CartesianKind::Line => "arm_line",
        };
        Self::new(name, ids, trajectory)
    }

    /// Random smooth moves in joint space.
    pub fn random_articular(
        ids: [u8; 2],
        duration: f64,
        max_speed: f64,
        seed: Option<u64>,
    ) -> Result<Self> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let trajectory = random_2r_trajectory(duration, max_speed, 1.0 / FRAMERATE_BENCH, &mut rng)?;
        Self::new("arm_random_articular", ids, trajectory)
    }

    fn targets(&self, positions: [f64; 2]) -> [(u8, f64); 2] {
        [(self.ids[0], positions[0]), (self.ids[1], positions[1])]
    }
}

impl Experiment for ArmPositionTrajectory {
    fn name(&self) -> &str {
        self.name
    }

    fn framerate(&self) -> f64 {
        FRAMERATE_BENCH
    }

    fn setup(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()> {
        switch_mode(motors, &self.ids, OperatingMode::Position);
        self.index = 0;
        reach(motors, clock, &self.targets(self.trajectory[0]))
    }

    fn is_finished(&self, _: f64) -> bool {
        self.index + 1 >= self.trajectory.len()
    }

    fn step(&mut self, motors: &mut MotorController, _: f64) -> Result<()> {
        for (k, id) in self.ids.into_iter().enumerate() {
            let reading = motors.read_data(id, ReadSelection::POSITION_VELOCITY)?;
            self.record.push_reading(&reading, &format!("_{}", k + 1));
        }
        for (k, goal) in self.trajectory[self.index].into_iter().enumerate() {
            self.record.push(&format!("goal_position_{}", k + 1), goal);
        }

        self.index += 1;
        let next = self.trajectory[self.index];
        for (id, position) in self.targets(next) {
            motors.set_position(id, position)?;
        }
        Ok(())
    }

    fn teardown(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()> {
        let parked = reach(motors, clock, &self.targets([0.0, 0.0]));
        motors.disable_torque(&self.ids);
        parked
    }

    fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog> {
        self.record.into_log(timestamps)
    }
}

/// 1R arm in position mode following a random sum of sinusoids, clipped to
/// ±π/3.
pub struct RandomSinusPosition {
    id: u8,
    sum: SinusoidSum,
    duration: f64,
    record: Record,
}

impl RandomSinusPosition {
    pub const LIMIT: f64 = PI / 3.0;

    pub fn new(id: u8, components: usize, duration: f64, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            id,
            sum: SinusoidSum::random(components, &mut rng),
            duration,
            record: Record::default(),
        }
    }

    fn goal(&self, t: f64) -> f64 {
        self.sum.value(t).clamp(-Self::LIMIT, Self::LIMIT)
    }
}

impl Experiment for RandomSinusPosition {
    fn name(&self) -> &str {
        "random_sinus_position"
    }

    fn framerate(&self) -> f64 {
        FRAMERATE_BENCH
    }

    fn setup(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()> {
        switch_mode(motors, &[self.id], OperatingMode::Position);
        reach(motors, clock, &[(self.id, self.goal(0.0))])
    }

    fn is_finished(&self, t_sum: f64) -> bool {
        t_sum >= self.duration
    }

    fn step(&mut self, motors: &mut MotorController, t: f64) -> Result<()> {
        let reading = motors.read_data(self.id, ReadSelection::POSITION_VELOCITY)?;
        self.record.push_reading(&reading, "");
        let goal = self.goal(t);
        self.record.push("goal_position", goal);
        motors.set_position(self.id, goal)
    }

    fn teardown(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()> {
        let parked = reach(motors, clock, &[(self.id, 0.0)]);
        motors.disable_torque(&[self.id]);
        parked
    }

    fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog> {
        self.record.into_log(timestamps)
    }
}
