use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::{DynamixelBus, MotorBus};
use crate::constants::*;

const SERIAL_TIMEOUT: Duration = Duration::from_millis(10);
const RPM_TO_RAD_S: f64 = 2.0 * PI / 60.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Current,
    Velocity,
    Position,
    ExtendedPosition,
    CurrentBasedPosition,
    Pwm,
}

impl OperatingMode {
    pub fn register_value(self) -> u8 {
        match self {
            OperatingMode::Current => 0,
            OperatingMode::Velocity => 1,
            OperatingMode::Position => 3,
            OperatingMode::ExtendedPosition => 4,
            OperatingMode::CurrentBasedPosition => 5,
            OperatingMode::Pwm => 16,
        }
    }
}

/// Which signals `read_data` fetches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadSelection {
    pub position: bool,
    pub velocity: bool,
    pub current: bool,
    pub pwm: bool,
}

impl ReadSelection {
    pub const ALL: ReadSelection = ReadSelection {
        position: true,
        velocity: true,
        current: true,
        pwm: true,
    };
    pub const POSITION_VELOCITY: ReadSelection = ReadSelection {
        position: true,
        velocity: true,
        current: false,
        pwm: false,
    };
    pub const POSITION_VELOCITY_CURRENT: ReadSelection = ReadSelection {
        position: true,
        velocity: true,
        current: true,
        pwm: false,
    };
    pub const VELOCITY_CURRENT: ReadSelection = ReadSelection {
        position: false,
        velocity: true,
        current: true,
        pwm: false,
    };
}

/// Signals read from one motor, in SI-ish units (rad, rad/s, mA, %).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotorReading {
    pub position: Option<f64>,
    pub velocity: Option<f64>,
    pub current: Option<f64>,
    pub pwm: Option<f64>,
}

pub fn radians_to_ticks(position: f64) -> u32 {
    let index = (position * (DXL_MAXIMUM_POSITION_VALUE + 1) as f64 / (2.0 * PI)).round() as i64
        + DXL_ZERO_POSITION_VALUE;
    index.clamp(DXL_MINIMUM_POSITION_VALUE, DXL_MAXIMUM_POSITION_VALUE) as u32
}

pub fn ticks_to_radians(ticks: u32) -> f64 {
    ticks as f64 * 2.0 * PI / (DXL_MAXIMUM_POSITION_VALUE + 1) as f64 - PI
}

fn le_u32(data: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| eyre!("Expected 4 bytes, got {}", data.len()))?;
    Ok(u32::from_le_bytes(bytes))
}

fn le_i16(data: &[u8]) -> Result<i16> {
    let bytes: [u8; 2] = data
        .try_into()
        .map_err(|_| eyre!("Expected 2 bytes, got {}", data.len()))?;
    Ok(i16::from_le_bytes(bytes))
}

/// Owns the bus and the list of configured motors.
pub struct MotorController {
    bus: Box<dyn MotorBus>,
    ids: Vec<u8>,
    max_retries: usize,
}

impl MotorController {
    pub fn new(bus: Box<dyn MotorBus>, ids: Vec<u8>) -> Self {
        Self {
            bus,
            ids,
            max_retries: DEFAULT_READ_RETRIES,
        }
    }

    /// Opens a serial port and talks protocol 2.0 on it.
    pub fn init_connection(port: &str, baudrate: u32, ids: Vec<u8>) -> Result<Self> {
        let bus = DynamixelBus::new(port, baudrate, SERIAL_TIMEOUT)?;
        info!("Connected to {} at {} baud, motors {:?}", port, baudrate, ids);
        Ok(Self::new(Box::new(bus), ids))
    }

    pub fn close_connection(self) {
        info!("Closing connection on {}", self.bus.port());
    }

    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    pub fn set_max_retries(&mut self, max_retries: usize) {
        self.max_retries = max_retries;
    }

    pub fn ping(&mut self, id: u8) -> Result<bool> {
        self.bus.ping(id)
    }

    fn write_each(&mut self, ids: &[u8], addr: u8, data: &[u8], what: &str) {
        for &id in ids {
            match self.bus.write(id, addr, data) {
                Ok(()) => debug!("Motor {}: {} ok", id, what),
                Err(e) => warn!("Motor {}: {} failed: {}", id, what, e),
            }
        }
    }

    /// Failures on one motor are logged and the batch carries on.
    pub fn enable_torque(&mut self, ids: &[u8]) {
        self.write_each(ids, ADDR_TORQUE_ENABLE, &[1], "torque enable");
    }

    pub fn disable_torque(&mut self, ids: &[u8]) {
        self.write_each(ids, ADDR_TORQUE_ENABLE, &[0], "torque disable");
    }

    /// The operating mode register only accepts writes while torque is off.
    pub fn set_control_mode(&mut self, ids: &[u8], mode: OperatingMode) {
        self.write_each(
            ids,
            ADDR_OPERATING_MODE,
            &[mode.register_value()],
            &format!("operating mode {:?}", mode),
        );
    }

    pub fn enable_torque_all(&mut self) {
        let ids = self.ids.clone();
        self.enable_torque(&ids);
    }

    pub fn disable_torque_all(&mut self) {
        let ids = self.ids.clone();
        self.disable_torque(&ids);
    }

    pub fn set_control_mode_all(&mut self, mode: OperatingMode) {
        let ids = self.ids.clone();
        self.set_control_mode(&ids, mode);
    }

    pub fn set_position(&mut self, id: u8, position: f64) -> Result<()> {
        let ticks = radians_to_ticks(position);
        self.bus.write(id, ADDR_GOAL_POSITION, &ticks.to_le_bytes())
    }

    pub fn get_position(&mut self, id: u8) -> Result<f64> {
        let data = self.bus.read(id, ADDR_PRESENT_POSITION, 4)?;
        Ok(ticks_to_radians(le_u32(&data)?))
    }

    /// Velocity in rad/s, or in rpm when `use_rpm` is set.
    pub fn set_velocity(&mut self, id: u8, velocity: f64, use_rpm: bool) -> Result<()> {
        let rpm = if use_rpm {
            velocity
        } else {
            velocity / RPM_TO_RAD_S
        };
        let units = (rpm / VELOCITY_UNIT_RPM).round() as i32;
        self.bus.write(id, ADDR_GOAL_VELOCITY, &units.to_le_bytes())
    }

    pub fn get_velocity(&mut self, id: u8) -> Result<f64> {
        let data = self.bus.read(id, ADDR_PRESENT_VELOCITY, 4)?;
        let units = le_u32(&data)? as i32;
        Ok(units as f64 * VELOCITY_UNIT_RPM * RPM_TO_RAD_S)
    }

    pub fn set_current(&mut self, id: u8, current_ma: f64) -> Result<()> {
        let units = (current_ma / CURRENT_UNIT_MA).round() as i16;
        self.bus.write(id, ADDR_GOAL_CURRENT, &units.to_le_bytes())
    }

    pub fn get_current(&mut self, id: u8) -> Result<f64> {
        let data = self.bus.read(id, ADDR_PRESENT_CURRENT, 2)?;
        Ok(le_i16(&data)? as f64 * CURRENT_UNIT_MA)
    }

    pub fn set_pwm(&mut self, id: u8, pwm_percent: f64) -> Result<()> {
        let units = (pwm_percent / PWM_UNIT_PERCENT).round() as i16;
        self.bus.write(id, ADDR_GOAL_PWM, &units.to_le_bytes())
    }

    pub fn get_pwm(&mut self, id: u8) -> Result<f64> {
        let data = self.bus.read(id, ADDR_PRESENT_PWM, 2)?;
        Ok(le_i16(&data)? as f64 * PWM_UNIT_PERCENT)
    }

    pub fn set_return_status(&mut self, level: u8) {
        let ids = self.ids.clone();
        self.write_each(&ids, ADDR_STATUS_RETURN_LEVEL, &[level], "status return level");
    }

    /// One unit is 2 us.
    pub fn set_return_delay_time(&mut self, units: u8) {
        let ids = self.ids.clone();
        self.write_each(&ids, ADDR_RETURN_DELAY_TIME, &[units], "return delay time");
    }

    pub fn set_moving_threshold(&mut self, value: u32) {
        let ids = self.ids.clone();
        self.write_each(
            &ids,
            ADDR_MOVING_THRESHOLD,
            &value.to_le_bytes(),
            "moving threshold",
        );
    }

    /// Pings every configured motor `samples` times and returns the mean
    /// round trip.
    pub fn check_latency(&mut self, samples: usize) -> Result<Duration> {
        if samples == 0 || self.ids.is_empty() {
            return Err(eyre!("Latency check needs at least one motor and one sample"));
        }

        let ids = self.ids.clone();
        let mut total = Duration::ZERO;
        for &id in &ids {
            for _ in 0..samples {
                let start = Instant::now();
                let found = self.bus.ping(id)?;
                total += start.elapsed();
                if !found {
                    return Err(eyre!("Motor {} did not answer ping", id));
                }
            }
        }

        let mean = total / (samples * ids.len()) as u32;
        info!("Mean ping round trip over {} motors: {:?}", ids.len(), mean);
        Ok(mean)
    }

    fn retry<F>(&mut self, id: u8, what: &str, mut read: F) -> Result<f64>
    where
        F: FnMut(&mut Self) -> Result<f64>,
    {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match read(self) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!("Motor {}: {} read attempt {} failed: {}", id, what, attempt, e);
                    last_error = Some(e);
                }
            }
        }
        let error = last_error.unwrap_or_else(|| eyre!("no read attempted"));
        Err(error).wrap_err(format!(
            "Motor {}: {} read failed after {} retries",
            id, what, self.max_retries
        ))
    }

    /// Reads the selected signals, retrying each failed read up to
    /// `max_retries` times.
    pub fn read_data(&mut self, id: u8, selection: ReadSelection) -> Result<MotorReading> {
        let mut reading = MotorReading::default();
        if selection.position {
            reading.position = Some(self.retry(id, "position", |m| m.get_position(id))?);
        }
        if selection.velocity {
            reading.velocity = Some(self.retry(id, "velocity", |m| m.get_velocity(id))?);
        }
        if selection.current {
            reading.current = Some(self.retry(id, "current", |m| m.get_current(id))?);
        }
        if selection.pwm {
            reading.pwm = Some(self.retry(id, "pwm", |m| m.get_pwm(id))?);
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimulatedBus;
    use approx::assert_relative_eq;

    fn controller(ids: &[u8]) -> (MotorController, SimulatedBus) {
        let bus = SimulatedBus::new(ids);
        (MotorController::new(Box::new(bus.clone()), ids.to_vec()), bus)
    }

    #[test]
    fn position_conversion_clamps_to_range() {
        assert_eq!(radians_to_ticks(0.0), 2048);
        assert_eq!(radians_to_ticks(PI / 2.0), 3072);
        assert_eq!(radians_to_ticks(10.0), 4095);
        assert_eq!(radians_to_ticks(-10.0), 0);
        assert_relative_eq!(ticks_to_radians(2048), 0.0);
        assert_relative_eq!(ticks_to_radians(0), -PI);
    }

    #[test]
    fn commanded_position_reads_back_with_torque_on() {
        let (mut motors, _bus) = controller(&[1]);
        motors.enable_torque(&[1]);
        motors.set_position(1, 0.5).unwrap();
        let read = motors.get_position(1).unwrap();
        assert!((read - 0.5).abs() < 2.0 * PI / 4096.0);
    }

    #[test]
    fn signed_registers_decode_negative_values() {
        let (mut motors, bus) = controller(&[1]);
        bus.poke(1, ADDR_PRESENT_CURRENT, &(-5i16).to_le_bytes())
            .unwrap();
        bus.poke(1, ADDR_PRESENT_VELOCITY, &(-10i32).to_le_bytes())
            .unwrap();
        bus.poke(1, ADDR_PRESENT_PWM, &(885i16).to_le_bytes()).unwrap();

        assert_relative_eq!(motors.get_current(1).unwrap(), -16.8, epsilon = 1e-9);
        assert_relative_eq!(
            motors.get_velocity(1).unwrap(),
            -2.29 * RPM_TO_RAD_S,
            epsilon = 1e-9
        );
        assert_relative_eq!(motors.get_pwm(1).unwrap(), 100.005, epsilon = 1e-9);
    }

    #[test]
    fn threshold_current_rounds_to_five_units() {
        let (mut motors, bus) = controller(&[1]);
        motors.set_current(1, CURRENT_THRESHOLD_MA + 1e-5).unwrap();
        assert_eq!(
            bus.register(1, ADDR_GOAL_CURRENT, 2).unwrap(),
            5i16.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn control_mode_is_written_per_motor() {
        let (mut motors, bus) = controller(&[1, 2]);
        motors.set_control_mode_all(OperatingMode::Pwm);
        assert_eq!(bus.register(1, ADDR_OPERATING_MODE, 1).unwrap(), vec![16]);
        assert_eq!(bus.register(2, ADDR_OPERATING_MODE, 1).unwrap(), vec![16]);
    }

    #[test]
    fn torque_batch_survives_missing_motor() {
        let (mut motors, bus) = controller(&[1, 2]);
        motors.enable_torque(&[7, 2]);
        assert_eq!(bus.register(2, ADDR_TORQUE_ENABLE, 1).unwrap(), vec![1]);
    }

    #[test]
    fn read_data_retries_transient_failures() {
        let (mut motors, bus) = controller(&[1]);
        bus.fail_next_reads(3);
        let reading = motors.read_data(1, ReadSelection::ALL).unwrap();
        assert_relative_eq!(reading.position.unwrap(), 0.0);
        assert!(reading.pwm.is_some());
    }

    #[test]
    fn read_data_gives_up_after_max_retries() {
        let (mut motors, bus) = controller(&[1]);
        motors.set_max_retries(2);
        bus.fail_next_reads(3);
        assert!(motors.read_data(1, ReadSelection::POSITION_VELOCITY).is_err());
    }

    #[test]
    fn read_data_skips_unselected_signals() {
        let (mut motors, _bus) = controller(&[1]);
        let reading = motors.read_data(1, ReadSelection::VELOCITY_CURRENT).unwrap();
        assert!(reading.position.is_none());
        assert!(reading.velocity.is_some());
        assert!(reading.current.is_some());
        assert!(reading.pwm.is_none());
    }

    #[test]
    fn latency_check_requires_answering_motors() {
        let (mut motors, _bus) = controller(&[1, 2]);
        assert!(motors.check_latency(3).is_ok());

        let bus = SimulatedBus::new(&[1]);
        let mut missing = MotorController::new(Box::new(bus), vec![1, 4]);
        assert!(missing.check_latency(1).is_err());
    }
}
