use eyre::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::motor::{MotorController, OperatingMode, ReadSelection};
use crate::runtime::Clock;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ActuatorCommand {
    pub actuator_id: u8,
    /// rad
    pub position: Option<f64>,
    /// rad/s
    pub velocity: Option<f64>,
    /// mA
    pub current: Option<f64>,
    /// %
    pub pwm: Option<f64>,
}

impl ActuatorCommand {
    pub fn position(actuator_id: u8, position: f64) -> Self {
        Self {
            actuator_id,
            position: Some(position),
            ..Default::default()
        }
    }
}

pub struct ConfigureRequest {
    pub actuator_id: u8,
    pub mode: Option<OperatingMode>,
    pub torque_enabled: Option<bool>,
}

#[derive(Debug)]
pub struct ActionResult {
    pub actuator_id: u8,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct ActionResponse {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct ActuatorState {
    pub actuator_id: u8,
    pub position: Option<f64>,
    pub velocity: Option<f64>,
    pub current: Option<f64>,
    pub pwm: Option<f64>,
    pub online: bool,
}

fn lerp(start: Option<f64>, end: Option<f64>, t: f64) -> Option<f64> {
    match (start, end) {
        (Some(start), Some(end)) => Some(start * (1.0 - t) + end * t),
        (Some(start), None) => Some(start),
        (None, Some(end)) => Some(end),
        (None, None) => None,
    }
}

impl MotorController {
    pub fn command_actuators(&mut self, commands: &[ActuatorCommand]) -> Vec<ActionResult> {
        let mut results = vec![];
        for command in commands {
            let id = command.actuator_id;
            let result = (|| -> Result<()> {
                if let Some(position) = command.position {
                    self.set_position(id, position)?;
                }
                if let Some(velocity) = command.velocity {
                    self.set_velocity(id, velocity, false)?;
                }
                if let Some(current) = command.current {
                    self.set_current(id, current)?;
                }
                if let Some(pwm) = command.pwm {
                    self.set_pwm(id, pwm)?;
                }
                Ok(())
            })();

            results.push(ActionResult {
                actuator_id: id,
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });
        }
        results
    }

    /// Interpolates linearly from `start_commands` to `end_commands` in
    /// `num_steps` commands spread over `total_delay`.
    pub fn command_actuators_slowed(
        &mut self,
        clock: &mut dyn Clock,
        start_commands: &[ActuatorCommand],
        end_commands: &[ActuatorCommand],
        total_delay: Duration,
        num_steps: usize,
    ) -> Result<Vec<ActionResult>> {
        if total_delay.is_zero() {
            return Err(eyre::eyre!("Total delay must be greater than zero"));
        }
        if num_steps == 0 {
            return Err(eyre::eyre!("Number of steps must be greater than zero"));
        }

        let start_command_map: BTreeMap<u8, &ActuatorCommand> = start_commands
            .iter()
            .map(|cmd| (cmd.actuator_id, cmd))
            .collect();
        let end_command_map: BTreeMap<u8, &ActuatorCommand> = end_commands
            .iter()
            .map(|cmd| (cmd.actuator_id, cmd))
            .collect();

        if start_command_map.keys().collect::<BTreeSet<_>>()
            != end_command_map.keys().collect::<BTreeSet<_>>()
        {
            return Err(eyre::eyre!(
                "Start and end commands must have the same actuator IDs"
            ));
        }

        let step_delay = total_delay.as_secs_f64() / num_steps as f64;
        let mut final_results = vec![];
        let mut next_loop_time = clock.now();

        for step in 0..num_steps {
            let t = if num_steps == 1 {
                1.0
            } else {
                step as f64 / (num_steps - 1) as f64
            };

            let interpolated_commands: Vec<ActuatorCommand> = start_command_map
                .iter()
                .map(|(&actuator_id, start)| {
                    let end = end_command_map.get(&actuator_id);
                    ActuatorCommand {
                        actuator_id,
                        position: lerp(start.position, end.and_then(|c| c.position), t),
                        velocity: lerp(start.velocity, end.and_then(|c| c.velocity), t),
                        current: lerp(start.current, end.and_then(|c| c.current), t),
                        pwm: lerp(start.pwm, end.and_then(|c| c.pwm), t),
                    }
                })
                .collect();

            tracing::trace!("Commands (slowed): {:?}", interpolated_commands);

            let results = self.command_actuators(&interpolated_commands);
            if step == num_steps - 1 {
                final_results = results;
            }

            next_loop_time += step_delay;
            let remaining = next_loop_time - clock.now();
            if remaining > 0.0 {
                clock.sleep(Duration::from_secs_f64(remaining));
            }
        }

        Ok(final_results)
    }

    /// Reads the present positions and eases every motor to `targets`.
    pub fn move_to(
        &mut self,
        clock: &mut dyn Clock,
        targets: &[ActuatorCommand],
        total_delay: Duration,
        num_steps: usize,
    ) -> Result<Vec<ActionResult>> {
        let mut start = Vec::with_capacity(targets.len());
        for target in targets {
            let reading = self.read_data(
                target.actuator_id,
                ReadSelection {
                    position: true,
                    velocity: false,
                    current: false,
                    pwm: false,
                },
            )?;
            start.push(ActuatorCommand {
                actuator_id: target.actuator_id,
                position: reading.position,
                ..Default::default()
            });
        }
        self.command_actuators_slowed(clock, &start, targets, total_delay, num_steps)
    }

    /// Mode changes need torque off, so torque is dropped first and restored
    /// afterwards when requested.
    pub fn configure_actuator(&mut self, config: ConfigureRequest) -> ActionResponse {
        let id = config.actuator_id;
        if let Some(mode) = config.mode {
            self.disable_torque(&[id]);
            self.set_control_mode(&[id], mode);
        }

        match config.torque_enabled {
            Some(true) => self.enable_torque(&[id]),
            Some(false) => self.disable_torque(&[id]),
            None => {}
        }

        match self.ping(id) {
            Ok(true) => ActionResponse {
                success: true,
                error: None,
            },
            Ok(false) => ActionResponse {
                success: false,
                error: Some(format!("Motor {} did not answer", id)),
            },
            Err(e) => ActionResponse {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn get_actuators_state(&mut self, actuator_ids: &[u8]) -> Vec<ActuatorState> {
        let mut responses = vec![];
        for &id in actuator_ids {
            match self.read_data(id, ReadSelection::ALL) {
                Ok(reading) => responses.push(ActuatorState {
                    actuator_id: id,
                    position: reading.position,
                    velocity: reading.velocity,
                    current: reading.current,
                    pwm: reading.pwm,
                    online: true,
                }),
                Err(e) => {
                    tracing::warn!("Motor {} offline: {}", id, e);
                    responses.push(ActuatorState {
                        actuator_id: id,
                        position: None,
                        velocity: None,
                        current: None,
                        pwm: None,
                        online: false,
                    });
                }
            }
        }
        responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimulatedBus;
    use crate::constants::*;
    use crate::motor::radians_to_ticks;
    use crate::runtime::SteppingClock;

    fn controller(ids: &[u8]) -> (MotorController, SimulatedBus) {
        let bus = SimulatedBus::new(ids);
        (MotorController::new(Box::new(bus.clone()), ids.to_vec()), bus)
    }

    #[test]
    fn slowed_commands_end_on_target() {
        let (mut motors, bus) = controller(&[1, 2]);
        motors.enable_torque_all();
        let mut clock = SteppingClock::new(0.001);

        let start = [ActuatorCommand::position(1, 0.0), ActuatorCommand::position(2, 0.0)];
        let end = [ActuatorCommand::position(1, 1.0), ActuatorCommand::position(2, -1.0)];
        let results = motors
            .command_actuators_slowed(&mut clock, &start, &end, Duration::from_secs(1), 10)
            .unwrap();

        assert!(results.iter().all(|r| r.success));
        assert!(clock.now() >= 1.0);
        assert_eq!(
            bus.register(2, ADDR_GOAL_POSITION, 4).unwrap(),
            radians_to_ticks(-1.0).to_le_bytes().to_vec()
        );
        let goal_writes = bus
            .writes()
            .iter()
            .filter(|(id, addr, _)| *id == 1 && *addr == ADDR_GOAL_POSITION)
            .count();
        assert_eq!(goal_writes, 10);
    }

    #[test]
    fn slowed_commands_reject_mismatched_ids() {
        let (mut motors, _bus) = controller(&[1, 2]);
        let mut clock = SteppingClock::new(0.001);
        let start = [ActuatorCommand::position(1, 0.0)];
        let end = [ActuatorCommand::position(2, 0.0)];
        assert!(motors
            .command_actuators_slowed(&mut clock, &start, &end, Duration::from_secs(1), 5)
            .is_err());
        assert!(motors
            .command_actuators_slowed(&mut clock, &start, &start, Duration::ZERO, 5)
            .is_err());
    }

    #[test]
    fn configure_switches_mode_and_torque() {
        let (mut motors, bus) = controller(&[3]);
        let response = motors.configure_actuator(ConfigureRequest {
            actuator_id: 3,
            mode: Some(OperatingMode::Current),
            torque_enabled: Some(true),
        });
        assert!(response.success);
        assert_eq!(bus.register(3, ADDR_OPERATING_MODE, 1).unwrap(), vec![0]);
        assert_eq!(bus.register(3, ADDR_TORQUE_ENABLE, 1).unwrap(), vec![1]);
    }

    #[test]
    fn unknown_motors_are_reported_offline() {
        let (mut motors, _bus) = controller(&[1]);
        motors.set_max_retries(0);
        let states = motors.get_actuators_state(&[1, 5]);
        assert!(states[0].online);
        assert!(!states[1].online);
        assert!(states[1].position.is_none());
    }

    #[test]
    fn failed_commands_carry_their_error() {
        let (mut motors, _bus) = controller(&[1]);
        let results = motors.command_actuators(&[ActuatorCommand::position(9, 0.3)]);
        assert!(!results[0].success);
        assert!(results[0].error.is_some());
    }
}
