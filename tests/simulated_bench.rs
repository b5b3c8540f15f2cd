use servo_bench::analysis::{process_directory, ProcessParams, ProcessedLog};
use servo_bench::arm::ArmModel;
use servo_bench::bus::SimulatedBus;
use servo_bench::constants::{ADDR_TORQUE_ENABLE, FRAMERATE_BENCH};
use servo_bench::dataset::Logs;
use servo_bench::experiments::{ArmPositionTrajectory, RandomPwm};
use servo_bench::motor::MotorController;
use servo_bench::recording::{timestamped_name, ExperimentLog};
use servo_bench::runtime::{ControlLoop, Experiment, SteppingClock};
use servo_bench::trajectory::CartesianKind;

fn simulated(ids: &[u8]) -> (MotorController, SimulatedBus) {
    let bus = SimulatedBus::new(ids);
    (MotorController::new(Box::new(bus.clone()), ids.to_vec()), bus)
}

fn run(experiment: Box<dyn Experiment>, motors: &mut MotorController) -> ExperimentLog {
    let control = ControlLoop::new(experiment.framerate()).unwrap();
    let mut clock = SteppingClock::new(0.5 / experiment.framerate());
    control.run(experiment, motors, &mut clock).unwrap()
}

#[test]
fn circle_log_is_processed_into_torques() {
    let (mut motors, bus) = simulated(&[1, 2]);
    let arm = ArmModel::two_r();
    let experiment =
        ArmPositionTrajectory::cartesian([1, 2], &arm, CartesianKind::Circle, 1.5, 1.0).unwrap();
    let log = run(Box::new(experiment), &mut motors);
    assert!(log.run_id.is_some());
    assert_eq!(bus.register(1, ADDR_TORQUE_ENABLE, 1), Some(vec![0]));
    assert_eq!(bus.register(2, ADDR_TORQUE_ENABLE, 1), Some(vec![0]));

    let raw = tempfile::tempdir().unwrap();
    let processed = tempfile::tempdir().unwrap();
    let name = timestamped_name("R2_circle").unwrap();
    log.save(&raw.path().join(&name)).unwrap();

    let written = process_directory(
        raw.path(),
        processed.path(),
        &[],
        &arm,
        &ProcessParams::default(),
    )
    .unwrap();
    assert_eq!(written, vec![processed.path().join(format!("processed_{}", name))]);

    let result = ProcessedLog::load(&written[0]).unwrap();
    let samples = result.timestamps.len();
    assert!(samples as f64 > 1.4 * FRAMERATE_BENCH);
    for joint in ["r1", "r2"] {
        assert_eq!(result.torques[joint].len(), samples);
        assert!(result.torques[joint].iter().all(|tau| tau.is_finite()));
    }

    // A second pass finds nothing new to do.
    let again = process_directory(
        raw.path(),
        processed.path(),
        &[],
        &arm,
        &ProcessParams::default(),
    )
    .unwrap();
    assert!(again.is_empty());
}

#[test]
fn random_pwm_log_feeds_the_sampler() {
    let (mut motors, _) = simulated(&[2]);
    let log = run(Box::new(RandomPwm::new(2, 1.0, 0.1, 50.0, Some(3))), &mut motors);
    for key in ["read_position", "read_velocity", "read_current", "read_pwm", "goal_pwm"] {
        assert!(log.contains(key), "{}", key);
    }
    let goals = log.series("goal_pwm").unwrap();
    assert!(goals.iter().all(|g| g.abs() <= 50.0));
    assert!(goals.iter().any(|g| *g != 0.0));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("random_pwm.json");
    log.save(&path).unwrap();

    let mut logs = Logs::load(&[&path], Some(7)).unwrap();
    let (x, y) = logs.sample_batch(0.01, 5, 8).unwrap();
    assert_eq!(x.dim(), (8, 15));
    assert_eq!(y.dim(), (8, 2));
}
