use ::std::sync::atomic::{AtomicBool, Ordering};
use ::std::sync::Arc;
use ::std::time::{Duration, Instant};
use eyre::{eyre, Result};
use thread_priority::{set_current_thread_priority, ThreadPriority};
use tracing::{debug, info, warn};

use crate::motor::MotorController;
use crate::recording::ExperimentLog;

/// Time source for the control loop, in seconds.
pub trait Clock: Send {
    fn now(&mut self) -> f64;
    fn sleep(&mut self, duration: Duration);
}

/// Monotonic wall clock.
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&mut self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock advancing by a fixed tick on every read.
#[derive(Clone, Debug)]
pub struct SteppingClock {
    ticks: u64,
    offset: f64,
    tick: f64,
}

impl SteppingClock {
    pub fn new(tick: f64) -> Self {
        Self {
            ticks: 0,
            offset: 0.0,
            tick,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&mut self) -> f64 {
        let now = self.offset + self.ticks as f64 * self.tick;
        self.ticks += 1;
        now
    }

    fn sleep(&mut self, duration: Duration) {
        self.offset += duration.as_secs_f64();
    }
}

/// One bench procedure: setup, a fixed-rate loop of steps, then teardown.
pub trait Experiment: Send {
    fn name(&self) -> &str;

    fn framerate(&self) -> f64;

    fn setup(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()>;

    /// Checked before every step with the time reached so far.
    fn is_finished(&self, t_sum: f64) -> bool;

    /// Reads the sensors, then commands the motors for time `t`.
    fn step(&mut self, motors: &mut MotorController, t: f64) -> Result<()>;

    fn teardown(&mut self, motors: &mut MotorController, clock: &mut dyn Clock) -> Result<()>;

    /// Builds the log from the recorded series and the loop timestamps.
    fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog>;
}

/// Requests the highest scheduling priority for the calling thread.
pub fn raise_thread_priority() {
    match set_current_thread_priority(ThreadPriority::Max) {
        Ok(()) => debug!("Control thread priority raised"),
        Err(e) => warn!("Could not raise control thread priority: {:?}", e),
    }
}

/// Best-effort fixed framerate loop driven by busy-waiting.
pub struct ControlLoop {
    framerate: f64,
    running: Arc<AtomicBool>,
}

impl ControlLoop {
    pub fn new(framerate: f64) -> Result<Self> {
        if !(framerate > 0.0) {
            return Err(eyre!("Framerate must be positive, got {}", framerate));
        }
        Ok(Self {
            framerate,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn framerate(&self) -> f64 {
        self.framerate
    }

    /// Shared flag, set from construction. Clearing it stops the loop at the
    /// next iteration, or skips the loop if `run` has not reached it yet.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stop(&self) {
        info!("Stopping control loop");
        self.running.store(false, Ordering::Relaxed);
    }

    /// Runs the loop until the experiment is done or the running flag is
    /// cleared, and returns the timestamps of every step.
    ///
    /// `t_sum` starts one period in the past so the first step lands at
    /// roughly zero.
    pub fn run_loop(
        &self,
        experiment: &mut dyn Experiment,
        motors: &mut MotorController,
        clock: &mut dyn Clock,
    ) -> Result<Vec<f64>> {
        let period = 1.0 / self.framerate;
        let mut timestamps = vec![];
        let mut t_sum = -period;
        let mut t0 = clock.now();

        while self.running.load(Ordering::Relaxed) && !experiment.is_finished(t_sum) {
            let elapsed = clock.now() - t0;
            if elapsed < period {
                continue;
            }

            t_sum += elapsed;
            experiment.step(motors, t_sum)?;
            timestamps.push(t_sum);
            t0 += elapsed;
        }

        if !self.running.load(Ordering::Relaxed) {
            info!("Control loop interrupted at t={:.3}s", t_sum);
        }
        Ok(timestamps)
    }

    /// Setup, loop and teardown of one experiment. Teardown runs even when
    /// setup or a step fails so torque is always released.
    pub fn run(
        &self,
        mut experiment: Box<dyn Experiment>,
        motors: &mut MotorController,
        clock: &mut dyn Clock,
    ) -> Result<ExperimentLog> {
        let run_id = uuid::Uuid::new_v4();
        info!(
            "runtime::experiment::START name={} framerate={} uuid={}",
            experiment.name(),
            self.framerate,
            run_id
        );

        if let Err(e) = experiment.setup(motors, clock) {
            self.running.store(false, Ordering::Relaxed);
            if let Err(teardown) = experiment.teardown(motors, clock) {
                warn!("Teardown after failed setup: {}", teardown);
            }
            return Err(e.wrap_err(format!("setting up {}", experiment.name())));
        }
        let looped = self.run_loop(experiment.as_mut(), motors, clock);
        let torn_down = experiment.teardown(motors, clock);
        self.running.store(false, Ordering::Relaxed);

        let timestamps = looped?;
        torn_down?;

        if let Some(jitter) = crate::signal::timestamp_jitter(&timestamps, self.framerate) {
            info!(
                "{} steps, mean period {:.6}s (goal {:.6}s), max {:.6}s",
                timestamps.len(),
                jitter.mean,
                jitter.goal,
                jitter.max
            );
        }

        let mut log = experiment.into_log(timestamps)?;
        log.run_id = Some(run_id.to_string());
        info!("runtime::experiment::END uuid={}", run_id);
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimulatedBus;
    use crate::constants::ADDR_TORQUE_ENABLE;

    struct Counter {
        steps: Vec<f64>,
        duration: f64,
        fail_setup: bool,
        fail_at: Option<usize>,
    }

    fn counter(duration: f64, fail_at: Option<usize>) -> Counter {
        Counter {
            steps: vec![],
            duration,
            fail_setup: false,
            fail_at,
        }
    }

    impl Experiment for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn framerate(&self) -> f64 {
            100.0
        }

        fn setup(&mut self, motors: &mut MotorController, _: &mut dyn Clock) -> Result<()> {
            motors.enable_torque(&[1]);
            if self.fail_setup {
                return Err(eyre!("setup failed"));
            }
            Ok(())
        }

        fn is_finished(&self, t_sum: f64) -> bool {
            t_sum >= self.duration
        }

        fn step(&mut self, _: &mut MotorController, t: f64) -> Result<()> {
            if Some(self.steps.len()) == self.fail_at {
                return Err(eyre!("boom"));
            }
            self.steps.push(t);
            Ok(())
        }

        fn teardown(&mut self, motors: &mut MotorController, _: &mut dyn Clock) -> Result<()> {
            motors.disable_torque(&[1]);
            Ok(())
        }

        fn into_log(self: Box<Self>, timestamps: Vec<f64>) -> Result<ExperimentLog> {
            let mut log = ExperimentLog::new(timestamps);
            log.insert("t", self.steps)?;
            Ok(log)
        }
    }

    fn motors() -> (MotorController, SimulatedBus) {
        let bus = SimulatedBus::new(&[1]);
        (MotorController::new(Box::new(bus.clone()), vec![1]), bus)
    }

    fn torque(bus: &SimulatedBus) -> Option<Vec<u8>> {
        bus.register(1, ADDR_TORQUE_ENABLE, 1)
    }

    #[test]
    fn stepping_clock_is_monotonic() {
        let mut clock = SteppingClock::new(0.5);
        assert_eq!(clock.now(), 0.0);
        assert_eq!(clock.now(), 0.5);
        clock.sleep(Duration::from_secs(2));
        assert_eq!(clock.now(), 3.0);
    }

    #[test]
    fn loop_paces_steps_at_framerate() {
        let control = ControlLoop::new(100.0).unwrap();
        // 3 ms ticks: a 10 ms period is only reached after 4 ticks.
        let mut clock = SteppingClock::new(0.003);
        let log = control
            .run(Box::new(counter(1.0, None)), &mut motors().0, &mut clock)
            .unwrap();

        let timestamps = &log.timestamps;
        assert_eq!(timestamps.len(), 85);
        assert!((timestamps[0] - 0.002).abs() < 1e-9);
        for pair in timestamps.windows(2) {
            let dt = pair[1] - pair[0];
            assert!((dt - 0.012).abs() < 1e-9, "{}", dt);
        }
        assert_eq!(log.series("t").unwrap(), timestamps.as_slice());
        assert!(log.run_id.is_some());
    }

    #[test]
    fn cleared_flag_stops_before_first_step() {
        let control = ControlLoop::new(50.0).unwrap();
        let mut experiment = counter(10.0, None);
        control.stop();
        let mut clock = SteppingClock::new(0.001);
        let timestamps = control
            .run_loop(&mut experiment, &mut motors().0, &mut clock)
            .unwrap();
        assert!(timestamps.is_empty());
    }

    #[test]
    fn stop_before_run_is_kept() {
        let control = ControlLoop::new(100.0).unwrap();
        control.running_flag().store(false, Ordering::Relaxed);
        let (mut motors, bus) = motors();
        let mut clock = SteppingClock::new(0.001);
        let log = control
            .run(Box::new(counter(10.0, None)), &mut motors, &mut clock)
            .unwrap();
        assert!(log.is_empty());
        assert_eq!(torque(&bus), Some(vec![0]));
    }

    #[test]
    fn failing_step_still_tears_down() {
        let control = ControlLoop::new(100.0).unwrap();
        let (mut motors, bus) = motors();
        let mut clock = SteppingClock::new(0.001);
        let err = control
            .run(Box::new(counter(1.0, Some(3))), &mut motors, &mut clock)
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(torque(&bus), Some(vec![0]));
    }

    #[test]
    fn failing_setup_still_tears_down() {
        let control = ControlLoop::new(100.0).unwrap();
        let (mut motors, bus) = motors();
        let mut clock = SteppingClock::new(0.001);
        let experiment = Counter {
            fail_setup: true,
            ..counter(1.0, None)
        };
        let err = control
            .run(Box::new(experiment), &mut motors, &mut clock)
            .unwrap_err();
        assert!(err.chain().any(|cause| cause.to_string() == "setup failed"));
        assert_eq!(torque(&bus), Some(vec![0]));
    }

    #[test]
    fn rejects_non_positive_framerate() {
        assert!(ControlLoop::new(0.0).is_err());
        assert!(ControlLoop::new(-3.0).is_err());
    }
}
