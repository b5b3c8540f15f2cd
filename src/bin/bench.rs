use ::clap::{Parser, Subcommand, ValueEnum};
use ::eyre::{eyre, Result, WrapErr};
use ::std::path::PathBuf;
use tracing::{info, warn};

use servo_bench::arm::ArmModel;
use servo_bench::bus::SimulatedBus;
use servo_bench::constants::*;
use servo_bench::experiments::{
    AmplitudeSinus, ArmPositionTrajectory, ConstantSteps, CurrentFeedforwardSinus,
    CurrentThreshold, PositionSinus, RandomPwm, RandomSinusPosition,
};
use servo_bench::motor::MotorController;
use servo_bench::recording::{timestamped_name, ExperimentLog};
use servo_bench::runtime::{raise_thread_priority, ControlLoop, Experiment, WallClock};
use servo_bench::trajectory::{CartesianKind, SinusProfile};
use servo_bench::{initialize_file_and_console_logging, initialize_logging};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port of the motor chain
    #[arg(long, default_value = DEFAULT_PORT)]
    port: String,
    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    baudrate: u32,
    /// Motors to configure, comma separated
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_MOTOR_IDS.to_vec())]
    ids: Vec<u8>,
    /// Directory receiving the experiment logs
    #[arg(long, default_value = "logs")]
    output_dir: PathBuf,
    /// Run against simulated motors instead of the serial bus
    #[arg(long)]
    simulate: bool,
    /// Also log to a daily file in the output directory
    #[arg(long)]
    file_logging: bool,
    #[command(subcommand)]
    experiment: ExperimentCommand,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Profile {
    Offset,
    Centered,
    Chirp,
}

impl From<Profile> for SinusProfile {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Offset => SinusProfile::Offset,
            Profile::Centered => SinusProfile::Centered,
            Profile::Chirp => SinusProfile::Chirp,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Shape {
    Circle,
    Line,
}

#[derive(Subcommand, Debug)]
enum ExperimentCommand {
    /// 1R arm following a sinus in position mode
    PositionSinus {
        #[arg(long, default_value_t = 2)]
        id: u8,
        #[arg(long, value_enum, default_value_t = Profile::Centered)]
        profile: Profile,
        #[arg(long, default_value_t = 20.0)]
        duration: f64,
    },
    /// 1R arm driven by a current sinus (horizontal bench only)
    CurrentSinus {
        #[arg(long, default_value_t = 2)]
        id: u8,
        /// mA
        #[arg(long, default_value_t = 200.0)]
        max_current: f64,
        /// rad/s
        #[arg(long, default_value_t = 3.0)]
        omega: f64,
        #[arg(long, default_value_t = 20.0)]
        duration: f64,
    },
    /// 1R arm tracking the offset sinus with feedforward current
    CurrentFeedforward {
        #[arg(long, default_value_t = 2)]
        id: u8,
        #[arg(long, default_value_t = 8.0)]
        duration: f64,
        /// Arm model JSON, the 1R bench by default
        #[arg(long)]
        arm: Option<PathBuf>,
    },
    /// 1R arm driven by a PWM sinus (horizontal bench only)
    PwmSinus {
        #[arg(long, default_value_t = 2)]
        id: u8,
        /// %
        #[arg(long, default_value_t = 30.0)]
        max_pwm: f64,
        /// rad/s
        #[arg(long, default_value_t = 2.0)]
        omega: f64,
        #[arg(long, default_value_t = 20.0)]
        duration: f64,
    },
    /// 1R arm driven by random PWM targets
    RandomPwm {
        #[arg(long, default_value_t = 2)]
        id: u8,
        #[arg(long, default_value_t = 300.0)]
        duration: f64,
        /// Time each target is held, s
        #[arg(long, default_value_t = 0.4)]
        pwm_duration: f64,
        #[arg(long, default_value_t = 100.0)]
        max_pwm: f64,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Successive constant PWM values
    ConstantPwm {
        #[arg(long, default_value_t = 1)]
        id: u8,
        #[arg(long, value_delimiter = ',', default_values_t = (1..=20).map(|k| 5.0 * k as f64))]
        values: Vec<f64>,
        #[arg(long, default_value_t = 3.0)]
        step_duration: f64,
    },
    /// Successive constant velocities
    ConstantVelocity {
        #[arg(long, default_value_t = 1)]
        id: u8,
        #[arg(long, value_delimiter = ',', default_values_t = (1..=10).map(|k| 0.2 * k as f64))]
        values: Vec<f64>,
        #[arg(long, default_value_t = 3.0)]
        step_duration: f64,
        /// Velocities are given in rpm instead of rad/s
        #[arg(long)]
        use_rpm: bool,
    },
    /// Smallest current moving the arm from rest
    CurrentThreshold {
        #[arg(long, default_value_t = 1)]
        id: u8,
    },
    /// 2R end point drawing a circle or a line
    ArmCartesian {
        #[arg(long, value_enum, default_value_t = Shape::Circle)]
        shape: Shape,
        #[arg(long, default_value_t = 8.0)]
        duration: f64,
        /// Period of one circle or line, s
        #[arg(long, default_value_t = 1.0)]
        period: f64,
        /// Arm model JSON, the 2R bench by default
        #[arg(long)]
        arm: Option<PathBuf>,
    },
    /// 2R arm doing smooth random moves in joint space
    ArmRandom {
        #[arg(long, default_value_t = 300.0)]
        duration: f64,
        /// rad/s
        #[arg(long, default_value_t = 3.5)]
        max_speed: f64,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// 1R arm following a random sum of sinusoids in position mode
    RandomSinus {
        #[arg(long, default_value_t = 2)]
        id: u8,
        #[arg(long, default_value_t = 3)]
        components: usize,
        #[arg(long, default_value_t = 20.0)]
        duration: f64,
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn arm_ids(ids: &[u8]) -> Result<[u8; 2]> {
    match ids {
        [first, second] => Ok([*first, *second]),
        _ => Err(eyre!("2R experiments need exactly two motor ids, got {:?}", ids)),
    }
}

fn build_experiment(command: &ExperimentCommand, ids: &[u8]) -> Result<Box<dyn Experiment>> {
    let experiment: Box<dyn Experiment> = match *command {
        ExperimentCommand::PositionSinus {
            id,
            profile,
            duration,
        } => Box::new(PositionSinus::new(id, profile.into(), duration)),
        ExperimentCommand::CurrentSinus {
            id,
            max_current,
            omega,
            duration,
        } => Box::new(AmplitudeSinus::current(id, max_current, omega, duration)),
        ExperimentCommand::CurrentFeedforward {
            id,
            duration,
            ref arm,
        } => {
            let arm = match arm {
                Some(path) => ArmModel::load(path)?,
                None => ArmModel::one_r(),
            };
            Box::new(CurrentFeedforwardSinus::new(id, arm, duration)?)
        }
        ExperimentCommand::PwmSinus {
            id,
            max_pwm,
            omega,
            duration,
        } => Box::new(AmplitudeSinus::pwm(id, max_pwm, omega, duration)),
        ExperimentCommand::RandomPwm {
            id,
            duration,
            pwm_duration,
            max_pwm,
            seed,
        } => Box::new(RandomPwm::new(id, duration, pwm_duration, max_pwm, seed)),
        ExperimentCommand::ConstantPwm {
            id,
            ref values,
            step_duration,
        } => Box::new(ConstantSteps::pwm(id, values.clone(), step_duration)?),
        ExperimentCommand::ConstantVelocity {
            id,
            ref values,
            step_duration,
            use_rpm,
        } => Box::new(ConstantSteps::velocity(
            id,
            values.clone(),
            step_duration,
            use_rpm,
        )?),
        ExperimentCommand::CurrentThreshold { id } => Box::new(CurrentThreshold::new(id)),
        ExperimentCommand::ArmCartesian {
            shape,
            duration,
            period,
            ref arm,
        } => {
            let arm = match arm {
                Some(path) => ArmModel::load(path)?,
                None => ArmModel::two_r(),
            };
            let kind = match shape {
                Shape::Circle => CartesianKind::Circle,
                Shape::Line => CartesianKind::Line,
            };
            Box::new(ArmPositionTrajectory::cartesian(
                arm_ids(ids)?,
                &arm,
                kind,
                duration,
                period,
            )?)
        }
        ExperimentCommand::ArmRandom {
            duration,
            max_speed,
            seed,
        } => Box::new(ArmPositionTrajectory::random_articular(
            arm_ids(ids)?,
            duration,
            max_speed,
            seed,
        )?),
        ExperimentCommand::RandomSinus {
            id,
            components,
            duration,
            seed,
        } => Box::new(RandomSinusPosition::new(id, components, duration, seed)),
    };
    Ok(experiment)
}

fn connect(args: &Args) -> Result<MotorController> {
    if args.simulate {
        info!("Using simulated motors {:?}", args.ids);
        return Ok(MotorController::new(
            Box::new(SimulatedBus::new(&args.ids)),
            args.ids.clone(),
        ));
    }

    let mut motors = MotorController::init_connection(&args.port, args.baudrate, args.ids.clone())?;
    motors.set_return_status(RETURN_STATUS_ALL);
    motors.set_return_delay_time(0);
    motors.set_moving_threshold(DEFAULT_MOVING_THRESHOLD);
    motors.check_latency(10)?;
    info!("Motors initialization done");
    Ok(motors)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::fs::create_dir_all(&args.output_dir)
        .wrap_err_with(|| format!("creating {}", args.output_dir.display()))?;
    let _guard = if args.file_logging {
        Some(initialize_file_and_console_logging(&args.output_dir)?)
    } else {
        initialize_logging()?;
        None
    };

    let experiment = build_experiment(&args.experiment, &args.ids)?;
    let name = experiment.name().to_string();
    let mut motors = connect(&args)?;

    let control = ControlLoop::new(experiment.framerate())?;
    let running = control.running_flag();
    let mut handle = tokio::task::spawn_blocking(move || -> Result<(ExperimentLog, MotorController)> {
        raise_thread_priority();
        let mut clock = WallClock::new();
        let log = control.run(experiment, &mut motors, &mut clock)?;
        Ok((log, motors))
    });

    let finished = tokio::select! {
        finished = &mut handle => finished,
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl+C received, stopping the experiment");
            running.store(false, std::sync::atomic::Ordering::Relaxed);
            handle.await
        }
    };
    let (log, mut motors) = finished.map_err(|e| eyre!("Control thread panicked: {}", e))??;

    let path = args.output_dir.join(timestamped_name(&name)?);
    log.save(&path)?;

    motors.disable_torque_all();
    motors.close_connection();
    Ok(())
}
