use ::clap::Parser;
use ::eyre::{eyre, Result};
use tracing::{info, warn};

use servo_bench::constants::*;
use servo_bench::initialize_logging;
use servo_bench::motor::{MotorController, ReadSelection};

/// Checks that every motor answers and measures the bus round trip.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = DEFAULT_PORT)]
    port: String,
    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    baudrate: u32,
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_MOTOR_IDS.to_vec())]
    ids: Vec<u8>,
    /// Pings per motor for the latency estimate
    #[arg(long, default_value_t = 10)]
    samples: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging()?;

    let mut motors = MotorController::init_connection(&args.port, args.baudrate, args.ids.clone())?;
    let mut missing = vec![];
    for &id in &args.ids {
        match motors.ping(id) {
            Ok(true) => {
                let reading = motors.read_data(id, ReadSelection::ALL)?;
                info!(
                    "Motor {}: position {:.3} rad, velocity {:.3} rad/s, current {:.1} mA, pwm {:.1} %",
                    id,
                    reading.position.unwrap_or_default(),
                    reading.velocity.unwrap_or_default(),
                    reading.current.unwrap_or_default(),
                    reading.pwm.unwrap_or_default()
                );
            }
            Ok(false) => missing.push(id),
            Err(e) => {
                warn!("Motor {}: {}", id, e);
                missing.push(id);
            }
        }
    }
    if !missing.is_empty() {
        return Err(eyre!("Motors {:?} did not answer on {}", missing, args.port));
    }

    let latency = motors.check_latency(args.samples)?;
    info!("Latency: {:?}", latency);
    motors.close_connection();
    Ok(())
}
