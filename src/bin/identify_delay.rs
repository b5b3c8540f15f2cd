use ::clap::Parser;
use ::eyre::Result;
use ::std::path::PathBuf;
use tracing::info;

use servo_bench::analysis::identify_delay;
use servo_bench::initialize_logging;
use servo_bench::recording::ExperimentLog;

/// Read/goal delays of position sinus logs, from their zero crossings.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Logs holding read and goal position and velocity
    #[arg(required = true)]
    logs: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging()?;

    for path in &args.logs {
        let log = ExperimentLog::load(path)?;
        let delays = identify_delay(&log)?;
        info!(
            "{}: position delay {:.2} ms, velocity delay {:.2} ms",
            path.display(),
            delays.position * 1e3,
            delays.velocity * 1e3
        );
    }
    Ok(())
}
