pub mod actuators;
pub mod analysis;
pub mod arm;
pub mod bus;
pub mod constants;
pub mod dataset;
pub mod experiments;
pub mod history;
pub mod logging;
pub mod model;
pub mod motor;
pub mod polyfit;
pub mod recording;
pub mod runtime;
pub mod signal;
pub mod training;
pub mod trajectory;

pub use logging::{initialize_file_and_console_logging, initialize_logging};
