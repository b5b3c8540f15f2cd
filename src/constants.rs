// Control table of the X-series servos (protocol 2.0).
pub const ADDR_RETURN_DELAY_TIME: u8 = 9;
pub const ADDR_OPERATING_MODE: u8 = 11;
pub const ADDR_MOVING_THRESHOLD: u8 = 24;
pub const ADDR_TORQUE_ENABLE: u8 = 64;
pub const ADDR_STATUS_RETURN_LEVEL: u8 = 68;
pub const ADDR_GOAL_PWM: u8 = 100;
pub const ADDR_GOAL_CURRENT: u8 = 102;
pub const ADDR_GOAL_VELOCITY: u8 = 104;
pub const ADDR_GOAL_POSITION: u8 = 116;
pub const ADDR_PRESENT_PWM: u8 = 124;
pub const ADDR_PRESENT_CURRENT: u8 = 126;
pub const ADDR_PRESENT_VELOCITY: u8 = 128;
pub const ADDR_PRESENT_POSITION: u8 = 132;

// Status return levels.
pub const RETURN_STATUS_PING: u8 = 0;
pub const RETURN_STATUS_PING_READ: u8 = 1;
pub const RETURN_STATUS_ALL: u8 = 2;

// Position encoding: one turn is 4096 ticks, tick 2048 is the zero angle.
pub const DXL_MINIMUM_POSITION_VALUE: i64 = 0;
pub const DXL_ZERO_POSITION_VALUE: i64 = 2048;
pub const DXL_MAXIMUM_POSITION_VALUE: i64 = 4095;

// 5 units = 16.8 mA
pub const CURRENT_UNIT_MA: f64 = 3.36;
pub const VELOCITY_UNIT_RPM: f64 = 0.229;
// 885 units = 100 %
pub const PWM_UNIT_PERCENT: f64 = 0.113;

pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUDRATE: u32 = 57600;
pub const DEFAULT_MOTOR_IDS: &[u8] = &[1, 2];
pub const DEFAULT_MOVING_THRESHOLD: u32 = 10;
pub const DEFAULT_READ_RETRIES: usize = 10;

pub const FRAMERATE_1R_POSITION: f64 = 800.0;
pub const FRAMERATE_BENCH: f64 = 300.0;

// Smallest current which moves the 1R arm from rest: 5 units rounded down.
pub const CURRENT_THRESHOLD_MA: f64 = 15.12;

// Rough current/torque ratio measured on the 1R bench.
pub const KI_A_PER_NM: f64 = 0.48;

pub const GRAVITY: f64 = 9.81;

// Lumped 1R link used by the gravity-only torque estimates.
pub const LINK_MASS_KG: f64 = 0.35;
pub const LINK_LENGTH_M: f64 = 0.17;

// Windowed polynomial smoothing of raw 2R logs.
pub const SPLINE_WINDOW_SIZE: usize = 38;
pub const SPLINE_DEGREE: usize = 2;
pub const SPLINE_INTERSECTED_VALUES: usize = 36;
pub const SAMPLE_RATE: f64 = 300.0;

// Default state/action layout of the learned model.
pub const STATE_ENTRIES: &[&str] = &["read_position", "read_velocity"];
pub const ACTION_ENTRIES: &[&str] = &["goal_pwm"];
