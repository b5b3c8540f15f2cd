use eyre::{eyre, Result};
use rustypot::DynamixelSerialIO;
use serialport::SerialPort;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

use crate::constants::*;

/// Register level access to a chain of servos.
pub trait MotorBus: Send {
    fn port(&self) -> String;
    fn ping(&mut self, id: u8) -> Result<bool>;
    fn read(&mut self, id: u8, addr: u8, len: u8) -> Result<Vec<u8>>;
    fn write(&mut self, id: u8, addr: u8, data: &[u8]) -> Result<()>;
}

/// Serial bus talking protocol 2.0 through rustypot.
pub struct DynamixelBus {
    serial_port: Box<dyn SerialPort>,
    io: DynamixelSerialIO,
    port_name: String,
}

impl DynamixelBus {
    pub fn new(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        let serial_port = serialport::new(port_name, baudrate)
            .timeout(timeout)
            .open()
            .map_err(|e| eyre!("Failed to open {} at {} baud: {}", port_name, baudrate, e))?;
        debug!("Opened {} at {} baud", port_name, baudrate);

        Ok(Self {
            serial_port,
            io: DynamixelSerialIO::v2(),
            port_name: port_name.to_string(),
        })
    }
}

impl MotorBus for DynamixelBus {
    fn port(&self) -> String {
        self.port_name.clone()
    }

    fn ping(&mut self, id: u8) -> Result<bool> {
        self.io
            .ping(self.serial_port.as_mut(), id)
            .map_err(|e| eyre!("ping {} on {}: {}", id, self.port_name, e))
    }

    fn read(&mut self, id: u8, addr: u8, len: u8) -> Result<Vec<u8>> {
        let data = self
            .io
            .read(self.serial_port.as_mut(), id, addr, len)
            .map_err(|e| eyre!("read {} bytes at {} from motor {}: {}", len, addr, id, e))?;
        trace!("read {}@{} -> {:02x?}", id, addr, data);
        Ok(data)
    }

    fn write(&mut self, id: u8, addr: u8, data: &[u8]) -> Result<()> {
        trace!("write {}@{} <- {:02x?}", id, addr, data);
        self.io
            .write(self.serial_port.as_mut(), id, addr, data)
            .map_err(|e| eyre!("write {:02x?} at {} to motor {}: {}", data, addr, id, e))
    }
}

const CONTROL_TABLE_SIZE: usize = 256;

// Goal register -> present register it is mirrored into, with width.
const MIRRORED_REGISTERS: [(u8, u8, usize); 4] = [
    (ADDR_GOAL_PWM, ADDR_PRESENT_PWM, 2),
    (ADDR_GOAL_CURRENT, ADDR_PRESENT_CURRENT, 2),
    (ADDR_GOAL_VELOCITY, ADDR_PRESENT_VELOCITY, 4),
    (ADDR_GOAL_POSITION, ADDR_PRESENT_POSITION, 4),
];

#[derive(Default)]
struct SimulatedState {
    tables: HashMap<u8, Vec<u8>>,
    failing_reads: usize,
    writes: Vec<(u8, u8, Vec<u8>)>,
}

/// In-memory stand-in for a servo chain.
///
/// Every motor owns a zeroed control table whose present position starts at
/// the zero tick. While torque is enabled, goal registers are copied into the
/// matching present registers so a read returns the last command.
#[derive(Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedBus {
    pub fn new(ids: &[u8]) -> Self {
        let bus = Self::default();
        {
            let mut state = bus.lock();
            for id in ids {
                let mut table = vec![0u8; CONTROL_TABLE_SIZE];
                let zero = (DXL_ZERO_POSITION_VALUE as u32).to_le_bytes();
                let addr = ADDR_PRESENT_POSITION as usize;
                table[addr..addr + 4].copy_from_slice(&zero);
                state.tables.insert(*id, table);
            }
        }
        bus
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `count` reads fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.lock().failing_reads = count;
    }

    /// Overwrites raw register bytes, bypassing torque checks.
    pub fn poke(&self, id: u8, addr: u8, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let table = state
            .tables
            .get_mut(&id)
            .ok_or_else(|| eyre!("No simulated motor with id {}", id))?;
        let start = addr as usize;
        table
            .get_mut(start..start + data.len())
            .ok_or_else(|| eyre!("poke past control table end: {}+{}", addr, data.len()))?
            .copy_from_slice(data);
        Ok(())
    }

    pub fn register(&self, id: u8, addr: u8, len: usize) -> Option<Vec<u8>> {
        let state = self.lock();
        let start = addr as usize;
        state
            .tables
            .get(&id)
            .and_then(|table| table.get(start..start + len))
            .map(|bytes| bytes.to_vec())
    }

    /// Every write seen so far as `(id, addr, data)`.
    pub fn writes(&self) -> Vec<(u8, u8, Vec<u8>)> {
        self.lock().writes.clone()
    }
}

impl MotorBus for SimulatedBus {
    fn port(&self) -> String {
        "simulated".to_string()
    }

    fn ping(&mut self, id: u8) -> Result<bool> {
        Ok(self.lock().tables.contains_key(&id))
    }

    fn read(&mut self, id: u8, addr: u8, len: u8) -> Result<Vec<u8>> {
        let mut state = self.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(eyre!("simulated read failure on motor {}", id));
        }
        let table = state
            .tables
            .get(&id)
            .ok_or_else(|| eyre!("No simulated motor with id {}", id))?;
        let start = addr as usize;
        let end = start + len as usize;
        if end > table.len() {
            return Err(eyre!("read past control table end: {}+{}", addr, len));
        }
        Ok(table[start..end].to_vec())
    }

    fn write(&mut self, id: u8, addr: u8, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        state.writes.push((id, addr, data.to_vec()));
        let table = state
            .tables
            .get_mut(&id)
            .ok_or_else(|| eyre!("No simulated motor with id {}", id))?;
        let start = addr as usize;
        let end = start + data.len();
        if end > table.len() {
            return Err(eyre!("write past control table end: {}+{}", addr, data.len()));
        }
        table[start..end].copy_from_slice(data);

        let torque_enabled = table[ADDR_TORQUE_ENABLE as usize] == 1;
        if torque_enabled {
            for (goal, present, width) in MIRRORED_REGISTERS {
                if goal == addr && data.len() == width {
                    let present = present as usize;
                    table[present..present + width].copy_from_slice(data);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_bus_starts_at_zero_tick() {
        let mut bus = SimulatedBus::new(&[1]);
        let data = bus.read(1, ADDR_PRESENT_POSITION, 4).unwrap();
        assert_eq!(u32::from_le_bytes(data.try_into().unwrap()), 2048);
    }

    #[test]
    fn goals_are_mirrored_only_with_torque_on() {
        let mut bus = SimulatedBus::new(&[3]);
        bus.write(3, ADDR_GOAL_POSITION, &1000u32.to_le_bytes()).unwrap();
        assert_eq!(
            bus.register(3, ADDR_PRESENT_POSITION, 4).unwrap(),
            2048u32.to_le_bytes().to_vec()
        );

        bus.write(3, ADDR_TORQUE_ENABLE, &[1]).unwrap();
        bus.write(3, ADDR_GOAL_POSITION, &1000u32.to_le_bytes()).unwrap();
        assert_eq!(
            bus.register(3, ADDR_PRESENT_POSITION, 4).unwrap(),
            1000u32.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn injected_failures_are_consumed() {
        let mut bus = SimulatedBus::new(&[1]);
        bus.fail_next_reads(2);
        assert!(bus.read(1, ADDR_PRESENT_PWM, 2).is_err());
        assert!(bus.read(1, ADDR_PRESENT_PWM, 2).is_err());
        assert!(bus.read(1, ADDR_PRESENT_PWM, 2).is_ok());
    }

    #[test]
    fn unknown_motor_is_an_error() {
        let mut bus = SimulatedBus::new(&[1]);
        assert!(!bus.ping(9).unwrap());
        assert!(bus.read(9, ADDR_PRESENT_POSITION, 4).is_err());
    }
}
