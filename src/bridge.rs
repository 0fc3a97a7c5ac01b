//! The opaque contract over the emulator's debugger/monitor channel.
//!
//! The rest of the harness never talks to a concrete transport: everything
//! goes through the `MonitorBridge` trait, so the core logic in `mtree`,
//! `registers`, `inject`, and `campaign` can be exercised against a
//! `MockBridge` without a real emulator attached.

use std::collections::{HashMap, HashSet};

use crate::error::HarnessError;

/// The value held by a register, as read back from the bridge.
///
/// `Vector`'s two lanes follow the convention adopted in the design notes:
/// index 0 is the architecturally lower 64 bits, index 1 the upper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterValue {
    Scalar(u64),
    Vector([u64; 2]),
}

impl RegisterValue {
    pub fn as_scalar(self) -> Option<u64> {
        match self {
            RegisterValue::Scalar(v) => Some(v),
            RegisterValue::Vector(_) => None,
        }
    }

    pub fn lane(self, half: usize) -> Option<u64> {
        match self {
            RegisterValue::Scalar(v) if half == 0 => Some(v),
            RegisterValue::Scalar(_) => None,
            RegisterValue::Vector(lanes) => lanes.get(half).copied(),
        }
    }

    pub fn with_lane(self, half: usize, value: u64) -> Self {
        match self {
            RegisterValue::Scalar(_) => RegisterValue::Scalar(value),
            RegisterValue::Vector(mut lanes) => {
                lanes[half] = value;
                RegisterValue::Vector(lanes)
            }
        }
    }
}

/// Operations the rest of the core relies on; see spec §6.
pub trait MonitorBridge {
    /// Synchronously execute a monitor command, returning its textual output.
    fn hmp(&self, cmd: &str) -> Result<String, HarnessError>;

    /// Direct guest-physical memory read.
    fn read_mem(&self, addr: u64, len: usize) -> Result<Vec<u8>, HarnessError>;

    /// Direct guest-physical memory write.
    fn write_mem(&self, addr: u64, data: &[u8]) -> Result<(), HarnessError>;

    /// Register access scoped to the currently selected guest CPU.
    fn read_reg(&self, name: &str) -> Result<RegisterValue, HarnessError>;

    /// Register access scoped to the currently selected guest CPU.
    fn write_reg(&self, name: &str, value: RegisterValue) -> Result<(), HarnessError>;

    /// Evaluate a debugger expression (used to resolve symbolic addresses
    /// like `main+0x20`).
    fn eval(&self, expr: &str) -> Result<u64, HarnessError>;

    /// Write raw bytes to the guest's serial port.
    fn send_serial(&self, bytes: &[u8]) -> Result<(), HarnessError>;

    /// Enumerate the current frame's registers as `(name, type_string, byte_width)`.
    fn list_registers(&self) -> Result<Vec<(String, String, u32)>, HarnessError>;
}

/// Convenience helper built on top of `MonitorBridge::hmp`: advance the guest
/// by exactly `ns` virtual nanoseconds, then re-pause (spec §4.G).
pub fn step(bridge: &dyn MonitorBridge, ns: u64) -> Result<(), HarnessError> {
    bridge.hmp("cont")?;
    bridge.hmp(&format!("stop_delayed {}", ns))?;
    Ok(())
}

/// A test double for `MonitorBridge`, backed entirely by in-memory state.
///
/// Supports canned `hmp` responses (for `info mtree -f`), a sparse byte
/// store for RAM, an in-memory register file, and a snapshot store so
/// `savevm`/`loadvm`/`delvm` round-trip for tests of the campaign engine.
pub struct MockBridge {
    mem: std::cell::RefCell<HashMap<u64, u8>>,
    registers: std::cell::RefCell<HashMap<String, RegisterValue>>,
    register_list: Vec<(String, String, u32)>,
    mtree_output: String,
    snapshots: std::cell::RefCell<HashMap<String, (HashMap<u64, u8>, HashMap<String, RegisterValue>)>>,
    read_only: HashSet<String>,
    serial: std::cell::RefCell<Vec<u8>>,
    hmp_log: std::cell::RefCell<Vec<String>>,
}

impl MockBridge {
    pub fn new() -> Self {
        MockBridge {
            mem: Default::default(),
            registers: Default::default(),
            register_list: Vec::new(),
            mtree_output: String::new(),
            snapshots: Default::default(),
            read_only: HashSet::new(),
            serial: Default::default(),
            hmp_log: Default::default(),
        }
    }

    pub fn set_register_list(&mut self, list: Vec<(String, String, u32)>) {
        self.register_list = list;
    }

    pub fn set_mtree_output(&mut self, text: impl Into<String>) {
        self.mtree_output = text.into();
    }

    pub fn seed_memory(&self, addr: u64, bytes: &[u8]) {
        let mut mem = self.mem.borrow_mut();
        for (i, b) in bytes.iter().enumerate() {
            mem.insert(addr + i as u64, *b);
        }
    }

    pub fn seed_register(&self, name: &str, value: RegisterValue) {
        self.registers.borrow_mut().insert(name.to_string(), value);
    }

    /// Mark a register as read-only: writes are silently dropped, simulating
    /// the "register is read-only" case from spec §4.F.
    pub fn mark_read_only(&mut self, name: &str) {
        self.read_only.insert(name.to_string());
    }

    pub fn serial_output(&self) -> Vec<u8> {
        self.serial.borrow().clone()
    }

    pub fn hmp_log(&self) -> Vec<String> {
        self.hmp_log.borrow().clone()
    }

    pub fn memory_snapshot(&self) -> HashMap<u64, u8> {
        self.mem.borrow().clone()
    }

    pub fn register_snapshot(&self) -> HashMap<String, RegisterValue> {
        self.registers.borrow().clone()
    }
}

impl Default for MockBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorBridge for MockBridge {
    fn hmp(&self, cmd: &str) -> Result<String, HarnessError> {
        self.hmp_log.borrow_mut().push(cmd.to_string());

        if cmd == "info mtree -f" {
            return Ok(self.mtree_output.clone());
        }
        if cmd == "cont" {
            return Ok(String::new());
        }
        if let Some(_ns) = cmd.strip_prefix("stop_delayed ") {
            return Ok(String::new());
        }
        if let Some(tag) = cmd.strip_prefix("savevm ") {
            self.snapshots.borrow_mut().insert(
                tag.to_string(),
                (self.mem.borrow().clone(), self.registers.borrow().clone()),
            );
            return Ok(String::new());
        }
        if let Some(tag) = cmd.strip_prefix("loadvm ") {
            let snapshots = self.snapshots.borrow();
            let (mem, regs) = snapshots
                .get(tag)
                .ok_or_else(|| HarnessError::bridge(format!("no such snapshot: {}", tag)))?;
            *self.mem.borrow_mut() = mem.clone();
            *self.registers.borrow_mut() = regs.clone();
            return Ok(String::new());
        }
        if let Some(tag) = cmd.strip_prefix("delvm ") {
            self.snapshots.borrow_mut().remove(tag);
            return Ok(String::new());
        }

        Err(HarnessError::bridge(format!("unsupported hmp command: {}", cmd)))
    }

    fn read_mem(&self, addr: u64, len: usize) -> Result<Vec<u8>, HarnessError> {
        let mem = self.mem.borrow();
        Ok((0..len as u64).map(|i| *mem.get(&(addr + i)).unwrap_or(&0)).collect())
    }

    fn write_mem(&self, addr: u64, data: &[u8]) -> Result<(), HarnessError> {
        let mut mem = self.mem.borrow_mut();
        for (i, b) in data.iter().enumerate() {
            mem.insert(addr + i as u64, *b);
        }
        Ok(())
    }

    fn read_reg(&self, name: &str) -> Result<RegisterValue, HarnessError> {
        self.registers
            .borrow()
            .get(name)
            .copied()
            .ok_or_else(|| HarnessError::bridge(format!("no such register: {}", name)))
    }

    fn write_reg(&self, name: &str, value: RegisterValue) -> Result<(), HarnessError> {
        if self.read_only.contains(name) {
            // Silently ignored, per the "register is read-only" case.
            return Ok(());
        }
        self.registers.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }

    fn eval(&self, expr: &str) -> Result<u64, HarnessError> {
        // The mock only supports bare hex/decimal literals and `base+0xNN`.
        if let Some((base, offset)) = expr.split_once('+') {
            let base = parse_int(base.trim())?;
            let offset = parse_int(offset.trim())?;
            return Ok(base + offset);
        }
        parse_int(expr.trim())
    }

    fn send_serial(&self, bytes: &[u8]) -> Result<(), HarnessError> {
        self.serial.borrow_mut().extend_from_slice(bytes);
        Ok(())
    }

    fn list_registers(&self) -> Result<Vec<(String, String, u32)>, HarnessError> {
        Ok(self.register_list.clone())
    }
}

fn parse_int(s: &str) -> Result<u64, HarnessError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| HarnessError::resolution(format!("bad address expression {:?}: {}", s, e)))
    } else {
        s.parse::<u64>()
            .map_err(|e| HarnessError::resolution(format!("bad address expression {:?}: {}", s, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_memory_round_trips() {
        let bridge = MockBridge::new();
        bridge.write_mem(0x1000, &[0xEF, 0xBE, 0xAD, 0xDE]).unwrap();
        assert_eq!(bridge.read_mem(0x1000, 4).unwrap(), vec![0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(bridge.read_mem(0x2000, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn mock_eval_resolves_symbolic_offsets() {
        let bridge = MockBridge::new();
        assert_eq!(bridge.eval("0x1000").unwrap(), 0x1000);
        assert_eq!(bridge.eval("0x1000+0x20").unwrap(), 0x1020);
    }

    #[test]
    fn mock_snapshot_round_trip() {
        let bridge = MockBridge::new();
        bridge.write_mem(0x1000, &[1, 2, 3, 4]).unwrap();
        bridge.hmp("savevm tag").unwrap();
        bridge.write_mem(0x1000, &[9, 9, 9, 9]).unwrap();
        bridge.hmp("loadvm tag").unwrap();
        assert_eq!(bridge.read_mem(0x1000, 4).unwrap(), vec![1, 2, 3, 4]);
        bridge.hmp("delvm tag").unwrap();
        assert!(bridge.hmp("loadvm tag").is_err());
    }

    #[test]
    fn read_only_register_write_is_silently_dropped() {
        let mut bridge = MockBridge::new();
        bridge.mark_read_only("pc");
        bridge.seed_register("pc", RegisterValue::Scalar(0x40));
        bridge.write_reg("pc", RegisterValue::Scalar(0x41)).unwrap();
        assert_eq!(bridge.read_reg("pc").unwrap(), RegisterValue::Scalar(0x40));
    }
}
