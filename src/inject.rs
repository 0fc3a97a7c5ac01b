//! Bit-flip primitives: RAM and register injections, with read-back
//! verification and the retry discipline for register selection.

use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;

use crate::bridge::{MonitorBridge, RegisterValue};
use crate::error::HarnessError;
use crate::logger::Logger;
use crate::registers::{RegisterClass, RegisterDescriptor};

/// A single completed injection, as logged to the CSV sink.
#[derive(Clone, Debug, serde::Serialize)]
pub struct InjectionRecord {
    pub target: String,
    pub old_value: u64,
    pub new_value: u64,
}

/// Maximum RAM bytewidth this harness will flip a bit within: wide enough
/// for every scalar register size in the inventory, narrow enough to fit in
/// a `u64` accumulator without extra bignum machinery.
const MAX_RAM_BYTEWIDTH: u32 = 8;

/// Flip one bit of `byte_width` bytes at `address`, verifying by read-back.
///
/// `bit` is drawn uniformly from `[0, byte_width * 8)` if not given.
pub fn inject_ram_bitflip(
    bridge: &dyn MonitorBridge,
    logger: &Logger,
    address: u64,
    byte_width: u32,
    bit: Option<u32>,
) -> Result<InjectionRecord, HarnessError> {
    if byte_width < 1 || byte_width > MAX_RAM_BYTEWIDTH {
        return Err(HarnessError::user_input(format!(
            "invalid bytewidth: {} (must be 1..={})",
            byte_width, MAX_RAM_BYTEWIDTH
        )));
    }

    let bitcount = byte_width * 8;
    let bit = match bit {
        Some(b) if b >= bitcount => {
            return Err(HarnessError::user_input(format!(
                "bit {} is outside the {}-bit width",
                b, bitcount
            )))
        }
        Some(b) => b,
        None => rand::thread_rng().gen_range(0..bitcount),
    };

    let bytes = bridge.read_mem(address, byte_width as usize)?;
    let ovalue = le_bytes_to_u64(&bytes);
    let nvalue = ovalue ^ (1u64 << bit);

    bridge.write_mem(address, &u64_to_le_bytes(nvalue, byte_width as usize))?;

    let readback_bytes = bridge.read_mem(address, byte_width as usize)?;
    let rnvalue = le_bytes_to_u64(&readback_bytes);

    if rnvalue != nvalue || nvalue == ovalue {
        return Err(HarnessError::bridge(format!(
            "mismatched values at 0x{:x}: o=0x{:x} n=0x{:x} rn=0x{:x}",
            address, ovalue, nvalue, rnvalue
        )));
    }

    let record = InjectionRecord {
        target: format!("0x{:x}", address),
        old_value: ovalue,
        new_value: nvalue,
    };
    logger.log(&record);
    Ok(record)
}

/// Flip one bit of a register, including the vector-half selection for
/// 128-bit registers. Returns `Ok(true)` on a verified success, `Ok(false)`
/// if the register turned out to be read-only (the normal "try another
/// register" case), and `Err` on a genuine bridge inconsistency.
pub fn inject_register_bitflip(
    bridge: &dyn MonitorBridge,
    logger: &Logger,
    descriptor: &RegisterDescriptor,
    bit: Option<u32>,
) -> Result<bool, HarnessError> {
    let bitcount = descriptor.bitcount();
    let bit = match bit {
        Some(b) if b >= bitcount => {
            return Err(HarnessError::user_input(format!(
                "bit {} is outside the {}-bit width of {}",
                b, bitcount, descriptor.name
            )))
        }
        Some(b) => b,
        None => rand::thread_rng().gen_range(0..bitcount),
    };
    let mask: u64 = if bitcount >= 64 {
        u64::MAX
    } else {
        (1u64 << bitcount) - 1
    };

    let value = bridge.read_reg(&descriptor.name)?;

    let half = match descriptor.class {
        RegisterClass::Scalar => 0,
        RegisterClass::Vector128 => rand::thread_rng().gen_range(0..2),
    };

    let oldval = value
        .lane(half)
        .ok_or_else(|| HarnessError::bridge(format!("register {} has no lane {}", descriptor.name, half)))?;
    let newval = oldval ^ (1u64 << bit);

    bridge.write_reg(&descriptor.name, value.with_lane(half, newval))?;
    let readback = bridge.read_reg(&descriptor.name)?;
    let rrval = readback
        .lane(half)
        .ok_or_else(|| HarnessError::bridge(format!("register {} has no lane {}", descriptor.name, half)))?;

    if (newval & mask) == (rrval & mask) {
        logger.log(&InjectionRecord {
            target: descriptor.name.clone(),
            old_value: oldval,
            new_value: rrval,
        });
        Ok(true)
    } else if (oldval & mask) == (rrval & mask) {
        log::info!(
            "bitflip could not be injected into register {} (0x{:x} -> 0x{:x} ignored)",
            descriptor.name,
            oldval,
            newval
        );
        Ok(false)
    } else {
        Err(HarnessError::bridge(format!(
            "double-mismatched register values on {}: o=0x{:x} n=0x{:x} rr=0x{:x}",
            descriptor.name, oldval, newval, rrval
        )))
    }
}

/// Expand a register-name wildcard pattern (`*` segments) into an anchored
/// regex and filter `names` by it.
pub fn expand_wildcard<'a>(pattern: &str, names: &'a [RegisterDescriptor]) -> Vec<&'a RegisterDescriptor> {
    let escaped: Vec<String> = pattern.split('*').map(|seg| regex::escape(seg)).collect();
    let pattern_str = format!("^{}$", escaped.join(".*"));
    let re = Regex::new(&pattern_str).expect("escaped wildcard pattern is always valid");
    names.iter().filter(|d| re.is_match(&d.name)).collect()
}

/// Select a register (filtered by `pattern`, `"*"` meaning "any") and retry
/// bitflip injection, shuffled, until one succeeds. Mirrors `inject_reg_internal`.
pub fn inject_into_matching_register(
    bridge: &dyn MonitorBridge,
    logger: &Logger,
    inventory: &[RegisterDescriptor],
    pattern: &str,
    bit: Option<u32>,
) -> Result<(), HarnessError> {
    let mut candidates = expand_wildcard(pattern, inventory);
    if candidates.is_empty() {
        return Err(HarnessError::resolution(format!(
            "no registers found matching {:?}",
            pattern
        )));
    }

    candidates.shuffle(&mut rand::thread_rng());

    for descriptor in candidates {
        if inject_register_bitflip(bridge, logger, descriptor, bit)? {
            return Ok(());
        }
        log::info!("trying another register...");
    }

    Err(HarnessError::resolution("out of registers to try"))
}

fn le_bytes_to_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn u64_to_le_bytes(value: u64, width: usize) -> Vec<u8> {
    value.to_le_bytes()[..width].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridge;

    #[test]
    fn ram_bitflip_flips_exactly_one_bit() {
        let bridge = MockBridge::new();
        bridge.write_mem(0x1000, &0xDEADBEEFu32.to_le_bytes()).unwrap();
        let logger = Logger::unlogged();

        let record = inject_ram_bitflip(&bridge, &logger, 0x1000, 4, Some(0)).unwrap();
        assert_eq!(record.old_value, 0xDEADBEEF);
        assert_eq!(record.new_value, 0xDEADBEEE);

        let bytes = bridge.read_mem(0x1000, 4).unwrap();
        assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 0xDEADBEEE);
    }

    #[test]
    fn ram_bitflip_is_idempotent_under_repetition() {
        let bridge = MockBridge::new();
        bridge.write_mem(0x2000, &[0x12, 0x34, 0x56, 0x78]).unwrap();
        let logger = Logger::unlogged();

        inject_ram_bitflip(&bridge, &logger, 0x2000, 4, Some(5)).unwrap();
        inject_ram_bitflip(&bridge, &logger, 0x2000, 4, Some(5)).unwrap();

        assert_eq!(bridge.read_mem(0x2000, 4).unwrap(), vec![0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn ram_bitflip_rejects_bit_outside_width() {
        let bridge = MockBridge::new();
        let logger = Logger::unlogged();
        assert!(inject_ram_bitflip(&bridge, &logger, 0x1000, 1, Some(8)).is_err());
    }

    fn scalar_descriptor(name: &str) -> RegisterDescriptor {
        RegisterDescriptor {
            name: name.to_string(),
            byte_width: 8,
            class: RegisterClass::Scalar,
        }
    }

    #[test]
    fn register_bitflip_flips_exactly_one_bit() {
        let bridge = MockBridge::new();
        bridge.seed_register("x0", RegisterValue::Scalar(0x00FF));
        let logger = Logger::unlogged();

        let desc = scalar_descriptor("x0");
        let ok = inject_register_bitflip(&bridge, &logger, &desc, Some(0)).unwrap();
        assert!(ok);
        assert_eq!(bridge.read_reg("x0").unwrap(), RegisterValue::Scalar(0x00FE));
    }

    #[test]
    fn register_bitflip_returns_false_on_read_only_register() {
        let mut bridge = MockBridge::new();
        bridge.seed_register("pc", RegisterValue::Scalar(0x40));
        bridge.mark_read_only("pc");
        let logger = Logger::unlogged();

        let desc = scalar_descriptor("pc");
        let ok = inject_register_bitflip(&bridge, &logger, &desc, Some(0)).unwrap();
        assert!(!ok);
    }

    #[test]
    fn vector_bitflip_only_touches_one_lane() {
        let bridge = MockBridge::new();
        bridge.seed_register("v0", RegisterValue::Vector([0x1111, 0x2222]));
        let logger = Logger::unlogged();

        let desc = RegisterDescriptor {
            name: "v0".to_string(),
            byte_width: 16,
            class: RegisterClass::Vector128,
        };
        inject_register_bitflip(&bridge, &logger, &desc, Some(0)).unwrap();

        let RegisterValue::Vector(lanes) = bridge.read_reg("v0").unwrap() else {
            panic!("expected vector register");
        };
        // Exactly one lane should have changed from its seeded value.
        let changed = (lanes[0] != 0x1111) as u8 + (lanes[1] != 0x2222) as u8;
        assert_eq!(changed, 1);
    }

    #[test]
    fn wildcard_expansion_matches_segments() {
        let inventory = vec![
            scalar_descriptor("r0"),
            scalar_descriptor("r1"),
            scalar_descriptor("x10"),
        ];
        let matches = expand_wildcard("r*", &inventory);
        assert_eq!(matches.len(), 2);

        let all = expand_wildcard("*", &inventory);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn selection_retries_until_a_mutable_register_succeeds() {
        let mut bridge = MockBridge::new();
        bridge.seed_register("pc", RegisterValue::Scalar(0x40));
        bridge.seed_register("x0", RegisterValue::Scalar(0xFF));
        bridge.mark_read_only("pc");
        let logger = Logger::unlogged();

        let inventory = vec![scalar_descriptor("pc"), scalar_descriptor("x0")];
        inject_into_matching_register(&bridge, &logger, &inventory, "*", Some(0)).unwrap();

        // pc must be untouched; x0 must have flipped.
        assert_eq!(bridge.read_reg("pc").unwrap(), RegisterValue::Scalar(0x40));
        assert_eq!(bridge.read_reg("x0").unwrap(), RegisterValue::Scalar(0xFE));
    }

    #[test]
    fn selection_fails_when_no_register_matches() {
        let bridge = MockBridge::new();
        let logger = Logger::unlogged();
        let inventory = vec![scalar_descriptor("x0")];
        assert!(inject_into_matching_register(&bridge, &logger, &inventory, "zzz*", None).is_err());
    }
}
