//! The campaign engine: time-stepped, repeated injection runs, optionally
//! scoped to a snapshot so many trials can start from the same guest state.

use rand::Rng;

use crate::bridge::{self, MonitorBridge};
use crate::error::HarnessError;
use crate::inject;
use crate::logger::Logger;
use crate::mtree;
use crate::registers::RegisterInventory;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Ram,
    Reg,
}

/// Parameters shared by `autoinject` and the loop inside `snapinject`.
pub struct CampaignParams {
    pub count: u32,
    pub min_ns: u64,
    pub max_ns: u64,
    pub kind: FaultKind,
}

impl CampaignParams {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.count < 1 {
            return Err(HarnessError::user_input("fatal: times < 1"));
        }
        if !(0 < self.min_ns && self.min_ns <= self.max_ns) {
            return Err(HarnessError::user_input("fatal: min_interval > max_interval"));
        }
        Ok(())
    }
}

/// The optional explicit target for a `snapinject` campaign: `(location, bit)`.
/// Both or neither — enforced by [`validate_target`].
pub struct SnapshotCampaignParams {
    pub base: CampaignParams,
    pub target: Option<(String, u32)>,
    pub observe_ns: u64,
    pub snapshot_tag: Option<String>,
}

/// `(target, bit)` is all-or-nothing; specifying one without the other is rejected.
pub fn validate_target(location: Option<&str>, bit: Option<u32>) -> Result<Option<(String, u32)>, HarnessError> {
    match (location, bit) {
        (Some(l), Some(b)) => Ok(Some((l.to_string(), b))),
        (None, None) => Ok(None),
        _ => Err(HarnessError::user_input(
            "--bit-index and --fault-location must be both specified or both omitted",
        )),
    }
}

fn sample_ram_address(bridge: &dyn MonitorBridge) -> Result<u64, HarnessError> {
    let output = bridge.hmp("info mtree -f")?;
    let tree = mtree::parse_mtree(&output);
    let memory = tree
        .get("memory")
        .ok_or_else(|| HarnessError::resolution("no \"memory\" address space in mtree output"))?;
    memory.random_address()
}

/// Run `params.count` untargeted injections, each preceded by a uniform
/// random guest-time delay in `[min_ns, max_ns]`.
pub fn run_untargeted(
    bridge: &dyn MonitorBridge,
    logger: &Logger,
    inventory: &RegisterInventory,
    params: &CampaignParams,
) -> Result<(), HarnessError> {
    params.validate()?;

    for _ in 0..params.count {
        let ns = rand::thread_rng().gen_range(params.min_ns..=params.max_ns);
        bridge::step(bridge, ns)?;

        match params.kind {
            FaultKind::Ram => {
                let address = sample_ram_address(bridge)?;
                inject::inject_ram_bitflip(bridge, logger, address, 1, None)?;
            }
            FaultKind::Reg => {
                let list = inventory.list(bridge)?;
                inject::inject_into_matching_register(bridge, logger, list, "*", None)?;
            }
        }
    }

    Ok(())
}

/// Run a snapshot-scoped campaign: establish a known starting state,
/// inject (either untargeted, or pinned to one target/bit), let the guest
/// run for `observe_ns`, then restore if the snapshot was temporary.
pub fn run_snapshot_campaign(
    bridge: &dyn MonitorBridge,
    logger: &Logger,
    inventory: &RegisterInventory,
    params: &SnapshotCampaignParams,
) -> Result<(), HarnessError> {
    params.base.validate()?;

    let (tag, temporary) = match &params.snapshot_tag {
        Some(tag) => {
            bridge.hmp(&format!("loadvm {}", tag))?;
            println!("Load checkpoint {}", tag);
            (tag.clone(), false)
        }
        None => {
            let tag = format!("{:032x}", rand::thread_rng().gen::<u128>());
            bridge.hmp(&format!("savevm {}", tag))?;
            println!("Create a tmp checkpoint {}", tag);
            (tag, true)
        }
    };

    let result = run_snapshot_campaign_body(bridge, logger, inventory, params);

    println!("Observing VM {} ns", params.observe_ns);
    bridge::step(bridge, params.observe_ns)?;
    println!("time up.");

    if temporary {
        bridge.hmp(&format!("loadvm {}", tag))?;
        println!("Back to checkpoint {} finished.", tag);
        bridge.hmp(&format!("delvm {}", tag))?;
        println!("Delete tmp VM checkpoint");
    }

    bridge.send_serial(b"\r")?;

    result
}

fn run_snapshot_campaign_body(
    bridge: &dyn MonitorBridge,
    logger: &Logger,
    inventory: &RegisterInventory,
    params: &SnapshotCampaignParams,
) -> Result<(), HarnessError> {
    match &params.target {
        None => run_untargeted(bridge, logger, inventory, &params.base),
        Some((location, bit)) => {
            for _ in 0..params.base.count {
                let ns = rand::thread_rng().gen_range(params.base.min_ns..=params.base.max_ns);
                bridge::step(bridge, ns)?;

                match params.base.kind {
                    FaultKind::Ram => {
                        let address = parse_hex_address(location)?;
                        inject::inject_ram_bitflip(bridge, logger, address, 1, Some(*bit))?;
                    }
                    FaultKind::Reg => {
                        let list = inventory.list(bridge)?;
                        let descriptor = list.iter().find(|d| &d.name == location).ok_or_else(|| {
                            HarnessError::resolution(format!("no such register: {}", location))
                        })?;
                        // Mirrors the source's direct call: a read-only target simply
                        // logs nothing and the campaign moves on to the next iteration.
                        inject::inject_register_bitflip(bridge, logger, descriptor, Some(*bit))?;
                    }
                }
            }
            Ok(())
        }
    }
}

fn parse_hex_address(s: &str) -> Result<u64, HarnessError> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16)
        .map_err(|e| HarnessError::resolution(format!("error parsing RAM address {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridge;
    use crate::bridge::RegisterValue;

    const MTREE: &str = r#"FlatView #5
 AS "memory", root: system
 Root memory region: system
  0000000000000000-000000000003ffff (prio 0, ram): mach-virt.ram
"#;

    #[test]
    fn untargeted_ram_campaign_steps_and_injects_n_times() {
        let mut bridge = MockBridge::new();
        bridge.set_mtree_output(MTREE);
        bridge.seed_memory(0, &[0u8; 4]);
        for addr in 0..0x40000u64 {
            bridge.seed_memory(addr, &[0]);
        }
        let logger = Logger::unlogged();
        let inventory = RegisterInventory::new();

        let params = CampaignParams { count: 3, min_ns: 1_000_000, max_ns: 1_000_000, kind: FaultKind::Ram };
        run_untargeted(&bridge, &logger, &inventory, &params).unwrap();

        let steps = bridge.hmp_log().iter().filter(|c| c.starts_with("stop_delayed")).count();
        assert_eq!(steps, 3);
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let bridge = MockBridge::new();
        let logger = Logger::unlogged();
        let inventory = RegisterInventory::new();
        let params = CampaignParams { count: 1, min_ns: 10, max_ns: 5, kind: FaultKind::Ram };
        assert!(run_untargeted(&bridge, &logger, &inventory, &params).is_err());
    }

    #[test]
    fn snapshot_campaign_restores_temporary_state() {
        let mut bridge = MockBridge::new();
        bridge.set_mtree_output(MTREE);
        bridge.seed_memory(0x1000, &0xDEADBEEFu32.to_le_bytes());
        let logger = Logger::unlogged();
        let inventory = RegisterInventory::new();

        let params = SnapshotCampaignParams {
            base: CampaignParams { count: 2, min_ns: 1, max_ns: 1, kind: FaultKind::Ram },
            target: Some(("0x1000".to_string(), 1)),
            observe_ns: 1,
            snapshot_tag: None,
        };
        run_snapshot_campaign(&bridge, &logger, &inventory, &params).unwrap();

        // Temporary snapshot must have been restored, leaving memory untouched.
        let bytes = bridge.read_mem(0x1000, 4).unwrap();
        assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 0xDEADBEEF);
        assert_eq!(bridge.serial_output(), b"\r");
    }

    #[test]
    fn snapshot_campaign_with_tag_does_not_delete_it() {
        let mut bridge = MockBridge::new();
        bridge.set_mtree_output(MTREE);
        bridge.seed_register("x0", RegisterValue::Scalar(0));
        bridge.hmp("savevm keep").unwrap();
        let logger = Logger::unlogged();
        let inventory = RegisterInventory::new();

        let params = SnapshotCampaignParams {
            base: CampaignParams { count: 1, min_ns: 1, max_ns: 1, kind: FaultKind::Reg },
            target: Some(("x0".to_string(), 0)),
            observe_ns: 1,
            snapshot_tag: Some("keep".to_string()),
        };
        let inventory_descriptor = crate::registers::RegisterDescriptor {
            name: "x0".to_string(),
            byte_width: 8,
            class: crate::registers::RegisterClass::Scalar,
        };
        let _ = inventory_descriptor;
        // No registers in the inventory's bridge-backed list, but the explicit
        // target path still resolves "x0" because the mock's register_list is
        // queried once and cached; seed it before running.
        bridge.set_register_list(vec![("x0".to_string(), "long".to_string(), 8)]);
        run_snapshot_campaign(&bridge, &logger, &inventory, &params).unwrap();

        assert!(bridge.hmp_log().iter().any(|c| c == "loadvm keep"));
        assert!(!bridge.hmp_log().iter().any(|c| c.starts_with("delvm")));
    }

    #[test]
    fn validate_target_requires_both_or_neither() {
        assert!(validate_target(Some("0x1000"), None).is_err());
        assert!(validate_target(None, Some(1)).is_err());
        assert!(validate_target(None, None).unwrap().is_none());
        assert!(validate_target(Some("0x1000"), Some(1)).unwrap().is_some());
    }
}
