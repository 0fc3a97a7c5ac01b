//! The CPU register inventory: a session-scoped list of the registers whose
//! bitflips are architecturally meaningful and non-aliasing.

use std::sync::OnceLock;

use crate::bridge::MonitorBridge;
use crate::error::HarnessError;

/// How wide a register is and how it must be addressed for a bitflip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum RegisterClass {
    /// A 64-bit scalar (general-purpose register, pointer, or function pointer).
    Scalar,
    /// A 128-bit vector register (AArch64 `$v`/`$q` style), flipped one 64-bit half at a time.
    Vector128,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RegisterDescriptor {
    pub name: String,
    pub byte_width: u32,
    pub class: RegisterClass,
}

impl RegisterDescriptor {
    /// `min(8 * byte_width, 64)`: vector registers only ever flip 64 bits at a time.
    pub fn bitcount(&self) -> u32 {
        (8 * self.byte_width).min(64)
    }
}

/// Type strings the source's gdb frontend recognizes as "architecturally
/// meaningful and non-aliasing" on AArch64. Alternate architectures need
/// their own allow-list, but the abstraction (filter-by-type-string) is
/// the same.
pub(crate) const SCALAR_TYPES: &[&str] = &["long", "void *", "void (*)()"];
pub(crate) const VECTOR_TYPE: &str = "union aarch64v";

/// Session-lifetime cache of the register inventory.
///
/// Construction is idempotent: once discovered, the architecture's register
/// set never changes for the life of the debugger session, so the bridge is
/// only ever queried once. One `RegisterInventory` is meant to live for the
/// lifetime of one debugger session (see `commands::Session`).
#[derive(Default)]
pub struct RegisterInventory {
    cached: OnceLock<Vec<RegisterDescriptor>>,
}

impl RegisterInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// List all registers known to the bridge's current frame, keeping only
    /// the ones whose reported type matches the allow-list above.
    pub fn list(&self, bridge: &dyn MonitorBridge) -> Result<&[RegisterDescriptor], HarnessError> {
        if let Some(list) = self.cached.get() {
            return Ok(list);
        }

        let mut descriptors = Vec::new();
        for (name, type_str, byte_width) in bridge.list_registers()? {
            let class = if SCALAR_TYPES.contains(&type_str.as_str()) {
                RegisterClass::Scalar
            } else if type_str == VECTOR_TYPE {
                RegisterClass::Vector128
            } else {
                continue;
            };

            descriptors.push(RegisterDescriptor {
                name,
                byte_width,
                class,
            });
        }

        // A losing `set` just means another caller raced us to the same
        // deterministic inventory; either way `get` now returns it.
        let _ = self.cached.set(descriptors);
        Ok(self.cached.get().expect("just initialized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridge;

    #[test]
    fn filters_to_allowlisted_types() {
        let mut bridge = MockBridge::new();
        bridge.set_register_list(vec![
            ("x0".into(), "long".into(), 8),
            ("sp".into(), "void *".into(), 8),
            ("pc".into(), "void (*)()".into(), 8),
            ("v0".into(), "union aarch64v".into(), 16),
            ("fpsr".into(), "uint32_t".into(), 4),
        ]);

        let inventory = RegisterInventory::new();
        let list = inventory.list(&bridge).unwrap();
        let names: Vec<&str> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["x0", "sp", "pc", "v0"]);
        assert_eq!(list[3].class, RegisterClass::Vector128);
        assert_eq!(list[3].bitcount(), 64);
        assert_eq!(list[0].bitcount(), 64);
    }

    #[test]
    fn cached_after_first_call() {
        let mut bridge = MockBridge::new();
        bridge.set_register_list(vec![("x0".into(), "long".into(), 8)]);

        let inventory = RegisterInventory::new();
        assert_eq!(inventory.list(&bridge).unwrap().len(), 1);

        // Even if the bridge's answer would change, the cache wins.
        bridge.set_register_list(vec![]);
        assert_eq!(inventory.list(&bridge).unwrap().len(), 1);
    }
}
