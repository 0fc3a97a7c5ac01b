//! Core library for the fault-injection harness: memory-tree parsing,
//! register inventory, injection primitives, the campaign engine, and the
//! host-side pagemap walker. The `mtfi` and `appinject-ranges` binaries are
//! thin wiring over this crate.

pub mod args;
pub mod bridge;
pub mod campaign;
pub mod commands;
pub mod duration;
pub mod error;
pub mod gdb_bridge;
pub mod inject;
pub mod logger;
pub mod mtree;
pub mod pagemap;
pub mod rangefile;
pub mod registers;
