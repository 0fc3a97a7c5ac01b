//! The `appinject` range-file format: one `0xHEX-0xHEX` interval per line,
//! inclusive start / exclusive end, byte granularity.

use std::fs;
use std::path::Path;

use rand::seq::SliceRandom;

use crate::bridge::MonitorBridge;
use crate::error::HarnessError;
use crate::inject;
use crate::logger::Logger;

/// Parse a range file into the flattened set of candidate byte addresses.
/// Blank and non-conforming lines are skipped with a warning.
pub fn parse_range_file(path: &Path) -> Result<Vec<u64>, HarnessError> {
    let text = fs::read_to_string(path).map_err(|e| HarnessError::HostOs {
        pid: std::process::id() as i32,
        source: e,
    })?;

    let mut addresses = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || !line.contains('-') {
            continue;
        }
        match parse_range_line(line) {
            Ok((start, end)) => addresses.extend(start..end),
            Err(e) => log::warn!("invalid line in range file: {:?} ({})", line, e),
        }
    }

    Ok(addresses)
}

fn parse_range_line(line: &str) -> Result<(u64, u64), HarnessError> {
    let (start_str, end_str) = line
        .split_once('-')
        .ok_or_else(|| HarnessError::user_input(format!("missing '-' in {:?}", line)))?;

    let start = parse_hex(start_str)?;
    let end = parse_hex(end_str)?;
    Ok((start, end))
}

fn parse_hex(s: &str) -> Result<u64, HarnessError> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| HarnessError::user_input(format!("bad hex value {:?}: {}", s, e)))
}

/// Pick `count` distinct addresses out of `addresses` and inject a one-byte
/// bitflip at each. A single address's injection failing is logged and does
/// not abort the rest of the run (matching the source's per-address `try`).
pub fn appinject(
    bridge: &dyn MonitorBridge,
    logger: &Logger,
    count: usize,
    addresses: &[u64],
) -> Result<(), HarnessError> {
    if addresses.is_empty() {
        return Err(HarnessError::resolution("No valid addresses found in file."));
    }
    if count > addresses.len() {
        return Err(HarnessError::resolution(format!(
            "Requested {} injections, but only {} addresses found.",
            count,
            addresses.len()
        )));
    }

    println!(
        "Performing {} bitflip injections from {} available addresses...",
        count,
        addresses.len()
    );

    let mut rng = rand::thread_rng();
    let targets: Vec<u64> = addresses.choose_multiple(&mut rng, count).copied().collect();

    for address in targets {
        if let Err(e) = inject::inject_ram_bitflip(bridge, logger, address, 1, None) {
            println!("Injection failed at 0x{:x}: {}", address, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridge;

    #[test]
    fn one_line_range_yields_four_addresses() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("mtfi-rangefile-test-{}.txt", std::process::id()));
        std::fs::write(&path, "0x1000-0x1004\n").unwrap();

        let addresses = parse_range_file(&path).unwrap();
        assert_eq!(addresses, vec![0x1000, 0x1001, 0x1002, 0x1003]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn invalid_lines_are_skipped() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("mtfi-rangefile-invalid-{}.txt", std::process::id()));
        std::fs::write(&path, "garbage\n0x2000-0x2002\n\n").unwrap();

        let addresses = parse_range_file(&path).unwrap();
        assert_eq!(addresses, vec![0x2000, 0x2001]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn appinject_rejects_over_large_request() {
        let bridge = MockBridge::new();
        let logger = Logger::unlogged();
        assert!(appinject(&bridge, &logger, 5, &[0x1000, 0x1001, 0x1002, 0x1003]).is_err());
    }

    #[test]
    fn appinject_injects_requested_count() {
        let bridge = MockBridge::new();
        for a in 0x1000u64..0x1004 {
            bridge.seed_memory(a, &[0]);
        }
        let logger = Logger::unlogged();
        appinject(&bridge, &logger, 2, &[0x1000, 0x1001, 0x1002, 0x1003]).unwrap();
    }
}
