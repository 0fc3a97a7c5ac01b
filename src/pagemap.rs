//! Host-side pagemap walker: resolves a process tree's virtual memory to
//! physical-page ranges, for confining fault injection to one workload.
//!
//! This is the library half of the `appinject-ranges` binary; process
//! discovery shells out to `ps` (matching the source's `subprocess.check_output`
//! calls) while `/proc/<pid>/maps` and `/proc/<pid>/pagemap` are read directly,
//! since those formats are kernel-stable.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::Command;

use regex::Regex;

use crate::error::HarnessError;

pub const PAGE_SIZE: u64 = 4096;
pub const PFN_MASK: u64 = (1u64 << 55) - 1;

/// One resolved virtual-to-physical page mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct PagemapEntry {
    pub vaddr: u64,
    pub paddr: u64,
}

fn run_ps(args: &[&str]) -> Result<String, HarnessError> {
    let output = Command::new("ps")
        .args(args)
        .output()
        .map_err(|e| HarnessError::bridge(format!("failed to run ps: {}", e)))?;
    String::from_utf8(output.stdout).map_err(|e| HarnessError::bridge(format!("non-UTF8 ps output: {}", e)))
}

/// Exact match of `comm` against `ps -eo pid,comm`.
pub fn find_pids_by_name(comm_name: &str) -> Result<Vec<i32>, HarnessError> {
    let output = run_ps(&["-eo", "pid,comm"])?;
    let mut pids = Vec::new();
    for line in output.lines().skip(1) {
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let (pid, comm) = match (parts.next(), parts.next()) {
            (Some(p), Some(c)) => (p, c.trim()),
            _ => continue,
        };
        if comm == comm_name {
            if let Ok(pid) = pid.parse() {
                pids.push(pid);
            }
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

/// Substring match against the full command line, excluding our own PID and
/// any process whose command line mentions our own executable's file name.
pub fn find_pids_by_cmdline_substring(keyword: &str) -> Result<Vec<i32>, HarnessError> {
    let current_pid = std::process::id() as i32;
    let self_name = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();

    let output = run_ps(&["-eo", "pid,args"])?;
    let mut pids = Vec::new();
    for line in output.lines().skip(1) {
        if !line.contains(keyword) {
            continue;
        }
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let (pid_str, cmdline) = match (parts.next(), parts.next()) {
            (Some(p), Some(c)) => (p, c),
            _ => continue,
        };
        let pid: i32 = match pid_str.parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        if pid == current_pid || (!self_name.is_empty() && cmdline.contains(&self_name)) {
            continue;
        }
        pids.push(pid);
    }
    pids.sort_unstable();
    Ok(pids)
}

/// Expand the root PID set to all descendants via BFS over the parent/child
/// relation read from `ps -eo pid,ppid`.
pub fn find_all_descendants(pids: &[i32]) -> Result<Vec<i32>, HarnessError> {
    let output = run_ps(&["-eo", "pid,ppid"])?;
    let mut children: std::collections::HashMap<i32, Vec<i32>> = std::collections::HashMap::new();
    for line in output.lines().skip(1) {
        let parts: Vec<&str> = line.trim().split_whitespace().collect();
        if parts.len() != 2 {
            continue;
        }
        if let (Ok(pid), Ok(ppid)) = (parts[0].parse::<i32>(), parts[1].parse::<i32>()) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut all: HashSet<i32> = pids.iter().copied().collect();
    let mut queue: VecDeque<i32> = pids.iter().copied().collect();
    while let Some(current) = queue.pop_front() {
        if let Some(kids) = children.get(&current) {
            for &child in kids {
                if all.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }

    let mut result: Vec<i32> = all.into_iter().collect();
    result.sort_unstable();
    Ok(result)
}

fn maps_line_regex() -> Regex {
    Regex::new(r"^([0-9a-f]+)-([0-9a-f]+)\s+([rwxps-]+)\s+[0-9a-f]+\s+[0-9a-f:]+\s+\d+\s*(.*)$")
        .expect("static regex is valid")
}

/// Select virtual-address ranges from `/proc/<pid>/maps`.
///
/// `anon_only`: restrict to anonymous, read-write-private ranges (workload
/// heap/stack); otherwise select every readable range.
pub fn parse_maps(pid: i32, anon_only: bool) -> Vec<(u64, u64)> {
    let path = format!("/proc/{}/maps", pid);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("failed to parse maps for PID {}: {}", pid, e);
            return Vec::new();
        }
    };

    let re = maps_line_regex();
    let mut ranges = Vec::new();
    for line in contents.lines() {
        let caps = match re.captures(line) {
            Some(c) => c,
            None => continue,
        };
        let start = u64::from_str_radix(&caps[1], 16).unwrap_or(0);
        let end = u64::from_str_radix(&caps[2], 16).unwrap_or(0);
        let perms = &caps[3];
        let pathname = caps[4].trim();

        let readable = perms.contains('r');
        if anon_only {
            if readable && perms.contains('w') && perms.contains('p') && pathname.is_empty() {
                ranges.push((start, end));
            }
        } else if readable {
            ranges.push((start, end));
        }
    }
    ranges
}

/// Resolve a set of page-aligned virtual addresses to physical pages via
/// `/proc/<pid>/pagemap`.
pub fn read_pagemap_entries(pid: i32, vaddrs: &[u64]) -> Vec<PagemapEntry> {
    let path = format!("/proc/{}/pagemap", pid);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            log::warn!("failed to read pagemap for PID {}: {}", pid, e);
            return Vec::new();
        }
    };

    let mut results = Vec::new();
    for &vaddr in vaddrs {
        let offset = (vaddr / PAGE_SIZE) * 8;
        if file.seek(SeekFrom::Start(offset)).is_err() {
            continue;
        }
        let mut buf = [0u8; 8];
        if file.read_exact(&mut buf).is_err() {
            continue;
        }
        let entry = u64::from_le_bytes(buf);
        let present = (entry >> 63) & 1;
        let pfn = entry & PFN_MASK;
        if present != 0 && pfn != 0 {
            results.push(PagemapEntry { vaddr, paddr: pfn * PAGE_SIZE });
        }
    }
    results
}

/// Every page-aligned virtual address backing `pid`'s selected ranges,
/// resolved to its physical page.
pub fn physical_pages_for_pid(pid: i32, anon_only: bool) -> Vec<PagemapEntry> {
    let mut vaddrs = Vec::new();
    for (start, end) in parse_maps(pid, anon_only) {
        let mut addr = start;
        while addr < end {
            vaddrs.push(addr);
            addr += PAGE_SIZE;
        }
    }
    read_pagemap_entries(pid, &vaddrs)
}

/// Merge adjacent `[start, end)` intervals where `interval_i.end == interval_{i+1}.start`.
pub fn merge_ranges(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    if ranges.is_empty() {
        return ranges;
    }
    ranges.sort_unstable();
    let mut merged = vec![ranges[0]];
    for &(start, end) in &ranges[1..] {
        let last = merged.last_mut().unwrap();
        if start == last.1 {
            last.1 = end;
        } else {
            merged.push((start, end));
        }
    }
    merged
}

/// Full walk: resolve the base PID set, expand to descendants, collect every
/// unique physical page backing the selection, and merge adjacent pages.
pub fn collect_physical_ranges(base_pids: &[i32], anon_only: bool) -> Result<Vec<(u64, u64)>, HarnessError> {
    let all_pids = find_all_descendants(base_pids)?;

    let mut all_phys: HashSet<(u64, u64)> = HashSet::new();
    for pid in all_pids {
        for entry in physical_pages_for_pid(pid, anon_only) {
            all_phys.insert((entry.paddr, entry.paddr + PAGE_SIZE));
        }
    }

    Ok(merge_ranges(all_phys.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_ranges_joins_adjacent_pages() {
        let ranges = vec![(0x1000, 0x2000), (0x2000, 0x3000), (0x5000, 0x6000)];
        let merged = merge_ranges(ranges);
        assert_eq!(merged, vec![(0x1000, 0x3000), (0x5000, 0x6000)]);
    }

    #[test]
    fn merge_ranges_handles_out_of_order_input() {
        let ranges = vec![(0x5000, 0x6000), (0x1000, 0x2000), (0x2000, 0x3000)];
        let merged = merge_ranges(ranges);
        assert_eq!(merged, vec![(0x1000, 0x3000), (0x5000, 0x6000)]);
    }

    #[test]
    fn merge_ranges_empty_input() {
        assert_eq!(merge_ranges(Vec::new()), Vec::new());
    }

    #[test]
    fn pagemap_entry_requires_present_and_nonzero_pfn() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("mtfi-pagemap-test-{}", std::process::id()));

        // Build a fake pagemap: page 0 absent, page 1 present with pfn=5, page 2 present but pfn=0.
        let mut data = Vec::new();
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&((1u64 << 63) | 5).to_le_bytes());
        data.extend_from_slice(&(1u64 << 63).to_le_bytes());
        std::fs::write(&path, &data).unwrap();

        // Can't easily fake /proc/<pid>/pagemap, so just exercise the bit math directly.
        let entry = u64::from_le_bytes(data[8..16].try_into().unwrap());
        assert_eq!((entry >> 63) & 1, 1);
        assert_eq!(entry & PFN_MASK, 5);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn maps_regex_parses_readable_and_anon_segments() {
        let line = "00400000-00401000 r-xp 00000000 08:01 123456 /bin/true";
        let caps = maps_line_regex().captures(line).unwrap();
        assert_eq!(&caps[1], "00400000");
        assert_eq!(&caps[3], "r-xp");

        let anon_line = "7f0000000000-7f0000001000 rw-p 00000000 00:00 0 ";
        let caps2 = maps_line_regex().captures(anon_line).unwrap();
        assert_eq!(caps2[4].trim(), "");
    }
}
