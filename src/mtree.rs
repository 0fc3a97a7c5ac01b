//! Parses the emulator monitor's `info mtree -f` report into a structured,
//! per-address-space flat view of memory ranges.

use std::collections::HashMap;
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

use crate::error::HarnessError;

/// An immutable, parsed memory-range line.
///
/// `end` is inclusive, as the monitor reports it; callers that need a byte
/// count should use `len()`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
    pub priority: i64,
    pub kind: String,
    pub name: String,
}

impl MemoryRange {
    /// Parse a single range line, e.g.
    /// `  0000000000000000-000000000000ffff (prio 0, i/o): io`.
    pub fn parse(line: &str) -> Result<Self, HarnessError> {
        let re = range_line_regex();
        let caps = re
            .captures(line.trim())
            .ok_or_else(|| HarnessError::user_input(format!("invalid memory range line: {:?}", line)))?;

        let start = u64::from_str_radix(&caps[1], 16)
            .map_err(|e| HarnessError::user_input(format!("bad start address in {:?}: {}", line, e)))?;
        let end = u64::from_str_radix(&caps[2], 16)
            .map_err(|e| HarnessError::user_input(format!("bad end address in {:?}: {}", line, e)))?;
        let priority = caps[3]
            .parse::<i64>()
            .map_err(|e| HarnessError::user_input(format!("bad priority in {:?}: {}", line, e)))?;
        let kind = caps[4].trim().to_string();
        let name = caps[5].to_string();

        if start > end {
            return Err(HarnessError::user_input(format!(
                "range start > end in {:?}",
                line
            )));
        }

        Ok(MemoryRange {
            start,
            end,
            priority,
            kind,
            name,
        })
    }

    /// Length in bytes, treating `end` as exclusive for arithmetic purposes.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

fn range_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^([0-9a-fA-F]+)-([0-9a-fA-F]+)\s+\(prio\s+(-?\d+),\s+([^)]+)\):\s+(\S+)"#)
            .expect("static regex is valid")
    })
}

fn is_memory_range_line(line: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"^\s*[0-9a-fA-F]+-[0-9a-fA-F]+\s+\(prio\s+-?\d+,\s+[^)]+\):\s+\S+"#)
            .expect("static regex is valid")
    });
    re.is_match(line)
}

/// An ordered sequence of `MemoryRange`s for one address space.
///
/// Duplicates are permitted: the monitor may legitimately repeat overlapping
/// regions at different priorities.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct FlatView {
    pub ranges: Vec<MemoryRange>,
}

impl FlatView {
    /// Parse a block of already-isolated range lines, skipping (and warning
    /// about) any line that doesn't parse.
    pub fn parse(lines: &[String]) -> Self {
        let mut fv = FlatView::default();
        for line in lines {
            match MemoryRange::parse(line) {
                Ok(range) => fv.ranges.push(range),
                Err(e) => log::warn!("skipping invalid memory range line: {}", e),
            }
        }
        fv
    }

    /// The `ram`-kinded ranges only, as `(start, end)` pairs.
    pub fn ram_ranges(&self) -> Vec<(u64, u64)> {
        self.ranges
            .iter()
            .filter(|r| r.kind == "ram")
            .map(|r| (r.start, r.end))
            .collect()
    }

    /// Draw a byte address uniformly at random from the union of RAM ranges.
    ///
    /// Follows the accumulate-and-subtract offset walk exactly, to stay
    /// faithful to the per-byte uniform distribution this has to provide.
    pub fn random_address(&self) -> Result<u64, HarnessError> {
        let ranges = self.ram_ranges();
        if ranges.is_empty() {
            return Err(HarnessError::resolution("no RAM ranges to sample from"));
        }

        let total: u64 = ranges.iter().map(|(start, end)| end - start).sum();
        if total == 0 {
            return Err(HarnessError::resolution("RAM ranges are all zero-width"));
        }

        let mut offset = rand::thread_rng().gen_range(0..total);
        for (start, end) in ranges {
            let width = end - start;
            if offset < width {
                return Ok(start + offset);
            }
            offset -= width;
        }

        unreachable!("offset must fall within one of the ranges");
    }
}

/// Mapping from address-space name (e.g. `"memory"`, `"I/O"`) to its flat view.
///
/// An address space whose FlatView rendered as `No rendered FlatView` is
/// absent from the map entirely.
pub type MemoryTree = HashMap<String, FlatView>;

/// Parse the full text response to `info mtree -f` into a `MemoryTree`.
pub fn parse_mtree(output: &str) -> MemoryTree {
    let lines: Vec<&str> = output.lines().collect();
    let mut views: HashMap<String, Vec<String>> = HashMap::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim_end();
        if line.starts_with("FlatView #") {
            i = parse_flatview_section(&lines, i + 1, &mut views);
        } else {
            if !line.trim().is_empty() {
                log::warn!("unexpected line in mtree output: {:?}", line);
            }
            i += 1;
        }
    }

    views
        .into_iter()
        .map(|(name, body)| (name, FlatView::parse(&body)))
        .collect()
}

fn parse_flatview_section(
    lines: &[&str],
    start: usize,
    views: &mut HashMap<String, Vec<String>>,
) -> usize {
    let mut i = start;
    let mut address_spaces: Vec<String> = Vec::new();

    while i < lines.len() {
        let line = lines[i].trim_end();

        if line.starts_with(" AS \"") {
            match extract_address_space_name(line) {
                Ok(name) => {
                    views.entry(name.clone()).or_default();
                    address_spaces.push(name);
                }
                Err(e) => {
                    log::error!("malformed AS line, dropping this flatview: {}", e);
                    // Hard error for this flatview only: skip forward to the next section.
                    for as_name in &address_spaces {
                        views.remove(as_name);
                    }
                    return skip_to_next_flatview(lines, i + 1);
                }
            }
        } else if line.starts_with(" Root ") {
            i += 1;
            break;
        } else if line.starts_with("FlatView #") {
            return i;
        }
        i += 1;
    }

    if i < lines.len() {
        let line = lines[i].trim_end();
        if line.trim_start().starts_with("No rendered FlatView") {
            for as_name in &address_spaces {
                views.remove(as_name);
            }
            i += 1;
        } else {
            while i < lines.len() {
                let line = lines[i].trim_end();
                if line.starts_with("  ") && is_memory_range_line(line) {
                    for as_name in &address_spaces {
                        views.get_mut(as_name).unwrap().push(line.to_string());
                    }
                } else if line.starts_with("FlatView #") || line.trim().is_empty() {
                    break;
                } else {
                    log::warn!("unexpected line in memory ranges: {:?}", line);
                }
                i += 1;
            }
        }
    }

    i
}

fn skip_to_next_flatview(lines: &[&str], mut i: usize) -> usize {
    while i < lines.len() && !lines[i].trim_end().starts_with("FlatView #") {
        i += 1;
    }
    i
}

fn extract_address_space_name(line: &str) -> Result<String, HarnessError> {
    if line.matches('"').count() != 2 {
        return Err(HarnessError::user_input(format!(
            "invalid AS line format: {:?}",
            line
        )));
    }
    Ok(line.splitn(3, '"').nth(1).unwrap().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"FlatView #0
 AS "I/O", root: io
 Root memory region: io
  0000000000000000-000000000000ffff (prio 0, i/o): io

FlatView #1
 AS "gpex-root", root: bus master container
 AS "pvpanic-pci", root: bus master container
 Root memory region: (none)
  No rendered FlatView

FlatView #2
 AS "virtio-pci-cfg-mem-as", root: virtio-pci
 Root memory region: virtio-pci
  0000008000004000-0000008000004fff (prio 0, i/o): virtio-pci-common-virtio-9p
  0000008000005000-0000008000005fff (prio 0, i/o): virtio-pci-isr-virtio-9p

FlatView #5
 AS "memory", root: system
 AS "cpu-memory-0", root: system
 Root memory region: system
  0000000000000000-0000000003ffffff (prio 0, romd): virt.flash0
  0000000004000000-0000000007ffffff (prio 0, romd): virt.flash1
  0000000040000000-000000013fffffff (prio 0, ram): mach-virt.ram
"#;

    #[test]
    fn parses_single_flatview() {
        let block = r#"FlatView #0
 AS "I/O", root: io
 Root memory region: io
  0000000000000000-000000000000ffff (prio 0, i/o): io
"#;
        let tree = parse_mtree(block);
        assert_eq!(tree.len(), 1);
        let fv = &tree["I/O"];
        assert_eq!(fv.ranges.len(), 1);
        assert_eq!(fv.ranges[0].start, 0x0);
        assert_eq!(fv.ranges[0].end, 0xffff);
        assert_eq!(fv.ranges[0].kind, "i/o");
        assert_eq!(fv.ranges[0].name, "io");
    }

    #[test]
    fn empty_flatview_drops_its_address_spaces() {
        let tree = parse_mtree(SAMPLE);
        assert!(!tree.contains_key("gpex-root"));
        assert!(!tree.contains_key("pvpanic-pci"));
    }

    #[test]
    fn shared_ranges_across_address_spaces() {
        let tree = parse_mtree(SAMPLE);
        assert_eq!(tree["memory"].ranges.len(), tree["cpu-memory-0"].ranges.len());
        assert_eq!(tree["memory"].ram_ranges(), vec![(0x40000000, 0x13fffffff)]);
    }

    #[test]
    fn invalid_range_line_is_skipped() {
        let lines = vec![
            "  0000000000000000-000000000000ffff (prio 0, i/o): io".to_string(),
            "invalid line".to_string(),
            "  0000000040000000-000000013fffffff (prio 0, ram): mach-virt.ram".to_string(),
        ];
        let fv = FlatView::parse(&lines);
        assert_eq!(fv.ranges.len(), 2);
    }

    #[test]
    fn random_address_stays_within_ram() {
        let tree = parse_mtree(SAMPLE);
        let fv = &tree["memory"];
        for _ in 0..500 {
            let addr = fv.random_address().unwrap();
            assert!(addr >= 0x40000000 && addr < 0x140000000);
        }
    }

    #[test]
    fn random_address_needs_ram() {
        let fv = FlatView::parse(&["  0000000000000000-000000000000ffff (prio 0, i/o): io".to_string()]);
        assert!(fv.random_address().is_err());
    }
}
