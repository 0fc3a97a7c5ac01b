//! Standalone companion to the `mtfi` shell: resolve a workload's process
//! tree to the physical RAM pages backing it, so a range file can scope
//! `appinject` to one process instead of the whole guest.
//!
//! Mirrors the source's `find_phys_ranges.py`: match a `comm` name or a
//! cmdline substring, expand to all descendants, and print merged physical
//! page ranges.

use anyhow::{bail, Result};
use clap::{App, Arg};
use serde::Serialize;

use mtfi::pagemap;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("appinject-ranges")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Resolve a process tree's physical RAM pages for scoped fault injection")
        .arg(
            Arg::with_name("output-format")
                .help("The output format to use")
                .short("F")
                .long("format")
                .takes_value(true)
                .possible_values(&["text", "json"])
                .default_value("text"),
        )
        .arg(
            Arg::with_name("cmdline-keyword")
                .help("Match processes whose command line contains KEYWORD, instead of an exact comm name")
                .short("f")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("anon-only")
                .help("Restrict to anonymous read-write-private mappings (heap/stack) instead of every readable range")
                .long("anon-only"),
        )
        .arg(
            Arg::with_name("target")
                .help("Exact process name to match against /proc/<pid>/comm")
                .index(1),
        )
}

#[derive(Serialize)]
struct RangeOut {
    start: u64,
    end: u64,
}

fn run() -> Result<()> {
    let matches = app().get_matches();
    let anon_only = matches.is_present("anon-only");

    let (keyword, base_pids) = if let Some(keyword) = matches.value_of("cmdline-keyword") {
        (keyword.to_string(), pagemap::find_pids_by_cmdline_substring(keyword)?)
    } else if let Some(comm) = matches.value_of("target") {
        (comm.to_string(), pagemap::find_pids_by_name(comm)?)
    } else {
        bail!("Usage:\n  sudo appinject-ranges <comm>\n  sudo appinject-ranges -f <keyword_in_cmdline>");
    };

    if base_pids.is_empty() {
        bail!("No process found matching: {}", keyword);
    }

    let ranges = pagemap::collect_physical_ranges(&base_pids, anon_only)?;

    match matches.value_of("output-format").unwrap() {
        "json" => {
            let out: Vec<RangeOut> = ranges.into_iter().map(|(start, end)| RangeOut { start, end }).collect();
            serde_json::to_writer_pretty(std::io::stdout(), &out)?;
            println!();
        }
        "text" => {
            for (start, end) in ranges {
                println!("  0x{:016x}-0x{:016x}", start, end);
            }
        }
        _ => unreachable!(),
    }

    Ok(())
}

fn main() {
    env_logger::init();

    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("Please run as root.");
        std::process::exit(1);
    }

    if let Err(e) = run() {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
