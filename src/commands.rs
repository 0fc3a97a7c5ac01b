//! The debugger-shell command registry: binds command names to parameter
//! schemas and handlers, and drives the read-eval loop.

use std::io::{self, BufRead, Write};
use std::time::Instant;

use crate::args::{self, ParamSpec, ParamType, ParsedArgs, Schema};
use crate::bridge::MonitorBridge;
use crate::campaign::{self, CampaignParams, FaultKind, SnapshotCampaignParams};
use crate::inject;
use crate::logger;
use crate::mtree;
use crate::rangefile;
use crate::registers::RegisterInventory;

/// One debugger session: the bridge to the emulator and its session-lifetime
/// register inventory. The logger is the process-wide singleton (§4.I).
pub struct Session {
    pub bridge: Box<dyn MonitorBridge>,
    pub inventory: RegisterInventory,
}

impl Session {
    pub fn new(bridge: Box<dyn MonitorBridge>) -> Self {
        Session { bridge, inventory: RegisterInventory::new() }
    }
}

pub struct CommandSpec {
    pub name: &'static str,
    pub doc: &'static str,
    pub handler: fn(&Session, &[CommandSpec], &str),
}

/// Build the command table. Constructed once at startup, the way the source
/// builds its `@BuildCmd`-decorated set of gdb user commands.
pub fn registry() -> Vec<CommandSpec> {
    vec![
        CommandSpec { name: "listram", doc: "List all RAM ranges allocated by the guest.", handler: cmd_listram },
        CommandSpec { name: "listreg", doc: "List all CPU registers available in the guest.", handler: cmd_listreg },
        CommandSpec {
            name: "stop_delayed",
            doc: "Stop the guest after a delay of the input nanoseconds.",
            handler: cmd_stop_delayed,
        },
        CommandSpec { name: "inject", doc: "Inject a bitflip at an address.", handler: cmd_inject },
        CommandSpec { name: "inject_reg", doc: "Inject a bitflip into a register.", handler: cmd_inject_reg },
        CommandSpec { name: "loginject", doc: "Log the injection of a bitflip to a CSV file.", handler: cmd_loginject },
        CommandSpec {
            name: "autoinject",
            doc: "Automatically inject faults into the guest according to the provided fault type.",
            handler: cmd_autoinject,
        },
        CommandSpec {
            name: "snapinject",
            doc: "Snapshot the guest, inject faults, observe, then restore the snapshot.",
            handler: cmd_snapinject,
        },
        CommandSpec { name: "loop", doc: "Loop an action for the specified number of times.", handler: cmd_loop },
        CommandSpec {
            name: "appinject",
            doc: "Inject bitflips at addresses loaded from a range file.",
            handler: cmd_appinject,
        },
    ]
}

/// Look up `name` in `table` and invoke its handler with `args_str`.
/// Unknown commands print a diagnostic; they never abort the session.
pub fn dispatch(session: &Session, table: &[CommandSpec], name: &str, args_str: &str) {
    match table.iter().find(|c| c.name == name) {
        Some(spec) => (spec.handler)(session, table, args_str),
        None => println!("Unknown command: {:?}", name),
    }
}

/// Read commands from stdin, one per line, until EOF or `quit`.
pub fn run_shell(session: &Session, table: &[CommandSpec]) {
    let stdin = io::stdin();
    loop {
        print!("(mtfi) ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                println!("Error reading command: {}", e);
                break;
            }
        }

        let (name, rest) = args::split_leading_word(&line);
        if name.is_empty() {
            continue;
        }
        if name == "quit" || name == "exit" {
            break;
        }
        if name == "help" {
            for spec in table {
                println!("{:16} {}", spec.name, spec.doc);
            }
            continue;
        }

        dispatch(session, table, name, rest);
    }
}

// --bytewidth is required only when --address is given (fixed at 1 on the
// random-address path); the schema can't express that conditional, so
// cmd_inject enforces it itself after parsing.
const INJECT_SCHEMA: Schema = Schema {
    params: &[
        ParamSpec { name: "address", ty: ParamType::Str, required: false },
        ParamSpec { name: "bytewidth", ty: ParamType::Int, required: false },
        ParamSpec { name: "bit", ty: ParamType::Int, required: false },
    ],
    variadic: None,
};

const INJECT_REG_SCHEMA: Schema = Schema {
    params: &[
        ParamSpec { name: "register", ty: ParamType::Str, required: true },
        ParamSpec { name: "bit", ty: ParamType::Int, required: false },
    ],
    variadic: None,
};

const STOP_DELAYED_SCHEMA: Schema = Schema {
    params: &[ParamSpec { name: "ns", ty: ParamType::Duration, required: true }],
    variadic: None,
};

const LOGINJECT_SCHEMA: Schema = Schema {
    params: &[ParamSpec { name: "filename", ty: ParamType::Str, required: true }],
    variadic: None,
};

const AUTOINJECT_SCHEMA: Schema = Schema {
    params: &[
        ParamSpec { name: "total-fault-number", ty: ParamType::Int, required: true },
        ParamSpec { name: "min-interval", ty: ParamType::Duration, required: true },
        ParamSpec { name: "max-interval", ty: ParamType::Duration, required: true },
        ParamSpec { name: "fault-type", ty: ParamType::Choice(&["ram", "reg"]), required: true },
    ],
    variadic: None,
};

const SNAPINJECT_SCHEMA: Schema = Schema {
    params: &[
        ParamSpec { name: "total-fault-number", ty: ParamType::Int, required: true },
        ParamSpec { name: "min-interval", ty: ParamType::Duration, required: true },
        ParamSpec { name: "max-interval", ty: ParamType::Duration, required: true },
        ParamSpec { name: "fault-type", ty: ParamType::Choice(&["ram", "reg"]), required: true },
        ParamSpec { name: "fault-location", ty: ParamType::Str, required: false },
        ParamSpec { name: "bit-index", ty: ParamType::Int, required: false },
        ParamSpec { name: "observe-time", ty: ParamType::Duration, required: true },
        ParamSpec { name: "snapshot-tag", ty: ParamType::Str, required: false },
    ],
    variadic: None,
};

const LOOP_SCHEMA: Schema = Schema {
    params: &[
        ParamSpec { name: "times", ty: ParamType::Int, required: true },
        ParamSpec { name: "command", ty: ParamType::Str, required: true },
    ],
    variadic: Some("command-args"),
};

const APPINJECT_SCHEMA: Schema = Schema {
    params: &[
        ParamSpec { name: "total-fault-number", ty: ParamType::Int, required: true },
        ParamSpec { name: "range-file", ty: ParamType::Str, required: true },
    ],
    variadic: None,
};

/// `--total-fault-number` must be a positive count that fits in a `u32`; the
/// source asserts `times >= 1` (fliputils.py) before ever spinning up a loop.
fn fault_count(parsed: &ParsedArgs) -> Option<u32> {
    let n = parsed.int("total-fault-number").expect("required");
    if n < 1 {
        println!("Error: fatal: times < 1");
        return None;
    }
    if n > u32::MAX as i64 {
        println!("Error: fatal: times too large");
        return None;
    }
    Some(n as u32)
}

fn cmd_listram(session: &Session, _table: &[CommandSpec], _args: &str) {
    let output = match session.bridge.hmp("info mtree -f") {
        Ok(o) => o,
        Err(e) => {
            println!("Error: {}", e);
            return;
        }
    };
    let tree = mtree::parse_mtree(&output);
    let memory = match tree.get("memory") {
        Some(m) => m,
        None => {
            println!("Error: no \"memory\" address space in mtree output");
            return;
        }
    };

    println!("QEMU RAM list:");
    for (start, end) in memory.ram_ranges() {
        println!("  RAM allocated from 0x{:x} to 0x{:x}", start, end);
    }
    match memory.random_address() {
        Ok(addr) => println!("Sampled index: 0x{:x}", addr),
        Err(e) => println!("Error: {}", e),
    }
}

fn cmd_listreg(session: &Session, _table: &[CommandSpec], _args: &str) {
    let list = match session.inventory.list(session.bridge.as_ref()) {
        Ok(l) => l,
        Err(e) => {
            println!("Error: {}", e);
            return;
        }
    };

    println!("QEMU CPU register list:");
    let maxlen = list.iter().map(|d| d.name.len()).max().unwrap_or(0);
    println!("  REG: {:>width$} -> Bytes", "Name", width = maxlen);
    for descriptor in list {
        println!("  REG: {:>width$} -> {}", descriptor.name, descriptor.byte_width, width = maxlen);
    }
}

fn cmd_stop_delayed(session: &Session, _table: &[CommandSpec], args_str: &str) {
    let parsed = match args::parse(&STOP_DELAYED_SCHEMA, args_str) {
        Ok(p) => p,
        Err(_) => return,
    };
    let ns = parsed.duration("ns").expect("required");
    if let Err(e) = crate::bridge::step(session.bridge.as_ref(), ns.as_nanos()) {
        println!("Error: {}", e);
    }
}

fn cmd_inject(session: &Session, _table: &[CommandSpec], args_str: &str) {
    let parsed = match args::parse(&INJECT_SCHEMA, args_str) {
        Ok(p) => p,
        Err(_) => return,
    };
    let bit = parsed.int("bit").map(|b| b as u32);

    let (address, bytewidth) = if let Some(expr) = parsed.str("address") {
        let address = match session.bridge.eval(expr) {
            Ok(a) => a,
            Err(e) => {
                println!("Error parsing address: {}", e);
                return;
            }
        };
        let bytewidth = match parsed.int("bytewidth") {
            Some(w) => w,
            None => {
                println!("the following arguments are required: --bytewidth");
                return;
            }
        };
        if bytewidth < 1 {
            println!("invalid bytewidth or address");
            return;
        }
        (address, bytewidth as u32)
    } else {
        let output = match session.bridge.hmp("info mtree -f") {
            Ok(o) => o,
            Err(e) => {
                println!("Error: {}", e);
                return;
            }
        };
        let tree = mtree::parse_mtree(&output);
        let addr = match tree.get("memory").map(|m| m.random_address()) {
            Some(Ok(a)) => a,
            Some(Err(e)) => {
                println!("Error: {}", e);
                return;
            }
            None => {
                println!("Error: no \"memory\" address space in mtree output");
                return;
            }
        };
        (addr, 1)
    };

    if let Err(e) = inject::inject_ram_bitflip(session.bridge.as_ref(), logger::global(), address, bytewidth, bit) {
        println!("Error: {}", e);
    }
}

fn cmd_inject_reg(session: &Session, _table: &[CommandSpec], args_str: &str) {
    let parsed = match args::parse(&INJECT_REG_SCHEMA, args_str) {
        Ok(p) => p,
        Err(_) => return,
    };
    let register = parsed.str("register").expect("required");
    let bit = parsed.int("bit").map(|b| b as u32);

    let list = match session.inventory.list(session.bridge.as_ref()) {
        Ok(l) => l,
        Err(e) => {
            println!("Error: {}", e);
            return;
        }
    };

    if let Err(e) = inject::inject_into_matching_register(session.bridge.as_ref(), logger::global(), list, register, bit) {
        println!("Error: {}", e);
    }
}

fn cmd_loginject(_session: &Session, _table: &[CommandSpec], args_str: &str) {
    let parsed = match args::parse(&LOGINJECT_SCHEMA, args_str) {
        Ok(p) => p,
        Err(_) => return,
    };
    let filename = parsed.str("filename").expect("required");
    match logger::Logger::to_csv(filename) {
        Ok(l) => logger::install_global(l),
        Err(e) => println!("Error: {}", e),
    }
}

fn cmd_autoinject(session: &Session, _table: &[CommandSpec], args_str: &str) {
    let parsed = match args::parse(&AUTOINJECT_SCHEMA, args_str) {
        Ok(p) => p,
        Err(_) => return,
    };
    let count = match fault_count(&parsed) {
        Some(c) => c,
        None => return,
    };
    let kind = if parsed.str("fault-type") == Some("ram") { FaultKind::Ram } else { FaultKind::Reg };
    let params = CampaignParams {
        count,
        min_ns: parsed.duration("min-interval").expect("required").as_nanos(),
        max_ns: parsed.duration("max-interval").expect("required").as_nanos(),
        kind,
    };

    let start = Instant::now();
    if let Err(e) = campaign::run_untargeted(session.bridge.as_ref(), logger::global(), &session.inventory, &params) {
        println!("Error: {}", e);
        return;
    }
    println!("Total injection duration: {:.3} s", start.elapsed().as_secs_f64());
}

fn cmd_snapinject(session: &Session, _table: &[CommandSpec], args_str: &str) {
    let parsed = match args::parse(&SNAPINJECT_SCHEMA, args_str) {
        Ok(p) => p,
        Err(_) => return,
    };

    let target = match campaign::validate_target(
        parsed.str("fault-location"),
        parsed.int("bit-index").map(|b| b as u32),
    ) {
        Ok(t) => t,
        Err(e) => {
            println!("Error: {}", e);
            return;
        }
    };

    let count = match fault_count(&parsed) {
        Some(c) => c,
        None => return,
    };
    let kind = if parsed.str("fault-type") == Some("ram") { FaultKind::Ram } else { FaultKind::Reg };
    let params = SnapshotCampaignParams {
        base: CampaignParams {
            count,
            min_ns: parsed.duration("min-interval").expect("required").as_nanos(),
            max_ns: parsed.duration("max-interval").expect("required").as_nanos(),
            kind,
        },
        target,
        observe_ns: parsed.duration("observe-time").expect("required").as_nanos(),
        snapshot_tag: parsed.str("snapshot-tag").map(|s| s.to_string()),
    };

    let start = Instant::now();
    if let Err(e) =
        campaign::run_snapshot_campaign(session.bridge.as_ref(), logger::global(), &session.inventory, &params)
    {
        println!("Error: {}", e);
        return;
    }
    println!("Total injection duration: {:.3} s", start.elapsed().as_secs_f64());
}

fn cmd_loop(session: &Session, table: &[CommandSpec], args_str: &str) {
    let parsed = match args::parse(&LOOP_SCHEMA, args_str) {
        Ok(p) => p,
        Err(_) => return,
    };
    let times = parsed.int("times").expect("required");
    let mut full_command = parsed.str("command").expect("required").to_string();
    if !parsed.variadic.is_empty() {
        full_command.push(' ');
        full_command.push_str(&parsed.variadic.join(" "));
    }

    for _ in 0..times {
        let (name, rest) = args::split_leading_word(&full_command);
        dispatch(session, table, name, rest);
    }
}

fn cmd_appinject(session: &Session, _table: &[CommandSpec], args_str: &str) {
    let parsed = match args::parse(&APPINJECT_SCHEMA, args_str) {
        Ok(p) => p,
        Err(_) => return,
    };
    let count = parsed.int("total-fault-number").expect("required");
    if count <= 0 {
        println!("Invalid count");
        return;
    }
    let path = parsed.str("range-file").expect("required");

    let addresses = match rangefile::parse_range_file(std::path::Path::new(path)) {
        Ok(a) => a,
        Err(e) => {
            println!("Error: {}", e);
            return;
        }
    };

    if let Err(e) = rangefile::appinject(session.bridge.as_ref(), logger::global(), count as usize, &addresses) {
        println!("{}", e);
    }
}
