use anyhow::{Context, Result};
use clap::{App, Arg};

use mtfi::commands::{self, Session};
use mtfi::gdb_bridge::GdbProcessBridge;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("gdb")
                .help("Path to the gdb binary to drive")
                .long("gdb")
                .takes_value(true)
                .default_value("gdb"),
        )
        .arg(
            Arg::with_name("remote")
                .help("The gdbstub address to attach to, e.g. a QEMU `-gdb tcp::1234` endpoint")
                .long("remote")
                .takes_value(true)
                .default_value("localhost:1234"),
        )
}

fn run() -> Result<()> {
    let matches = app().get_matches();
    let gdb_path = matches.value_of("gdb").expect("has default");
    let remote = matches.value_of("remote").expect("has default");

    let bridge = GdbProcessBridge::spawn(gdb_path, remote)
        .with_context(|| format!("failed to attach {} to {}", gdb_path, remote))?;

    let session = Session::new(Box::new(bridge));
    let table = commands::registry();
    commands::run_shell(&session, &table);

    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}
