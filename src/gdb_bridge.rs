//! A `MonitorBridge` adapter that drives a real session by shelling out to
//! `gdb` and scripting it over its plain console interpreter, the way the
//! source ran as a gdb-loaded Python extension attached to QEMU's gdbstub.
//!
//! This is the one piece of the harness that talks to a live transport
//! (§1's "debugger/monitor transport" is explicitly out of scope for the
//! core's design, but the `mtfi` binary still needs *some* adapter to be
//! runnable end to end). Every command is scripted as a single `gdb -ex`
//! round trip followed by a sentinel `echo`, so we can tell where gdb's
//! reply ends without depending on its prompt string.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Mutex;

use crate::bridge::{MonitorBridge, RegisterValue};
use crate::error::HarnessError;
use crate::registers::{SCALAR_TYPES, VECTOR_TYPE};

const SENTINEL: &str = "__MTFI_COMMAND_DONE__";

pub struct GdbProcessBridge {
    _child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<std::process::ChildStdout>>,
}

impl GdbProcessBridge {
    /// Spawn `gdb_path` and connect it to `remote` (e.g. `"localhost:1234"`,
    /// QEMU's `-gdb tcp::1234` stub).
    pub fn spawn(gdb_path: &str, remote: &str) -> Result<Self, HarnessError> {
        let mut child = Command::new(gdb_path)
            .args(["-q", "-nx", "--interpreter=console"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HarnessError::bridge(format!("failed to spawn {:?}: {}", gdb_path, e)))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let bridge = GdbProcessBridge {
            _child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
        };

        bridge.exec(&format!("target remote {}", remote))?;
        Ok(bridge)
    }

    /// Send one gdb console command and collect its output up to (but not
    /// including) the sentinel line that marks the end of this round trip.
    fn exec(&self, cmd: &str) -> Result<String, HarnessError> {
        {
            let mut stdin = self.stdin.lock().expect("gdb stdin mutex poisoned");
            writeln!(stdin, "{}", cmd)
                .and_then(|_| writeln!(stdin, "echo {}\\n", SENTINEL))
                .and_then(|_| stdin.flush())
                .map_err(|e| HarnessError::bridge(format!("failed to write to gdb: {}", e)))?;
        }

        let mut reader = self.stdout.lock().expect("gdb stdout mutex poisoned");
        let mut out = String::new();
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .map_err(|e| HarnessError::bridge(format!("failed to read from gdb: {}", e)))?;
            if n == 0 {
                return Err(HarnessError::bridge("gdb closed its output stream"));
            }
            if line.trim_end() == SENTINEL {
                break;
            }
            out.push_str(&line);
        }
        Ok(out.trim_end().to_string())
    }

    fn print_value(&self, expr: &str) -> Result<i64, HarnessError> {
        let out = self.exec(&format!("print {}", expr))?;
        let value = out
            .rsplit('=')
            .next()
            .ok_or_else(|| HarnessError::bridge(format!("unparsable gdb output: {:?}", out)))?
            .trim();
        value
            .parse::<i64>()
            .map_err(|e| HarnessError::bridge(format!("unparsable gdb value {:?}: {}", value, e)))
    }
}

impl MonitorBridge for GdbProcessBridge {
    fn hmp(&self, cmd: &str) -> Result<String, HarnessError> {
        self.exec(&format!("monitor {}", cmd))
    }

    fn read_mem(&self, addr: u64, len: usize) -> Result<Vec<u8>, HarnessError> {
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            let v = self.print_value(&format!("*(unsigned char *)({} + {})", addr, i))?;
            bytes.push(v as u8);
        }
        Ok(bytes)
    }

    fn write_mem(&self, addr: u64, data: &[u8]) -> Result<(), HarnessError> {
        for (i, byte) in data.iter().enumerate() {
            self.exec(&format!("set variable *(unsigned char *)({} + {}) = {}", addr, i, byte))?;
        }
        Ok(())
    }

    fn read_reg(&self, name: &str) -> Result<RegisterValue, HarnessError> {
        let type_str = self.exec(&format!("ptype ${}", name))?;
        if type_str.contains(VECTOR_TYPE) {
            let low = self.print_value(&format!("((int64_t[2])${})[0]", name))?;
            let high = self.print_value(&format!("((int64_t[2])${})[1]", name))?;
            Ok(RegisterValue::Vector([low as u64, high as u64]))
        } else {
            let v = self.print_value(&format!("${}", name))?;
            Ok(RegisterValue::Scalar(v as u64))
        }
    }

    fn write_reg(&self, name: &str, value: RegisterValue) -> Result<(), HarnessError> {
        match value {
            RegisterValue::Scalar(v) => {
                self.exec(&format!("set ${} = {}", name, v as i64))?;
            }
            RegisterValue::Vector([low, high]) => {
                self.exec(&format!("set ((int64_t[2])${})[0] = {}", name, low as i64))?;
                self.exec(&format!("set ((int64_t[2])${})[1] = {}", name, high as i64))?;
            }
        }
        Ok(())
    }

    fn eval(&self, expr: &str) -> Result<u64, HarnessError> {
        let out = self.exec(&format!("print/x {}", expr))?;
        let hex = out
            .rsplit('=')
            .next()
            .ok_or_else(|| HarnessError::bridge(format!("unparsable gdb output: {:?}", out)))?
            .trim()
            .trim_start_matches("0x");
        u64::from_str_radix(hex, 16)
            .map_err(|e| HarnessError::resolution(format!("bad address expression {:?}: {}", expr, e)))
    }

    fn send_serial(&self, bytes: &[u8]) -> Result<(), HarnessError> {
        let text = String::from_utf8_lossy(bytes);
        self.hmp(&format!("sendkey {}", text)).map(|_| ())
    }

    fn list_registers(&self) -> Result<Vec<(String, String, u32)>, HarnessError> {
        let info = self.exec("info registers")?;
        let mut out = Vec::new();
        for line in info.lines() {
            let name = match line.split_whitespace().next() {
                Some(n) => n,
                None => continue,
            };
            let type_str = self.exec(&format!("ptype ${}", name))?;
            let type_str = type_str.trim_start_matches("type = ").trim().to_string();
            if !SCALAR_TYPES.contains(&type_str.as_str()) && type_str != VECTOR_TYPE {
                continue;
            }
            let width = if type_str == VECTOR_TYPE { 16 } else { 8 };
            out.push((name.to_string(), type_str, width));
        }
        Ok(out)
    }
}
