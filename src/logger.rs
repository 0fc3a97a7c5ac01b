//! The injection log: a CSV sink that every `inject*` and campaign command
//! writes through, falling back to a human-readable stdout line when no
//! file has been configured.

use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use crate::error::HarnessError;
use crate::inject::InjectionRecord;

enum Sink {
    Csv(Mutex<csv::Writer<File>>),
    Stdout,
}

/// Logs `InjectionRecord`s either to a CSV file or to stdout.
///
/// Numeric fields are always rendered as hex strings in the CSV, matching
/// the rest of the harness's address/value formatting.
pub struct Logger {
    sink: Sink,
}

impl Logger {
    /// No file configured: records print to stdout instead.
    pub fn unlogged() -> Self {
        Logger { sink: Sink::Stdout }
    }

    /// Truncate (or create) `path` and write the header row. Subsequent
    /// `log` calls append.
    pub fn to_csv(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let file = File::create(path.as_ref())
            .map_err(|e| HarnessError::HostOs { pid: std::process::id() as i32, source: e })?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(["Address/Register", "Old Value", "New Value"])
            .map_err(|e| HarnessError::bridge(format!("failed to write CSV header: {}", e)))?;
        writer
            .flush()
            .map_err(|e| HarnessError::bridge(format!("failed to flush CSV header: {}", e)))?;
        Ok(Logger {
            sink: Sink::Csv(Mutex::new(writer)),
        })
    }

    pub fn log(&self, record: &InjectionRecord) {
        match &self.sink {
            Sink::Stdout => {
                println!(
                    "injected: target={} old=0x{:x} new=0x{:x}",
                    record.target, record.old_value, record.new_value
                );
            }
            Sink::Csv(writer) => {
                let mut writer = writer.lock().expect("logger mutex poisoned");
                let row = [
                    record.target.clone(),
                    format!("0x{:x}", record.old_value),
                    format!("0x{:x}", record.new_value),
                ];
                if let Err(e) = writer.write_record(&row) {
                    log::error!("failed to write injection record: {}", e);
                    return;
                }
                if let Err(e) = writer.flush() {
                    log::error!("failed to flush injection log: {}", e);
                }
            }
        }
    }
}

static GLOBAL: OnceLock<Logger> = OnceLock::new();

/// Install the process-wide logger. Must be called at most once, before
/// the first use of [`global`]; later calls are ignored.
pub fn install_global(logger: Logger) {
    let _ = GLOBAL.set(logger);
}

/// The process-wide logger, defaulting to stdout if `install_global` was
/// never called.
pub fn global() -> &'static Logger {
    GLOBAL.get_or_init(Logger::unlogged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_log_round_trips_through_the_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("mtfi-logger-test-{}.csv", std::process::id()));

        {
            let logger = Logger::to_csv(&path).unwrap();
            logger.log(&InjectionRecord {
                target: "0x1000".to_string(),
                old_value: 0xDEAD,
                new_value: 0xDEAF,
            });
            logger.log(&InjectionRecord {
                target: "x0".to_string(),
                old_value: 1,
                new_value: 0,
            });
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), "Address/Register,Old Value,New Value");
        assert_eq!(lines.next().unwrap(), "0x1000,0xdead,0xdeaf");
        assert_eq!(lines.next().unwrap(), "x0,0x1,0x0");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn reopening_truncates_previous_contents() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("mtfi-logger-truncate-{}.csv", std::process::id()));

        {
            let logger = Logger::to_csv(&path).unwrap();
            logger.log(&InjectionRecord {
                target: "0x1".to_string(),
                old_value: 0,
                new_value: 1,
            });
        }
        {
            let _logger = Logger::to_csv(&path).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        std::fs::remove_file(&path).ok();
    }
}
