//! Console logger for the monitor binary.
//!
//! Records go to stderr so they never interleave with monitor output on
//! stdout. The level comes from `COWMON_LOG` (error, warn, info, debug,
//! trace; default info).

use conquer_once::spin::OnceCell;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;
use std::io::{self, Stderr, Write};

/// Environment variable holding the log level.
pub const LOG_ENV: &str = "COWMON_LOG";

static LOGGER: OnceCell<ConsoleLogger> = OnceCell::uninit();

pub struct ConsoleLogger {
    level: LevelFilter,
    sink: Mutex<Stderr>,
}

impl ConsoleLogger {
    fn new(level: LevelFilter) -> Self {
        Self {
            level,
            sink: Mutex::new(io::stderr()),
        }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = self.sink.lock();
        // a failed write to stderr has nowhere else to go
        let _ = writeln!(
            sink,
            "[{:>5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = self.sink.lock().flush();
    }
}

/// Parse a level name, falling back to `Info`.
pub fn level_from(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Install the logger with the level from the environment.
pub fn init() -> Result<(), SetLoggerError> {
    let level = level_from(std::env::var(LOG_ENV).ok().as_deref());
    let logger = LOGGER.get_or_init(|| ConsoleLogger::new(level));
    log::set_logger(logger)?;
    log::set_max_level(level);
    log::debug!("Logger initialized at level {}", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from() {
        assert_eq!(level_from(None), LevelFilter::Info);
        assert_eq!(level_from(Some("debug")), LevelFilter::Debug);
        assert_eq!(level_from(Some(" TRACE ")), LevelFilter::Trace);
        assert_eq!(level_from(Some("loud")), LevelFilter::Info);
    }
}
