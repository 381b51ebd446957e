//! Kernel logging facility
//!
//! Provides thread-safe logging functionality for the kernel using the `log` crate.
//! Log levels are configured based on build configuration (debug/release).

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Thread-safe logger implementation
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a new logger instance
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    /// Flush buffered logs (no-op in this implementation)
    fn flush(&self) {}
}

/// Initializes the logging system
///
/// # Arguments
/// * `cpu_id` - CPU core identifier. Only core 0 will initialize the logger
pub fn init(cpu_id: u32) {
    if cpu_id == 0 {
        let level = if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        log::set_logger(&LOGGER)
            .map(|()| log::set_max_level(level))
            .expect("Logger initialization failed");
    }
}
