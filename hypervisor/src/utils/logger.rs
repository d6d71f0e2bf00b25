use crate::platform::Platform;
use alloc::{boxed::Box, format};
use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Forwards `log` records to the platform's debug output.
pub struct KernelLogger {
    platform: &'static dyn Platform,
    level: LevelFilter,
}

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = format!("{} - {}\n", record.level(), record.args());

            self.platform.debug_print(&message);
        }
    }

    fn flush(&self) {}
}

/// Installs the [`KernelLogger`]. Fails if another logger is already set.
pub fn init(platform: &'static dyn Platform, level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger = Box::leak(Box::new(KernelLogger { platform, level }));

    log::set_logger(logger).map(|()| log::set_max_level(level))
}
