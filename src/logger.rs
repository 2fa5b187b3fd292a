use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use log::{LevelFilter, Log, Metadata, Record};

use crate::config::SimError;

/// Log sink writing pipeline event lines to the configured logfile. The
/// effective verbosity is adjusted over the run through `log::set_max_level`
/// so logging can be switched on at a configured iteration.
pub struct FileLogger {
    writer: Mutex<LineWriter<File>>,
}

impl Log for FileLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut writer = self.writer.lock().unwrap();
        let _ = writeln!(writer, "{}", record.args());
    }

    fn flush(&self) {
        let _ = self.writer.lock().unwrap().flush();
    }
}

pub fn level_for(loglevel: u64) -> LevelFilter {
    match loglevel {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

pub fn init(path: &Path, loglevel: u64) -> Result<(), SimError> {
    let file = File::create(path)?;
    let logger = FileLogger {
        writer: Mutex::new(LineWriter::new(file)),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(level_for(loglevel));
    }
    Ok(())
}
