//! Logger installation.
//!
//! Messages go to stderr as `[LEVEL] target: message`. The verbosity is
//! fixed at startup: `Debug` with the `-d` flag, `Info` otherwise.

use std::io::Write;

use log::{Level, LevelFilter, Metadata, Record};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let level = match record.level() {
			Level::Error => "ERROR",
			Level::Warn => "WARN",
			Level::Info => "INFO",
			Level::Debug => "DEBUG",
			Level::Trace => "TRACE",
		};

		let mut stderr = std::io::stderr().lock();
		let _ = writeln!(
			stderr,
			"[{}] {}: {}",
			level,
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}

/// Install the logger. Must be called once, before any thread is spawned.
pub fn init(debug: bool) {
	let level = if debug {
		LevelFilter::Debug
	} else {
		LevelFilter::Info
	};

	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(level);
	}
}
