use core::fmt;

use anstyle::AnsiColor;
use log::{Level, LevelFilter, Metadata, Record};

/// Data structure to filter kernel messages
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

pub fn init() {
	log::set_logger(&LOGGER).expect("logger already registered");
	log::set_max_level(max_level());
}

fn max_level() -> LevelFilter {
	match crate::env::var("LOG_LEVEL") {
		Some("off") => LevelFilter::Off,
		Some("error") => LevelFilter::Error,
		Some("warn") => LevelFilter::Warn,
		Some("debug") => LevelFilter::Debug,
		Some("trace") => LevelFilter::Trace,
		_ => LevelFilter::Info,
	}
}

impl log::Log for KernelLogger {
	fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
		true
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			let core_id = crate::arch::x86_64::kernel::core_local::core_id();
			let level = ColorLevel(record.level());
			println!("[{core_id}][{level}] {}", record.args());
		}
	}

	fn flush(&self) {}
}

struct ColorLevel(Level);

impl fmt::Display for ColorLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let level = self.0;

		let color = match level {
			Level::Trace => AnsiColor::Magenta,
			Level::Debug => AnsiColor::Blue,
			Level::Info => AnsiColor::Green,
			Level::Warn => AnsiColor::Yellow,
			Level::Error => AnsiColor::Red,
		};

		let style = anstyle::Style::new().fg_color(Some(color.into()));
		write!(f, "{style}{level}{style:#}")
	}
}
