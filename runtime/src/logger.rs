use std::time::SystemTime;

use log::{Level, LevelFilter};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

pub struct Logger;

impl log::Log for Logger {
	fn enabled(&self, _: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		let time = humantime::format_rfc3339_nanos(SystemTime::now());

		let dim = Style::new().dimmed().prefix();

		eprintln!(
			"{dim}{time}{RESET} {}{:5}{RESET} {}{}{RESET}{dim}:{RESET} {}",
			match record.level() {
				Level::Trace => Color::Purple,
				Level::Debug => Color::Blue,
				Level::Info => Color::Green,
				Level::Warn => Color::Yellow,
				Level::Error => Color::Red,
			}
			.bold()
			.prefix(),
			record.level(),
			Style::new().bold().prefix(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}

/// Install the logger. Safe to call more than once; later calls lose.
pub fn init(level: LevelFilter) {
	if log::set_logger(&Logger).is_ok() {
		log::set_max_level(level);
	}
}

/// Install the logger with the level taken from `RUST_LOG` (a bare level
/// name), defaulting to `info`.
pub fn init_from_env() {
	let level = std::env::var("RUST_LOG")
		.ok()
		.and_then(|v| v.parse().ok())
		.unwrap_or(LevelFilter::Info);
	init(level);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn init_is_idempotent() {
		init(LevelFilter::Debug);
		init(LevelFilter::Trace);
		log::info!("logger up");
	}
}
