use std::time::{Duration, Instant, SystemTime};

/// A monotonic clock anchored at creation time.
#[derive(Clone, Copy)]
pub struct Clock {
	base: Instant,
}

impl Clock {
	pub fn new() -> Self {
		Self { base: Instant::now() }
	}

	/// Get the current monotonic time.
	pub fn now(&self) -> Instant {
		Instant::now()
	}

	/// Milliseconds since the clock was created, wrapping at 32 bits. Feeds
	/// the initial-sequence-number generator.
	pub fn millis(&self) -> u32 {
		self.base.elapsed().as_millis() as u32
	}

	/// Milliseconds since midnight UT, for ICMP timestamp replies.
	pub fn millis_of_day() -> u32 {
		// Derive from the wall clock; the monotonic base has no relation to
		// the time of day.
		let unix = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.unwrap_or(Duration::ZERO);
		(unix.as_millis() % 86_400_000) as u32
	}
}

impl Default for Clock {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn millis_advances() {
		let c = Clock::new();
		let a = c.millis();
		std::thread::sleep(Duration::from_millis(5));
		assert!(c.millis() >= a + 5);
	}

	#[test]
	fn millis_of_day_in_range() {
		assert!(Clock::millis_of_day() < 86_400_000);
	}
}
