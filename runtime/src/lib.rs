pub mod logger;
pub mod time;
pub mod timer;

pub use time::Clock;
pub use timer::{TimerKey, Timers};
