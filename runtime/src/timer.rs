//! One-shot timers ordered by deadline.
//!
//! All pending timers sit on a single list sorted by expiry time. A
//! dispatch thread sleeps until the head is due and then invokes handlers
//! in deadline order, releasing the list lock across each call so a
//! handler may reschedule itself. Scheduling returns a key; cancellation
//! goes through the key, and a key that already fired is a no-op.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use slab::Slab;

type Handler = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
	deadline: Instant,
	gen: u64,
	handler: Option<Handler>,
	next: Option<usize>,
	prev: Option<usize>,
}

/// Handle on a scheduled timer. The default key is idle and cancels
/// nothing.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct TimerKey {
	index: usize,
	gen: u64,
}

struct Wheel {
	slab: Slab<Entry>,
	head: Option<usize>,
	gen: u64,
	running: bool,
}

struct Shared {
	wheel: Mutex<Wheel>,
	cond: Condvar,
}

/// The timer service. Clones share one list and one dispatch thread.
#[derive(Clone)]
pub struct Timers {
	shared: Arc<Shared>,
	thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Wheel {
	fn unlink(&mut self, idx: usize) {
		let (prev, next) = (self.slab[idx].prev, self.slab[idx].next);
		match prev {
			Some(p) => self.slab[p].next = next,
			None => self.head = next,
		}
		if let Some(n) = next {
			self.slab[n].prev = prev;
		}
	}

	/// Insert by deadline, scanning from the head. Ties fire in insertion
	/// order.
	fn insert(&mut self, deadline: Instant, handler: Handler) -> TimerKey {
		self.gen += 1;
		let gen = self.gen;
		let idx = self.slab.insert(Entry { deadline, gen, handler: Some(handler), next: None, prev: None });

		let mut prev = None;
		let mut cur = self.head;
		while let Some(c) = cur {
			if self.slab[c].deadline > deadline {
				break;
			}
			prev = Some(c);
			cur = self.slab[c].next;
		}

		self.slab[idx].prev = prev;
		self.slab[idx].next = cur;
		match prev {
			Some(p) => self.slab[p].next = Some(idx),
			None => self.head = Some(idx),
		}
		if let Some(c) = cur {
			self.slab[c].prev = Some(idx);
		}

		TimerKey { index: idx, gen }
	}
}

impl Timers {
	/// Start the timer service and its dispatch thread.
	pub fn start() -> Timers {
		let shared = Arc::new(Shared {
			wheel: Mutex::new(Wheel { slab: Slab::new(), head: None, gen: 0, running: true }),
			cond: Condvar::new(),
		});

		let s = shared.clone();
		let thread = std::thread::Builder::new()
			.name("timers".into())
			.spawn(move || dispatch(&s))
			.expect("failed to spawn the timer thread");

		Timers { shared, thread: Arc::new(Mutex::new(Some(thread))) }
	}

	/// Schedule `f` to run at `deadline`.
	pub fn schedule_at(&self, deadline: Instant, f: impl FnOnce() + Send + 'static) -> TimerKey {
		let mut w = self.shared.wheel.lock().unwrap();
		let key = w.insert(deadline, Box::new(f));
		// Wake the dispatcher in case the new timer is now the head.
		self.shared.cond.notify_one();
		key
	}

	/// Schedule `f` to run `delay` from now.
	pub fn schedule_in(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerKey {
		self.schedule_at(Instant::now() + delay, f)
	}

	/// Cancel a pending timer. Returns whether the timer was still pending;
	/// a key that already fired or was cancelled does nothing.
	pub fn cancel(&self, key: TimerKey) -> bool {
		let mut w = self.shared.wheel.lock().unwrap();
		match w.slab.get(key.index) {
			Some(e) if e.gen == key.gen => {}
			_ => return false,
		}
		w.unlink(key.index);
		w.slab.remove(key.index);
		true
	}

	/// Stop the dispatch thread. Pending timers never fire.
	pub fn shutdown(&self) {
		{
			let mut w = self.shared.wheel.lock().unwrap();
			w.running = false;
		}
		self.shared.cond.notify_all();
		if let Some(t) = self.thread.lock().unwrap().take() {
			let _ = t.join();
		}
	}
}

fn dispatch(shared: &Shared) {
	let mut w = shared.wheel.lock().unwrap();
	loop {
		if !w.running {
			return;
		}

		let Some(head) = w.head else {
			w = shared.cond.wait(w).unwrap();
			continue;
		};

		let now = Instant::now();
		let deadline = w.slab[head].deadline;
		if deadline > now {
			let (guard, _) = shared.cond.wait_timeout(w, deadline - now).unwrap();
			w = guard;
			continue;
		}

		w.unlink(head);
		let mut entry = w.slab.remove(head);
		let handler = entry.handler.take().unwrap();

		// Release the lock so the handler can schedule timers.
		drop(w);
		handler();
		w = shared.wheel.lock().unwrap();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::mpsc;

	use super::*;

	#[test]
	fn fires_in_deadline_order() {
		let timers = Timers::start();
		let (tx, rx) = mpsc::channel();

		let now = Instant::now();
		for (label, ms) in [(2u32, 30u64), (0, 5), (1, 15)] {
			let tx = tx.clone();
			timers.schedule_at(now + Duration::from_millis(ms), move || {
				tx.send(label).unwrap();
			});
		}

		let mut got = Vec::new();
		for _ in 0..3 {
			got.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
		}
		assert_eq!(got, vec![0, 1, 2]);
		timers.shutdown();
	}

	#[test]
	fn cancel_prevents_firing() {
		let timers = Timers::start();
		static FIRED: AtomicUsize = AtomicUsize::new(0);

		let key = timers.schedule_in(Duration::from_millis(20), || {
			FIRED.fetch_add(1, Ordering::SeqCst);
		});
		assert!(timers.cancel(key));
		// A second cancel through the same key is a no-op.
		assert!(!timers.cancel(key));

		std::thread::sleep(Duration::from_millis(60));
		assert_eq!(FIRED.load(Ordering::SeqCst), 0);
		timers.shutdown();
	}

	#[test]
	fn handler_may_reschedule() {
		let timers = Timers::start();
		let (tx, rx) = mpsc::channel();

		let t = timers.clone();
		timers.schedule_in(Duration::from_millis(5), move || {
			t.schedule_in(Duration::from_millis(5), move || {
				tx.send(()).unwrap();
			});
		});

		rx.recv_timeout(Duration::from_secs(2)).unwrap();
		timers.shutdown();
	}

	#[test]
	fn stale_key_is_noop() {
		let timers = Timers::start();
		let (tx, rx) = mpsc::channel();
		let key = timers.schedule_in(Duration::ZERO, move || {
			tx.send(()).unwrap();
		});
		rx.recv_timeout(Duration::from_secs(2)).unwrap();
		// The slot may be reused by now; the generation check protects it.
		let _other = timers.schedule_in(Duration::from_secs(60), || {});
		assert!(!timers.cancel(key));
		timers.shutdown();
	}
}
