//! The asynchronous HDLC receive state machine.

use log::{debug, warn};
use nbuf::{Chain, Pool};

use crate::accm::Accm;
use crate::{fcs, ESCAPE, ESC_XOR, FLAG};

/// Parser state; the current state names the field yet to be completed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
enum State {
	/// Waiting for the first flag.
	Idle,
	/// Resynchronizing: discard until the next flag.
	Start,
	/// Expecting the all-stations address.
	Address,
	/// Expecting the unnumbered-information control octet.
	Control,
	/// Expecting the first (or only) protocol octet.
	Protocol1,
	/// Expecting the second protocol octet.
	Protocol2,
	/// Accumulating information-field octets.
	Data,
}

pub(crate) struct Framer {
	state: State,
	escaped: bool,
	fcs: u16,
	protocol: u16,
	chain: Option<Chain>,
	/// Async control character map for the receive side. Octets in the map
	/// that are neither flag nor escape are line noise and are discarded.
	pub accm: Accm,
	pub mru: u16,
}

/// What one octet run produced.
pub(crate) struct Deframed {
	/// Completed frames ready for dispatch.
	pub frames: Vec<(u16, Chain)>,
	/// Frames dropped mid-assembly (bad FCS, truncation, allocation).
	pub dropped: u32,
}

impl Framer {
	pub fn new(mru: u16) -> Self {
		Framer {
			state: State::Idle,
			escaped: false,
			fcs: fcs::INIT,
			protocol: 0,
			chain: None,
			accm: Accm::default(),
			mru,
		}
	}

	fn drop_frame(&mut self, pool: &Pool, out: &mut Deframed) {
		if let Some(c) = self.chain.take() {
			debug!("framer: dropping {} byte partial frame", pool.len(&c));
			pool.free(c);
		}
		out.dropped += 1;
	}

	/// Feed raw octets from the serial driver through the state machine.
	/// Octet runs may begin and end anywhere relative to frame boundaries.
	pub fn input(&mut self, pool: &Pool, octets: &[u8], out: &mut Deframed) {
		for &raw in octets {
			let c = raw;

			if self.accm.escaped(c) {
				if c == ESCAPE {
					self.escaped = true;
				} else if c == FLAG {
					self.flag(pool, out);
				} else {
					// Control characters inserted by the physical layer.
					warn!("framer: dropping ACCM octet {c:#04x}");
				}
				continue;
			}

			// Undo transparency before anything else sees the octet.
			let c = if self.escaped {
				self.escaped = false;
				c ^ ESC_XOR
			} else {
				c
			};

			self.fcs = fcs::step(self.fcs, c);

			match self.state {
				// Waiting for a frame boundary; discard.
				State::Idle | State::Start => {}
				State::Address => {
					if c == crate::ALL_STATIONS {
						self.state = State::Control;
					} else {
						// Compressed address and control fields: this octet
						// already belongs to the protocol field.
						self.protocol_octet(c);
					}
				}
				State::Control => {
					if c == crate::UI {
						self.state = State::Protocol1;
					} else {
						warn!("framer: invalid control octet {c:#04x}");
						self.state = State::Start;
					}
				}
				State::Protocol1 => self.protocol_octet(c),
				State::Protocol2 => {
					self.protocol |= c as u16;
					self.state = State::Data;
				}
				State::Data => {
					// An information field past the MRU (plus the FCS
					// trailer) cannot be a valid frame.
					if let Some(chain) = &self.chain {
						if pool.len(chain) >= self.mru as usize + 2 {
							warn!("framer: frame exceeds mru {}", self.mru);
							self.drop_frame(pool, out);
							self.state = State::Start;
							self.fcs = fcs::INIT;
							continue;
						}
					}
					let appended = match &self.chain {
						Some(chain) => pool.append_byte(chain, c),
						None => match pool.get() {
							Some(chain) => {
								let n = pool.append_byte(&chain, c);
								self.chain = Some(chain);
								n
							}
							None => 0,
						},
					};
					if appended == 0 {
						// No free buffers: drop the frame in progress and
						// resynchronize on the next flag.
						warn!("framer: no free buffers");
						self.drop_frame(pool, out);
						self.state = State::Start;
						self.fcs = fcs::INIT;
					}
				}
			}
		}
	}

	/// A one-octet protocol field has its low bit set; otherwise this is
	/// the high octet and another follows.
	fn protocol_octet(&mut self, c: u8) {
		if c & 1 != 0 {
			self.protocol = c as u16;
			self.state = State::Data;
		} else {
			self.protocol = (c as u16) << 8;
			self.state = State::Protocol2;
		}
	}

	/// Frame boundary.
	fn flag(&mut self, pool: &Pool, out: &mut Deframed) {
		// Back-to-back flags between frames are ordinary.
		if self.state == State::Address {
		} else if self.state < State::Data {
			debug!("framer: flag inside header, state {:?}", self.state);
			self.drop_frame(pool, out);
		} else if self.fcs != fcs::GOOD {
			warn!("framer: bad FCS {:#06x}, protocol {:#06x}", self.fcs, self.protocol);
			self.drop_frame(pool, out);
		} else if let Some(chain) = self.chain.take() {
			// Trim the FCS trailer off and hand the frame up.
			match pool.trim_back(chain, 2, None) {
				(Some(chain), 2) => out.frames.push((self.protocol, chain)),
				(rest, _) => {
					// Nothing left once the trailer goes: an empty frame.
					if let Some(c) = rest {
						pool.free(c);
					}
					out.dropped += 1;
				}
			}
		} else {
			// A frame whose information field was only the FCS itself.
			out.dropped += 1;
		}

		self.fcs = fcs::INIT;
		self.state = State::Address;
		self.escaped = false;
	}
}
