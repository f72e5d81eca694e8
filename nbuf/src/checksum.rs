use log::warn;

use crate::pool::{Chain, Pool};

impl Pool {
	/// The 16-bit ones'-complement Internet checksum over `len` octets of
	/// the chain starting `off` bytes from the head.
	///
	/// Octets pair into big-endian words regardless of where buffer
	/// boundaries fall, so an odd-length buffer carries its orphan byte
	/// into the next one. The result is ready to store through a
	/// big-endian field; a verification pass over data that includes the
	/// stored checksum yields zero.
	pub fn checksum(&self, c: &Chain, len: usize, off: usize) -> u16 {
		let mut sum: u32 = 0;
		let mut remaining = len;
		let mut skip = off;
		let mut high = true;

		self.for_each(c, |s| {
			let s = if skip >= s.len() {
				skip -= s.len();
				return;
			} else {
				let s = &s[skip..];
				skip = 0;
				s
			};

			for &byte in s.iter().take(remaining) {
				if high {
					sum += (byte as u32) << 8;
				} else {
					sum += byte as u32;
				}
				high = !high;
			}
			remaining -= s.len().min(remaining);
		});

		if remaining > 0 {
			warn!("checksum: out of data ({remaining} bytes short)");
		}

		// Fold the carries back in.
		while sum >> 16 != 0 {
			sum = (sum & 0xffff) + (sum >> 16);
		}
		!(sum as u16)
	}
}
