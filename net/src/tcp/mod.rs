//! The TCP engine: connection table, state machine, input and output
//! pipelines, and the blocking user API.

use core::fmt;
use core::mem::size_of;
use core::net::Ipv4Addr;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Condvar, Mutex};

use bilge::prelude::*;
use log::debug;
use utils::bytes::{Cast, Unaligned};
use utils::endian::{u16be, u32be};

use crate::icmp::Prc;
use crate::Stack;

mod api;
pub(crate) mod input;
pub(crate) mod output;
pub mod seq;
pub(crate) mod tcb;

pub use tcb::State;

#[cfg(test)]
mod tests;

/// Maximum TCP connections, listeners included.
pub const MAXTCP: usize = 6;
/// Hash buckets in the connection table.
pub const NTCB: usize = 16;
/// Default time-to-live for TCP datagrams.
pub const TCPTTL: u8 = 64;
/// TCP options scratch in the header cache; a multiple of 4.
pub const OPTSPACE: usize = 20;
/// Maximum retransmissions before the connection times out.
pub const MAXRETRANS: u32 = 12;
/// Maximum unanswered keep-alive probes.
pub const MAXKEEPTIMES: u32 = 10;
/// Maximum queued cloned listen connections.
pub const MAXLISTEN: usize = 2;
/// Seconds to wait in FINWAIT2 for the peer's FIN.
pub const MAXFINWAIT2: u64 = 600;
/// Two maximum segment lifetimes, in seconds.
pub const MSL2: u64 = 30;

/// Default maximum segment size.
pub const TCP_DEFMSS: u16 = 256;
/// Minimum MSS.
pub const TCP_MINMSS: u16 = 256;
/// Default receive window.
pub const TCP_DEFWND: u16 = 512;
/// Initial round-trip guess, milliseconds.
pub const TCP_DEFRTT: u32 = 500;
/// Initial slow-start threshold.
pub const TCP_ISSTHRESH: u16 = 0xffff;
/// First automatically assigned local port.
pub const TCP_DEFPORT: u16 = 5000;
/// Maximum chains allowed on the send queue.
pub const TCP_MAXQUEUE: u32 = 8;
/// Minimum segment for the modified Nagle rule.
pub const TCP_MINSEG: u16 = 80;

/// Octets of a TCP header without options.
pub const TCP_HDR_LEN: usize = size_of::<TcpHdr>();
/// Largest link-level header in front of IP.
pub const MAXIFHDR: usize = 5;
/// Timer granularity folded into the retransmit interval, milliseconds.
pub const GRANULARITY_MS: u32 = 1;

/// Round-trip smoothing gain, 1/8.
pub const AGAIN: u32 = 8;
/// Mean-deviation smoothing gain, 1/4.
pub const DGAIN: u32 = 4;

/// The retransmit backoff series: binary exponential through the fourth
/// retry, quadratic after (1, 2, 4, 8, 16, 25, 36, 49, ...).
#[inline]
pub fn backoff(n: u32) -> u32 {
	if n <= 4 {
		1 << n
	} else {
		n * n
	}
}

/// Why an operation failed, or why the connection went away.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
	/// End of data.
	Eof,
	/// No control block or buffer available.
	Alloc,
	/// Invalid parameters.
	Param,
	/// Invalid address.
	InvAddr,
	/// Invalid configuration.
	Config,
	/// No connection.
	Connect,
	/// Connection reset by the peer.
	Reset,
	/// Transmission timed out.
	Timeout,
	/// Network problem reported by ICMP.
	Network,
	/// IP precedence mismatch.
	Prec,
	/// Protocol error.
	Protocol,
}

/// A connection descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Td(pub(crate) usize);

#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
pub struct Flags {
	pub fin: bool,
	pub syn: bool,
	pub rst: bool,
	pub psh: bool,
	pub ack: bool,
	pub urg: bool,
	pub reserved: u2,
}

impl Flags {
	pub fn none() -> Flags {
		0u8.into()
	}
}

impl fmt::Debug for Flags {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let names = [
			(self.ack(), "ACK"),
			(self.psh(), "PSH"),
			(self.rst(), "RST"),
			(self.syn(), "SYN"),
			(self.fin(), "FIN"),
			(self.urg(), "URG"),
		];
		let mut any = false;
		for (set, name) in names {
			if set {
				if any {
					f.write_str("+")?;
				}
				f.write_str(name)?;
				any = true;
			}
		}
		if !any {
			f.write_str("NONE")?;
		}
		Ok(())
	}
}

#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
pub struct Offset {
	pub x2: u4,
	/// Header length in 32-bit words.
	pub words: u4,
}

/// The TCP header, RFC 793.
#[repr(C)]
pub struct TcpHdr {
	pub src: u16be,
	pub dst: u16be,
	pub seq: u32be,
	pub ack: u32be,
	pub off: Offset,
	pub flags: Flags,
	pub win: u16be,
	pub csum: u16be,
	pub urg: u16be,
}

unsafe impl Cast for Flags {}
unsafe impl Unaligned for Flags {}
unsafe impl Cast for Offset {}
unsafe impl Unaligned for Offset {}
unsafe impl Cast for TcpHdr {}
unsafe impl Unaligned for TcpHdr {}

const _: () = assert!(size_of::<TcpHdr>() == 20);

/// TCP option kinds we emit.
pub const TCPOPT_MAXSEG: u8 = 2;
pub const TCPOLEN_MAXSEG: u8 = 4;

/// The identity of a connection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Connection {
	pub local_addr: Ipv4Addr,
	pub local_port: u16,
	pub remote_addr: Ipv4Addr,
	pub remote_port: u16,
}

impl Connection {
	pub const UNSPEC: Connection = Connection {
		local_addr: Ipv4Addr::UNSPECIFIED,
		local_port: 0,
		remote_addr: Ipv4Addr::UNSPECIFIED,
		remote_port: 0,
	};

	/// XOR-fold of the four tuple fields.
	fn hash(&self) -> usize {
		let l = u32::from(self.local_addr);
		let r = u32::from(self.remote_addr);
		let mut h = (r >> 16) as u16;
		h ^= r as u16;
		h ^= (l >> 16) as u16;
		h ^= l as u16;
		h ^= self.remote_port;
		h ^= self.local_port;
		h as usize % NTCB
	}
}

#[derive(Default)]
pub struct TcpStats {
	pub min_free: AtomicU32,
	pub runt: AtomicU32,
	pub checksum: AtomicU32,
	pub conout: AtomicU32,
	pub conin: AtomicU32,
	pub reset_out: AtomicU32,
	pub reset_in: AtomicU32,
}

/// One arena slot: the control block and the conditions tasks wait on.
pub(crate) struct Entry {
	pub tcb: Mutex<tcb::Tcb>,
	pub connect: Condvar,
	pub read: Condvar,
	pub write: Condvar,
}

pub(crate) struct Table {
	pub free: Vec<usize>,
	pub buckets: [Vec<(Connection, usize)>; NTCB],
}

pub(crate) struct Tcp {
	pub entries: Vec<Entry>,
	pub table: Mutex<Table>,
	pub free_port: Mutex<u16>,
	/// Random offset under the initial-sequence-number clock.
	pub isn_offset: u32,
	pub stats: TcpStats,
}

impl Tcp {
	pub fn new(isn_offset: u32) -> Tcp {
		let mut entries = Vec::with_capacity(MAXTCP);
		let mut free = Vec::with_capacity(MAXTCP);
		for i in 0..MAXTCP {
			entries.push(Entry {
				tcb: Mutex::new(tcb::Tcb::new()),
				connect: Condvar::new(),
				read: Condvar::new(),
				write: Condvar::new(),
			});
			free.push(MAXTCP - 1 - i);
		}
		let stats = TcpStats::default();
		stats.min_free.store(MAXTCP as u32, std::sync::atomic::Ordering::Relaxed);
		Tcp {
			entries,
			table: Mutex::new(Table { free, buckets: std::array::from_fn(|_| Vec::new()) }),
			free_port: Mutex::new(TCP_DEFPORT),
			isn_offset,
			stats,
		}
	}

	/// Pop a control block off the free list.
	pub fn alloc(&self) -> Option<usize> {
		let mut t = self.table.lock().unwrap();
		let id = t.free.pop()?;
		let free = t.free.len() as u32;
		let min = self.stats.min_free.load(std::sync::atomic::Ordering::Relaxed);
		if free < min {
			self.stats.min_free.store(free, std::sync::atomic::Ordering::Relaxed);
		}
		Some(id)
	}

	/// Insert at the head of the proper hash chain.
	pub fn link(&self, id: usize, conn: Connection) {
		let mut t = self.table.lock().unwrap();
		t.buckets[conn.hash()].insert(0, (conn, id));
	}

	/// Remove from whatever hash chain the block is on.
	pub fn unlink(&self, id: usize, conn: &Connection) {
		let mut t = self.table.lock().unwrap();
		let b = &mut t.buckets[conn.hash()];
		if let Some(pos) = b.iter().position(|&(_, i)| i == id) {
			b.remove(pos);
		}
	}

	/// Exact-match lookup.
	pub fn lookup(&self, conn: &Connection) -> Option<usize> {
		let t = self.table.lock().unwrap();
		t.buckets[conn.hash()].iter().find(|(c, _)| c == conn).map(|&(_, i)| i)
	}

	/// Return a block to the free list.
	pub fn release(&self, id: usize) {
		let mut t = self.table.lock().unwrap();
		debug_assert!(!t.free.contains(&id), "tcb already free");
		t.free.push(id);
	}

	/// Next automatically assigned local port.
	pub fn next_port(&self) -> u16 {
		let mut p = self.free_port.lock().unwrap();
		let port = *p;
		*p = p.checked_add(1).unwrap_or(TCP_DEFPORT);
		port
	}
}

/// ICMP advisory about one of our destinations. Advisories are logged;
/// no connection state changes hang off them.
pub(crate) fn advise(stack: &Arc<Stack>, prc: Prc, dst: Ipv4Addr) {
	let _ = stack;
	debug!("advise: {prc:?} for {dst}");
}

#[cfg(test)]
mod unit {
	use super::*;

	#[test]
	fn backoff_series() {
		let got: Vec<u32> = (0..11).map(backoff).collect();
		assert_eq!(got, vec![1, 2, 4, 8, 16, 25, 36, 49, 64, 81, 100]);
	}

	#[test]
	fn hash_folds_tuple() {
		let a = Connection {
			local_addr: Ipv4Addr::new(10, 0, 0, 1),
			local_port: 23,
			remote_addr: Ipv4Addr::new(10, 0, 0, 2),
			remote_port: 4000,
		};
		assert!(a.hash() < NTCB);
		// The hash must not depend on anything but the tuple.
		let b = a;
		assert_eq!(a.hash(), b.hash());
	}

	#[test]
	fn flags_format() {
		let mut f = Flags::none();
		assert_eq!(format!("{f:?}"), "NONE");
		f.set_ack(true);
		f.set_syn(true);
		assert_eq!(format!("{f:?}"), "ACK+SYN");
	}
}
