//! The IP dispatcher.
//!
//! One dispatch function serves both directions: an incoming datagram that
//! is addressed to us (or to the loopback address) is demultiplexed to the
//! transport protocol, one that is from us heads out the default interface,
//! and anything else is dropped because this host is not a router. Routing
//! a locally generated packet back in through the same function is what
//! makes the loopback short-circuit free.
//!
//! Multi-octet header fields stay in network byte order for their whole
//! life in the buffer; every read goes through an endian-typed accessor, so
//! there is no separate host-order phase to keep track of.

use core::mem::size_of;
use core::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bilge::prelude::*;
use log::{debug, info, warn};
use nbuf::{Chain, NBUFSZ};
use utils::bytes::{self, Cast, Unaligned};
use utils::endian::{b, u16be};

use crate::{icmp, tcp, Stack};

/// Loopback address (127.0.0.1).
pub const LOOPADDR: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
/// Default time-to-live.
pub const IPTTL_DEFAULT: u8 = 64;
/// Time-to-live on reflected ICMP messages.
pub const MAXTTL: u8 = 255;
/// Octets of an IP header without options.
pub const IP_HDR_LEN: usize = size_of::<IpHdr>();

/// Precedence bits of the type-of-service octet.
pub const TOS_PREC_MASK: u8 = 0xe0;

#[bitsize(4)]
#[derive(Clone, Copy, FromBits, PartialEq)]
pub enum Version {
	V4 = 4,
	V6 = 6,
	#[fallback]
	Unknown,
}

#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
pub struct Meta {
	pub ihl: u4,
	pub ver: Version,
}

#[bitsize(16)]
#[derive(Clone, Copy, FromBits)]
pub struct Fragment {
	pub ofst: u13,
	pub more: bool,
	pub dont: bool,
	pub reserved: bool,
}

#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
#[repr(u8)]
pub enum Protocol {
	Icmp = 1,
	Tcp = 6,
	#[fallback]
	Unknown(u8),
}

/// The IPv4 header, RFC 791. No options.
#[repr(C)]
pub struct IpHdr {
	pub meta: Meta,
	pub tos: u8,
	/// Total length, header included.
	pub len: u16be,
	pub id: u16be,
	pub frag: b<Fragment>,
	pub ttl: u8,
	pub proto: b<Protocol>,
	pub csum: u16be,
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
}

unsafe impl Cast for Meta {}
unsafe impl Unaligned for Meta {}
unsafe impl Cast for IpHdr {}
unsafe impl Unaligned for IpHdr {}

const _: () = assert!(size_of::<IpHdr>() == 20);

/// A link the dispatcher can transmit on.
pub trait NetIf: Send + Sync {
	fn output(&self, chain: Chain);
	fn mtu(&self) -> usize;
}

#[derive(Default)]
pub struct IpStats {
	pub total: AtomicU32,
	pub toosmall: AtomicU32,
	pub badvers: AtomicU32,
	pub badhlen: AtomicU32,
	pub badsum: AtomicU32,
	pub badlen: AtomicU32,
	pub odropped: AtomicU32,
	pub cantforward: AtomicU32,
	pub delivered: AtomicU32,
}

pub struct Ip {
	/// Our address. Unspecified until configuration (or IPCP) supplies one.
	local: Mutex<Ipv4Addr>,
	/// Identification counter for outgoing datagrams.
	id: AtomicU16,
	default_if: Mutex<Option<Arc<dyn NetIf>>>,
	pub stats: IpStats,
}

impl Ip {
	pub(crate) fn new(local: Ipv4Addr) -> Ip {
		Ip {
			local: Mutex::new(local),
			id: AtomicU16::new(1),
			default_if: Mutex::new(None),
			stats: IpStats::default(),
		}
	}

	pub fn local_addr(&self) -> Ipv4Addr {
		*self.local.lock().unwrap()
	}

	pub fn set_local_addr(&self, addr: Ipv4Addr) {
		info!("local address {addr}");
		*self.local.lock().unwrap() = addr;
	}

	pub fn set_default_if(&self, ifc: Arc<dyn NetIf>) {
		*self.default_if.lock().unwrap() = Some(ifc);
	}

	pub fn clear_default_if(&self) {
		info!("default route cleared");
		*self.default_if.lock().unwrap() = None;
	}

	fn default_if(&self) -> Option<Arc<dyn NetIf>> {
		self.default_if.lock().unwrap().clone()
	}

	pub(crate) fn next_id(&self) -> u16 {
		self.id.fetch_add(1, Ordering::Relaxed)
	}
}

/// Validate a raw incoming datagram and dispatch it.
pub fn input(stack: &Arc<Stack>, chain: Chain) {
	let pool = &stack.pool;
	let stats = &stack.ip.stats;
	stats.total.fetch_add(1, Ordering::Relaxed);

	let mut chain = chain;
	if pool.head_len(&chain) < IP_HDR_LEN {
		let Some(c) = pool.pullup(chain, IP_HDR_LEN) else {
			stats.toosmall.fetch_add(1, Ordering::Relaxed);
			debug!("input: runt packet");
			return;
		};
		chain = c;
	}

	let (ver, hlen, total, frag) = pool.with(&chain, |hdr| {
		let h: &IpHdr = bytes::cast(hdr);
		(h.meta.ver(), h.meta.ihl().value() as usize * 4, h.len.get() as usize, h.frag.get())
	});

	if ver != Version::V4 {
		stats.badvers.fetch_add(1, Ordering::Relaxed);
		debug!("input: bad version");
		return pool.free(chain);
	}
	if frag.more() || frag.ofst().value() != 0 {
		// No reassembly on this stack.
		info!("input: fragmented packet, discarding");
		stats.odropped.fetch_add(1, Ordering::Relaxed);
		return pool.free(chain);
	}
	if hlen < IP_HDR_LEN {
		stats.badhlen.fetch_add(1, Ordering::Relaxed);
		debug!("input: bad header size {hlen}");
		return pool.free(chain);
	}
	if hlen > pool.head_len(&chain) {
		let Some(c) = pool.pullup(chain, hlen) else {
			stats.badhlen.fetch_add(1, Ordering::Relaxed);
			return;
		};
		chain = c;
	}
	if pool.checksum(&chain, hlen, 0) != 0 {
		stats.badsum.fetch_add(1, Ordering::Relaxed);
		debug!("input: bad header checksum");
		return pool.free(chain);
	}
	if total < hlen || total > pool.len(&chain) {
		stats.badlen.fetch_add(1, Ordering::Relaxed);
		return pool.free(chain);
	}

	dispatch(stack, chain);
}

/// Dispatch a prepared datagram (header at the front of the chain) by its
/// addresses and protocol.
pub(crate) fn dispatch(stack: &Arc<Stack>, chain: Chain) {
	let pool = &stack.pool;
	let stats = &stack.ip.stats;

	let (hlen, total, proto, src, dst) = pool.with(&chain, |hdr| {
		let h: &IpHdr = bytes::cast(hdr);
		(
			h.meta.ihl().value() as usize * 4,
			h.len.get() as usize,
			h.proto.get(),
			h.src,
			h.dst,
		)
	});

	let local = stack.ip.local_addr();

	if total < hlen {
		stats.badlen.fetch_add(1, Ordering::Relaxed);
		debug!("dispatch: dropped short packet from {src}");
		pool.free(chain);
	} else if dst == local || dst == LOOPADDR {
		// For us. The loopback address is caught here rather than by a
		// loopback interface so this one function carries both directions.
		match proto {
			Protocol::Icmp => icmp::input(stack, chain, hlen),
			Protocol::Tcp => tcp::input::tcp_input(stack, chain, hlen),
			Protocol::Unknown(tag) => {
				debug!("dispatch: dropped protocol {tag} from {src}");
				stats.odropped.fetch_add(1, Ordering::Relaxed);
				pool.free(chain);
			}
		}
	} else if src != local {
		// Neither from us nor for us: we are not a router.
		debug!("dispatch: can't forward {src} -> {dst}");
		stats.cantforward.fetch_add(1, Ordering::Relaxed);
		pool.free(chain);
	} else {
		match stack.ip.default_if() {
			Some(ifc) => {
				// Refresh the header checksum before it hits the wire.
				pool.with_mut(&chain, |hdr| {
					bytes::cast_mut::<IpHdr, _>(hdr).csum = 0u16.into();
				});
				let csum = pool.checksum(&chain, hlen, 0);
				pool.with_mut(&chain, |hdr| {
					bytes::cast_mut::<IpHdr, _>(hdr).csum = csum.into();
				});
				ifc.output(chain);
				stats.delivered.fetch_add(1, Ordering::Relaxed);
			}
			None => {
				warn!("dispatch: no interface for {dst}");
				stats.odropped.fetch_add(1, Ordering::Relaxed);
				pool.free(chain);
			}
		}
	}
}

/// Build and send a datagram: minimal header, default TTL and TOS, no
/// fragments, no options.
pub fn send(stack: &Arc<Stack>, proto: Protocol, src: Ipv4Addr, dst: Ipv4Addr, payload: Chain) {
	let pool = &stack.pool;

	let hdr = IpHdr {
		meta: Meta::new(u4::new(5), Version::V4),
		tos: 0,
		len: ((pool.len(&payload) + IP_HDR_LEN) as u16).into(),
		id: stack.ip.next_id().into(),
		frag: Fragment::new(u13::new(0), false, false).into(),
		ttl: IPTTL_DEFAULT,
		proto: proto.into(),
		csum: 0u16.into(),
		src,
		dst,
	};

	match pool.prepend(payload, bytes::as_slice(&hdr)) {
		Some(chain) => dispatch(stack, chain),
		None => {
			stack.ip.stats.odropped.fetch_add(1, Ordering::Relaxed);
		}
	}
}

/// Send a datagram whose header the caller already composed.
pub(crate) fn raw_out(stack: &Arc<Stack>, chain: Chain) {
	dispatch(stack, chain);
}

/// Maximum transmission unit toward `dst`; zero when unreachable.
pub fn mtu(stack: &Stack, dst: Ipv4Addr) -> usize {
	let st = if dst == stack.ip.local_addr() || dst == LOOPADDR {
		NBUFSZ
	} else {
		stack.ip.default_if().map_or(0, |i| i.mtu())
	};
	debug!("mtu: dst {dst} => {st}");
	st
}

/// Re-pack the chain with the IP options removed so upper-layer checksums
/// see a bare header. Unrecoverable on failure: the chain is dropped.
pub(crate) fn strip_options(stack: &Arc<Stack>, chain: Chain, ip_hlen: usize) -> Option<Chain> {
	let pool = &stack.pool;
	let stats = &stack.ip.stats;
	let opt_len = ip_hlen - IP_HDR_LEN;

	let Some(rest) = pool.split(&chain, ip_hlen) else {
		stats.odropped.fetch_add(1, Ordering::Relaxed);
		pool.free(chain);
		return None;
	};
	let (hdr, trimmed) = pool.trim_back(chain, opt_len, None);
	let Some(hdr) = hdr else {
		stats.odropped.fetch_add(1, Ordering::Relaxed);
		pool.free(rest);
		return None;
	};
	if trimmed < opt_len {
		stats.odropped.fetch_add(1, Ordering::Relaxed);
		pool.free(rest);
		pool.free(hdr);
		return None;
	}
	let chain = pool.cat(hdr, rest);

	// The header no longer carries options; fix the length bookkeeping.
	pool.with_mut(&chain, |buf| {
		let h: &mut IpHdr = bytes::cast_mut(buf);
		h.meta = Meta::new(u4::new(5), Version::V4);
		h.len = (h.len.get() - opt_len as u16).into();
	});
	Some(chain)
}
