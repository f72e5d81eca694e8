//! ICMP: echo and timestamp turnaround, error generation, and advisory
//! delivery for errors the peer reports about our traffic.

use core::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use nbuf::Chain;
use runtime::Clock;
use utils::bytes::{self, Cast, Unaligned};
use utils::endian::{u16be, u32be};

use crate::ip::{self, IpHdr, Protocol, IP_HDR_LEN, MAXTTL};
use crate::Stack;

pub const ECHOREPLY: u8 = 0;
pub const UNREACH: u8 = 3;
pub const SOURCEQUENCH: u8 = 4;
pub const REDIRECT: u8 = 5;
pub const ECHO: u8 = 8;
pub const TIMXCEED: u8 = 11;
pub const PARAMPROB: u8 = 12;
pub const TSTAMP: u8 = 13;
pub const TSTAMPREPLY: u8 = 14;
pub const MAXTYPE: u8 = 18;

/// Destination-unreachable codes.
pub const UNREACH_NET: u8 = 0;
pub const UNREACH_HOST: u8 = 1;
pub const UNREACH_PROTOCOL: u8 = 2;
pub const UNREACH_PORT: u8 = 3;
pub const UNREACH_NEEDFRAG: u8 = 4;
pub const UNREACH_SRCFAIL: u8 = 5;

/// Minimum ICMP message: type, code, checksum, and one 32-bit word.
pub const MINLEN: usize = 8;
/// A timestamp message: header plus three timestamps.
pub const TSLEN: usize = MINLEN + 12;
/// Minimum advisory message: header plus the quoted IP header and 8 octets.
pub const ADVLENMIN: usize = MINLEN + IP_HDR_LEN + 8;

#[repr(C)]
pub struct IcmpHdr {
	pub typ: u8,
	pub code: u8,
	pub csum: u16be,
	/// Unused / identifier + sequence / gateway / pointer, by type.
	pub void: u32be,
}

unsafe impl Cast for IcmpHdr {}
unsafe impl Unaligned for IcmpHdr {}

const _: () = assert!(size_of::<IcmpHdr>() == MINLEN);

/// Advisory codes delivered to the transport layer when the peer reports a
/// problem with our traffic.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Prc {
	UnreachNet,
	UnreachHost,
	UnreachProtocol,
	UnreachPort,
	MsgSize,
	SrcFail,
	TimxceedIntrans,
	TimxceedReass,
	Paramprob,
	Quench,
}

#[derive(Default)]
pub struct IcmpStats {
	pub errors: AtomicU32,
	pub oldicmp: AtomicU32,
	pub tooshort: AtomicU32,
	pub badsum: AtomicU32,
	pub badlen: AtomicU32,
	pub badcode: AtomicU32,
	pub reflects: AtomicU32,
	pub advisories: AtomicU32,
}

/// Whether the type is purely informational (never an error report).
fn is_info(typ: u8) -> bool {
	matches!(typ, ECHOREPLY | ECHO | 9 | 10 | TSTAMP | TSTAMPREPLY | 15..=MAXTYPE)
}

/// Process a received ICMP message. The IP header leads the chain.
pub(crate) fn input(stack: &Arc<Stack>, chain: Chain, ip_hlen: usize) {
	let pool = &stack.pool;
	let stats = &stack.icmp_stats;

	let total = pool.with(&chain, |b| bytes::cast::<IpHdr, _>(b).len.get() as usize);
	let icmp_len = total.saturating_sub(ip_hlen);
	if icmp_len < MINLEN {
		stats.tooshort.fetch_add(1, Ordering::Relaxed);
		return pool.free(chain);
	}

	let want = ip_hlen + icmp_len.min(ADVLENMIN);
	let mut chain = chain;
	if pool.head_len(&chain) < want {
		let Some(c) = pool.pullup(chain, want) else {
			stats.tooshort.fetch_add(1, Ordering::Relaxed);
			return;
		};
		chain = c;
	}

	if pool.checksum(&chain, icmp_len, ip_hlen) != 0 {
		stats.badsum.fetch_add(1, Ordering::Relaxed);
		debug!("input: bad checksum");
		return pool.free(chain);
	}

	let (typ, code) = pool.with(&chain, |b| {
		let h: &IcmpHdr = bytes::cast(&b[ip_hlen..]);
		(h.typ, h.code)
	});
	debug!("input: type {typ} code {code} len {icmp_len}");

	match typ {
		ECHO => {
			pool.with_mut(&chain, |b| bytes::cast_mut::<IcmpHdr, _>(&mut b[ip_hlen..]).typ = ECHOREPLY);
			reflect(stack, chain, ip_hlen, icmp_len);
		}

		TSTAMP => {
			if icmp_len < TSLEN {
				stats.badlen.fetch_add(1, Ordering::Relaxed);
				return pool.free(chain);
			}
			let t = Clock::millis_of_day().wrapping_mul(10);
			pool.with_mut(&chain, |b| {
				let m = &mut b[ip_hlen..];
				bytes::cast_mut::<IcmpHdr, _>(m).typ = TSTAMPREPLY;
				// Receive and transmit timestamps follow the originate one.
				*bytes::cast_mut::<u32be, _>(&mut m[12..]) = t.into();
				*bytes::cast_mut::<u32be, _>(&mut m[16..]) = t.into();
			});
			reflect(stack, chain, ip_hlen, icmp_len);
		}

		UNREACH | TIMXCEED | PARAMPROB | SOURCEQUENCH => {
			let prc = match (typ, code) {
				(UNREACH, UNREACH_NET) | (UNREACH, 6) | (UNREACH, 8) | (UNREACH, 11) => Some(Prc::UnreachNet),
				(UNREACH, UNREACH_HOST) | (UNREACH, 7) | (UNREACH, 9) | (UNREACH, 10) | (UNREACH, 12) => Some(Prc::UnreachHost),
				(UNREACH, UNREACH_PROTOCOL) => Some(Prc::UnreachProtocol),
				(UNREACH, UNREACH_PORT) => Some(Prc::UnreachPort),
				(UNREACH, UNREACH_NEEDFRAG) => Some(Prc::MsgSize),
				(UNREACH, UNREACH_SRCFAIL) => Some(Prc::SrcFail),
				(TIMXCEED, 0) => Some(Prc::TimxceedIntrans),
				(TIMXCEED, 1) => Some(Prc::TimxceedReass),
				(PARAMPROB, 0) | (PARAMPROB, 1) => Some(Prc::Paramprob),
				(SOURCEQUENCH, 0) => Some(Prc::Quench),
				_ => None,
			};

			match prc {
				None => {
					stats.badcode.fetch_add(1, Ordering::Relaxed);
				}
				Some(prc) => {
					if icmp_len < ADVLENMIN {
						stats.badlen.fetch_add(1, Ordering::Relaxed);
						return pool.free(chain);
					}
					// The quoted datagram names the connection concerned.
					let dst = pool.with(&chain, |b| bytes::cast::<IpHdr, _>(&b[ip_hlen + MINLEN..]).dst);
					stats.advisories.fetch_add(1, Ordering::Relaxed);
					crate::tcp::advise(stack, prc, dst);
				}
			}
			pool.free(chain);
		}

		// No processing for replies and everything else.
		_ => {
			pool.free(chain);
		}
	}
}

/// Reflect a message back to its source with our address as the new source.
fn reflect(stack: &Arc<Stack>, chain: Chain, ip_hlen: usize, icmp_len: usize) {
	let pool = &stack.pool;
	stack.icmp_stats.reflects.fetch_add(1, Ordering::Relaxed);

	pool.with_mut(&chain, |b| {
		let h: &mut IpHdr = bytes::cast_mut(b);
		h.dst = h.src;
		h.src = stack.ip.local_addr();
		h.ttl = MAXTTL;
	});
	send_checksummed(stack, chain, ip_hlen, icmp_len);
}

/// Checksum the message body and hand the datagram to IP.
fn send_checksummed(stack: &Arc<Stack>, chain: Chain, ip_hlen: usize, icmp_len: usize) {
	let pool = &stack.pool;
	pool.with_mut(&chain, |b| bytes::cast_mut::<IcmpHdr, _>(&mut b[ip_hlen..]).csum = 0u16.into());
	let csum = pool.checksum(&chain, icmp_len, ip_hlen);
	pool.with_mut(&chain, |b| bytes::cast_mut::<IcmpHdr, _>(&mut b[ip_hlen..]).csum = csum.into());
	ip::raw_out(stack, chain);
}

/// Generate an error message of `typ`/`code` in response to a bad datagram.
/// The offending datagram is consumed.
pub fn error(stack: &Arc<Stack>, chain: Chain, typ: u8, code: u8, dest: core::net::Ipv4Addr) {
	let pool = &stack.pool;
	let stats = &stack.icmp_stats;

	if typ != REDIRECT {
		stats.errors.fetch_add(1, Ordering::Relaxed);
	}
	if typ > MAXTYPE {
		panic!("icmp error type {typ}");
	}

	let head = pool.head_len(&chain);
	if head < IP_HDR_LEN {
		return pool.free(chain);
	}

	let (old_hlen, old_len, old_proto, frag_ofst) = pool.with(&chain, |b| {
		let h: &IpHdr = bytes::cast(b);
		(
			h.meta.ihl().value() as usize * 4,
			h.len.get() as usize,
			h.proto.get(),
			h.frag.get().ofst().value(),
		)
	});

	// Never report a non-first fragment.
	if frag_ofst != 0 {
		return pool.free(chain);
	}
	// Never report an ICMP error message, only informational types.
	if matches!(old_proto, Protocol::Icmp) && typ != REDIRECT && head >= old_hlen + 1 {
		let old_typ = pool.with(&chain, |b| b[old_hlen]);
		if !is_info(old_typ) {
			stats.oldicmp.fetch_add(1, Ordering::Relaxed);
			return pool.free(chain);
		}
	}

	// Quote the original header plus the first 8 octets after it.
	let quoted = (old_hlen + 8).min(old_len).min(head);
	let body_len = MINLEN + quoted;

	let Some(msg) = pool.get() else {
		warn!("error: no free buffers");
		return pool.free(chain);
	};
	pool.align_end(&msg, body_len);

	let mut quote = [0u8; 60 + 8];
	pool.copy_out(&chain, 0, &mut quote[..quoted]);
	let (src, dst) = pool.with(&chain, |b| {
		let h: &IpHdr = bytes::cast(b);
		(h.src, h.dst)
	});

	pool.with_mut(&msg, |b| {
		let h: &mut IcmpHdr = bytes::cast_mut(b);
		h.typ = typ;
		h.code = code;
		h.void = 0u32.into();
		if typ == REDIRECT {
			h.void = u32::from(dest).into();
		} else if typ == PARAMPROB {
			// The pointer rides in the first octet of the unused word.
			h.void = ((code as u32) << 24).into();
			h.code = 0;
		}
		b[MINLEN..MINLEN + quoted].copy_from_slice(&quote[..quoted]);
	});
	pool.free(chain);

	// Fresh outer header; reflect() swaps it toward the source.
	let hdr = IpHdr {
		meta: super::ip::Meta::new(bilge::prelude::u4::new(5), super::ip::Version::V4),
		tos: 0,
		len: ((IP_HDR_LEN + body_len) as u16).into(),
		id: 0u16.into(),
		frag: super::ip::Fragment::new(bilge::prelude::u13::new(0), false, false).into(),
		ttl: 0,
		proto: Protocol::Icmp.into(),
		csum: 0u16.into(),
		src,
		dst,
	};
	let Some(msg) = pool.prepend(msg, bytes::as_slice(&hdr)) else {
		info!("error: dropped, no buffer for header");
		return;
	};
	reflect(stack, msg, IP_HDR_LEN, body_len);
}
