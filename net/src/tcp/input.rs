//! The receive pipeline, RFC 793 section 3.9.

use core::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

use log::{debug, trace, warn};
use nbuf::{Chain, Pool, NBUFSZ};
use utils::bytes;

use super::output::{reset, tcp_output};
use super::tcb::{arm_keep, arm_resend, close_self, load_path_defaults, proc_syn, send_syn, set_state, start_2msl};
use super::tcb::{Placement, State, Tcb};
use super::{seq, Connection, Error, Flags, TcpHdr, MAXFINWAIT2, TCP_HDR_LEN};
use crate::ip::{self, IpHdr, IP_HDR_LEN, TOS_PREC_MASK};
use crate::Stack;

/// The fields of the segment at hand, read out of the buffer once and kept
/// in step with any in-place edits.
#[derive(Clone, Copy)]
pub(crate) struct Seg {
	pub ip_hlen: usize,
	pub tcp_hlen: usize,
	/// IP total length.
	pub len: u16,
	pub tos: u8,
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
	pub src_port: u16,
	pub dst_port: u16,
	pub seq: u32,
	pub ack: u32,
	pub win: u16,
	pub flags: Flags,
	/// Octets of segment text (sequence space taken by SYN/FIN excluded).
	pub data_len: u16,
}

/// Read the headers at the front of the chain. The head buffer must hold
/// them contiguously.
pub(crate) fn read_seg(pool: &Pool, chain: &Chain) -> Option<Seg> {
	pool.with(chain, |b| {
		if b.len() < IP_HDR_LEN {
			return None;
		}
		let iph: &IpHdr = bytes::cast(b);
		let ip_hlen = iph.meta.ihl().value() as usize * 4;
		if b.len() < ip_hlen + TCP_HDR_LEN {
			return None;
		}
		let tcph: &TcpHdr = bytes::cast(&b[ip_hlen..]);
		let tcp_hlen = tcph.off.words().value() as usize * 4;
		if tcp_hlen < TCP_HDR_LEN {
			return None;
		}
		let len = iph.len.get();
		let data_len = (len as usize).checked_sub(ip_hlen + tcp_hlen)? as u16;
		Some(Seg {
			ip_hlen,
			tcp_hlen,
			len,
			tos: iph.tos,
			src: iph.src,
			dst: iph.dst,
			src_port: tcph.src.get(),
			dst_port: tcph.dst.get(),
			seq: tcph.seq.get(),
			ack: tcph.ack.get(),
			win: tcph.win.get(),
			flags: tcph.flags,
			data_len,
		})
	})
}

/// Write the mutable fields of the segment view back into the buffer so a
/// requeued segment re-reads consistently.
fn write_back(pool: &Pool, chain: &Chain, seg: &Seg) {
	pool.with_mut(chain, |b| {
		let (ih, th) = b.split_at_mut(seg.ip_hlen);
		bytes::cast_mut::<IpHdr, _>(ih).len = seg.len.into();
		let tcph: &mut TcpHdr = bytes::cast_mut(th);
		tcph.seq = seg.seq.into();
		tcph.flags = seg.flags;
	});
}

/// Trim the segment to the receive window. Leading duplicate data (the SYN
/// included) is shaved off in place; trailing excess stays, because whole
/// chains move to the receive queue anyway and the MSS is small. Returns
/// `None` when no part of the segment is acceptable.
fn trim_seg(stack: &Arc<Stack>, tcb: &mut Tcb, seg: &mut Seg, chain: &Chain) -> Option<()> {
	let pool = &stack.pool;

	let mut len = seg.data_len as u32;
	if seg.flags.syn() {
		len += 1;
	}
	if seg.flags.fin() {
		len += 1;
	}

	let accept = if tcb.rcv.wnd == 0 {
		// Only in-order empty segments are acceptable on a closed window.
		seg.seq == tcb.rcv.nxt && len == 0
	} else {
		let lo = tcb.rcv.nxt;
		let hi = tcb.rcv.nxt.wrapping_add(tcb.rcv.wnd as u32).wrapping_sub(1);
		let end = seg.seq.wrapping_add(len).wrapping_sub(1);
		seq::within(seg.seq, lo, hi)
			|| (len != 0 && (seq::within(end, lo, hi) || seq::within(lo, seg.seq, end)))
	};
	if !accept {
		return None;
	}
	if len == 0 {
		return Some(());
	}

	// Shave the duplicated leading edge.
	let mut dup = tcb.rcv.nxt.wrapping_sub(seg.seq) as i32;
	if dup > 0 {
		tcb.rerecv = tcb.rerecv.wrapping_add(dup as u32);
		if seg.flags.syn() {
			// The SYN sits before the first data octet.
			seg.flags.set_syn(false);
			seg.seq = seg.seq.wrapping_add(1);
			dup -= 1;
		}
		if dup > 0 {
			// Split the headers off, trim the text, splice it back.
			let hdr_len = seg.ip_hlen + seg.tcp_hlen;
			if let Some(tail) = pool.split(chain, hdr_len) {
				let (rest, trimmed) = pool.trim_front(tail, dup as usize, None);
				if let Some(rest) = rest {
					pool.extend(chain, rest);
				}
				seg.seq = seg.seq.wrapping_add(trimmed as u32);
				seg.data_len -= trimmed as u16;
				seg.len -= trimmed as u16;
			}
		}
		write_back(pool, chain, seg);
	}

	Some(())
}

enum Verdict {
	Ok,
	Drop,
	Reset,
	Close,
}

/// Check the control flags and process the acknowledgment (p. 70-73).
fn proc_in_flags(stack: &Arc<Stack>, td: usize, tcb: &mut Tcb, seg: &Seg) -> Verdict {
	let stats = &stack.tcp.stats;

	if seg.flags.rst() {
		if tcb.state == State::SynReceived && !tcb.clone && !tcb.active {
			// A passive, uncloned server goes back to listening; nobody
			// has picked the embryonic connection up yet.
			if tcb.placement == Placement::Linked {
				stack.tcp.unlink(td, &tcb.conn);
			}
			tcb.conn.remote_addr = Ipv4Addr::UNSPECIFIED;
			tcb.conn.remote_port = 0;
			stack.tcp.link(td, tcb.conn);
			tcb.placement = Placement::Linked;
			set_state(stack, td, tcb, State::Listen);
		} else {
			close_self(stack, td, tcb, Some(Error::Reset));
		}
		debug!("tcp[{td}]: reset in {:?}", tcb.state);
		stats.reset_in.fetch_add(1, Ordering::Relaxed);
		return Verdict::Drop;
	}

	// Precedence must match once a connection exists.
	if (seg.tos & TOS_PREC_MASK) != (tcb.hdr.ip.tos & TOS_PREC_MASK) {
		warn!("tcp[{td}]: precedence mismatch");
		return Verdict::Reset;
	}

	// A SYN here is erroneous.
	if seg.flags.syn() {
		debug!("tcp[{td}]: unexpected SYN in {:?}", tcb.state);
		return Verdict::Reset;
	}

	// Every segment after synchronization carries an ACK.
	if !seg.flags.ack() {
		debug!("tcp[{td}]: missing ACK in {:?}", tcb.state);
		return Verdict::Drop;
	}

	match tcb.state {
		State::SynReceived => {
			if seq::within(seg.ack, tcb.snd.una.wrapping_add(1), tcb.snd.nxt) {
				super::tcb::update(stack, td, tcb, seg);
				set_state(stack, td, tcb, State::Established);
			} else {
				return Verdict::Reset;
			}
		}
		State::Established | State::CloseWait => super::tcb::update(stack, td, tcb, seg),
		State::FinWait1 => {
			super::tcb::update(stack, td, tcb, seg);
			if tcb.snd_cnt == 0 {
				// Our FIN is acknowledged.
				set_state(stack, td, tcb, State::FinWait2);
			}
		}
		State::FinWait2 => {
			super::tcb::update(stack, td, tcb, seg);
			// Still hearing from the peer; push the FINWAIT2 bound out.
			let deadline = stack.clock.now() + std::time::Duration::from_secs(MAXFINWAIT2);
			arm_resend(stack, td, tcb, deadline);
		}
		State::Closing => {
			super::tcb::update(stack, td, tcb, seg);
			if tcb.snd_cnt == 0 {
				set_state(stack, td, tcb, State::TimeWait);
				start_2msl(stack, td, tcb);
			}
		}
		State::LastAck => {
			super::tcb::update(stack, td, tcb, seg);
			if tcb.snd_cnt == 0 {
				return Verdict::Close;
			}
		}
		// Nothing in TIME_WAIT: forcing an ACK here can feed a permanent
		// ACK-ACK loop with a peer doing the same.
		State::TimeWait => {}
		_ => {}
	}

	Verdict::Ok
}

/// Process an incoming datagram handed up from IP, headers leading.
pub(crate) fn tcp_input(stack: &Arc<Stack>, chain: Chain, ip_hlen: usize) {
	let pool = &stack.pool;
	let stats = &stack.tcp.stats;

	// The TCP checksum covers a pseudo-header without IP options; re-pack
	// the chain so they are gone.
	let mut chain = chain;
	if ip_hlen > IP_HDR_LEN {
		let Some(c) = ip::strip_options(stack, chain, ip_hlen) else {
			return;
		};
		chain = c;
	}

	// Both headers together in the head buffer.
	if pool.head_len(&chain) < IP_HDR_LEN + TCP_HDR_LEN {
		let Some(c) = pool.pullup(chain, IP_HDR_LEN + TCP_HDR_LEN) else {
			stats.runt.fetch_add(1, Ordering::Relaxed);
			debug!("input: runt packet");
			return;
		};
		chain = c;
	}

	// Form the pseudo-header in place: clear the TTL and put the TCP
	// length in the IP checksum slot, then sum from the TTL on.
	let total = pool.with_mut(&chain, |b| {
		let iph: &mut IpHdr = bytes::cast_mut(b);
		iph.ttl = 0;
		let total = iph.len.get();
		iph.csum = (total - IP_HDR_LEN as u16).into();
		total
	});
	if pool.checksum(&chain, total as usize - 8, 8) != 0 {
		stats.checksum.fetch_add(1, Ordering::Relaxed);
		debug!("input: bad checksum");
		return pool.free(chain);
	}

	let Some(mut seg) = read_seg(pool, &chain) else {
		stats.runt.fetch_add(1, Ordering::Relaxed);
		debug!("input: bad TCP header");
		return pool.free(chain);
	};

	let conn = Connection {
		local_addr: seg.dst,
		local_port: seg.dst_port,
		remote_addr: seg.src,
		remote_port: seg.src_port,
	};

	// Find the connection, or a listener willing to take it.
	let (td, mut tcb): (usize, MutexGuard<Tcb>) = match stack.tcp.lookup(&conn) {
		Some(td) => {
			let guard = stack.tcp.entries[td].tcb.lock().unwrap();
			if guard.placement != Placement::Linked || guard.conn != conn {
				// The block went away between lookup and lock.
				return pool.free(chain);
			}
			(td, guard)
		}
		None => {
			if !seg.flags.syn() {
				return reset(stack, chain, &seg);
			}
			// A listener bound to the local address, or a wildcard one.
			let mut lconn = conn;
			lconn.remote_addr = Ipv4Addr::UNSPECIFIED;
			lconn.remote_port = 0;
			let listener = stack.tcp.lookup(&lconn).or_else(|| {
				lconn.local_addr = Ipv4Addr::UNSPECIFIED;
				stack.tcp.lookup(&lconn)
			});
			let Some(ltd) = listener else {
				return reset(stack, chain, &seg);
			};

			let lentry = &stack.tcp.entries[ltd];
			let mut ltcb = lentry.tcb.lock().unwrap();

			let (td, mut tcb) = if ltcb.clone {
				// The clone rule: spawn a child block for this connection
				// and queue it for accept; the listener keeps listening.
				if ltcb.listen_q.len() >= ltcb.listen_open {
					drop(ltcb);
					debug!("tcp[{ltd}]: listen queue full");
					return reset(stack, chain, &seg);
				}
				let Some(ntd) = stack.tcp.alloc() else {
					drop(ltcb);
					return reset(stack, chain, &seg);
				};
				let nentry = &stack.tcp.entries[ntd];
				let mut ntcb = nentry.tcb.lock().unwrap();
				ntcb.placement = Placement::Unlinked;
				ntcb.init();
				ntcb.state = State::Listen;
				ntcb.free_on_close = false;
				ntcb.close_reason = None;
				ntcb.clone = true;
				ntcb.keep_alive = ltcb.keep_alive;
				ntcb.trace_level = ltcb.trace_level;
				ntcb.hdr.ip.tos = ltcb.hdr.ip.tos;

				ltcb.listen_q.push(ntd);
				lentry.connect.notify_all();
				drop(ltcb);
				(ntd, ntcb)
			} else {
				// No clone: the listener itself transitions. It will be
				// re-linked with its full identity below.
				if ltcb.placement == Placement::Linked {
					stack.tcp.unlink(ltd, &ltcb.conn);
					ltcb.placement = Placement::Unlinked;
				}
				(ltd, ltcb)
			};

			// Fill in the identity from the incoming packet.
			tcb.conn = conn;
			tcb.hdr.ip.src = conn.local_addr;
			tcb.hdr.ip.dst = conn.remote_addr;
			tcb.hdr.tcp.src = conn.local_port.into();
			tcb.hdr.tcp.dst = conn.remote_port.into();
			load_path_defaults(stack, &mut tcb);
			stack.tcp.link(td, conn);
			tcb.placement = Placement::Linked;
			(td, tcb)
		}
	};

	let entry = &stack.tcp.entries[td];

	trace!(
		"tcp[{td}]: in {:?} {}:{} -> {}:{} {}@{} ack {} win {}",
		seg.flags,
		seg.src,
		seg.src_port,
		seg.dst,
		seg.dst_port,
		seg.data_len,
		seg.seq,
		seg.ack,
		seg.win
	);

	// Traffic restarts the keep-alive clock.
	if let Some(interval) = tcb.keep_alive {
		tcb.keep_probes = 0;
		let deadline = stack.clock.now() + interval;
		arm_keep(stack, td, &mut tcb, deadline);
	}

	// Unsynchronized-state processing (p. 64-68).
	match tcb.state {
		State::Closed => {
			drop(tcb);
			if seg.flags.rst() {
				stats.reset_in.fetch_add(1, Ordering::Relaxed);
				return pool.free(chain);
			}
			return reset(stack, chain, &seg);
		}

		State::Listen => {
			if seg.flags.rst() {
				stats.reset_in.fetch_add(1, Ordering::Relaxed);
				return pool.free(chain);
			}
			if seg.flags.ack() {
				drop(tcb);
				return reset(stack, chain, &seg);
			}
			if !seg.flags.syn() {
				debug!("tcp[{td}]: dropping non-SYN in LISTEN");
				return pool.free(chain);
			}

			// Adopt a higher incoming precedence (we take the whole TOS).
			if (seg.tos & TOS_PREC_MASK) > (tcb.hdr.ip.tos & TOS_PREC_MASK) {
				tcb.hdr.ip.tos = seg.tos;
			}

			stats.conin.fetch_add(1, Ordering::Relaxed);
			proc_syn(&mut tcb, &seg);
			send_syn(stack, &mut tcb);
			set_state(stack, td, &mut tcb, State::SynReceived);

			if seg.data_len == 0 && !seg.flags.fin() {
				pool.free(chain);
				drop(tcb);
				return tcp_output(stack, td);
			}
			// A data-bearing SYN: carry on into the common path.
		}

		State::SynSent => {
			if seg.flags.ack() && !seq::within(seg.ack, tcb.iss.wrapping_add(1), tcb.snd.nxt) {
				drop(tcb);
				return reset(stack, chain, &seg);
			}
			if seg.flags.rst() {
				if seg.flags.ack() {
					// The ack is acceptable (just checked): this is how the
					// remote end refuses a connection.
					close_self(stack, td, &mut tcb, Some(Error::Reset));
				}
				stats.reset_in.fetch_add(1, Ordering::Relaxed);
				return pool.free(chain);
			}

			// Precedence rules: with an ACK it must match; without, adopt
			// anything higher.
			if seg.flags.ack() {
				if (seg.tos & TOS_PREC_MASK) != (tcb.hdr.ip.tos & TOS_PREC_MASK) {
					warn!("tcp[{td}]: precedence mismatch in SYN-SENT");
					drop(tcb);
					return reset(stack, chain, &seg);
				}
			} else if (seg.tos & TOS_PREC_MASK) > (tcb.hdr.ip.tos & TOS_PREC_MASK) {
				tcb.hdr.ip.tos = seg.tos;
			}

			if !seg.flags.syn() {
				debug!("tcp[{td}]: dropping non-SYN in SYN-SENT");
				return pool.free(chain);
			}

			proc_syn(&mut tcb, &seg);
			if seg.flags.ack() {
				// Our SYN has been acked, or the ACK would not have been
				// acceptable.
				super::tcb::update(stack, td, &mut tcb, &seg);
				set_state(stack, td, &mut tcb, State::Established);
			} else {
				set_state(stack, td, &mut tcb, State::SynReceived);
			}

			if seg.data_len == 0 && !seg.flags.fin() {
				pool.free(chain);
				drop(tcb);
				return tcp_output(stack, td);
			}
		}

		_ => {}
	}

	// Common processing for synchronized states. A data-bearing SYN that
	// fell through from above cannot fail the trim.
	if trim_seg(stack, &mut tcb, &mut seg, &chain).is_none() {
		debug!("tcp[{td}]: unacceptable segment in {:?}", tcb.state);
		if !seg.flags.rst() {
			// Re-send the last ACK to resynchronize the peer.
			tcb.force = true;
			drop(tcb);
			tcp_output(stack, td);
		}
		return pool.free(chain);
	}

	// The acknowledgment is processed before the segment can be dropped
	// for buffer shortage or parked for resequencing, so the send side
	// clears as early as possible.
	match proc_in_flags(stack, td, &mut tcb, &seg) {
		Verdict::Close => {
			close_self(stack, td, &mut tcb, None);
			return pool.free(chain);
		}
		Verdict::Drop => return pool.free(chain),
		Verdict::Reset => {
			drop(tcb);
			return reset(stack, chain, &seg);
		}
		Verdict::Ok => {}
	}

	// Keep enough buffers free to go on operating: drain the resequencing
	// queue if this is the expected segment, and failing that drop this
	// one (the peer will retransmit).
	let mut cur = Some(chain);
	if pool.free_count() < tcb.min_free_bufs {
		if seg.seq == tcb.rcv.nxt {
			while !tcb.reseq.is_empty() && pool.free_count() < tcb.min_free_bufs {
				debug!("tcp[{td}]: clearing reseq queue");
				let c = pool.dequeue(&mut tcb.reseq).unwrap();
				pool.free(c);
			}
		}
		if pool.free_count() < tcb.min_free_bufs {
			debug!("tcp[{td}]: drop, insufficient free buffers");
			pool.free(cur.take().unwrap());
		}
	} else if seg.seq != tcb.rcv.nxt && (seg.data_len > 0 || seg.flags.fin()) {
		// Out of order: park it, sorted by sequence, and re-ack.
		trace!("tcp[{td}]: queued {} out of order", seg.data_len);
		let c = cur.take().unwrap();
		pool.enqueue_sorted(&mut tcb.reseq, c, seg.seq);
		tcb.force = true;
	}

	// Process the expected segment, then whatever the resequencing queue
	// can now satisfy.
	while let Some(chain) = cur.take() {
		if seg.data_len > 0 {
			match pool.split(&chain, seg.ip_hlen + seg.tcp_hlen) {
				Some(text) => match tcb.state {
					State::SynReceived | State::Established | State::FinWait1 | State::FinWait2 => {
						pool.enqueue(&mut tcb.rcvq, text);
						tcb.rcv_cnt += seg.data_len;
						tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(seg.data_len as u32);
						// Chains, not octets, are the unit of queueing, so
						// the window moves in buffer-size steps.
						tcb.rcv.wnd = tcb.rcv.wnd.saturating_sub(NBUFSZ as u16);
						tcb.force = true;
					}
					_ => {
						debug!("tcp[{td}]: text ignored in {:?}", tcb.state);
						pool.free(text);
					}
				},
				None => {
					// Could not detach the text; leave rcv.nxt alone and
					// let the peer retransmit.
					warn!("tcp[{td}]: no buffer to split segment");
				}
			}
		}

		// Wake readers before the ACK goes out, so a higher-priority
		// application gets a chance to piggyback a reply, and before FIN
		// processing so the close lands after the data.
		if tcb.rcv_cnt != 0 {
			entry.read.notify_all();
		}

		if seg.flags.fin() {
			tcb.force = true;
			match tcb.state {
				State::SynReceived | State::Established => {
					tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
					set_state(stack, td, &mut tcb, State::CloseWait);
				}
				State::FinWait1 => {
					tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
					if tcb.snd_cnt == 0 {
						// Our FIN is already acked; skip CLOSING.
						set_state(stack, td, &mut tcb, State::TimeWait);
						start_2msl(stack, td, &mut tcb);
					} else {
						set_state(stack, td, &mut tcb, State::Closing);
					}
				}
				State::FinWait2 => {
					tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
					set_state(stack, td, &mut tcb, State::TimeWait);
					start_2msl(stack, td, &mut tcb);
				}
				State::CloseWait | State::Closing | State::LastAck => {}
				State::TimeWait => {
					// A retransmitted FIN restarts the quiet period (p. 76).
					start_2msl(stack, td, &mut tcb);
				}
				_ => {}
			}
		}

		// Done with this segment's headers; any text was detached above.
		pool.free(chain);

		// Pull forward whatever the resequencing queue now satisfies.
		while let Some(sort) = pool.head_sort(&tcb.reseq) {
			if !seq::ge(tcb.rcv.nxt, sort) {
				break;
			}
			let c = pool.dequeue(&mut tcb.reseq).unwrap();
			let Some(mut s) = read_seg(pool, &c) else {
				pool.free(c);
				continue;
			};
			if trim_seg(stack, &mut tcb, &mut s, &c).is_none() {
				pool.free(c);
				continue;
			}
			seg = s;
			cur = Some(c);
			break;
		}
	}

	// Send any ACK or window update owed.
	drop(tcb);
	tcp_output(stack, td);
}
