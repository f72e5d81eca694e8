//! The transmit scheduler and its timers.

use std::sync::Arc;

use log::{debug, trace, warn};
use nbuf::Chain;
use utils::bytes::{self, as_slice};

use super::input::Seg;
use super::tcb::{arm_keep, arm_resend, close_self, resend_interval, State};
use super::{seq, Flags, Offset, MAXIFHDR, MAXKEEPTIMES, MAXRETRANS};
use super::{Error, TcpHdr, TCPOLEN_MAXSEG, TCPOPT_MAXSEG, TCPTTL, TCP_HDR_LEN, TCP_MAXQUEUE, TCP_MINSEG};
use crate::ip::{self, IpHdr, IP_HDR_LEN};
use crate::Stack;
use bilge::prelude::*;

/// Send whatever the window and the queue allow. A segment goes out only
/// when there is data to move or an ACK/window update is owed.
///
/// The block's lock is held across the loop and released only around the
/// handoff to IP, so input processing can update the send state between
/// iterations (and so a loopback delivery can take the lock itself).
pub(crate) fn tcp_output(stack: &Arc<Stack>, td: usize) {
	let entry = &stack.tcp.entries[td];
	let pool = &stack.pool;
	let mut tcb = entry.tcb.lock().unwrap();

	if tcb.state == State::Listen || tcb.state == State::Closed {
		return;
	}
	let epoch = tcb.epoch;

	loop {
		let sent = tcb.in_flight();

		// Nothing but the SYN retransmit goes out until the SYN is acked.
		if sent != 0 && !tcb.synack {
			break;
		}

		// Usable window: the offered window limited by the congestion
		// window, less what is already in the pipe. A closed window gets a
		// single one-byte probe.
		let usable = if tcb.snd.wnd == 0 {
			if sent != 0 {
				0
			} else {
				1
			}
		} else {
			tcb.snd.wnd.min(tcb.cwind).saturating_sub(sent)
		};

		// Segment size: usable window, what we have on hand, or the MSS,
		// whichever is least.
		let mut ssize = tcb.snd_cnt.saturating_sub(sent).min(usable).min(tcb.mss);

		// Modified Nagle rule: with data outstanding, hold small segments
		// back unless the queue is at quota or this is the last segment
		// before our FIN.
		if sent != 0
			&& ssize < TCP_MINSEG
			&& tcb.sndq.len() < TCP_MAXQUEUE
			&& !(tcb.state == State::FinWait1 && ssize == tcb.snd_cnt.saturating_sub(sent))
		{
			ssize = 0;
		}

		if ssize == 0 && !tcb.force {
			break;
		}
		tcb.force = false;

		// Choose the flags and header size. A state transition associated
		// with this segment has already happened, which is what lets the
		// retransmit timer call in here with force set.
		let mut flags = Flags::none();
		if tcb.state != State::SynSent {
			flags.set_ack(true);
		}
		let mut dsize = ssize;
		let mut hsize = IP_HDR_LEN + TCP_HDR_LEN;

		if (tcb.state == State::SynSent || tcb.state == State::SynReceived) && tcb.snd.ptr == tcb.iss {
			// (Re)sending the first sequence number of the connection: a
			// SYN, carrying the MSS option.
			flags.set_syn(true);
			dsize -= 1;
			hsize += TCPOLEN_MAXSEG as usize;
			let mss = tcb.mss;
			tcb.hdr.opts[0] = TCPOPT_MAXSEG;
			tcb.hdr.opts[1] = TCPOLEN_MAXSEG;
			tcb.hdr.opts[2] = (mss >> 8) as u8;
			tcb.hdr.opts[3] = mss as u8;
		}

		// Sequence and window values. A keep-alive probe repeats the last
		// acknowledged octet so it cannot be mistaken for data.
		let seq_no = if dsize == 0 && tcb.keepalive {
			tcb.snd.una.wrapping_sub(1)
		} else {
			tcb.snd.ptr
		};
		tcb.hdr.tcp.seq = seq_no.into();
		tcb.hdr.tcp.ack = tcb.rcv.nxt.into();
		tcb.hdr.tcp.win = tcb.rcv.wnd.into();
		tcb.hdr.tcp.urg = 0u16.into();

		// Start the segment buffer with room for the link and protocol
		// headers.
		let Some(sbuf) = pool.get() else {
			warn!("tcp[{td}]: output: no free buffers");
			break;
		};
		pool.advance(&sbuf, MAXIFHDR + hsize);

		// Load the payload off the send queue. SYN and FIN occupy sequence
		// space and are counted in snd_cnt without sitting on the queue, so
		// a short read tells us the FIN goes with this segment.
		if dsize > 0 {
			let got = pool.append_from_queue(&sbuf, &tcb.sndq, sent as usize, dsize as usize);
			if got != dsize as usize {
				flags.set_fin(true);
				dsize -= 1;
			}
		} else if tcb.keepalive {
			// A dummy octet keeps stacks that ignore empty segments honest.
			dsize = pool.append_byte(&sbuf, b'?') as u16;
		}
		tcb.keepalive = false;

		// Push when this flushes the queue.
		if dsize != 0 && sent + ssize == tcb.snd_cnt {
			flags.set_psh(true);
		}

		// Keep score of retransmitted sequence numbers.
		if seq::lt(tcb.snd.ptr, tcb.snd.nxt) {
			tcb.resent += (tcb.snd.nxt.wrapping_sub(tcb.snd.ptr)).min(ssize as u32);
		}
		tcb.snd.ptr = tcb.snd.ptr.wrapping_add(ssize as u32);
		if seq::gt(tcb.snd.ptr, tcb.snd.nxt) {
			tcb.snd.nxt = tcb.snd.ptr;
		}

		// Finish the cached header and prepend it. The cache TTL is zero,
		// which is exactly what the pseudo-header checksum wants.
		tcb.hdr.ip.len = ((hsize + dsize as usize) as u16).into();
		tcb.hdr.ip.id = stack.ip.next_id().into();
		tcb.hdr.tcp.off = Offset::new(u4::new(0), u4::new(((hsize - IP_HDR_LEN) / 4) as u8));
		tcb.hdr.tcp.flags = flags;
		tcb.hdr.tcp.csum = 0u16.into();
		tcb.hdr.ip.csum = 0u16.into();

		let hdr_bytes = &as_slice::<u8, _>(&tcb.hdr)[..hsize];
		let Some(sbuf) = pool.prepend(sbuf, hdr_bytes) else {
			warn!("tcp[{td}]: output: failed to write header");
			break;
		};

		// The pseudo-header trick: with the TTL zero, load the TCP length
		// into the IP checksum slot and sum everything from the TTL on.
		let tcp_len = (hsize + dsize as usize - IP_HDR_LEN) as u16;
		pool.with_mut(&sbuf, |b| {
			bytes::cast_mut::<IpHdr, _>(b).csum = tcp_len.into();
		});
		let csum = pool.checksum(&sbuf, pool.len(&sbuf) - 8, 8);
		pool.with_mut(&sbuf, |b| {
			let (ih, th) = b.split_at_mut(IP_HDR_LEN);
			bytes::cast_mut::<TcpHdr, _>(th).csum = csum.into();
			bytes::cast_mut::<IpHdr, _>(ih).ttl = TCPTTL;
		});

		// Sending data or flags (re)starts the retransmission timer, and
		// the round-trip clock if it is idle.
		if ssize != 0 {
			let deadline = stack.clock.now() + resend_interval(&tcb);
			arm_resend(stack, td, &mut tcb, deadline);
			if tcb.rtt_start.is_none() {
				tcb.rtt_start = Some(stack.clock.now());
				tcb.rtt_seq = tcb.snd.ptr;
			}
		}

		trace!(
			"tcp[{td}]: out {:?} seq {} ack {} win {} len {}",
			flags,
			seq_no,
			tcb.rcv.nxt,
			tcb.rcv.wnd,
			dsize
		);

		// Hand the segment to IP with the lock released; a loopback
		// delivery re-enters the engine on this very stack frame.
		drop(tcb);
		ip::raw_out(stack, sbuf);
		tcb = entry.tcb.lock().unwrap();

		if tcb.epoch != epoch || tcb.state == State::Closed {
			break;
		}
	}
}

/// The resend timer: retransmission, the 2MSL wait, and the FINWAIT2 bound
/// all ride on it, told apart by the connection state.
pub(crate) fn resend_timeout(stack: &Arc<Stack>, td: usize, epoch: u64) {
	let entry = &stack.tcp.entries[td];
	let mut tcb = entry.tcb.lock().unwrap();
	if tcb.epoch != epoch || tcb.state == State::Closed {
		return;
	}

	debug!("tcp[{td}]: resend timer in {:?}", tcb.state);

	// The timer is meaningful only with unacknowledged output or in the
	// timed wait states.
	if tcb.snd.una == tcb.snd.nxt && tcb.state != State::TimeWait && tcb.state != State::FinWait2 {
		return;
	}

	// Rescheduled deadlines supersede the one this expiry was armed for.
	if let Some(deadline) = tcb.resend_deadline {
		let now = stack.clock.now();
		if deadline > now {
			arm_resend(stack, td, &mut tcb, deadline);
			return;
		}
	}

	if tcb.state == State::TimeWait || (tcb.state == State::FinWait2 && tcb.free_on_close) {
		// The quiet period is over (or the peer never finished closing).
		close_self(stack, td, &mut tcb, None);
		return;
	}

	if tcb.retrans_cnt >= MAXRETRANS {
		close_self(stack, td, &mut tcb, Some(Error::Timeout));
		return;
	}
	tcb.retrans_cnt += 1;

	// Back off, shrink to one segment, and resend from the oldest
	// unacknowledged octet.
	tcb.retran = true;
	tcb.backoff += 1;
	tcb.snd.ptr = tcb.snd.una;
	tcb.ssthresh = (tcb.cwind / 2).max(tcb.mss);
	tcb.cwind = tcb.mss;

	drop(tcb);
	tcp_output(stack, td);
}

/// The keep-alive timer.
pub(crate) fn keep_timeout(stack: &Arc<Stack>, td: usize, epoch: u64) {
	let entry = &stack.tcp.entries[td];
	let mut tcb = entry.tcb.lock().unwrap();
	if tcb.epoch != epoch {
		return;
	}

	let Some(interval) = tcb.keep_alive else { return };
	if tcb.state != State::Established && tcb.state != State::CloseWait {
		return;
	}

	// Input traffic pushes the deadline forward; if it is still ahead of
	// us, just re-arm.
	if let Some(deadline) = tcb.keep_deadline {
		if deadline > stack.clock.now() {
			arm_keep(stack, td, &mut tcb, deadline);
			return;
		}
	}

	if tcb.keep_probes >= MAXKEEPTIMES {
		warn!("tcp[{td}]: keep-alive expired, closing");
		close_self(stack, td, &mut tcb, Some(Error::Timeout));
		return;
	}
	tcb.keep_probes += 1;

	let deadline = stack.clock.now() + interval;
	arm_keep(stack, td, &mut tcb, deadline);
	tcb.force = true;
	tcb.keepalive = true;

	drop(tcb);
	tcp_output(stack, td);
}

/// Compose an acceptable RST in place on the offending segment and send it
/// back. Never in response to an RST.
pub(crate) fn reset(stack: &Arc<Stack>, chain: Chain, seg: &Seg) {
	let pool = &stack.pool;

	if seg.flags.rst() {
		return pool.free(chain);
	}
	stack.tcp.stats.reset_out.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
	debug!("tcp: reset to {}:{}", seg.src, seg.src_port);

	pool.with_mut(&chain, |b| {
		let (ih, th) = b.split_at_mut(seg.ip_hlen);
		let ip: &mut IpHdr = bytes::cast_mut(ih);
		let tcp: &mut TcpHdr = bytes::cast_mut(th);

		core::mem::swap(&mut ip.src, &mut ip.dst);
		let (sp, dp) = (tcp.src, tcp.dst);
		tcp.src = dp;
		tcp.dst = sp;

		let mut rflags = Flags::none();
		rflags.set_rst(true);
		if seg.flags.ack() {
			// Clearing a half-open connection: our sequence is their ack.
			tcp.seq = seg.ack.into();
			tcp.ack = 0u32.into();
		} else {
			// Rejecting a connection request: acknowledge their SYN.
			rflags.set_ack(true);
			let mut ack = seg.seq;
			if seg.flags.syn() {
				ack = ack.wrapping_add(1);
			}
			ack = ack.wrapping_add(seg.data_len as u32);
			if seg.flags.fin() {
				ack = ack.wrapping_add(1);
			}
			tcp.ack = ack.into();
			tcp.seq = 0u32.into();
		}
		tcp.flags = rflags;
		tcp.win = 0u16.into();
		tcp.urg = 0u16.into();

		// The zero-TTL pseudo-header again; the TTL was cleared on input.
		ip.ttl = 0;
		ip.csum = (ip.len.get() - seg.ip_hlen as u16).into();
		tcp.csum = 0u16.into();
	});

	let csum = pool.checksum(&chain, pool.len(&chain) - 8, 8);
	pool.with_mut(&chain, |b| {
		let (ih, th) = b.split_at_mut(seg.ip_hlen);
		bytes::cast_mut::<TcpHdr, _>(th).csum = csum.into();
		bytes::cast_mut::<IpHdr, _>(ih).ttl = TCPTTL;
	});

	ip::raw_out(stack, chain);
}
