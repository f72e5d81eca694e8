//! The transmission control block and its state transitions.

use core::mem::size_of;
use core::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bilge::prelude::*;
use log::{debug, info, trace, warn};
use nbuf::{Chain, Queue, NBUFSZ};
use runtime::TimerKey;
use utils::bytes::{Cast, Unaligned};

use super::{output, seq, Connection, Error, Flags, Offset, TcpHdr};
use super::{AGAIN, DGAIN, GRANULARITY_MS, MAXFINWAIT2, MSL2, OPTSPACE, TCP_DEFMSS, TCP_DEFRTT, TCP_ISSTHRESH};
use crate::ip::{IpHdr, Meta, Protocol, Version, IP_HDR_LEN};
use crate::tcp::backoff;
use crate::Stack;

/// Connection states, RFC 793 section 3.2.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum State {
	Closed,
	Listen,
	SynSent,
	SynReceived,
	Established,
	FinWait1,
	FinWait2,
	CloseWait,
	Closing,
	LastAck,
	TimeWait,
}

impl State {
	/// A connection that has seen its SYN exchange.
	pub fn synchronized(self) -> bool {
		self >= State::Established
	}
}

/// Where the control block currently lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Placement {
	/// On the free list.
	Free,
	/// Allocated but not reachable through the connection table.
	Unlinked,
	/// On a hash chain.
	Linked,
}

/// The cached TCP/IP header pair, mutated in place before each transmit so
/// the last-sent header is always inspectable. The TTL stays zero in the
/// cache: the TCP checksum is computed over the pseudo-header formed by the
/// zeroed TTL, the protocol, and the TCP length loaded into the IP checksum
/// slot, and the real TTL goes in after.
#[repr(C)]
pub struct TcpIpHdr {
	pub ip: IpHdr,
	pub tcp: TcpHdr,
	pub opts: [u8; OPTSPACE],
}

unsafe impl Cast for TcpIpHdr {}
unsafe impl Unaligned for TcpIpHdr {}

const _: () = assert!(size_of::<TcpIpHdr>() == 40 + OPTSPACE);

/// Send sequence state.
#[derive(Default)]
pub struct SndSeq {
	/// First unacknowledged sequence number.
	pub una: u32,
	/// Next sequence number to send for the first time.
	pub nxt: u32,
	/// Rolling transmission pointer.
	pub ptr: u32,
	/// The peer's offered window.
	pub wnd: u16,
	/// Segment sequence number of the last window update.
	pub wl1: u32,
	/// Ack number of the last window update.
	pub wl2: u32,
}

/// Receive sequence state.
#[derive(Default)]
pub struct RcvSeq {
	/// Next sequence number expected.
	pub nxt: u32,
	/// Our offered window.
	pub wnd: u16,
	/// Receive urgent pointer.
	pub up: u16,
}

pub struct Tcb {
	pub conn: Connection,
	pub placement: Placement,
	pub state: State,
	/// Bumped every time the block is freed; timer callbacks check it so a
	/// stale expiry cannot touch a reused block.
	pub epoch: u64,

	pub free_on_close: bool,
	pub close_reason: Option<Error>,
	pub trace_level: u8,

	pub snd: SndSeq,
	pub iss: u32,
	pub cwind: u16,
	pub ssthresh: u16,
	pub resent: u32,

	pub rcv: RcvSeq,
	pub irs: u32,
	pub mss: u16,
	pub rerecv: u32,

	/// Free buffers to keep in reserve before queueing input.
	pub min_free_bufs: usize,

	pub backoff: u32,

	/// We owe the peer an ACK or a window update.
	pub force: bool,
	/// Server listener: incoming SYNs spawn a child block.
	pub clone: bool,
	/// At least one retransmission has occurred.
	pub retran: bool,
	/// Opened actively.
	pub active: bool,
	/// Our SYN has been acknowledged.
	pub synack: bool,
	/// The next output is a keep-alive probe.
	pub keepalive: bool,

	/// Cloned children awaiting accept, oldest first.
	pub listen_open: usize,
	pub listen_q: Vec<usize>,

	pub rcvq: Queue,
	pub rcv_cnt: u16,
	/// One dequeued chain being drained by the reader.
	pub rcv_buf: Option<Chain>,

	pub sndq: Queue,
	/// Unacknowledged sequence numbers on the send side, the SYN and FIN
	/// included even though they never sit on the queue.
	pub snd_cnt: u16,

	pub reseq: Queue,

	pub resend_timer: TimerKey,
	pub resend_deadline: Option<Instant>,
	pub retrans_cnt: u32,
	pub rtt_start: Option<Instant>,
	pub rtt_seq: u32,
	/// Smoothed round-trip time, milliseconds.
	pub srtt: u32,
	/// Mean deviation, milliseconds.
	pub mdev: u32,

	pub keep_alive: Option<Duration>,
	pub keep_probes: u32,
	pub keep_deadline: Option<Instant>,
	pub keep_timer: TimerKey,

	pub hdr: TcpIpHdr,
}

fn blank_hdr() -> TcpIpHdr {
	TcpIpHdr {
		ip: IpHdr {
			meta: Meta::new(u4::new(5), Version::V4),
			tos: 0,
			len: 0u16.into(),
			id: 0u16.into(),
			frag: crate::ip::Fragment::new(u13::new(0), false, false).into(),
			ttl: 0,
			proto: Protocol::Tcp.into(),
			csum: 0u16.into(),
			src: Ipv4Addr::UNSPECIFIED,
			dst: Ipv4Addr::UNSPECIFIED,
		},
		tcp: TcpHdr {
			src: 0u16.into(),
			dst: 0u16.into(),
			seq: 0u32.into(),
			ack: 0u32.into(),
			off: Offset::new(u4::new(0), u4::new(5)),
			flags: Flags::none(),
			win: 0u16.into(),
			csum: 0u16.into(),
			urg: 0u16.into(),
		},
		opts: [0; OPTSPACE],
	}
}

impl Tcb {
	pub fn new() -> Tcb {
		Tcb {
			conn: Connection::UNSPEC,
			placement: Placement::Free,
			state: State::Closed,
			epoch: 0,
			free_on_close: false,
			close_reason: None,
			trace_level: 0,
			snd: SndSeq::default(),
			iss: 0,
			cwind: 0,
			ssthresh: 0,
			resent: 0,
			rcv: RcvSeq::default(),
			irs: 0,
			mss: TCP_DEFMSS,
			rerecv: 0,
			min_free_bufs: 0,
			backoff: 0,
			force: false,
			clone: false,
			retran: false,
			active: false,
			synack: false,
			keepalive: false,
			listen_open: 0,
			listen_q: Vec::new(),
			rcvq: Queue::new(),
			rcv_cnt: 0,
			rcv_buf: None,
			sndq: Queue::new(),
			snd_cnt: 0,
			reseq: Queue::new(),
			resend_timer: TimerKey::default(),
			resend_deadline: None,
			retrans_cnt: 0,
			rtt_start: None,
			rtt_seq: 0,
			srtt: 0,
			mdev: 0,
			keep_alive: None,
			keep_probes: 0,
			keep_deadline: None,
			keep_timer: TimerKey::default(),
			hdr: blank_hdr(),
		}
	}

	/// Set up the defaults for a fresh connection attempt. The identity a
	/// bind may have placed in the header cache stays put.
	pub fn init(&mut self) {
		self.cwind = TCP_DEFMSS;
		self.ssthresh = TCP_ISSTHRESH;
		self.srtt = TCP_DEFRTT;
		self.mdev = 0;
		self.hdr.ip.tos = 0;
	}

	/// Local address and port out of the header cache.
	pub fn local(&self) -> (Ipv4Addr, u16) {
		(self.hdr.ip.src, self.hdr.tcp.src.get())
	}

	pub fn remote(&self) -> (Ipv4Addr, u16) {
		(self.hdr.ip.dst, self.hdr.tcp.dst.get())
	}

	/// Sequence count in flight (the unacknowledged span up to the rolling
	/// transmit pointer).
	pub fn in_flight(&self) -> u16 {
		self.snd.ptr.wrapping_sub(self.snd.una) as u16
	}
}

/// An initial sequence number: the pool-seeded offset plus 250 times the
/// millisecond clock, in the spirit of RFC 793's 4-microsecond ISN clock.
pub(crate) fn new_iss(stack: &Stack) -> u32 {
	stack.tcp.isn_offset.wrapping_add(stack.clock.millis().wrapping_mul(250))
}

/// Put a SYN on the send side with a fresh initial sequence number.
pub(crate) fn send_syn(stack: &Stack, tcb: &mut Tcb) {
	let iss = new_iss(stack);
	tcb.iss = iss;
	tcb.snd.ptr = iss;
	tcb.snd.nxt = iss;
	tcb.rtt_seq = iss;
	tcb.snd.wl2 = iss;
	tcb.snd.una = iss;
	tcb.snd_cnt += 1;
	tcb.force = true;
}

/// Take note of an incoming SYN (p. 68). `wl1` and the send window are
/// initialized here so the first window update in `update` cannot fail on
/// an unlucky initial receive sequence.
pub(crate) fn proc_syn(tcb: &mut Tcb, seg: &super::input::Seg) {
	tcb.force = true;
	tcb.rcv.nxt = seg.seq.wrapping_add(1);
	tcb.irs = seg.seq;
	tcb.snd.wl1 = seg.seq;
	tcb.snd.wnd = seg.win;
}

/// Re-arm the resend timer for `deadline`.
pub(crate) fn arm_resend(stack: &Arc<Stack>, td: usize, tcb: &mut Tcb, deadline: Instant) {
	stack.timers.cancel(tcb.resend_timer);
	tcb.resend_deadline = Some(deadline);
	let weak = Arc::downgrade(stack);
	let epoch = tcb.epoch;
	tcb.resend_timer = stack.timers.schedule_at(deadline, move || {
		if let Some(stack) = weak.upgrade() {
			output::resend_timeout(&stack, td, epoch);
		}
	});
}

/// The retransmit interval under the current backoff level.
pub(crate) fn resend_interval(tcb: &Tcb) -> Duration {
	let ms = backoff(tcb.backoff) as u64 * (2 * tcb.mdev + tcb.srtt + GRANULARITY_MS) as u64;
	Duration::from_millis(ms)
}

/// Re-arm the keep-alive timer for `deadline`.
pub(crate) fn arm_keep(stack: &Arc<Stack>, td: usize, tcb: &mut Tcb, deadline: Instant) {
	stack.timers.cancel(tcb.keep_timer);
	tcb.keep_deadline = Some(deadline);
	let weak = Arc::downgrade(stack);
	let epoch = tcb.epoch;
	tcb.keep_timer = stack.timers.schedule_at(deadline, move || {
		if let Some(stack) = weak.upgrade() {
			output::keep_timeout(&stack, td, epoch);
		}
	});
}

/// Move to a new state, waking every waiter so each can re-examine the
/// connection. Conditions are posted after the state is written.
pub(crate) fn set_state(stack: &Arc<Stack>, td: usize, tcb: &mut Tcb, new: State) {
	let old = tcb.state;
	if old == new {
		return;
	}
	tcb.state = new;
	debug!("tcp[{td}]: {new:?} from {old:?}");

	if new == State::FinWait2 {
		// Bound the wait for the peer's FIN so a vanished peer cannot pin
		// the block forever.
		let deadline = stack.clock.now() + Duration::from_secs(MAXFINWAIT2);
		arm_resend(stack, td, tcb, deadline);
	}

	let entry = &stack.tcp.entries[td];
	entry.connect.notify_all();
	entry.read.notify_all();
	entry.write.notify_all();

	if new == State::Closed {
		if tcb.free_on_close {
			tcb_free(stack, td, tcb);
		} else if tcb.placement == Placement::Linked {
			stack.tcp.unlink(td, &tcb.conn);
			tcb.placement = Placement::Unlinked;
		}
	}
}

/// Close our end locally: transition to CLOSED and record why.
pub(crate) fn close_self(stack: &Arc<Stack>, td: usize, tcb: &mut Tcb, reason: Option<Error>) {
	tcb.close_reason = reason;
	set_state(stack, td, tcb, State::Closed);
}

/// Start the 2MSL wait.
pub(crate) fn start_2msl(stack: &Arc<Stack>, td: usize, tcb: &mut Tcb) {
	let deadline = stack.clock.now() + Duration::from_secs(MSL2);
	trace!("tcp[{td}]: 2MSL timer in {:?}", tcb.state);
	arm_resend(stack, td, tcb, deadline);
}

/// Discard the queues and hand the block back to the free list. The block
/// is assumed closed.
pub(crate) fn tcb_free(stack: &Arc<Stack>, td: usize, tcb: &mut Tcb) {
	if tcb.placement == Placement::Free {
		warn!("tcp[{td}]: freeing a free block");
		return;
	}
	if tcb.placement == Placement::Linked {
		stack.tcp.unlink(td, &tcb.conn);
	}
	tcb.placement = Placement::Free;
	tcb.epoch += 1;

	stack.timers.cancel(tcb.resend_timer);
	stack.timers.cancel(tcb.keep_timer);
	tcb.resend_timer = TimerKey::default();
	tcb.keep_timer = TimerKey::default();
	tcb.resend_deadline = None;
	tcb.keep_deadline = None;
	tcb.keep_alive = None;
	tcb.keep_probes = 0;
	tcb.rtt_start = None;

	let pool = &stack.pool;
	while let Some(c) = pool.dequeue(&mut tcb.reseq) {
		pool.free(c);
	}
	while let Some(c) = pool.dequeue(&mut tcb.rcvq) {
		pool.free(c);
	}
	tcb.rcv_cnt = 0;
	while let Some(c) = pool.dequeue(&mut tcb.sndq) {
		pool.free(c);
	}
	tcb.snd_cnt = 0;
	if let Some(c) = tcb.rcv_buf.take() {
		pool.free(c);
	}
	tcb.listen_q.clear();
	tcb.listen_open = 0;

	tcb.backoff = 0;
	tcb.retrans_cnt = 0;
	let ptr = tcb.snd.ptr;
	tcb.snd.nxt = ptr;
	tcb.rtt_seq = ptr;
	tcb.snd.wl2 = ptr;
	tcb.snd.una = ptr;
	tcb.iss = ptr;
	tcb.force = false;
	tcb.clone = false;
	tcb.retran = false;
	tcb.active = false;
	tcb.synack = false;
	tcb.keepalive = false;
	tcb.conn = Connection::UNSPEC;
	tcb.hdr = blank_hdr();
	tcb.state = State::Closed;

	stack.tcp.release(td);
	info!("tcp[{td}]: block freed");
}

/// Process an acceptable acknowledgement and window update (p. 72).
pub(crate) fn update(stack: &Arc<Stack>, td: usize, tcb: &mut Tcb, seg: &super::input::Seg) {
	if seq::gt(seg.ack, tcb.snd.nxt) {
		// Acks something not yet sent.
		tcb.force = true;
		return;
	}

	// A window update is checked on every legal ACK, even one that
	// acknowledges nothing: it may be a spontaneous window reopening.
	if seq::gt(seg.seq, tcb.snd.wl1) || (seg.seq == tcb.snd.wl1 && seq::ge(seg.ack, tcb.snd.wl2)) {
		if tcb.snd.wnd == 0 && seg.win != 0 {
			// The window reopened: crank the send pointer back so
			// transmission resumes now rather than at the next probe.
			tcb.snd.ptr = tcb.snd.una;
		}
		tcb.snd.wnd = seg.win;
		tcb.snd.wl1 = seg.seq;
		tcb.snd.wl2 = seg.ack;
	}

	if !seq::gt(seg.ack, tcb.snd.una) {
		// Nothing new acknowledged.
		return;
	}

	let mut acked = seg.ack.wrapping_sub(tcb.snd.una) as u16;

	// Congestion window growth, clamped to the offered window.
	if tcb.cwind < tcb.snd.wnd {
		let mut expand = if tcb.cwind < tcb.ssthresh {
			// Slow start: expand by the amount acked.
			(acked).min(tcb.mss)
		} else {
			// Steady state probe of extra path capacity.
			((tcb.mss as u32 * tcb.mss as u32) / tcb.cwind as u32) as u16
		};
		if tcb.cwind.checked_add(expand).is_none() {
			expand = u16::MAX - tcb.cwind;
		}
		if tcb.cwind + expand > tcb.snd.wnd {
			expand = tcb.snd.wnd - tcb.cwind;
		}
		tcb.cwind += expand;
	}

	// Round-trip estimation, only when the timed range was never
	// retransmitted.
	if let Some(start) = tcb.rtt_start {
		if seq::ge(seg.ack, tcb.rtt_seq) {
			let elapsed = stack.clock.now().duration_since(start).as_millis() as u32;
			tcb.rtt_start = None;
			if !tcb.retran {
				if elapsed > tcb.srtt && (tcb.state == State::SynSent || tcb.state == State::SynReceived) {
					// The first sample; base the whole estimate on it.
					tcb.srtt = elapsed;
				} else {
					let abserr = elapsed.abs_diff(tcb.srtt);
					tcb.srtt = ((AGAIN - 1) * tcb.srtt + elapsed) / AGAIN;
					tcb.mdev = ((DGAIN - 1) * tcb.mdev + abserr) / DGAIN;
				}
				tcb.backoff = 0;
			}
		}
	}

	// The first ack covers our SYN.
	if !tcb.synack {
		tcb.synack = true;
		acked -= 1;
		tcb.snd_cnt -= 1;
	}

	// Remove what was acknowledged from the send queue. A FIN being acked
	// is not on the queue; the count still covers it.
	stack.pool.trim_queue(&mut tcb.sndq, acked as usize, None);
	tcb.snd_cnt = tcb.snd_cnt.saturating_sub(acked);
	tcb.snd.una = seg.ack;

	// Restart the retransmission timer if data remains outstanding.
	stack.timers.cancel(tcb.resend_timer);
	tcb.resend_deadline = None;
	if tcb.snd.una != tcb.snd.nxt {
		let deadline = stack.clock.now() + resend_interval(tcb);
		arm_resend(stack, td, tcb, deadline);
	}

	// Keep the send pointer out of ancient history after retransmissions.
	if seq::lt(tcb.snd.ptr, tcb.snd.una) {
		tcb.snd.ptr = tcb.snd.una;
	}

	// The oldest unacknowledged segment (the only one ever retransmitted)
	// has now been acked.
	tcb.retran = false;

	trace!(
		"tcp[{td}]: snd una {} nxt {} ptr {} wnd {} cwind {} backoff {}",
		tcb.snd.una,
		tcb.snd.nxt,
		tcb.snd.ptr,
		tcb.snd.wnd,
		tcb.cwind,
		tcb.backoff
	);

	if acked > 0 {
		tcb.retrans_cnt = 0;
		if tcb.state == State::Established || tcb.state == State::CloseWait {
			stack.tcp.entries[td].write.notify_all();
		}
	}
}

/// Load the per-connection parameters derived from the path MTU.
pub(crate) fn load_path_defaults(stack: &Stack, tcb: &mut Tcb) {
	tcb.rcv.wnd = super::TCP_DEFWND;
	let mtu = crate::ip::mtu(stack, tcb.hdr.ip.dst);
	tcb.mss = (mtu.saturating_sub(IP_HDR_LEN + super::TCP_HDR_LEN) as u16).max(super::TCP_MINMSS);
	tcb.min_free_bufs = (tcb.mss as usize + NBUFSZ) / NBUFSZ;
}
