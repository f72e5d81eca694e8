//! Scripted connection scenarios against a capturing interface.

use core::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nbuf::{Chain, Pool};

use super::output::resend_timeout;
use super::tcb::{Placement, State};
use super::{Error, Td, TCP_DEFWND};
use crate::ip::NetIf;
use crate::{Config, Stack};

const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const PEER_PORT: u16 = 4000;
const PORT: u16 = 23;

/// Captures outbound IP datagrams as flat byte strings.
struct Wire {
	pool: Arc<Pool>,
	frames: Mutex<Vec<Vec<u8>>>,
}

impl NetIf for Wire {
	fn output(&self, chain: Chain) {
		self.frames.lock().unwrap().push(self.pool.to_vec(&chain));
		self.pool.free(chain);
	}

	fn mtu(&self) -> usize {
		512
	}
}

impl Wire {
	fn take(&self) -> Vec<Vec<u8>> {
		std::mem::take(&mut self.frames.lock().unwrap())
	}

	fn last(&self) -> Vec<u8> {
		self.frames.lock().unwrap().last().expect("a frame was sent").clone()
	}
}

/// A decoded outbound segment.
struct Out {
	seq: u32,
	ack: u32,
	win: u16,
	flags: u8,
	tcp_hlen: usize,
	opts: Vec<u8>,
	payload: Vec<u8>,
}

const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const ACK: u8 = 0x10;

fn parse(frame: &[u8]) -> Out {
	let ip_hlen = (frame[0] & 0x0f) as usize * 4;
	let t = &frame[ip_hlen..];
	let tcp_hlen = (t[12] >> 4) as usize * 4;
	Out {
		seq: u32::from_be_bytes(t[4..8].try_into().unwrap()),
		ack: u32::from_be_bytes(t[8..12].try_into().unwrap()),
		win: u16::from_be_bytes(t[14..16].try_into().unwrap()),
		flags: t[13] & 0x3f,
		tcp_hlen,
		opts: t[20..tcp_hlen].to_vec(),
		payload: t[tcp_hlen..].to_vec(),
	}
}

fn ref_csum(data: &[u8]) -> u16 {
	let mut sum: u32 = 0;
	for pair in data.chunks(2) {
		let w = ((pair[0] as u32) << 8) | if pair.len() == 2 { pair[1] as u32 } else { 0 };
		sum += w;
		while sum >> 16 != 0 {
			sum = (sum & 0xffff) + (sum >> 16);
		}
	}
	!(sum as u16)
}

/// Build a valid segment from the peer and inject it.
fn inject(stack: &Arc<Stack>, seq: u32, ack: u32, flags: u8, win: u16, payload: &[u8]) {
	inject_from(stack, PEER_PORT, seq, ack, flags, win, payload);
}

fn inject_from(stack: &Arc<Stack>, src_port: u16, seq: u32, ack: u32, flags: u8, win: u16, payload: &[u8]) {
	let total = 40 + payload.len();
	let mut b = vec![0u8; total];
	b[0] = 0x45;
	b[2..4].copy_from_slice(&(total as u16).to_be_bytes());
	b[8] = 0; // TTL zero for the pseudo-header sum
	b[9] = 6;
	b[12..16].copy_from_slice(&PEER.octets());
	b[16..20].copy_from_slice(&LOCAL.octets());

	let t = &mut b[20..];
	t[0..2].copy_from_slice(&src_port.to_be_bytes());
	t[2..4].copy_from_slice(&PORT.to_be_bytes());
	t[4..8].copy_from_slice(&seq.to_be_bytes());
	t[8..12].copy_from_slice(&ack.to_be_bytes());
	t[12] = 5 << 4;
	t[13] = flags;
	t[14..16].copy_from_slice(&win.to_be_bytes());
	t[20..].copy_from_slice(payload);

	// TCP checksum over the pseudo-header (TTL zeroed, the TCP length in
	// the IP checksum slot) and everything after it.
	let tcp_len = (total - 20) as u16;
	b[10..12].copy_from_slice(&tcp_len.to_be_bytes());
	let csum = ref_csum(&b[8..]);
	b[36..38].copy_from_slice(&csum.to_be_bytes());

	// Now the real IP header.
	b[8] = 64;
	b[10] = 0;
	b[11] = 0;
	let ip_csum = ref_csum(&b[..20]);
	b[10..12].copy_from_slice(&ip_csum.to_be_bytes());

	let chain = stack.pool.get().unwrap();
	assert_eq!(stack.pool.append(&chain, &b), b.len());
	stack.ip_input(chain);
}

fn stack() -> (Arc<Stack>, Arc<Wire>) {
	let stack = Stack::new(Config { local_addr: LOCAL, buffers: nbuf::MAXNBUFS });
	let wire = Arc::new(Wire { pool: stack.pool.clone(), frames: Mutex::new(Vec::new()) });
	stack.set_default_if(wire.clone());
	(stack, wire)
}

/// Drive a listener through the three-way handshake. Returns the accepted
/// descriptor, our initial sequence number, and the peer's next sequence.
fn establish(stack: &Arc<Stack>, wire: &Wire) -> (Td, u32, u32) {
	let td = stack.tcp_open().unwrap();
	stack.tcp_bind(td, Ipv4Addr::UNSPECIFIED, PORT).unwrap();
	stack.tcp_listen(td, 1).unwrap();

	inject(stack, 1000, 0, SYN, 2048, &[]);

	let synack = parse(&wire.last());
	assert_eq!(synack.flags, SYN | ACK);
	assert_eq!(synack.ack, 1001);
	let iss = synack.seq;

	inject(stack, 1001, iss.wrapping_add(1), ACK, 2048, &[]);

	let (accepted, peer) = stack.tcp_accept(td, Some(Duration::from_millis(200))).unwrap();
	assert_eq!(peer, (PEER, PEER_PORT));
	assert!(stack.tcp_is_up(accepted).unwrap());
	wire.take();
	(accepted, iss, 1001)
}

#[test]
fn three_way_handshake() {
	let (stack, wire) = stack();
	let td = stack.tcp_open().unwrap();
	stack.tcp_bind(td, Ipv4Addr::UNSPECIFIED, PORT).unwrap();
	stack.tcp_listen(td, 1).unwrap();

	inject(&stack, 1000, 0, SYN, 2048, &[]);

	let synack = parse(&wire.last());
	assert_eq!(synack.flags, SYN | ACK);
	assert_eq!(synack.ack, 1001);
	assert_eq!(synack.win, TCP_DEFWND);
	// The SYN carries the MSS option: interface MTU less both headers.
	assert_eq!(synack.tcp_hlen, 24);
	assert_eq!(&synack.opts[..2], &[2, 4]);
	let mss = u16::from_be_bytes(synack.opts[2..4].try_into().unwrap());
	assert_eq!(mss, 512 - 40);

	inject(&stack, 1001, synack.seq.wrapping_add(1), ACK, 2048, &[]);

	let (accepted, peer) = stack.tcp_accept(td, Some(Duration::from_millis(200))).unwrap();
	assert_eq!(peer, (PEER, PEER_PORT));
	assert!(stack.tcp_is_up(accepted).unwrap());

	// The listener is still listening.
	assert!(!stack.tcp_is_up(td).unwrap());
	stack.shutdown();
}

#[test]
fn data_then_fin_from_peer() {
	let (stack, wire) = stack();
	let (td, iss, mut pseq) = establish(&stack, &wire);

	inject(&stack, pseq, iss.wrapping_add(1), ACK, 2048, b"hello");
	pseq += 5;

	// The data is acknowledged and the window shrinks by one buffer.
	let ack = parse(&wire.last());
	assert_eq!(ack.flags, ACK);
	assert_eq!(ack.ack, 1006);
	assert_eq!(ack.win, TCP_DEFWND - nbuf::NBUFSZ as u16);

	let mut buf = [0u8; 32];
	let n = stack.tcp_read(td, &mut buf, None).unwrap();
	assert_eq!(&buf[..n], b"hello");

	// The peer closes its side.
	inject(&stack, pseq, iss.wrapping_add(1), ACK | FIN, 2048, &[]);
	let ack = parse(&wire.last());
	assert_eq!(ack.ack, 1007);

	// Drained and half-closed: end of file.
	assert_eq!(stack.tcp_read(td, &mut buf, None), Err(Error::Eof));

	// Our close sends the FIN and the final ACK releases the block.
	wire.take();
	stack.tcp_close(td).unwrap();
	let fin = parse(&wire.last());
	assert_eq!(fin.flags, FIN | ACK);
	assert_eq!(fin.seq, iss.wrapping_add(1));
	assert_eq!(fin.ack, 1007);

	inject(&stack, pseq + 1, iss.wrapping_add(2), ACK, 2048, &[]);
	assert_eq!(stack.tcp_is_up(td), Err(Error::Param));

	// Every buffer found its way back to the pool.
	assert_eq!(stack.pool.free_count(), nbuf::MAXNBUFS);
	stack.shutdown();
}

/// Force the resend timer to fire now.
fn force_resend(stack: &Arc<Stack>, td: Td) {
	let epoch = {
		let mut tcb = stack.tcp.entries[td.0].tcb.lock().unwrap();
		tcb.resend_deadline = Some(stack.clock.now());
		tcb.epoch
	};
	resend_timeout(stack, td.0, epoch);
}

#[test]
fn retransmit_backs_off_and_times_out() {
	let (stack, wire) = stack();
	let (td, iss, _pseq) = establish(&stack, &wire);

	let data: Vec<u8> = (0u8..200).collect();
	assert_eq!(stack.tcp_write(td, &data, None).unwrap(), 200);

	let sent = parse(&wire.last());
	assert_eq!(sent.payload.len(), 200);
	assert_eq!(sent.seq, iss.wrapping_add(1));
	let cwind_before = stack.tcp.entries[td.0].tcb.lock().unwrap().cwind;

	// The segment is lost; the timer drives a retransmission.
	wire.take();
	force_resend(&stack, td);

	let re = parse(&wire.last());
	assert_eq!(re.seq, sent.seq);
	assert_eq!(re.payload, sent.payload);
	{
		let tcb = stack.tcp.entries[td.0].tcb.lock().unwrap();
		assert_eq!(tcb.backoff, 1);
		assert_eq!(tcb.cwind, tcb.mss);
		assert!(tcb.ssthresh >= tcb.mss);
		assert!(tcb.ssthresh >= cwind_before / 2);
		assert!(tcb.retran);
	}

	// A second loss doubles the backoff.
	force_resend(&stack, td);
	assert_eq!(stack.tcp.entries[td.0].tcb.lock().unwrap().backoff, 2);

	// Persistent loss gives up with a timeout.
	for _ in 0..12 {
		force_resend(&stack, td);
	}
	let tcb = stack.tcp.entries[td.0].tcb.lock().unwrap();
	assert_eq!(tcb.state, State::Closed);
	assert_eq!(tcb.close_reason, Some(Error::Timeout));
	drop(tcb);
	stack.shutdown();
}

#[test]
fn zero_window_probe_and_resume() {
	let (stack, wire) = stack();
	let (td, _iss, pseq) = establish(&stack, &wire);

	let data: Vec<u8> = (0u8..100).collect();
	assert_eq!(stack.tcp_write(td, &data, None).unwrap(), 100);
	let first = parse(&wire.last());
	assert_eq!(first.payload.len(), 100);

	// The peer takes half and slams the window shut.
	inject(&stack, pseq, first.seq.wrapping_add(50), ACK, 0, &[]);
	wire.take();

	// The resend timer turns into a one-byte probe of the closed window.
	force_resend(&stack, td);
	let probe = parse(&wire.last());
	assert_eq!(probe.payload.len(), 1);
	assert_eq!(probe.seq, first.seq.wrapping_add(50));
	assert_eq!(probe.payload[0], data[50]);

	// Only one probe may be outstanding.
	wire.take();
	force_resend(&stack, td);
	let again = parse(&wire.last());
	assert_eq!(again.payload.len(), 1);

	// The window reopens; transmission resumes with the rest.
	wire.take();
	inject(&stack, pseq, first.seq.wrapping_add(51), ACK, 2048, &[]);
	let rest = parse(&wire.last());
	assert_eq!(rest.seq, first.seq.wrapping_add(51));
	assert_eq!(rest.payload.len(), 49);
	assert_eq!(rest.payload[..], data[51..]);

	// And the peer's ack of it leaves nothing outstanding.
	inject(&stack, pseq, first.seq.wrapping_add(100), ACK, 2048, &[]);
	let tcb = stack.tcp.entries[td.0].tcb.lock().unwrap();
	assert_eq!(tcb.snd.una, tcb.snd.nxt);
	assert_eq!(tcb.snd_cnt, 0);
	drop(tcb);
	stack.shutdown();
}

#[test]
fn out_of_order_resequenced() {
	let (stack, wire) = stack();
	let (td, iss, pseq) = establish(&stack, &wire);

	// The second segment arrives first and is parked.
	inject(&stack, pseq + 7, iss.wrapping_add(1), ACK, 2048, b"world!");
	let dup = parse(&wire.last());
	assert_eq!(dup.ack, pseq); // a duplicate ack, nothing consumed

	{
		let tcb = stack.tcp.entries[td.0].tcb.lock().unwrap();
		assert_eq!(tcb.reseq.len(), 1);
	}

	// The gap fills; both segments are delivered in order.
	inject(&stack, pseq, iss.wrapping_add(1), ACK, 2048, b"hello, ");
	let ack = parse(&wire.last());
	assert_eq!(ack.ack, pseq + 13);

	let mut buf = [0u8; 32];
	let n = stack.tcp_read(td, &mut buf, None).unwrap();
	assert_eq!(&buf[..n], b"hello, world!");
	stack.shutdown();
}

#[test]
fn receive_window_closes_and_reopens() {
	let (stack, wire) = stack();
	let (td, iss, pseq) = establish(&stack, &wire);

	// Four unread buffer chains close the 512-octet window.
	let payload = [0x55u8; 100];
	for i in 0..4u32 {
		inject(&stack, pseq + i * 100, iss.wrapping_add(1), ACK, 2048, &payload);
	}
	let ack = parse(&wire.last());
	assert_eq!(ack.win, 0);
	assert_eq!(ack.ack, pseq + 400);

	// Further data must be refused, re-acked at the shut window.
	wire.take();
	inject(&stack, pseq + 400, iss.wrapping_add(1), ACK, 2048, &payload);
	let re = parse(&wire.last());
	assert_eq!(re.win, 0);
	assert_eq!(re.ack, pseq + 400);
	{
		let tcb = stack.tcp.entries[td.0].tcb.lock().unwrap();
		assert_eq!(tcb.rcv_cnt, 400);
	}

	// Draining the queue reopens the window in buffer-sized steps.
	wire.take();
	let mut buf = [0u8; 100];
	let n = stack.tcp_read(td, &mut buf, None).unwrap();
	assert_eq!(n, 100);
	let update = parse(&wire.last());
	assert!(update.win >= nbuf::NBUFSZ as u16);
	stack.shutdown();
}

#[test]
fn reset_tears_connection_down() {
	let (stack, wire) = stack();
	let (td, iss, pseq) = establish(&stack, &wire);

	inject(&stack, pseq, iss.wrapping_add(1), ACK | RST, 2048, &[]);

	let tcb = stack.tcp.entries[td.0].tcb.lock().unwrap();
	assert_eq!(tcb.state, State::Closed);
	assert_eq!(tcb.close_reason, Some(Error::Reset));
	drop(tcb);

	let mut buf = [0u8; 4];
	assert_eq!(stack.tcp_read(td, &mut buf, None), Err(Error::Connect));
	let _ = wire;
	stack.shutdown();
}

#[test]
fn stray_segment_answered_with_reset() {
	let (stack, wire) = stack();

	// No listener anywhere: an ACK out of the blue draws a RST carrying
	// the offending ack as its sequence.
	inject(&stack, 5000, 777, ACK, 1024, &[]);
	let rst = parse(&wire.last());
	assert_eq!(rst.flags, RST);
	assert_eq!(rst.seq, 777);

	// A stray SYN draws RST+ACK acknowledging the SYN.
	wire.take();
	inject(&stack, 9000, 0, SYN, 1024, &[]);
	let rst = parse(&wire.last());
	assert_eq!(rst.flags, RST | ACK);
	assert_eq!(rst.ack, 9001);
	stack.shutdown();
}

#[test]
fn listen_queue_overflow_resets() {
	let (stack, wire) = stack();
	let td = stack.tcp_open().unwrap();
	stack.tcp_bind(td, Ipv4Addr::UNSPECIFIED, PORT).unwrap();
	stack.tcp_listen(td, 1).unwrap();

	// First connection occupies the single backlog slot.
	inject(&stack, 1000, 0, SYN, 2048, &[]);
	assert_eq!(parse(&wire.last()).flags, SYN | ACK);

	// A SYN from another port finds the backlog full and is refused.
	{
		let tcb = stack.tcp.entries[td.0].tcb.lock().unwrap();
		assert_eq!(tcb.listen_q.len(), 1);
	}
	wire.take();
	inject_from(&stack, PEER_PORT + 1, 2000, 0, SYN, 2048, &[]);
	let rst = parse(&wire.last());
	assert!(rst.flags & RST != 0);
	assert_eq!(rst.ack, 2001);
	stack.shutdown();
}

#[test]
fn placement_invariant_held() {
	let (stack, wire) = stack();
	let (td, _, _) = establish(&stack, &wire);

	for (i, e) in stack.tcp.entries.iter().enumerate() {
		let tcb = e.tcb.lock().unwrap();
		match tcb.placement {
			Placement::Free => assert_eq!(tcb.state, State::Closed, "free block {i} not closed"),
			Placement::Linked | Placement::Unlinked => {}
		}
	}
	let _ = td;
	stack.shutdown();
}
