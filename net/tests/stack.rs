//! End-to-end flows through the public surface: the loopback short-circuit
//! carrying a full TCP conversation, and ICMP turnaround.

use core::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nbuf::{Chain, Pool};
use net::{Config, NetIf, Stack};

const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 99);

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

#[test]
fn tcp_echo_over_loopback() {
	let stack = Stack::new(Config { local_addr: LOCAL, ..Config::default() });

	let server = stack.tcp_open().unwrap();
	stack.tcp_bind(server, Ipv4Addr::UNSPECIFIED, 7).unwrap();
	stack.tcp_listen(server, 2).unwrap();

	let s = stack.clone();
	let echo = std::thread::spawn(move || {
		let (c, peer) = s.tcp_accept(server, Some(Duration::from_secs(5))).unwrap();
		assert_eq!(peer.0, LOCAL);
		let mut buf = [0u8; 64];
		loop {
			match s.tcp_read(c, &mut buf, None) {
				Ok(n) if n > 0 => {
					s.tcp_write(c, &buf[..n], None).unwrap();
				}
				_ => break,
			}
		}
		let _ = s.tcp_disconnect(c);
		let _ = s.tcp_wait(c);
	});

	let client = stack.tcp_open().unwrap();
	stack
		.tcp_connect(client, LOCAL, 7, 0, Some(Duration::from_secs(5)))
		.unwrap();
	assert!(stack.tcp_is_up(client).unwrap());

	let msg = b"ping over the loop";
	assert_eq!(stack.tcp_write(client, msg, None).unwrap(), msg.len());

	let mut got = Vec::new();
	let mut buf = [0u8; 64];
	while got.len() < msg.len() {
		let n = stack.tcp_read(client, &mut buf, None).unwrap();
		assert!(n > 0);
		got.extend_from_slice(&buf[..n]);
	}
	assert_eq!(got, msg);

	stack.tcp_close(client).unwrap();
	echo.join().unwrap();

	// No buffer leaked across the whole conversation.
	assert_eq!(stack.pool.free_count(), nbuf::MAXNBUFS);
	stack.shutdown();
}

#[test]
fn half_close_delivers_eof() {
	let stack = Stack::new(Config { local_addr: LOCAL, ..Config::default() });

	let server = stack.tcp_open().unwrap();
	stack.tcp_bind(server, Ipv4Addr::UNSPECIFIED, 9).unwrap();
	stack.tcp_listen(server, 1).unwrap();

	let s = stack.clone();
	let sink = std::thread::spawn(move || {
		let (c, _) = s.tcp_accept(server, Some(Duration::from_secs(5))).unwrap();
		let mut total = 0;
		let mut buf = [0u8; 64];
		loop {
			match s.tcp_read(c, &mut buf, None) {
				Ok(n) if n > 0 => total += n,
				_ => break,
			}
		}
		total
	});

	let client = stack.tcp_open().unwrap();
	stack
		.tcp_connect(client, LOCAL, 9, 0, Some(Duration::from_secs(5)))
		.unwrap();
	stack.tcp_write(client, &[7u8; 300], None).unwrap();
	// Half-close: the FIN tells the reader the stream is done.
	stack.tcp_disconnect(client).unwrap();

	assert_eq!(sink.join().unwrap(), 300);
	stack.shutdown();
}

/// Captures the octets a PPP link hands to its serial driver.
struct Serial {
	pool: Arc<Pool>,
	tx: Mutex<Vec<u8>>,
}

impl ppp::LinkIo for Serial {
	fn transmit(&self, pool: &Pool, frame: Chain) {
		self.tx.lock().unwrap().extend(pool.to_vec(&frame));
		pool.free(frame);
	}
}

/// Frame an IP datagram the way the peer's PPP stack would (no compression
/// negotiated, asyncmap zero).
fn ppp_frame(datagram: &[u8]) -> Vec<u8> {
	let mut wire = vec![0x7e];
	let mut fcs = ppp::fcs::INIT;
	let mut put = |wire: &mut Vec<u8>, c: u8| {
		if c == 0x7e || c == 0x7d {
			wire.push(0x7d);
			wire.push(c ^ 0x20);
		} else {
			wire.push(c);
		}
	};
	for &c in [0xffu8, 0x03, 0x00, 0x21].iter().chain(datagram) {
		fcs = ppp::fcs::step(fcs, c);
		put(&mut wire, c);
	}
	let t = !fcs;
	put(&mut wire, t as u8);
	put(&mut wire, (t >> 8) as u8);
	wire.push(0x7e);
	wire
}

#[test]
fn ping_across_the_link() {
	let stack = Stack::new(Config { local_addr: LOCAL, ..Config::default() });
	let serial = Arc::new(Serial { pool: stack.pool.clone(), tx: Mutex::new(Vec::new()) });
	let link = stack.attach_link(serial.clone());
	link.link_up();

	// An echo request arrives over the serial line.
	let total = 28usize;
	let mut b = vec![0u8; total];
	b[0] = 0x45;
	b[2..4].copy_from_slice(&(total as u16).to_be_bytes());
	b[8] = 64;
	b[9] = 1;
	b[12..16].copy_from_slice(&PEER.octets());
	b[16..20].copy_from_slice(&LOCAL.octets());
	b[20] = 8;
	let icmp_csum = ref_csum(&b[20..]);
	b[22..24].copy_from_slice(&icmp_csum.to_be_bytes());
	let ip_csum = ref_csum(&b[..20]);
	b[10..12].copy_from_slice(&ip_csum.to_be_bytes());

	stack.serial_input(&link, &ppp_frame(&b));

	// The reply left through the same link, framed and checksummed. Undo
	// the transparency to look inside.
	let wire = serial.tx.lock().unwrap().clone();
	assert!(wire.len() > 10);
	assert_eq!(*wire.first().unwrap(), 0x7e);
	assert_eq!(*wire.last().unwrap(), 0x7e);
	let mut frame = Vec::new();
	let mut escaped = false;
	for &c in &wire[1..wire.len() - 1] {
		match c {
			0x7d => escaped = true,
			c => {
				frame.push(if escaped { c ^ 0x20 } else { c });
				escaped = false;
			}
		}
	}
	assert_eq!(&frame[..4], &[0xff, 0x03, 0x00, 0x21]);
	let reply = &frame[4..frame.len() - 2]; // drop the FCS trailer
	assert_eq!(reply[0], 0x45);
	assert_eq!(&reply[12..16], &LOCAL.octets());
	assert_eq!(&reply[16..20], &PEER.octets());
	assert_eq!(reply[20], 0); // echo reply

	stack.shutdown();
}

#[test]
fn icmp_echo_reflects() {
	let stack = Stack::new(Config { local_addr: LOCAL, ..Config::default() });
	let wire = Arc::new(Wire { pool: stack.pool.clone(), frames: Mutex::new(Vec::new()) });
	stack.set_default_if(wire.clone());

	// An echo request from a peer, id 0x42, seq 1, with a little payload.
	let payload = b"probe";
	let total = 20 + 8 + payload.len();
	let mut b = vec![0u8; total];
	b[0] = 0x45;
	b[2..4].copy_from_slice(&(total as u16).to_be_bytes());
	b[8] = 64;
	b[9] = 1;
	b[12..16].copy_from_slice(&PEER.octets());
	b[16..20].copy_from_slice(&LOCAL.octets());
	b[20] = 8; // echo request
	b[24..26].copy_from_slice(&[0, 0x42]);
	b[26..28].copy_from_slice(&[0, 1]);
	b[28..].copy_from_slice(payload);
	let icmp_csum = ref_csum(&b[20..]);
	b[22..24].copy_from_slice(&icmp_csum.to_be_bytes());
	let ip_csum = ref_csum(&b[..20]);
	b[10..12].copy_from_slice(&ip_csum.to_be_bytes());

	let chain = stack.pool.get().unwrap();
	assert_eq!(stack.pool.append(&chain, &b), b.len());
	stack.ip_input(chain);

	let frames = wire.frames.lock().unwrap();
	assert_eq!(frames.len(), 1);
	let reply = &frames[0];
	// Reflected to the source, from us, maximum TTL, echo reply type,
	// identifier and payload intact.
	assert_eq!(&reply[12..16], &LOCAL.octets());
	assert_eq!(&reply[16..20], &PEER.octets());
	assert_eq!(reply[8], 255);
	assert_eq!(reply[20], 0);
	assert_eq!(&reply[24..26], &[0, 0x42]);
	assert_eq!(&reply[28..], payload);
	// The reply checksum verifies.
	assert_eq!(ref_csum(&reply[20..]), 0);
	drop(frames);

	stack.shutdown();
}

#[test]
fn ip_send_builds_a_valid_datagram() {
	let stack = Stack::new(Config { local_addr: LOCAL, ..Config::default() });
	let wire = Arc::new(Wire { pool: stack.pool.clone(), frames: Mutex::new(Vec::new()) });
	stack.set_default_if(wire.clone());

	let payload = stack.pool.get().unwrap();
	assert_eq!(stack.pool.append(&payload, b"datagram body"), 13);
	net::ip::send(&stack, net::ip::Protocol::Icmp, LOCAL, PEER, payload);

	let frames = wire.frames.lock().unwrap();
	let f = &frames[0];
	assert_eq!(f[0], 0x45);
	assert_eq!(u16::from_be_bytes(f[2..4].try_into().unwrap()), 33);
	assert_eq!(f[8], 64);
	assert_eq!(f[9], 1);
	assert_eq!(&f[12..16], &LOCAL.octets());
	assert_eq!(&f[16..20], &PEER.octets());
	// The header checksum verifies.
	assert_eq!(ref_csum(&f[..20]), 0);
	assert_eq!(&f[20..], b"datagram body");
	drop(frames);
	stack.shutdown();
}

#[test]
fn corrupt_ip_header_dropped() {
	let stack = Stack::new(Config { local_addr: LOCAL, ..Config::default() });
	let wire = Arc::new(Wire { pool: stack.pool.clone(), frames: Mutex::new(Vec::new()) });
	stack.set_default_if(wire.clone());

	let mut b = vec![0u8; 28];
	b[0] = 0x45;
	b[2..4].copy_from_slice(&28u16.to_be_bytes());
	b[8] = 64;
	b[9] = 1;
	b[12..16].copy_from_slice(&PEER.octets());
	b[16..20].copy_from_slice(&LOCAL.octets());
	b[20] = 8;
	// Deliberately wrong header checksum.
	b[10..12].copy_from_slice(&[0xde, 0xad]);

	let chain = stack.pool.get().unwrap();
	stack.pool.append(&chain, &b);
	stack.ip_input(chain);

	assert!(wire.frames.lock().unwrap().is_empty());
	// The buffer came back to the pool.
	assert_eq!(stack.pool.free_count(), nbuf::MAXNBUFS);
	stack.shutdown();
}
