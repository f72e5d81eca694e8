//! Async-serial PPP link layer.
//!
//! One [`Link`] per serial line. The driver task pushes raw octets into
//! [`Link::input`]; complete frames are demultiplexed by protocol number to
//! the registered control-protocol machines (LCP, IPCP, PAP are external
//! collaborators) or up to the network layer. Outbound packets are framed,
//! byte-stuffed against the negotiated ACCM, and handed to the driver
//! through [`LinkIo`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nbuf::{Chain, Pool};
use runtime::Clock;

mod accm;
pub mod fcs;
mod framer;

pub use accm::Accm;

use framer::{Deframed, Framer};

/// Flag sequence marking frame boundaries.
pub const FLAG: u8 = 0x7e;
/// Asynchronous control escape.
pub const ESCAPE: u8 = 0x7d;
/// Transparency modifier: escaped octets are XORed with this.
pub const ESC_XOR: u8 = 0x20;
/// All-stations address.
pub const ALL_STATIONS: u8 = 0xff;
/// Unnumbered information control octet.
pub const UI: u8 = 0x03;

/// Default MTU/MRU (size of the information field).
pub const PPP_MTU: u16 = 512;
pub const PPP_MRU: u16 = 512;

/// Transmit a flag first when the line has idled this long, to flush noise.
const MAX_IDLE_FLAG: Duration = Duration::from_millis(500);

/// Protocol field values.
pub mod proto {
	/// Internet Protocol.
	pub const IP: u16 = 0x0021;
	/// Van Jacobson compressed TCP.
	pub const VJC_COMP: u16 = 0x002d;
	/// Van Jacobson uncompressed TCP.
	pub const VJC_UNCOMP: u16 = 0x002f;
	/// IP Control Protocol.
	pub const IPCP: u16 = 0x8021;
	/// Link Control Protocol.
	pub const LCP: u16 = 0xc021;
	/// Password Authentication Protocol.
	pub const PAP: u16 = 0xc023;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
	/// Buffer allocation failed.
	Alloc,
	/// The link is not up.
	Open,
	/// The packet was rejected (a VJ compression failure).
	Protocol,
}

/// The serial transmit boundary. The driver owns pacing and buffering; the
/// encoded frame is handed over as a chain and the driver frees it.
pub trait LinkIo: Send + Sync {
	fn transmit(&self, pool: &Pool, frame: Chain);
}

/// The network layer above the link.
pub trait Network: Send + Sync {
	fn ip_input(&self, chain: Chain);
}

/// An external negotiation machine (LCP, IPCP or PAP per RFC 1661/1332/1334).
pub trait ControlProtocol: Send + Sync {
	/// A complete frame for this protocol arrived.
	fn input(&self, link: &Link, data: &[u8]);
	/// The physical layer is ready.
	fn lower_up(&self, link: &Link);
	/// The physical layer is gone.
	fn lower_down(&self, link: &Link);
}

/// Verdict of the VJ compressor on an outbound IP packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VjKind {
	/// Not TCP (or not compressible); send as plain IP.
	Ip,
	/// Rewritten to a compressed TCP packet.
	Compressed,
	/// Rewritten to an uncompressed TCP packet carrying a slot id.
	Uncompressed,
	/// The packet is malformed; drop it.
	Error,
}

/// Van Jacobson header compression, RFC 1144. External collaborator: with
/// no codec attached the link behaves as if VJ were compiled out.
pub trait VjCodec: Send + Sync {
	fn configure(&self, max_slot: u8, compress_cid: bool);
	/// May rewrite the packet in place.
	fn compress(&self, pool: &Pool, chain: &Chain) -> VjKind;
	/// Rebuild the TCP/IP header of a compressed packet.
	fn decompress(&self, pool: &Pool, chain: Chain) -> Option<Chain>;
	/// Note the connection state of an uncompressed TCP packet.
	fn expand(&self, pool: &Pool, chain: Chain) -> Option<Chain>;
	/// A frame was lost; the decompressor state is suspect.
	fn error(&self);
}

/// Upcalls into whoever manages the link lifecycle.
pub trait Phase: Send + Sync {
	/// LCP reached the network phase.
	fn link_established(&self, link: &Link);
	/// The link went down.
	fn link_terminated(&self, link: &Link);
	/// IPCP is up: IP traffic may flow.
	fn np_up(&self, link: &Link);
	/// IPCP went down.
	fn np_down(&self, link: &Link);
}

/// Peer authentication policy for the PAP machine bound to this link.
///
/// `AcceptAll` grants every credential pair. It is the shipped default and
/// deliberately explicit; swap in `External` when a real secret store backs
/// the check.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AuthPolicy {
	#[default]
	AcceptAll,
	External,
}

struct Tx {
	accm: Accm,
	/// Peer accepts protocol-field compression.
	pcomp: bool,
	/// Peer accepts address/control-field compression.
	accomp: bool,
	mtu: u16,
	last_xmit: Option<Instant>,
}

#[derive(Default)]
struct Handlers {
	network: Option<Arc<dyn Network>>,
	lcp: Option<Arc<dyn ControlProtocol>>,
	ipcp: Option<Arc<dyn ControlProtocol>>,
	pap: Option<Arc<dyn ControlProtocol>>,
	vj: Option<Arc<dyn VjCodec>>,
	vj_enabled: bool,
	phase: Option<Arc<dyn Phase>>,
}

/// Per-link counters.
#[derive(Default)]
pub struct LinkStats {
	pub in_bytes: AtomicU32,
	pub in_packets: AtomicU32,
	pub in_errors: AtomicU32,
	pub dispatch_drops: AtomicU32,
	pub out_bytes: AtomicU32,
	pub out_packets: AtomicU32,
	pub out_errors: AtomicU32,
}

pub struct Link {
	pool: Arc<Pool>,
	clock: Clock,
	io: Arc<dyn LinkIo>,
	rx: Mutex<Framer>,
	tx: Mutex<Tx>,
	handlers: Mutex<Handlers>,
	up: AtomicBool,
	auth: Mutex<AuthPolicy>,
	pub stats: LinkStats,
}

impl Link {
	pub fn new(pool: Arc<Pool>, clock: Clock, io: Arc<dyn LinkIo>) -> Link {
		Link {
			pool,
			clock,
			io,
			rx: Mutex::new(Framer::new(PPP_MRU)),
			tx: Mutex::new(Tx {
				accm: Accm::default(),
				pcomp: false,
				accomp: false,
				mtu: PPP_MTU,
				last_xmit: None,
			}),
			handlers: Mutex::new(Handlers::default()),
			up: AtomicBool::new(false),
			auth: Mutex::new(AuthPolicy::default()),
			stats: LinkStats::default(),
		}
	}

	pub fn set_network(&self, n: Arc<dyn Network>) {
		self.handlers.lock().unwrap().network = Some(n);
	}

	pub fn set_lcp(&self, p: Arc<dyn ControlProtocol>) {
		self.handlers.lock().unwrap().lcp = Some(p);
	}

	pub fn set_ipcp(&self, p: Arc<dyn ControlProtocol>) {
		self.handlers.lock().unwrap().ipcp = Some(p);
	}

	pub fn set_pap(&self, p: Arc<dyn ControlProtocol>) {
		self.handlers.lock().unwrap().pap = Some(p);
	}

	pub fn set_vj_codec(&self, c: Arc<dyn VjCodec>) {
		self.handlers.lock().unwrap().vj = Some(c);
	}

	pub fn set_phase(&self, p: Arc<dyn Phase>) {
		self.handlers.lock().unwrap().phase = Some(p);
	}

	pub fn auth_policy(&self) -> AuthPolicy {
		*self.auth.lock().unwrap()
	}

	pub fn set_auth_policy(&self, policy: AuthPolicy) {
		*self.auth.lock().unwrap() = policy;
	}

	/// Configure the transmit side from the LCP negotiation result.
	pub fn set_send_config(&self, mtu: u16, asyncmap: u32, pcomp: bool, accomp: bool) {
		let mut tx = self.tx.lock().unwrap();
		tx.mtu = mtu;
		tx.accm = Accm::from_asyncmap(asyncmap);
		tx.pcomp = pcomp;
		tx.accomp = accomp;
		info!("send config: mtu {mtu} accm {asyncmap:#010x} pcomp {pcomp} accomp {accomp}");
	}

	/// Configure the receive side from the LCP negotiation result. Only the
	/// asyncmap affects the deframer; the rest is recorded for diagnostics.
	pub fn set_recv_config(&self, mru: u16, asyncmap: u32, pcomp: bool, accomp: bool) {
		let mut rx = self.rx.lock().unwrap();
		rx.accm = Accm::from_asyncmap(asyncmap);
		rx.mru = mru;
		info!("recv config: mru {mru} accm {asyncmap:#010x} pcomp {pcomp} accomp {accomp}");
	}

	/// Replace the extended transmit ACCM.
	pub fn set_xaccm(&self, map: [u8; 32]) {
		self.tx.lock().unwrap().accm = Accm::from_extended(map);
	}

	/// Configure VJ TCP header compression.
	pub fn set_vj(&self, enabled: bool, max_slot: u8, compress_cid: bool) {
		let mut h = self.handlers.lock().unwrap();
		h.vj_enabled = enabled;
		if let Some(vj) = &h.vj {
			vj.configure(max_slot, compress_cid);
		}
		info!("vj compression enable {enabled} max slot {max_slot} cid {compress_cid}");
	}

	pub fn mtu(&self) -> u16 {
		self.tx.lock().unwrap().mtu
	}

	pub fn is_up(&self) -> bool {
		self.up.load(Ordering::Acquire)
	}

	/// The physical layer is ready: open the link.
	pub fn link_up(&self) {
		self.up.store(true, Ordering::Release);
		let h = self.clone_handlers();
		for p in [&h.lcp, &h.ipcp, &h.pap].into_iter().flatten() {
			p.lower_up(self);
		}
	}

	/// The physical layer is gone.
	pub fn link_down(&self) {
		self.up.store(false, Ordering::Release);
		let h = self.clone_handlers();
		for p in [&h.lcp, &h.ipcp, &h.pap].into_iter().flatten() {
			p.lower_down(self);
		}
	}

	/// Called by the LCP machine when negotiation completes.
	pub fn notify_established(&self) {
		if let Some(p) = self.clone_handlers().phase {
			p.link_established(self);
		}
	}

	/// Called by the LCP machine when the link terminates.
	pub fn notify_terminated(&self) {
		self.up.store(false, Ordering::Release);
		if let Some(p) = self.clone_handlers().phase {
			p.link_terminated(self);
		}
	}

	/// Called by the IPCP machine when the network protocol opens or closes.
	pub fn notify_np(&self, up: bool) {
		if let Some(p) = self.clone_handlers().phase {
			if up {
				p.np_up(self);
			} else {
				p.np_down(self);
			}
		}
	}

	fn clone_handlers(&self) -> Handlers {
		let h = self.handlers.lock().unwrap();
		Handlers {
			network: h.network.clone(),
			lcp: h.lcp.clone(),
			ipcp: h.ipcp.clone(),
			pap: h.pap.clone(),
			vj: h.vj.clone(),
			vj_enabled: h.vj_enabled,
			phase: h.phase.clone(),
		}
	}

	/// Feed raw octets received from the serial driver. Runs on the driver
	/// task; complete frames are dispatched from here.
	pub fn input(&self, octets: &[u8]) {
		self.stats.in_bytes.fetch_add(octets.len() as u32, Ordering::Relaxed);

		let mut out = Deframed { frames: Vec::new(), dropped: 0 };
		self.rx.lock().unwrap().input(&self.pool, octets, &mut out);

		let h = self.clone_handlers();
		if out.dropped > 0 {
			self.stats.in_errors.fetch_add(out.dropped, Ordering::Relaxed);
			if let Some(vj) = &h.vj {
				vj.error();
			}
		}

		for (protocol, chain) in out.frames {
			self.stats.in_packets.fetch_add(1, Ordering::Relaxed);
			self.dispatch(&h, protocol, chain);
		}
	}

	/// Hand a completed frame to the right handler.
	fn dispatch(&self, h: &Handlers, protocol: u16, chain: Chain) {
		match protocol {
			proto::LCP => self.control_input(&h.lcp, "lcp", chain),
			proto::IPCP => self.control_input(&h.ipcp, "ipcp", chain),
			proto::PAP => self.control_input(&h.pap, "pap", chain),
			proto::IP => match &h.network {
				Some(n) => n.ip_input(chain),
				None => self.drop_frame("no network layer", chain),
			},
			proto::VJC_COMP => match (&h.vj, &h.network) {
				(Some(vj), Some(n)) => match vj.decompress(&self.pool, chain) {
					Some(chain) => n.ip_input(chain),
					None => {
						warn!("dropping undecompressable VJ packet");
						self.stats.dispatch_drops.fetch_add(1, Ordering::Relaxed);
					}
				},
				_ => self.drop_frame("vj compressed without codec", chain),
			},
			proto::VJC_UNCOMP => match (&h.vj, &h.network) {
				(Some(vj), Some(n)) => match vj.expand(&self.pool, chain) {
					Some(chain) => n.ip_input(chain),
					None => {
						warn!("dropping bad VJ uncompressed packet");
						self.stats.dispatch_drops.fetch_add(1, Ordering::Relaxed);
					}
				},
				_ => self.drop_frame("vj uncompressed without codec", chain),
			},
			_ => self.drop_frame("unhandled protocol", chain),
		}
	}

	fn drop_frame(&self, why: &str, chain: Chain) {
		debug!("dispatch: dropping frame ({why})");
		self.stats.dispatch_drops.fetch_add(1, Ordering::Relaxed);
		self.pool.free(chain);
	}

	/// Control-protocol frames are small; make them contiguous and hand the
	/// octets to the machine.
	fn control_input(&self, p: &Option<Arc<dyn ControlProtocol>>, name: &str, chain: Chain) {
		let Some(p) = p else {
			return self.drop_frame(name, chain);
		};
		let len = self.pool.len(&chain);
		let Some(chain) = self.pool.pullup(chain, len.min(nbuf::NBUFSZ)) else {
			self.stats.dispatch_drops.fetch_add(1, Ordering::Relaxed);
			return;
		};
		self.pool.with(&chain, |data| p.input(self, data));
		self.pool.free(chain);
	}

	/// Send a network-layer packet. Consumes the chain in all cases.
	pub fn output(&self, mut protocol: u16, chain: Chain) -> Result<(), Error> {
		if !self.is_up() {
			debug!("output: link not up");
			self.stats.dispatch_drops.fetch_add(1, Ordering::Relaxed);
			self.pool.free(chain);
			return Err(Error::Open);
		}

		let h = self.clone_handlers();
		if protocol == proto::IP && h.vj_enabled {
			if let Some(vj) = &h.vj {
				match vj.compress(&self.pool, &chain) {
					VjKind::Ip => {}
					VjKind::Compressed => protocol = proto::VJC_COMP,
					VjKind::Uncompressed => protocol = proto::VJC_UNCOMP,
					VjKind::Error => {
						warn!("output: bad IP packet");
						self.stats.out_errors.fetch_add(1, Ordering::Relaxed);
						self.pool.free(chain);
						return Err(Error::Protocol);
					}
				}
			}
		}

		// The source is consumed up front; the encoder works from a flat
		// copy rather than chasing the chain while building the new one.
		let payload = self.pool.to_vec(&chain);
		self.pool.free(chain);

		let mut tx = self.tx.lock().unwrap();
		let Some(out) = self.pool.get() else {
			self.stats.out_errors.fetch_add(1, Ordering::Relaxed);
			return Err(Error::Alloc);
		};
		let mut enc = Encoder { pool: &self.pool, out, short: false, fcs: fcs::INIT };

		self.begin_frame(&mut tx, &mut enc);
		if !tx.accomp {
			enc.put(ALL_STATIONS, &tx.accm);
			enc.put(UI, &tx.accm);
		}
		if !tx.pcomp || protocol > 0xff {
			enc.put((protocol >> 8) as u8, &tx.accm);
		}
		enc.put(protocol as u8, &tx.accm);

		for &c in &payload {
			enc.put(c, &tx.accm);
		}

		self.end_frame(&mut tx, enc)
	}

	/// Frame and send a raw octet string (a control-protocol packet built by
	/// an external machine, complete with its address/control/protocol
	/// fields).
	pub fn write_raw(&self, s: &[u8]) -> Result<(), Error> {
		let mut tx = self.tx.lock().unwrap();
		let Some(out) = self.pool.get() else {
			self.stats.out_errors.fetch_add(1, Ordering::Relaxed);
			return Err(Error::Alloc);
		};
		let mut enc = Encoder { pool: &self.pool, out, short: false, fcs: fcs::INIT };

		self.begin_frame(&mut tx, &mut enc);
		for &c in s {
			enc.put(c, &tx.accm);
		}

		self.end_frame(&mut tx, enc)
	}

	fn begin_frame(&self, tx: &mut Tx, enc: &mut Encoder) {
		// A fresh flag flushes any noise accumulated while the line idled.
		let idle = match tx.last_xmit {
			None => true,
			Some(t) => self.clock.now().duration_since(t) > MAX_IDLE_FLAG,
		};
		if idle {
			enc.put_raw(FLAG);
		}
		tx.last_xmit = Some(self.clock.now());
	}

	fn end_frame(&self, tx: &mut Tx, mut enc: Encoder) -> Result<(), Error> {
		let trailer = !enc.fcs;
		let accm = tx.accm;
		enc.put(trailer as u8, &accm);
		enc.put((trailer >> 8) as u8, &accm);
		enc.put_raw(FLAG);

		if enc.short {
			warn!("output: allocation failed, dropping frame");
			self.stats.out_errors.fetch_add(1, Ordering::Relaxed);
			self.pool.free(enc.out);
			return Err(Error::Alloc);
		}

		self.stats.out_packets.fetch_add(1, Ordering::Relaxed);
		self.stats.out_bytes.fetch_add(self.pool.len(&enc.out) as u32, Ordering::Relaxed);
		self.io.transmit(&self.pool, enc.out);
		Ok(())
	}
}

struct Encoder<'a> {
	pool: &'a Pool,
	out: Chain,
	short: bool,
	fcs: u16,
}

impl Encoder<'_> {
	/// Append an octet with FCS accounting and transparency.
	fn put(&mut self, c: u8, accm: &Accm) {
		self.fcs = fcs::step(self.fcs, c);
		if accm.escaped(c) {
			self.append(&[ESCAPE, c ^ ESC_XOR]);
		} else {
			self.append(&[c]);
		}
	}

	/// Append an octet outside the FCS and transparency (the flag).
	fn put_raw(&mut self, c: u8) {
		self.append(&[c]);
	}

	fn append(&mut self, bytes: &[u8]) {
		if !self.short && self.pool.append(&self.out, bytes) < bytes.len() {
			self.short = true;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex as StdMutex;

	use super::*;

	/// Captures encoded frames as flat byte strings.
	#[derive(Default)]
	struct Capture {
		frames: StdMutex<Vec<Vec<u8>>>,
	}

	impl LinkIo for Capture {
		fn transmit(&self, pool: &Pool, frame: Chain) {
			self.frames.lock().unwrap().push(pool.to_vec(&frame));
			pool.free(frame);
		}
	}

	/// Captures packets delivered to the network layer.
	#[derive(Default)]
	struct NetCapture {
		packets: StdMutex<Vec<Vec<u8>>>,
		pool: StdMutex<Option<Arc<Pool>>>,
	}

	impl Network for NetCapture {
		fn ip_input(&self, chain: Chain) {
			let pool = self.pool.lock().unwrap().clone().unwrap();
			self.packets.lock().unwrap().push(pool.to_vec(&chain));
			pool.free(chain);
		}
	}

	fn link() -> (Arc<Link>, Arc<Capture>, Arc<NetCapture>, Arc<Pool>) {
		let pool = Arc::new(Pool::new(nbuf::MAXNBUFS));
		let io = Arc::new(Capture::default());
		let net = Arc::new(NetCapture::default());
		*net.pool.lock().unwrap() = Some(pool.clone());
		let link = Arc::new(Link::new(pool.clone(), Clock::new(), io.clone()));
		link.set_network(net.clone());
		link.link_up();
		(link, io, net, pool)
	}

	fn chain_of(pool: &Pool, data: &[u8]) -> Chain {
		let c = pool.get().unwrap();
		assert_eq!(pool.append(&c, data), data.len());
		c
	}

	#[test]
	fn escapes_specials_and_accm() {
		let (link, io, _, pool) = link();
		link.set_send_config(PPP_MTU, 0x000a_0000, false, false);

		let payload = [0x7e, 0x7d, 0x03, 0x11];
		link.output(proto::IP, chain_of(&pool, &payload)).unwrap();

		let frames = io.frames.lock().unwrap();
		let wire = &frames[0];
		// Leading flag, address/control, two protocol octets, then the
		// stuffed payload.
		assert_eq!(&wire[..5], &[FLAG, 0xff, 0x03, 0x00, 0x21]);
		let body = &wire[5..wire.len() - 1];
		let expect = [0x7d, 0x5e, 0x7d, 0x5d, 0x03, 0x7d, 0x31];
		assert_eq!(&body[..7], &expect);
		assert_eq!(*wire.last().unwrap(), FLAG);
	}

	#[test]
	fn round_trip() {
		let (link, io, net, pool) = link();
		link.set_send_config(PPP_MTU, 0x000a_0000, false, false);
		link.set_recv_config(PPP_MRU, 0x000a_0000, false, false);

		let payload: Vec<u8> = (0u16..300).map(|i| (i % 256) as u8).collect();
		link.output(proto::IP, chain_of(&pool, &payload)).unwrap();

		let wire = io.frames.lock().unwrap()[0].clone();
		// Feed the encoded octets back in two arbitrary pieces.
		link.input(&wire[..17]);
		link.input(&wire[17..]);

		let got = net.packets.lock().unwrap();
		assert_eq!(got.len(), 1);
		assert_eq!(got[0], payload);
		assert_eq!(pool.free_count(), nbuf::MAXNBUFS);
	}

	#[test]
	fn compressed_header_fields_round_trip() {
		let (link, io, net, pool) = link();
		// Peer accepts address/control and protocol compression.
		link.set_send_config(PPP_MTU, 0, true, true);

		link.output(proto::IP, chain_of(&pool, b"hi there")).unwrap();

		let wire = io.frames.lock().unwrap()[0].clone();
		// Compressed: flag, then the one-octet protocol directly.
		assert_eq!(&wire[..2], &[FLAG, 0x21]);

		link.input(&wire);
		assert_eq!(net.packets.lock().unwrap()[0], b"hi there");
	}

	#[test]
	fn bad_fcs_dropped() {
		let (link, io, net, _pool) = link();
		link.set_send_config(PPP_MTU, 0, false, false);

		link.output(proto::IP, chain_of(&link.pool, b"payload")).unwrap();
		let mut wire = io.frames.lock().unwrap()[0].clone();
		// Corrupt one payload octet.
		let n = wire.len() - 4;
		wire[n] ^= 0x40;

		link.input(&wire);
		assert!(net.packets.lock().unwrap().is_empty());
		assert!(link.stats.in_errors.load(Ordering::Relaxed) >= 1);
	}

	#[test]
	fn noise_between_frames_ignored() {
		let (link, io, net, pool) = link();
		link.set_send_config(PPP_MTU, 0, false, false);

		link.output(proto::IP, chain_of(&pool, b"abc")).unwrap();
		let wire = io.frames.lock().unwrap()[0].clone();

		// Garbage before the first flag is discarded in the idle state;
		// extra flags between frames are harmless.
		let mut line = vec![0x55, 0xaa, 0x01];
		line.push(FLAG);
		line.push(FLAG);
		line.extend_from_slice(&wire);
		link.input(&line);

		assert_eq!(net.packets.lock().unwrap()[0], b"abc");
	}

	#[test]
	fn vj_frames_without_codec_drop() {
		let (link, _, net, pool) = link();
		// Hand-build a VJ-compressed frame: addr, ctrl, protocol 0x002d.
		let mut frame = vec![FLAG];
		let mut f = fcs::INIT;
		for c in [0xffu8, 0x03, 0x00, 0x2d, 0x42, 0x43] {
			f = fcs::step(f, c);
			frame.push(c);
		}
		let t = !f;
		frame.push(t as u8);
		frame.push((t >> 8) as u8);
		frame.push(FLAG);

		link.input(&frame);
		assert!(net.packets.lock().unwrap().is_empty());
		assert_eq!(link.stats.dispatch_drops.load(Ordering::Relaxed), 1);
		assert_eq!(pool.free_count(), nbuf::MAXNBUFS);
	}
}
