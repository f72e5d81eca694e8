//! A small TCP/IP stack for hosts that dial out over a serial line.
//!
//! The [`Stack`] owns everything the protocols share: the buffer pool, the
//! clock, the timer service, the randomness pool, the IP dispatcher and the
//! TCP engine. PPP links attach to it; the serial driver below them is an
//! external collaborator, as are the LCP/IPCP/PAP negotiation machines.

use core::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};

use log::info;
use nbuf::{Chain, Pool};
use ppp::{Link, LinkIo};
use runtime::{Clock, Timers};

pub mod icmp;
pub mod ip;
pub mod rand;
pub mod tcp;

pub use ip::NetIf;
pub use tcp::{Error, Td};

use rand::RandPool;

/// Stack-wide configuration. The defaults suit a PPP link on a small
/// serial device.
pub struct Config {
	/// Our address; may stay unspecified until IPCP supplies one.
	pub local_addr: Ipv4Addr,
	/// Buffers in the pool.
	pub buffers: usize,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			local_addr: Ipv4Addr::UNSPECIFIED,
			buffers: nbuf::MAXNBUFS,
		}
	}
}

pub struct Stack {
	pub pool: Arc<Pool>,
	pub clock: Clock,
	pub timers: Timers,
	pub(crate) rand: Mutex<RandPool>,
	pub(crate) ip: ip::Ip,
	pub(crate) tcp: tcp::Tcp,
	pub(crate) icmp_stats: icmp::IcmpStats,
}

impl Stack {
	pub fn new(cfg: Config) -> Arc<Stack> {
		let mut rand = RandPool::new();
		let isn_offset = rand.random_u32();

		Arc::new(Stack {
			pool: Arc::new(Pool::new(cfg.buffers)),
			clock: Clock::new(),
			timers: Timers::start(),
			rand: Mutex::new(rand),
			ip: ip::Ip::new(cfg.local_addr),
			tcp: tcp::Tcp::new(isn_offset),
			icmp_stats: icmp::IcmpStats::default(),
		})
	}

	/// Drain every connection, cancel the timers, and stop the timer task.
	pub fn shutdown(self: &Arc<Self>) {
		for td in 0..tcp::MAXTCP {
			let mut tcb = self.tcp.entries[td].tcb.lock().unwrap();
			if tcb.placement == tcp::tcb::Placement::Free {
				continue;
			}
			if tcb.state == tcp::State::Closed {
				tcp::tcb::tcb_free(self, td, &mut tcb);
			} else {
				tcb.free_on_close = true;
				tcp::tcb::close_self(self, td, &mut tcb, None);
			}
		}
		self.timers.shutdown();
		info!("stack down");
	}

	/// Create a PPP link bound to this stack: the link's network side feeds
	/// the IP dispatcher, and the dispatcher's default route leads back out
	/// through the link.
	pub fn attach_link(self: &Arc<Self>, io: Arc<dyn LinkIo>) -> Arc<Link> {
		let link = Arc::new(Link::new(self.pool.clone(), self.clock, io));
		link.set_network(Arc::new(Upper { stack: Arc::downgrade(self) }));
		self.ip.set_default_if(Arc::new(PppIf { link: link.clone() }));
		link
	}

	/// Feed octets received by the serial driver. Arrival timing is one of
	/// the stack's sources of randomness.
	pub fn serial_input(self: &Arc<Self>, link: &Link, octets: &[u8]) {
		self.rand.lock().unwrap().churn(None);
		link.input(octets);
	}

	/// Hand the dispatcher a raw IP datagram (a non-PPP ingress path).
	pub fn ip_input(self: &Arc<Self>, chain: Chain) {
		ip::input(self, chain);
	}

	pub fn local_addr(&self) -> Ipv4Addr {
		self.ip.local_addr()
	}

	pub fn set_local_addr(&self, addr: Ipv4Addr) {
		self.ip.set_local_addr(addr);
	}

	/// Install the default interface directly (tests and non-PPP links).
	pub fn set_default_if(&self, ifc: Arc<dyn NetIf>) {
		self.ip.set_default_if(ifc);
	}

	/// Stir the randomness pool with event data.
	pub fn churn(&self, data: &[u8]) {
		self.rand.lock().unwrap().churn(Some(data));
	}
}

/// The link's view of the network layer.
struct Upper {
	stack: Weak<Stack>,
}

impl ppp::Network for Upper {
	fn ip_input(&self, chain: Chain) {
		if let Some(stack) = self.stack.upgrade() {
			ip::input(&stack, chain);
		}
	}
}

/// The dispatcher's view of a PPP link.
struct PppIf {
	link: Arc<Link>,
}

impl NetIf for PppIf {
	fn output(&self, chain: Chain) {
		let _ = self.link.output(ppp::proto::IP, chain);
	}

	fn mtu(&self) -> usize {
		self.link.mtu() as usize
	}
}
