//! The user-facing connection calls. All of them block on the connection's
//! conditions; the timeout argument bounds the wait, and `None` means
//! forever for connection management and until-progress for data transfer.

use core::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, MutexGuard};
use std::time::{Duration, Instant};

use log::debug;
use nbuf::NBUFSZ;

use super::output::tcp_output;
use super::tcb::{close_self, load_path_defaults, send_syn, set_state, Placement, State, Tcb};
use super::{Connection, Error, Td, MAXLISTEN, MAXTCP, TCP_DEFWND, TCP_MAXQUEUE};
use crate::Stack;

/// Sleep quantum while a writer polls for free buffers.
const WRITESLEEP: Duration = Duration::from_secs(1);

fn deadline_of(timeout: Option<Duration>) -> Option<Instant> {
	timeout.map(|t| Instant::now() + t)
}

/// Wait on `cond`, bounded by the caller's deadline and an optional cap.
/// Returns the reacquired guard and whether the deadline has passed.
fn wait_on<'a>(
	cond: &Condvar,
	guard: MutexGuard<'a, Tcb>,
	deadline: Option<Instant>,
	cap: Option<Duration>,
) -> (MutexGuard<'a, Tcb>, bool) {
	match deadline {
		None => match cap {
			None => (cond.wait(guard).unwrap(), false),
			Some(c) => (cond.wait_timeout(guard, c).unwrap().0, false),
		},
		Some(d) => {
			let now = Instant::now();
			if now >= d {
				return (guard, true);
			}
			let mut dur = d - now;
			if let Some(c) = cap {
				dur = dur.min(c);
			}
			let g = cond.wait_timeout(guard, dur).unwrap().0;
			(g, Instant::now() >= d)
		}
	}
}

impl Stack {
	fn tcb_guard(&self, td: Td) -> Result<MutexGuard<'_, Tcb>, Error> {
		if td.0 >= MAXTCP {
			return Err(Error::Param);
		}
		let guard = self.tcp.entries[td.0].tcb.lock().unwrap();
		if guard.placement == Placement::Free {
			return Err(Error::Param);
		}
		Ok(guard)
	}

	/// Allocate a connection descriptor.
	pub fn tcp_open(&self) -> Result<Td, Error> {
		let Some(id) = self.tcp.alloc() else {
			return Err(Error::Alloc);
		};
		let mut tcb = self.tcp.entries[id].tcb.lock().unwrap();
		tcb.placement = Placement::Unlinked;
		tcb.free_on_close = false;
		tcb.close_reason = None;
		tcb.keep_alive = None;
		tcb.keep_probes = 0;
		debug!("tcp[{id}]: opened");
		Ok(Td(id))
	}

	/// Bind our address for the connection. The address must be zero or our
	/// local address; only a closed connection can be bound.
	pub fn tcp_bind(&self, td: Td, addr: Ipv4Addr, port: u16) -> Result<(), Error> {
		let mut tcb = self.tcb_guard(td)?;
		if addr != Ipv4Addr::UNSPECIFIED && addr != self.ip.local_addr() {
			return Err(Error::InvAddr);
		}
		if tcb.state != State::Closed {
			return Err(Error::Connect);
		}
		tcb.hdr.ip.src = addr;
		tcb.hdr.tcp.src = port.into();
		debug!("tcp[{}]: bound to {addr}:{port}", td.0);
		Ok(())
	}

	/// Establish a connection with a remote host, blocking until it opens
	/// or fails. Without a prior bind, the local address and port are
	/// assigned automatically.
	pub fn tcp_connect(
		self: &Arc<Self>,
		td: Td,
		addr: Ipv4Addr,
		port: u16,
		tos: u8,
		timeout: Option<Duration>,
	) -> Result<(), Error> {
		let deadline = deadline_of(timeout);
		let entry = &self.tcp.entries[td.0];
		let mut tcb = self.tcb_guard(td)?;

		if addr == Ipv4Addr::UNSPECIFIED || port == 0 {
			return Err(Error::InvAddr);
		}
		if tcb.hdr.ip.src == Ipv4Addr::UNSPECIFIED && self.ip.local_addr() == Ipv4Addr::UNSPECIFIED {
			return Err(Error::Config);
		}
		if tcb.state != State::Closed {
			return Err(Error::Connect);
		}

		tcb.init();
		tcb.hdr.ip.tos = tos;
		if tcb.hdr.ip.src == Ipv4Addr::UNSPECIFIED {
			tcb.hdr.ip.src = self.ip.local_addr();
		}
		if tcb.hdr.tcp.src.get() == 0 {
			tcb.hdr.tcp.src = self.tcp.next_port().into();
		}
		tcb.hdr.ip.dst = addr;
		tcb.hdr.tcp.dst = port.into();

		load_path_defaults(self, &mut tcb);

		tcb.conn = Connection {
			local_addr: tcb.hdr.ip.src,
			local_port: tcb.hdr.tcp.src.get(),
			remote_addr: addr,
			remote_port: port,
		};
		self.tcp.link(td.0, tcb.conn);
		tcb.placement = Placement::Linked;

		debug!("tcp[{}]: connecting to {addr}:{port} mss {}", td.0, tcb.mss);

		tcb.active = true;
		send_syn(self, &mut tcb);
		set_state(self, td.0, &mut tcb, State::SynSent);
		drop(tcb);
		tcp_output(self, td.0);
		self.tcp.stats.conout.fetch_add(1, Ordering::Relaxed);

		let mut tcb = entry.tcb.lock().unwrap();
		loop {
			match tcb.state {
				State::Established => return Ok(()),
				State::Closed => {
					// Wake anything else still pending on the attempt.
					entry.connect.notify_all();
					return Err(tcb.close_reason.unwrap_or(Error::Eof));
				}
				_ => {
					let (g, timed_out) = wait_on(&entry.connect, tcb, deadline, None);
					tcb = g;
					if timed_out && tcb.state != State::Established {
						close_self(self, td.0, &mut tcb, Some(Error::Timeout));
						return Err(Error::Timeout);
					}
				}
			}
		}
	}

	/// Queue up to `backlog` incoming connections for accept. Returns the
	/// granted backlog.
	pub fn tcp_listen(&self, td: Td, backlog: usize) -> Result<usize, Error> {
		let mut tcb = self.tcb_guard(td)?;
		if tcb.hdr.tcp.src.get() == 0 {
			return Err(Error::Config);
		}
		match tcb.state {
			State::Closed => {
				tcb.init();
				tcb.conn = Connection {
					local_addr: tcb.hdr.ip.src,
					local_port: tcb.hdr.tcp.src.get(),
					remote_addr: Ipv4Addr::UNSPECIFIED,
					remote_port: 0,
				};
				self.tcp.link(td.0, tcb.conn);
				tcb.placement = Placement::Linked;
				tcb.state = State::Listen;
			}
			State::Listen => {}
			_ => return Err(Error::Connect),
		}
		tcb.listen_open = backlog.min(MAXLISTEN);
		tcb.clone = true;
		debug!("tcp[{}]: listening, backlog {}", td.0, tcb.listen_open);
		Ok(tcb.listen_open)
	}

	/// Pick up a connection opened by a remote host. Returns the new
	/// descriptor and the peer's address.
	pub fn tcp_accept(
		self: &Arc<Self>,
		td: Td,
		timeout: Option<Duration>,
	) -> Result<(Td, (Ipv4Addr, u16)), Error> {
		let deadline = deadline_of(timeout);
		let entry = &self.tcp.entries[td.0];
		let mut tcb = self.tcb_guard(td)?;

		if tcb.hdr.tcp.src.get() == 0 {
			return Err(Error::Config);
		}

		match tcb.state {
			State::Closed => {
				// An accept without listen takes a single connection on the
				// original block.
				tcb.init();
				tcb.conn = Connection {
					local_addr: tcb.hdr.ip.src,
					local_port: tcb.hdr.tcp.src.get(),
					remote_addr: Ipv4Addr::UNSPECIFIED,
					remote_port: 0,
				};
				self.tcp.link(td.0, tcb.conn);
				tcb.placement = Placement::Linked;
				tcb.state = State::Listen;
			}
			State::Listen => {}
			_ => return Err(Error::Connect),
		}

		let accepted = if tcb.clone {
			loop {
				if tcb.state != State::Listen {
					return Err(Error::Connect);
				}
				if !tcb.listen_q.is_empty() {
					break tcb.listen_q.remove(0);
				}
				let (g, timed_out) = wait_on(&entry.connect, tcb, deadline, None);
				tcb = g;
				if timed_out && tcb.listen_q.is_empty() {
					return Err(Error::Timeout);
				}
			}
		} else {
			loop {
				match tcb.state {
					State::Listen | State::SynSent | State::SynReceived => {
						let (g, timed_out) = wait_on(&entry.connect, tcb, deadline, None);
						tcb = g;
						if timed_out && tcb.state < State::Established {
							close_self(self, td.0, &mut tcb, Some(Error::Timeout));
							return Err(Error::Timeout);
						}
					}
					State::Established => break td.0,
					_ => return Err(tcb.close_reason.unwrap_or(Error::Connect)),
				}
			}
		};
		drop(tcb);

		let mut atcb = self.tcp.entries[accepted].tcb.lock().unwrap();
		atcb.clone = false;
		let peer = (atcb.conn.remote_addr, atcb.conn.remote_port);
		debug!("tcp[{td:?}]: accepted [{accepted}] from {}:{}", peer.0, peer.1);
		Ok((Td(accepted), peer))
	}

	/// Read from the connection. With no timeout, blocks until at least one
	/// octet arrives and then returns what is buffered; with one, fills the
	/// buffer until the deadline.
	pub fn tcp_read(self: &Arc<Self>, td: Td, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
		let deadline = deadline_of(timeout);
		let entry = &self.tcp.entries[td.0];
		let pool = &self.pool;
		let mut tcb = self.tcb_guard(td)?;

		if tcb.state == State::Closed || tcb.conn.remote_port == 0 {
			return Err(Error::Connect);
		}

		let mut got = 0;
		while got < buf.len() {
			if let Some(rb) = tcb.rcv_buf.take() {
				// Drain the buffer under the reader first.
				let want = buf.len() - got;
				let (rest, n) = pool.trim_front(rb, want, Some(&mut buf[got..]));
				tcb.rcv_buf = rest;
				got += n;
				tcb.rcv_cnt = tcb.rcv_cnt.saturating_sub(n as u16);
			} else if tcb.rcv_cnt != 0 {
				// Pull the next chain off the receive queue; each dequeued
				// chain reopens the window by one buffer.
				if let Some(c) = pool.dequeue(&mut tcb.rcvq) {
					tcb.rcv_buf = Some(c);
					let was_closed = tcb.rcv.wnd == 0;
					tcb.rcv.wnd = (tcb.rcv.wnd + NBUFSZ as u16).min(TCP_DEFWND);
					if was_closed {
						// Window update the peer is waiting for.
						tcb.force = true;
						drop(tcb);
						tcp_output(self, td.0);
						tcb = entry.tcb.lock().unwrap();
					}
				}
			} else if got > 0 && timeout.is_none() {
				// The queue is dry and we have something: hand it over
				// rather than waiting for more.
				break;
			} else {
				match tcb.state {
					State::Listen
					| State::SynSent
					| State::SynReceived
					| State::Established
					| State::FinWait1
					| State::FinWait2 => {
						let (g, timed_out) = wait_on(&entry.read, tcb, deadline, None);
						tcb = g;
						if timed_out {
							break;
						}
					}
					_ => {
						// Closed or closing with the inbound side done.
						if got == 0 {
							return Err(tcb.close_reason.unwrap_or(Error::Eof));
						}
						break;
					}
				}
			}
		}
		Ok(got)
	}

	/// Write to the connection. With no timeout, blocks until everything is
	/// queued; with one, until the deadline.
	pub fn tcp_write(self: &Arc<Self>, td: Td, buf: &[u8], timeout: Option<Duration>) -> Result<usize, Error> {
		let deadline = deadline_of(timeout);
		let entry = &self.tcp.entries[td.0];
		let pool = &self.pool;
		let mut tcb = self.tcb_guard(td)?;

		if tcb.state == State::Closed || tcb.conn.remote_port == 0 {
			return Err(Error::Connect);
		}

		let mut sent = 0;
		while sent < buf.len() {
			// Never queue more than a full segment past what the window
			// will take.
			let room = (tcb.snd.wnd as i64 - tcb.snd_cnt as i64)
				.min((buf.len() - sent) as i64)
				.min(tcb.mss as i64);

			if room <= 0 || tcb.sndq.len() >= TCP_MAXQUEUE {
				// It is the input side's job to wake us when things open.
				let (g, timed_out) = wait_on(&entry.write, tcb, deadline, None);
				tcb = g;
				if timed_out {
					break;
				}
			} else if pool.free_count() < tcb.min_free_bufs + (room as usize / NBUFSZ) * 2 {
				// Leave enough buffers to receive the acknowledgement;
				// poll until the pool recovers.
				let (g, timed_out) = wait_on(&entry.write, tcb, deadline, Some(WRITESLEEP));
				tcb = g;
				if timed_out {
					break;
				}
			} else {
				match tcb.state {
					State::SynSent | State::SynReceived | State::Established | State::CloseWait => {
						let Some(c) = pool.get() else { continue };
						let n = pool.append(&c, &buf[sent..sent + room as usize]);
						if n == 0 {
							pool.free(c);
							continue;
						}
						pool.enqueue(&mut tcb.sndq, c);
						tcb.snd_cnt += n as u16;
						sent += n;
						drop(tcb);
						tcp_output(self, td.0);
						tcb = entry.tcb.lock().unwrap();
					}
					_ => {
						return Err(tcb.close_reason.unwrap_or(Error::Eof));
					}
				}
			}
		}
		Ok(sent)
	}

	/// Half-close: tell the peer we have no more data to send. Reads may
	/// continue until the peer closes its side.
	pub fn tcp_disconnect(self: &Arc<Self>, td: Td) -> Result<(), Error> {
		let mut tcb = self.tcb_guard(td)?;
		debug!("tcp[{}]: disconnect in {:?}", td.0, tcb.state);

		match tcb.state {
			State::Listen | State::SynSent => {
				// No connection was ever established.
				close_self(self, td.0, &mut tcb, None);
				Ok(())
			}
			State::SynReceived | State::Established => {
				// Our FIN takes one sequence number but never sits on the
				// send queue; the transmit scheduler synthesizes it.
				tcb.snd_cnt += 1;
				tcb.snd.nxt = tcb.snd.nxt.wrapping_add(1);
				set_state(self, td.0, &mut tcb, State::FinWait1);
				drop(tcb);
				tcp_output(self, td.0);
				Ok(())
			}
			State::CloseWait => {
				tcb.snd_cnt += 1;
				tcb.snd.nxt = tcb.snd.nxt.wrapping_add(1);
				set_state(self, td.0, &mut tcb, State::LastAck);
				drop(tcb);
				tcp_output(self, td.0);
				Ok(())
			}
			// Already closing, or nothing to do.
			_ => Ok(()),
		}
	}

	/// Wait for the connection to reach CLOSED. Fails unless the connection
	/// is closing.
	pub fn tcp_wait(&self, td: Td) -> Result<(), Error> {
		if td.0 >= MAXTCP {
			return Err(Error::Param);
		}
		let entry = &self.tcp.entries[td.0];
		let mut tcb = entry.tcb.lock().unwrap();
		if tcb.state != State::Closed && tcb.state < State::FinWait1 {
			return Err(Error::Connect);
		}
		while tcb.state != State::Closed {
			tcb = entry.connect.wait(tcb).unwrap();
		}
		Ok(())
	}

	/// Half-close and release the descriptor once the connection reaches
	/// CLOSED.
	pub fn tcp_close(self: &Arc<Self>, td: Td) -> Result<(), Error> {
		{
			let mut tcb = self.tcb_guard(td)?;
			if tcb.state == State::Closed {
				debug!("tcp[{}]: freeing closed block", td.0);
				super::tcb::tcb_free(self, td.0, &mut tcb);
				return Ok(());
			}
			tcb.free_on_close = true;
		}
		self.tcp_disconnect(td)
	}

	/// Whether the connection is up.
	pub fn tcp_is_up(&self, td: Td) -> Result<bool, Error> {
		Ok(self.tcb_guard(td)?.state == State::Established)
	}

	/// Octets waiting in the receive queue.
	pub fn tcp_rcv_count(&self, td: Td) -> Result<usize, Error> {
		Ok(self.tcb_guard(td)?.rcv_cnt as usize)
	}

	/// The keep-alive interval, if enabled.
	pub fn tcp_keep_alive(&self, td: Td) -> Result<Option<Duration>, Error> {
		Ok(self.tcb_guard(td)?.keep_alive)
	}

	/// Set or clear the keep-alive interval. On an established connection
	/// the timer starts with the next traffic.
	pub fn tcp_set_keep_alive(&self, td: Td, interval: Option<Duration>) -> Result<(), Error> {
		self.tcb_guard(td)?.keep_alive = interval;
		Ok(())
	}

	pub fn tcp_trace_level(&self, td: Td) -> Result<u8, Error> {
		Ok(self.tcb_guard(td)?.trace_level)
	}

	pub fn tcp_set_trace_level(&self, td: Td, level: u8) -> Result<(), Error> {
		self.tcb_guard(td)?.trace_level = level;
		Ok(())
	}
}
