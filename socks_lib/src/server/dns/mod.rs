/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/

//! Non-blocking DNS client used by the reactor.
//!
//! Queries for A records go out over a single connected UDP socket.
//! Answers are matched to the session that asked by transaction ID and by
//! question name. Nothing here blocks, the reactor calls
//! [`Resolver::on_readable`] when the socket has datagrams and
//! [`Resolver::expire`] when a deadline has passed.

use crate::prelude::*;
use mio::{net::UdpSocket, Interest, Registry, Token};
use std::collections::HashMap;
use thiserror::Error;
use trust_dns_proto::{
	error::ProtoError,
	op::{Message, MessageType, OpCode, Query},
	rr::{Name, RData, RecordType},
};

/// Longest domain name (without the trailing dot) that fits in a query.
pub const MAX_DOMAIN_LEN: usize = 253;

/// Plain DNS over UDP is limited to 512 bytes without EDNS.
const MAX_DATAGRAM_SIZE: usize = 512;

const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5000;

fn default_servers() -> Vec<SocketAddr> {
	vec![
		SocketAddr::from(([1, 1, 1, 1], 53)),
		SocketAddr::from(([8, 8, 8, 8], 53)),
		SocketAddr::from(([9, 9, 9, 9], 53)),
	]
}

fn default_query_timeout_ms() -> u64 {
	DEFAULT_QUERY_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "use_serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "use_serde", serde(deny_unknown_fields))]
pub struct Config {
	/// Upstream servers. Only one is in use at any time, the next one is
	/// picked when the current one fails.
	#[cfg_attr(feature = "use_serde", serde(default = "default_servers"))]
	pub servers: Vec<SocketAddr>,
	#[cfg_attr(feature = "use_serde", serde(default = "default_query_timeout_ms"))]
	pub query_timeout_ms: u64,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			servers: default_servers(),
			query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
		}
	}
}

#[derive(Debug, Error)]
pub enum ResolveError {
	#[error("invalid domain '{0}'")]
	InvalidDomain(String),
	#[error("DNS encoding error ({0})")]
	Proto(#[from] ProtoError),
	#[error("cannot send DNS query ({0})")]
	Io(#[from] io::Error),
	#[error("too many pending DNS queries")]
	TooManyPending,
}

/// Why a query produced no address.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
	#[error("no A record")]
	NoRecord,
	#[error("DNS channel failed")]
	ChannelFailed,
	#[error("DNS query timed out")]
	TimedOut,
}

/// The outcome of a query, addressed to the session that issued it.
#[derive(Debug)]
pub struct Answer {
	pub owner: Token,
	pub id: u16,
	/// The port the owner asked to connect to.
	pub port: u16,
	pub result: Result<IpAddr, LookupError>,
}

#[derive(Debug)]
struct PendingQuery {
	owner: Token,
	port: u16,
	domain: String,
	deadline: Instant,
}

pub struct Resolver {
	/// `None` while the channel is down after a failed reopen.
	socket: Option<UdpSocket>,
	token: Token,
	servers: Vec<SocketAddr>,
	current: usize,
	pending: HashMap<u16, PendingQuery>,
	query_timeout: Duration,
	recv_buf: Box<[u8]>,
}

impl Resolver {
	/// Open a UDP socket to the first server in `config` and register it
	/// with `token`.
	///
	/// # Errors
	///
	/// Returns an error if `config` has no server or the socket cannot
	/// be opened or registered.
	pub fn new(config: &Config, registry: &Registry, token: Token) -> io::Result<Self> {
		let server = *config.servers.first().ok_or_else(|| {
			io::Error::new(io::ErrorKind::InvalidInput, "no DNS server configured")
		})?;
		let socket = open_socket(server, registry, token)?;
		info!("Using DNS server {}", server);
		Ok(Self {
			socket: Some(socket),
			token,
			servers: config.servers.clone(),
			current: 0,
			pending: HashMap::new(),
			query_timeout: Duration::from_millis(config.query_timeout_ms),
			recv_buf: vec![0_u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
		})
	}

	/// The upstream server currently in use.
	#[inline]
	pub fn server(&self) -> SocketAddr {
		self.servers[self.current]
	}

	#[inline]
	pub fn pending_count(&self) -> usize {
		self.pending.len()
	}

	/// Send an A query for `domain` on behalf of `owner`, who wants to
	/// connect to `port` once the name is resolved.
	///
	/// Returns the transaction ID of the query. The answer arrives later
	/// through [`Resolver::on_readable`] or [`Resolver::expire`].
	///
	/// # Errors
	///
	/// Returns an error if the domain is not a valid name of at most
	/// [`MAX_DOMAIN_LEN`] bytes, or if the query cannot be sent right now.
	/// A channel that is down is reopened first, and if that fails the
	/// error is returned.
	pub fn resolve(
		&mut self,
		registry: &Registry,
		domain: &str,
		port: u16,
		owner: Token,
	) -> Result<u16, ResolveError> {
		let domain = domain.strip_suffix('.').unwrap_or(domain);
		if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
			return Err(ResolveError::InvalidDomain(domain.to_owned()));
		}
		let domain = domain.to_ascii_lowercase();
		let id = self.new_id()?;
		let query = make_query(id, &domain)?;
		let len = self.socket(registry)?.send(&query)?;
		if len != query.len() {
			return Err(io::Error::new(io::ErrorKind::WriteZero, "DNS query truncated").into());
		}
		debug!("DNS query {} for '{}' sent to {}", id, domain, self.server());
		self.pending.insert(
			id,
			PendingQuery {
				owner,
				port,
				domain,
				deadline: Instant::now() + self.query_timeout,
			},
		);
		Ok(id)
	}

	/// Forget query `id`, usually because its session is gone.
	pub fn cancel(&mut self, id: u16) {
		if let Some(query) = self.pending.remove(&id) {
			debug!("DNS query {} for '{}' cancelled", id, query.domain);
		}
	}

	/// The earliest deadline among pending queries.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.pending.values().map(|q| q.deadline).min()
	}

	/// Remove every query whose deadline is not after `now`.
	pub fn expire(&mut self, now: Instant) -> Vec<Answer> {
		let expired: Vec<u16> = self
			.pending
			.iter()
			.filter(|(_, q)| q.deadline <= now)
			.map(|(id, _)| *id)
			.collect();
		expired
			.into_iter()
			.filter_map(|id| {
				let query = self.pending.remove(&id)?;
				warn!("DNS query {} for '{}' timed out", id, query.domain);
				Some(Answer {
					owner: query.owner,
					id,
					port: query.port,
					result: Err(LookupError::TimedOut),
				})
			})
			.collect()
	}

	/// Read every datagram available on the socket.
	///
	/// If the socket fails, it is replaced by a new one and every pending
	/// query fails with [`LookupError::ChannelFailed`].
	pub fn on_readable(&mut self, registry: &Registry) -> Vec<Answer> {
		let mut answers = Vec::new();
		loop {
			let socket = match &self.socket {
				Some(socket) => socket,
				None => break,
			};
			let len = match socket.recv(&mut self.recv_buf) {
				Ok(len) => len,
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => {
					error!("DNS socket to {} failed ({})", self.server(), e);
					self.reopen(registry, &mut answers);
					break;
				}
			};
			match Message::from_vec(&self.recv_buf[..len]) {
				Ok(msg) => answers.extend(self.handle_response(&msg)),
				Err(e) => warn!("Malformed DNS message from {} ({})", self.server(), e),
			}
		}
		answers
	}

	fn handle_response(&mut self, msg: &Message) -> Option<Answer> {
		let id = msg.id();
		if msg.message_type() != MessageType::Response {
			debug!("Ignoring DNS message {} that is not a response", id);
			return None;
		}
		let query = if let Some(query) = self.pending.get(&id) {
			query
		} else {
			warn!("DNS response with unknown ID {} dropped", id);
			return None;
		};
		if !question_matches(msg, &query.domain) {
			warn!(
				"DNS response {} does not answer the question for '{}', dropped",
				id, query.domain
			);
			return None;
		}
		let query = self.pending.remove(&id)?;
		let result = first_a_record(msg).map(IpAddr::V4).ok_or(LookupError::NoRecord);
		match &result {
			Ok(ip) => debug!("DNS query {}: '{}' is {}", id, query.domain, ip),
			Err(_) => debug!("DNS query {}: no A record for '{}'", id, query.domain),
		}
		Some(Answer {
			owner: query.owner,
			id,
			port: query.port,
			result,
		})
	}

	/// The socket to send on, reopened if the channel is down.
	fn socket(&mut self, registry: &Registry) -> io::Result<&UdpSocket> {
		if self.socket.is_none() {
			let server = self.server();
			let socket = open_socket(server, registry, self.token)?;
			info!("DNS socket reopened to {}", server);
			self.socket = Some(socket);
		}
		self.socket
			.as_ref()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "DNS channel is down"))
	}

	fn reopen(&mut self, registry: &Registry, answers: &mut Vec<Answer>) {
		self.deregister(registry);
		self.socket = None;
		if self.servers.len() > 1 {
			self.current = (self.current + 1) % self.servers.len();
		}
		if let Err(e) = self.socket(registry) {
			error!(
				"Cannot reopen DNS socket to {} ({}), retrying on the next query",
				self.server(),
				e
			);
		}
		answers.extend(self.pending.drain().map(|(id, query)| Answer {
			owner: query.owner,
			id,
			port: query.port,
			result: Err(LookupError::ChannelFailed),
		}));
	}

	fn new_id(&self) -> Result<u16, ResolveError> {
		if self.pending.len() > usize::from(u16::MAX) {
			return Err(ResolveError::TooManyPending);
		}
		loop {
			let id = rand::random::<u16>();
			if !self.pending.contains_key(&id) {
				return Ok(id);
			}
		}
	}

	/// Deregister the socket from `registry`.
	pub fn deregister(&mut self, registry: &Registry) {
		if let Some(socket) = &mut self.socket {
			if let Err(e) = registry.deregister(socket) {
				debug!("Cannot deregister DNS socket ({})", e);
			}
		}
	}
}

fn open_socket(server: SocketAddr, registry: &Registry, token: Token) -> io::Result<UdpSocket> {
	let bind_addr: SocketAddr = if server.is_ipv4() {
		(Ipv4Addr::UNSPECIFIED, 0).into()
	} else {
		(Ipv6Addr::UNSPECIFIED, 0).into()
	};
	let mut socket = UdpSocket::bind(bind_addr)?;
	socket.connect(server)?;
	registry.register(&mut socket, token, Interest::READABLE)?;
	Ok(socket)
}

/// Encode a recursive A query for `domain`.
fn make_query(id: u16, domain: &str) -> Result<Vec<u8>, ProtoError> {
	let name = Name::from_ascii(format!("{}.", domain))?;
	let mut msg = Message::new();
	msg.set_id(id)
		.set_message_type(MessageType::Query)
		.set_op_code(OpCode::Query)
		.set_recursion_desired(true)
		.add_query(Query::query(name, RecordType::A));
	msg.to_vec()
}

fn question_matches(msg: &Message, domain: &str) -> bool {
	msg.queries().iter().any(|q| {
		let name = q.name().to_ascii();
		name.trim_end_matches('.').eq_ignore_ascii_case(domain)
	})
}

fn first_a_record(msg: &Message) -> Option<Ipv4Addr> {
	msg.answers().iter().find_map(|record| match record.rdata() {
		RData::A(ip) => Some(*ip),
		_ => None,
	})
}
