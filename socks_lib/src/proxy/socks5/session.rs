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

//! Per-connection SOCKS5 negotiation.
//!
//! [`Session`] owns no socket. The reactor feeds it bytes read from the
//! client and acts on the [`Step`]s it returns, so the whole protocol can be
//! driven from tests without any I/O.

use super::{
	utils::{
		check_version, CommandCode, Error, Reply, ReplyCode, AUTH_FAILED, AUTH_SUCCESSFUL,
		SUB_VERS, VAL_NO_ACCEPTABLE, VAL_USER_PASS,
	},
	CredentialValidator,
};
use crate::{prelude::*, protocol::socks_addr::DomainName};

/// Initial capacity of the receive buffer.
///
/// No complete frame is longer than 513 bytes (a subnegotiation with
/// 255 byte username and password), and the reactor reads at most one
/// chunk between two calls to [`Session::advance`], so the buffer stays small.
const HANDSHAKE_BUFFER_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	/// Waiting for the method selection message.
	Handshake,
	/// Waiting for the username/password subnegotiation.
	Authenticating,
	/// Waiting for the CONNECT request.
	Connecting,
	/// A DNS query for the destination is in flight.
	Resolving,
	/// An outbound connection to the destination is in progress.
	Dialing,
	/// The connection is established and the session can become a tunnel.
	Established,
	Closed,
}

/// What the reactor must do next for a session.
#[derive(Debug)]
pub enum Step {
	/// Buffered bytes do not form a complete frame yet.
	NeedMore,
	/// Send this reply and keep negotiating.
	Reply(Reply),
	/// Send this reply if possible, then close the connection.
	Reject(Reply, Error),
	/// Connect to this address.
	Connect(SocketAddr),
	/// Resolve this name, then connect to it on the given port.
	Resolve(DomainName, u16),
}

pub struct Session {
	phase: Phase,
	buf: Vec<u8>,
	user: Option<String>,
	dest: Option<SocksAddr>,
	query: Option<u16>,
}

impl Default for Session {
	fn default() -> Self {
		Self::new()
	}
}

impl Session {
	#[must_use]
	pub fn new() -> Self {
		Self {
			phase: Phase::Handshake,
			buf: Vec::with_capacity(HANDSHAKE_BUFFER_CAPACITY),
			user: None,
			dest: None,
			query: None,
		}
	}

	#[inline]
	#[must_use]
	pub fn phase(&self) -> Phase {
		self.phase
	}

	/// Returns `true` while the session still reads frames from the client.
	#[inline]
	#[must_use]
	pub fn is_negotiating(&self) -> bool {
		matches!(
			self.phase,
			Phase::Handshake | Phase::Authenticating | Phase::Connecting
		)
	}

	/// The authenticated username, if any.
	#[inline]
	#[must_use]
	pub fn user(&self) -> Option<&str> {
		self.user.as_deref()
	}

	/// The requested destination, once the CONNECT request is parsed.
	#[inline]
	#[must_use]
	pub fn dest(&self) -> Option<&SocksAddr> {
		self.dest.as_ref()
	}

	/// ID of the DNS query this session is waiting for.
	#[inline]
	#[must_use]
	pub fn query(&self) -> Option<u16> {
		self.query
	}

	/// Append bytes read from the client.
	#[inline]
	pub fn feed(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Number of buffered bytes not consumed yet.
	#[inline]
	#[must_use]
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Try to consume one frame from the buffer.
	///
	/// Call again after every [`Step::Reply`], since the client may have
	/// pipelined the next frame.
	pub fn advance(&mut self, validator: &dyn CredentialValidator) -> Step {
		let res = match self.phase {
			Phase::Handshake => self.read_methods(),
			Phase::Authenticating => self.read_authentication(validator),
			Phase::Connecting => self.read_request(),
			_ => return Step::NeedMore,
		};
		match res {
			Ok(step) => step,
			Err(e) => {
				let reply = self.failure_reply();
				self.phase = Phase::Closed;
				Step::Reject(reply, e)
			}
		}
	}

	/// Record the DNS query issued for the destination.
	pub fn set_query(&mut self, id: u16) {
		debug_assert_eq!(self.phase, Phase::Resolving);
		self.query = Some(id);
	}

	/// The destination name resolved to `ip`.
	///
	/// Returns the address to connect to, or `None` if the session was not
	/// waiting for a DNS answer.
	pub fn resolved(&mut self, ip: IpAddr) -> Option<SocketAddr> {
		if self.phase != Phase::Resolving {
			return None;
		}
		let port = self.dest.as_ref()?.port;
		self.query = None;
		self.phase = Phase::Dialing;
		Some(SocketAddr::new(ip, port))
	}

	/// The outbound connection is up. Returns the success reply.
	pub fn established(&mut self) -> Reply {
		self.phase = Phase::Established;
		Reply::Connect(ReplyCode::Succeeded)
	}

	/// Resolving or connecting failed. Returns the reply for the client.
	pub fn fail(&mut self) -> Reply {
		let reply = self.failure_reply();
		self.query = None;
		self.phase = Phase::Closed;
		reply
	}

	/// Bytes the client sent after its CONNECT request.
	///
	/// They belong to the tunnel and must be forwarded to the destination.
	#[must_use]
	pub fn into_early_data(self) -> Vec<u8> {
		self.buf
	}

	fn failure_reply(&self) -> Reply {
		match self.phase {
			Phase::Handshake => Reply::Method(VAL_NO_ACCEPTABLE),
			Phase::Authenticating => Reply::Auth(AUTH_FAILED),
			_ => Reply::Connect(ReplyCode::SocksFailure),
		}
	}

	#[inline]
	fn consume(&mut self, n: usize) {
		self.buf.drain(..n);
	}

	/// Read methods in the following format:
	///```not_rust
	/// +----+----------+----------+
	/// |VER | NMETHODS | METHODS  |
	/// +----+----------+----------+
	/// | 1  |    1     | 1 to 255 |
	/// +----+----------+----------+
	///```
	fn read_methods(&mut self) -> Result<Step, Error> {
		let buf = &self.buf;
		if buf.is_empty() {
			return Ok(Step::NeedMore);
		}
		check_version(buf[0])?;
		if buf.len() < 2 {
			return Ok(Step::NeedMore);
		}
		let len = 2 + usize::from(buf[1]);
		if buf.len() < len {
			return Ok(Step::NeedMore);
		}
		let methods = &buf[2..len];
		if !methods.contains(&VAL_USER_PASS) {
			return Err(Error::UnsupportedMethod(methods.to_vec()));
		}
		debug!("SOCKS5 client offered methods {:?}", methods);
		self.consume(len);
		self.phase = Phase::Authenticating;
		Ok(Step::Reply(Reply::Method(VAL_USER_PASS)))
	}

	/// Read username and password in the following format:
	///```not_rust
	/// +----+------+----------+------+----------+
	/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
	/// +----+------+----------+------+----------+
	/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
	/// +----+------+----------+------+----------+
	///```
	/// See more at <https://datatracker.ietf.org/doc/html/rfc1929>
	fn read_authentication(&mut self, validator: &dyn CredentialValidator) -> Result<Step, Error> {
		let buf = &self.buf;
		if buf.is_empty() {
			return Ok(Step::NeedMore);
		}
		if buf[0] != SUB_VERS {
			return Err(Error::WrongSubVersion(buf[0]));
		}
		if buf.len() < 2 {
			return Ok(Step::NeedMore);
		}
		let user_end = 2 + usize::from(buf[1]);
		if buf.len() < user_end + 1 {
			return Ok(Step::NeedMore);
		}
		let len = user_end + 1 + usize::from(buf[user_end]);
		if buf.len() < len {
			return Ok(Step::NeedMore);
		}
		let user = std::str::from_utf8(&buf[2..user_end]).ok();
		let pass = &buf[user_end + 1..len];
		let user = match user {
			Some(user) if validator.validate(user, pass) => user.to_owned(),
			_ => {
				debug!(
					"SOCKS5 authentication failed for user '{}'",
					String::from_utf8_lossy(&buf[2..user_end])
				);
				return Err(Error::FailedAuthentication);
			}
		};
		debug!("SOCKS5 user '{}' authenticated", user);
		self.user = Some(user);
		self.consume(len);
		self.phase = Phase::Connecting;
		Ok(Step::Reply(Reply::Auth(AUTH_SUCCESSFUL)))
	}

	/// Read request in the following format:
	///```not_rust
	/// +----+-----+-------+------+----------+----------+
	/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
	/// +----+-----+-------+------+----------+----------+
	/// | 1  |  1  | X'00' |  1   | Variable |    2     |
	/// +----+-----+-------+------+----------+----------+
	///```
	fn read_request(&mut self) -> Result<Step, Error> {
		let buf = &self.buf;
		if buf.is_empty() {
			return Ok(Step::NeedMore);
		}
		check_version(buf[0])?;
		if buf.len() < 3 {
			return Ok(Step::NeedMore);
		}
		let cmd = buf[1];
		match CommandCode::try_from(cmd) {
			Ok(CommandCode::Connect) => {}
			Ok(cmd) => return Err(Error::UnsupportedCommand(cmd)),
			Err(_) => return Err(Error::UnknownCommand(cmd)),
		}
		let (addr, addr_len) = match SocksAddr::read_from_bytes(&buf[3..]) {
			Ok(res) => res,
			Err(e) if e.is_incomplete() => return Ok(Step::NeedMore),
			Err(e) => return Err(Error::CannotReadAddr(e)),
		};
		self.consume(3 + addr_len);
		if addr.port == 0 {
			return Err(Error::ZeroPort);
		}
		debug!("SOCKS5 request successfully read, dst: {}", addr);
		let step = match &addr.dest {
			SocksDestination::Ip(ip) => {
				self.phase = Phase::Dialing;
				Step::Connect(SocketAddr::new(*ip, addr.port))
			}
			SocksDestination::Name(name) => {
				self.phase = Phase::Resolving;
				Step::Resolve(name.clone(), addr.port)
			}
		};
		self.dest = Some(addr);
		Ok(step)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proxy::socks5::StaticValidator;

	const AUTH_OK: &[u8] = b"\x01\x05admin\x08admin123";
	const AUTH_WRONG: &[u8] = b"\x01\x05admin\x07admn123";

	fn validator() -> StaticValidator {
		StaticValidator::with_demo_users()
	}

	fn reply_bytes(step: &Step) -> Vec<u8> {
		match step {
			Step::Reply(r) | Step::Reject(r, _) => r.to_vec(),
			_ => panic!("{:?} is not a reply", step),
		}
	}

	/// Session that has passed handshake and authentication.
	fn authenticated() -> Session {
		let v = validator();
		let mut s = Session::new();
		s.feed(&[5, 1, 2]);
		assert!(matches!(s.advance(&v), Step::Reply(_)));
		s.feed(AUTH_OK);
		assert!(matches!(s.advance(&v), Step::Reply(_)));
		assert_eq!(s.phase(), Phase::Connecting);
		s
	}

	#[test]
	fn test_handshake_accepts_user_pass() {
		let v = validator();
		let mut s = Session::new();
		s.feed(&[5, 2, 0, 2]);
		let step = s.advance(&v);
		assert_eq!(reply_bytes(&step), [5, 2]);
		assert!(matches!(step, Step::Reply(_)));
		assert_eq!(s.phase(), Phase::Authenticating);
		assert_eq!(s.buffered(), 0);
	}

	#[test]
	fn test_handshake_without_user_pass() {
		let v = validator();
		let mut s = Session::new();
		s.feed(&[5, 1, 0]);
		let step = s.advance(&v);
		assert_eq!(reply_bytes(&step), [5, 0xff]);
		assert!(matches!(step, Step::Reject(_, Error::UnsupportedMethod(_))));
		assert_eq!(s.phase(), Phase::Closed);
	}

	#[test]
	fn test_handshake_wrong_version() {
		let v = validator();
		let mut s = Session::new();
		// Rejected as soon as the version byte is known.
		s.feed(&[4]);
		let step = s.advance(&v);
		assert_eq!(reply_bytes(&step), [5, 0xff]);
		assert!(matches!(step, Step::Reject(_, Error::WrongVersion(4))));
	}

	#[test]
	fn test_handshake_partial() {
		let v = validator();
		let mut s = Session::new();
		for b in [5_u8, 3, 0, 1] {
			s.feed(&[b]);
			assert!(matches!(s.advance(&v), Step::NeedMore));
			assert_eq!(s.phase(), Phase::Handshake);
		}
		s.feed(&[2]);
		assert_eq!(reply_bytes(&s.advance(&v)), [5, 2]);
	}

	#[test]
	fn test_wrong_password() {
		let v = validator();
		let mut s = Session::new();
		s.feed(&[5, 2, 0, 2]);
		s.advance(&v);
		// Pipelined request after wrong credentials must never be parsed.
		s.feed(AUTH_WRONG);
		s.feed(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 80]);
		let step = s.advance(&v);
		assert_eq!(reply_bytes(&step), [1, 1]);
		assert!(matches!(step, Step::Reject(_, Error::FailedAuthentication)));
		assert_eq!(s.phase(), Phase::Closed);
		assert!(matches!(s.advance(&v), Step::NeedMore));
		assert!(s.user().is_none());
	}

	#[test]
	fn test_auth_wrong_sub_version() {
		let v = validator();
		let mut s = Session::new();
		s.feed(&[5, 1, 2]);
		s.advance(&v);
		s.feed(&[5, 5]);
		assert_eq!(reply_bytes(&s.advance(&v)), [1, 1]);
	}

	#[test]
	fn test_auth_partial() {
		let v = validator();
		let mut s = Session::new();
		s.feed(&[5, 1, 2]);
		s.advance(&v);
		for b in &AUTH_OK[..AUTH_OK.len() - 1] {
			s.feed(&[*b]);
			assert!(matches!(s.advance(&v), Step::NeedMore));
		}
		s.feed(&AUTH_OK[AUTH_OK.len() - 1..]);
		assert_eq!(reply_bytes(&s.advance(&v)), [1, 0]);
		assert_eq!(s.user(), Some("admin"));
	}

	#[test]
	fn test_auth_non_utf8_user() {
		let v = |_: &str, _: &[u8]| true;
		let mut s = Session::new();
		s.feed(&[5, 1, 2]);
		s.advance(&v);
		s.feed(&[1, 2, 0xff, 0xfe, 1, b'p']);
		assert_eq!(reply_bytes(&s.advance(&v)), [1, 1]);
	}

	#[test]
	fn test_connect_ipv4() {
		let v = validator();
		let mut s = authenticated();
		s.feed(&[5, 1, 0, 1, 127, 0, 0, 1, 0x01, 0xbb]);
		match s.advance(&v) {
			Step::Connect(addr) => assert_eq!(addr, "127.0.0.1:443".parse().unwrap()),
			step => panic!("unexpected {:?}", step),
		}
		assert_eq!(s.phase(), Phase::Dialing);
		assert_eq!(s.established().to_vec(), [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
	}

	#[test]
	fn test_connect_ipv6() {
		let v = validator();
		let mut s = authenticated();
		let mut req = vec![5, 1, 0, 4];
		req.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
		req.extend_from_slice(&8080_u16.to_be_bytes());
		s.feed(&req);
		match s.advance(&v) {
			Step::Connect(addr) => assert_eq!(addr, "[::1]:8080".parse().unwrap()),
			step => panic!("unexpected {:?}", step),
		}
	}

	#[test]
	fn test_connect_domain() {
		let v = validator();
		let mut s = authenticated();
		s.feed(b"\x05\x01\x00\x03\x09localhost\x01\xbb");
		match s.advance(&v) {
			Step::Resolve(name, port) => {
				assert_eq!(name.as_str(), "localhost");
				assert_eq!(port, 443);
			}
			step => panic!("unexpected {:?}", step),
		}
		assert_eq!(s.phase(), Phase::Resolving);
		assert_eq!(s.user(), Some("admin"));
		assert_eq!(s.dest().unwrap().to_string(), "localhost:443");
		s.set_query(77);
		assert_eq!(s.query(), Some(77));
		let addr = s.resolved(Ipv4Addr::LOCALHOST.into()).unwrap();
		assert_eq!(addr, "127.0.0.1:443".parse().unwrap());
		assert_eq!(s.phase(), Phase::Dialing);
		assert_eq!(s.query(), None);
		// Only one answer is accepted.
		assert!(s.resolved(Ipv4Addr::LOCALHOST.into()).is_none());
	}

	#[test]
	fn test_connect_domain_is_normalized() {
		let v = validator();
		let mut s = authenticated();
		s.feed(b"\x05\x01\x00\x03\x0cExample.COM.\x00\x50");
		match s.advance(&v) {
			Step::Resolve(name, 80) => assert_eq!(name.as_str(), "example.com"),
			step => panic!("unexpected {:?}", step),
		}
	}

	#[test]
	fn test_connect_domain_with_underscore() {
		let v = validator();
		let mut s = authenticated();
		s.feed(b"\x05\x01\x00\x03\x0cmy_host.corp\x00\x50");
		match s.advance(&v) {
			Step::Resolve(name, 80) => assert_eq!(name.as_str(), "my_host.corp"),
			step => panic!("unexpected {:?}", step),
		}
		assert_eq!(s.phase(), Phase::Resolving);
	}

	#[test]
	fn test_connect_domain_ip_literal() {
		let v = validator();
		let mut s = authenticated();
		s.feed(b"\x05\x01\x00\x03\x0910.0.0.20\x00\x16");
		match s.advance(&v) {
			Step::Connect(addr) => assert_eq!(addr, "10.0.0.20:22".parse().unwrap()),
			step => panic!("unexpected {:?}", step),
		}
	}

	#[test]
	fn test_connect_rejections() {
		let v = validator();
		let failure = [5, 1, 0, 1, 0, 0, 0, 0, 0, 0];
		let cases: &[&[u8]] = &[
			// zero port
			&[5, 1, 0, 1, 127, 0, 0, 1, 0, 0],
			b"\x05\x01\x00\x03\x09localhost\x00\x00",
			// BIND
			&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80],
			// unknown command
			&[5, 9, 0, 1, 127, 0, 0, 1, 0, 80],
			// wrong version
			&[4, 1, 0, 1, 127, 0, 0, 1, 0, 80],
			// unknown address type
			&[5, 1, 0, 2, 127, 0, 0, 1, 0, 80],
			// empty domain
			&[5, 1, 0, 3, 0, 0, 80],
			// empty label
			b"\x05\x01\x00\x03\x04a..b\x00\x50",
			// domain is not UTF-8
			&[5, 1, 0, 3, 2, 0xff, 0xfe, 0, 80],
		];
		for case in cases {
			let mut s = authenticated();
			s.feed(case);
			let step = s.advance(&v);
			assert!(matches!(step, Step::Reject(..)), "{:?} -> {:?}", case, step);
			assert_eq!(reply_bytes(&step), failure);
			assert_eq!(s.phase(), Phase::Closed);
		}
	}

	#[test]
	fn test_request_partial() {
		let v = validator();
		let req = b"\x05\x01\x00\x03\x09localhost\x01\xbb";
		let mut s = authenticated();
		for b in &req[..req.len() - 1] {
			s.feed(&[*b]);
			assert!(matches!(s.advance(&v), Step::NeedMore));
		}
		s.feed(&req[req.len() - 1..]);
		assert!(matches!(s.advance(&v), Step::Resolve(..)));
	}

	#[test]
	fn test_pipelined_frames_and_early_data() {
		let v = validator();
		let mut s = Session::new();
		let mut all = vec![5, 1, 2];
		all.extend_from_slice(AUTH_OK);
		all.extend_from_slice(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 80]);
		all.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");
		s.feed(&all);
		assert_eq!(reply_bytes(&s.advance(&v)), [5, 2]);
		assert_eq!(reply_bytes(&s.advance(&v)), [1, 0]);
		assert!(matches!(s.advance(&v), Step::Connect(_)));
		// Nothing more is parsed once the request is read.
		assert!(matches!(s.advance(&v), Step::NeedMore));
		assert_eq!(s.into_early_data(), b"GET / HTTP/1.0\r\n\r\n");
	}

	#[test]
	fn test_fail_after_resolve() {
		let v = validator();
		let mut s = authenticated();
		s.feed(b"\x05\x01\x00\x03\x09localhost\x01\xbb");
		s.advance(&v);
		s.set_query(1);
		assert_eq!(s.fail().to_vec(), [5, 1, 0, 1, 0, 0, 0, 0, 0, 0]);
		assert_eq!(s.phase(), Phase::Closed);
		assert_eq!(s.query(), None);
	}
}
