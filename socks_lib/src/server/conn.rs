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

use crate::{
	prelude::*,
	proxy::socks5::{Reply, Session},
	utils::relay::Tunnel,
};
use mio::{net::TcpStream, Registry, Token};
use std::io::{Read, Write};

/// Bytes read from a negotiating client at a time.
const READ_CHUNK_SIZE: usize = 512;

/// What a token in the reactor's map points to.
pub(super) enum Conn {
	/// A client that has not got a tunnel yet, under its own token.
	Client(Box<Client>),
	/// An established tunnel, under the client's token.
	Tunnel(Box<Tunnel>),
	/// A remote socket, under its own token. Holds the client's token.
	Remote(Token),
}

pub(super) struct Remote {
	pub stream: TcpStream,
	pub token: Token,
	pub addr: SocketAddr,
}

pub(super) struct Client {
	/// Hex form of the client's token, used in logs.
	pub id: String,
	pub stream: TcpStream,
	pub peer: SocketAddr,
	pub session: Session,
	/// Outbound connection in progress.
	pub remote: Option<Remote>,
}

impl Client {
	pub fn new(token: Token, stream: TcpStream, peer: SocketAddr) -> Self {
		Self {
			id: format!("{:x}", token.0),
			stream,
			peer,
			session: Session::new(),
			remote: None,
		}
	}

	/// Read at most one chunk into the session buffer.
	///
	/// Returns the number of bytes read, 0 means EOF.
	pub fn read_chunk(&mut self) -> io::Result<usize> {
		let mut chunk = [0_u8; READ_CHUNK_SIZE];
		loop {
			match self.stream.read(&mut chunk) {
				Ok(n) => {
					trace!("[{}] read {} bytes from client", self.id, n);
					self.session.feed(&chunk[..n]);
					return Ok(n);
				}
				Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => return Err(e),
			}
		}
	}

	/// Write `reply` in one go.
	///
	/// Replies are tiny, so a socket that cannot take one whole reply
	/// is treated as broken.
	pub fn send(&mut self, reply: Reply) -> io::Result<()> {
		let buf = reply.to_vec();
		loop {
			match self.stream.write(&buf) {
				Ok(n) if n == buf.len() => return Ok(()),
				Ok(_) => {
					return Err(io::Error::new(
						io::ErrorKind::WriteZero,
						"reply only partially written",
					))
				}
				Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => return Err(e),
			}
		}
	}

	pub fn send_best_effort(&mut self, reply: Reply) {
		if let Err(e) = self.send(reply) {
			debug!("[{}] cannot send reply {:?} ({})", self.id, reply, e);
		}
	}

	/// Deregister the client socket and the remote socket, if any.
	///
	/// Returns the token of the remote socket so the caller can forget it.
	pub fn deregister(&mut self, registry: &Registry) -> Option<Token> {
		if let Err(e) = registry.deregister(&mut self.stream) {
			debug!("[{}] cannot deregister client socket ({})", self.id, e);
		}
		let mut remote = self.remote.take()?;
		if let Err(e) = registry.deregister(&mut remote.stream) {
			debug!("[{}] cannot deregister remote socket ({})", self.id, e);
		}
		Some(remote.token)
	}
}

/// Check the result of a non-blocking connect after `stream` became
/// writable.
///
/// Returns `Ok(false)` if the connection is still in progress.
pub(super) fn check_connected(stream: &TcpStream) -> io::Result<bool> {
	if let Some(e) = stream.take_error()? {
		return Err(e);
	}
	match stream.peer_addr() {
		Ok(_) => Ok(true),
		Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
		Err(e) => Err(e),
	}
}
