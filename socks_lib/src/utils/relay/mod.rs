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

mod stream_copier;
mod traffic;

pub use stream_copier::{Flow, StreamCopier};
pub use traffic::Traffic;

use crate::prelude::*;
use mio::{net::TcpStream, Interest, Registry, Token};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	Open,
	Closed,
}

/// A TCP stream together with its token and its current registration.
///
/// `interest` is `None` when the stream is not registered, which is the
/// only way to wait for nothing since mio rejects an empty interest.
pub struct Endpoint {
	stream: TcpStream,
	token: Token,
	interest: Option<Interest>,
}

impl Endpoint {
	/// `interest` must be what `stream` is currently registered with.
	pub fn new(stream: TcpStream, token: Token, interest: Interest) -> Self {
		Self {
			stream,
			token,
			interest: Some(interest),
		}
	}

	fn set_interest(&mut self, registry: &Registry, interest: Option<Interest>) -> io::Result<()> {
		if self.interest == interest {
			return Ok(());
		}
		match (self.interest, interest) {
			(None, Some(i)) => registry.register(&mut self.stream, self.token, i)?,
			(Some(_), Some(i)) => registry.reregister(&mut self.stream, self.token, i)?,
			(Some(_), None) => registry.deregister(&mut self.stream)?,
			(None, None) => {}
		}
		self.interest = interest;
		Ok(())
	}
}

fn make_interest(readable: bool, writable: bool) -> Option<Interest> {
	match (readable, writable) {
		(true, true) => Some(Interest::READABLE | Interest::WRITABLE),
		(true, false) => Some(Interest::READABLE),
		(false, true) => Some(Interest::WRITABLE),
		(false, false) => None,
	}
}

/// Bidirectional byte pipe between a client and the remote it asked for.
///
/// Each direction owns its own buffer. A socket is watched for
/// readability only while the buffer it feeds is empty, and for
/// writability only while the buffer it drains has bytes left.
pub struct Tunnel {
	conn_id: Arc<str>,
	client: Endpoint,
	remote: Endpoint,
	/// Client ---> Remote
	send: StreamCopier,
	/// Client <--- Remote
	recv: StreamCopier,
	start_time: Instant,
	closed: bool,
}

impl Tunnel {
	/// `early_data` is whatever the client sent after its request and
	/// before the tunnel existed. It is forwarded to the remote first.
	pub fn new(
		conn_id: &str,
		client: Endpoint,
		remote: Endpoint,
		buffer_size: usize,
		early_data: &[u8],
	) -> Self {
		let conn_id = Arc::<str>::from(conn_id);
		let send_tag = Arc::<str>::from(format!("[{} send]", conn_id));
		let recv_tag = Arc::<str>::from(format!("[{} recv]", conn_id));
		Self {
			conn_id,
			client,
			remote,
			send: StreamCopier::with_pending(buffer_size, early_data, send_tag),
			recv: StreamCopier::new(buffer_size, recv_tag),
			start_time: Instant::now(),
			closed: false,
		}
	}

	#[inline]
	pub fn remote_token(&self) -> Token {
		self.remote.token
	}

	#[inline]
	pub fn conn_id(&self) -> &str {
		&self.conn_id
	}

	/// Bytes delivered so far in each direction.
	#[inline]
	pub fn traffic(&self) -> Traffic {
		Traffic {
			sent: self.send.count(),
			received: self.recv.count(),
			lasted: self.start_time.elapsed(),
		}
	}

	/// Move whatever can be moved in both directions.
	///
	/// Must be called once after construction, since edge-triggered
	/// readiness that fired before the tunnel existed will not fire again.
	///
	/// # Errors
	///
	/// Returns I/O errors from either socket or from the registry.
	pub fn start(&mut self, registry: &Registry) -> io::Result<Status> {
		self.on_ready(registry, self.client.token, true, true)
	}

	/// Handle readiness of the socket identified by `token`.
	///
	/// # Errors
	///
	/// Returns I/O errors from either socket or from the registry.
	pub fn on_ready(
		&mut self,
		registry: &Registry,
		token: Token,
		readable: bool,
		writable: bool,
	) -> io::Result<Status> {
		if self.closed {
			return Ok(Status::Closed);
		}
		let from_client = token == self.client.token;
		// Readable on one side feeds the buffer towards the other side,
		// writable on one side drains the buffer towards it.
		let (pump_send, pump_recv) = if from_client {
			(readable, writable)
		} else {
			(writable, readable)
		};
		if pump_send && self.pump_send()? == Flow::Eof {
			return Ok(Status::Closed);
		}
		if pump_recv && self.pump_recv()? == Flow::Eof {
			return Ok(Status::Closed);
		}
		self.sync_interest(registry)?;
		Ok(Status::Open)
	}

	fn pump_send(&mut self) -> io::Result<Flow> {
		self.send.copy(&mut self.client.stream, &mut self.remote.stream)
	}

	fn pump_recv(&mut self) -> io::Result<Flow> {
		self.recv.copy(&mut self.remote.stream, &mut self.client.stream)
	}

	fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
		let send_drained = self.send.is_drained();
		let recv_drained = self.recv.is_drained();
		self.client
			.set_interest(registry, make_interest(send_drained, !recv_drained))?;
		self.remote
			.set_interest(registry, make_interest(recv_drained, !send_drained))?;
		Ok(())
	}

	/// Deregister both sockets. Calling this more than once has no effect.
	///
	/// The sockets themselves are closed when the tunnel is dropped.
	pub fn close(&mut self, registry: &Registry) {
		if self.closed {
			return;
		}
		self.closed = true;
		for end in [&mut self.client, &mut self.remote] {
			if end.interest.is_some() {
				if let Err(e) = registry.deregister(&mut end.stream) {
					debug!("[{}] cannot deregister socket ({})", self.conn_id, e);
				}
				end.interest = None;
			}
		}
		info!("[{}] relay finished, {}", self.conn_id, self.traffic());
	}

	#[inline]
	pub fn is_closed(&self) -> bool {
		self.closed
	}
}
