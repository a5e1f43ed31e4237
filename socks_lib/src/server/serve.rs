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

use super::{
	conn::{check_connected, Client, Conn, Remote},
	dns::Answer,
	Error, Server, EVENTS_CAPACITY, LISTENER, RESOLVER, WAKER,
};
use crate::{
	prelude::*,
	protocol::socks_addr::DomainName,
	proxy::socks5::{Phase, Step},
	utils::relay::{Endpoint, Status, Tunnel},
};
use mio::{event::Event, net::TcpStream, Events, Interest, Token};
use std::sync::atomic::Ordering;

impl Server {
	/// Run the event loop on the current thread until
	/// [`StopHandle::stop`](super::StopHandle::stop) is called.
	///
	/// # Errors
	///
	/// Returns an error only if waiting for events fails. Errors on single
	/// connections are logged and close that connection.
	pub fn serve(mut self) -> io::Result<()> {
		info!("SOCKS5 server listening on {}", self.local_addr);
		let mut events = Events::with_capacity(EVENTS_CAPACITY);
		while self.running.load(Ordering::Acquire) {
			let timeout = self
				.resolver
				.next_deadline()
				.map(|deadline| deadline.saturating_duration_since(Instant::now()));
			if let Err(e) = self.poll.poll(&mut events, timeout) {
				if e.kind() == io::ErrorKind::Interrupted {
					continue;
				}
				error!("Cannot poll events ({})", e);
				self.shutdown();
				return Err(e);
			}
			for event in events.iter() {
				match event.token() {
					LISTENER => self.accept(),
					RESOLVER => {
						let answers = self.resolver.on_readable(self.poll.registry());
						self.dispatch_answers(answers);
					}
					WAKER => trace!("Server woken up"),
					_ => self.on_conn_event(event),
				}
			}
			let expired = self.resolver.expire(Instant::now());
			self.dispatch_answers(expired);
		}
		self.shutdown();
		Ok(())
	}

	fn accept(&mut self) {
		loop {
			let (mut stream, peer) = match self.listener.accept() {
				Ok(res) => res,
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => {
					error!("Cannot accept connection ({})", e);
					break;
				}
			};
			let token = self.next_token();
			if let Err(e) = self
				.poll
				.registry()
				.register(&mut stream, token, Interest::READABLE)
			{
				warn!("Cannot register connection from {} ({})", peer, e);
				continue;
			}
			let client = Client::new(token, stream, peer);
			info!("[{}] new connection from {}", client.id, peer);
			self.conns.insert(token, Conn::Client(Box::new(client)));
		}
	}

	fn on_conn_event(&mut self, event: &Event) {
		let token = event.token();
		let owner = match self.conns.get(&token) {
			Some(Conn::Remote(owner)) => *owner,
			Some(_) => token,
			None => {
				trace!("Event on released token {:?}", token);
				return;
			}
		};
		match self.conns.remove(&owner) {
			Some(Conn::Client(client)) => {
				if token == owner {
					self.on_client_event(owner, client, event);
				} else {
					self.on_connect_event(owner, client, token);
				}
			}
			Some(Conn::Tunnel(tunnel)) => self.on_tunnel_event(owner, tunnel, token, event),
			Some(Conn::Remote(_)) | None => {
				warn!("Remote socket {:?} has no owner, dropping it", token);
				self.conns.remove(&token);
			}
		}
	}

	fn on_client_event(&mut self, token: Token, mut client: Box<Client>, event: &Event) {
		if !client.session.is_negotiating() {
			// Bytes sent while waiting for DNS or connect stay in the
			// socket until the tunnel takes over.
			if event.is_error() || event.is_read_closed() {
				debug!("[{}] client went away while connecting", client.id);
				self.close_client(client, None);
			} else {
				self.conns.insert(token, Conn::Client(client));
			}
			return;
		}
		match self.negotiate(token, &mut client) {
			Ok(true) => {
				self.conns.insert(token, Conn::Client(client));
			}
			Ok(false) => self.close_client(client, None),
			Err(e) => self.close_client(client, Some(e)),
		}
	}

	/// Consume buffered frames and read more until the client would block.
	///
	/// Returns `Ok(false)` if the client closed the connection.
	fn negotiate(&mut self, token: Token, client: &mut Client) -> Result<bool, Error> {
		while client.session.is_negotiating() {
			match client.session.advance(&*self.validator) {
				Step::NeedMore => {}
				Step::Reply(reply) => {
					client.send(reply)?;
					continue;
				}
				Step::Reject(reply, e) => {
					client.send_best_effort(reply);
					return Err(e.into());
				}
				Step::Connect(addr) => {
					self.dial(token, client, addr)?;
					break;
				}
				Step::Resolve(name, port) => {
					self.resolve(token, client, &name, port)?;
					break;
				}
			}
			match client.read_chunk() {
				Ok(0) => {
					debug!("[{}] client closed during negotiation", client.id);
					return Ok(false);
				}
				Ok(_) => {}
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) => return Err(e.into()),
			}
		}
		Ok(true)
	}

	fn dial(&mut self, owner: Token, client: &mut Client, addr: SocketAddr) -> Result<(), Error> {
		info!("[{}] connecting to {}", client.id, addr);
		let mut stream = TcpStream::connect(addr)?;
		let token = self.next_token();
		self.poll
			.registry()
			.register(&mut stream, token, Interest::WRITABLE)?;
		client.remote = Some(Remote {
			stream,
			token,
			addr,
		});
		self.conns.insert(token, Conn::Remote(owner));
		Ok(())
	}

	fn resolve(
		&mut self,
		owner: Token,
		client: &mut Client,
		name: &DomainName,
		port: u16,
	) -> Result<(), Error> {
		let id = self
			.resolver
			.resolve(self.poll.registry(), name.as_str(), port, owner)?;
		debug!("[{}] resolving '{}' (query {})", client.id, name, id);
		client.session.set_query(id);
		Ok(())
	}

	fn dispatch_answers(&mut self, answers: Vec<Answer>) {
		for answer in answers {
			let mut client = match self.conns.remove(&answer.owner) {
				Some(Conn::Client(client)) if client.session.query() == Some(answer.id) => client,
				Some(other) => {
					debug!("DNS answer {} no longer wanted", answer.id);
					self.conns.insert(answer.owner, other);
					continue;
				}
				None => continue,
			};
			let addr = match answer.result {
				Ok(ip) => client.session.resolved(ip),
				Err(e) => {
					self.close_client(client, Some(e.into()));
					continue;
				}
			};
			let res = match addr {
				Some(addr) => self.dial(answer.owner, &mut client, addr),
				None => Ok(()),
			};
			match res {
				Ok(()) => {
					self.conns.insert(answer.owner, Conn::Client(client));
				}
				Err(e) => self.close_client(client, Some(e)),
			}
		}
	}

	fn on_connect_event(&mut self, owner: Token, client: Box<Client>, token: Token) {
		let res = match &client.remote {
			Some(remote) if remote.token == token => check_connected(&remote.stream),
			_ => {
				self.conns.insert(owner, Conn::Client(client));
				return;
			}
		};
		match res {
			Ok(true) => self.establish(owner, client),
			Ok(false) => {
				self.conns.insert(owner, Conn::Client(client));
			}
			Err(e) => self.close_client(client, Some(e.into())),
		}
	}

	/// Tell the client it is connected and turn it into a tunnel.
	fn establish(&mut self, owner: Token, mut client: Box<Client>) {
		let reply = client.session.established();
		if let Err(e) = client.send(reply) {
			self.close_client(client, Some(e.into()));
			return;
		}
		let Client {
			id,
			stream,
			peer,
			session,
			remote,
		} = *client;
		let remote = if let Some(remote) = remote {
			remote
		} else {
			return;
		};
		info!(
			"[{}] tunnel {} <-> {} established for user '{}' (requested {})",
			id,
			peer,
			remote.addr,
			session.user().unwrap_or_default(),
			session
				.dest()
				.map_or_else(String::new, ToString::to_string),
		);
		let early_data = session.into_early_data();
		let mut tunnel = Box::new(Tunnel::new(
			&id,
			Endpoint::new(stream, owner, Interest::READABLE),
			Endpoint::new(remote.stream, remote.token, Interest::WRITABLE),
			self.relay_buffer_size,
			&early_data,
		));
		match tunnel.start(self.poll.registry()) {
			Ok(Status::Open) => {
				self.conns.insert(owner, Conn::Tunnel(tunnel));
			}
			Ok(Status::Closed) => self.close_tunnel(tunnel),
			Err(e) => {
				debug!("[{}] relay error ({})", id, e);
				self.close_tunnel(tunnel);
			}
		}
	}

	fn on_tunnel_event(&mut self, owner: Token, mut tunnel: Box<Tunnel>, token: Token, event: &Event) {
		let readable = event.is_readable() || event.is_read_closed() || event.is_error();
		let writable = event.is_writable() || event.is_write_closed();
		match tunnel.on_ready(self.poll.registry(), token, readable, writable) {
			Ok(Status::Open) => {
				self.conns.insert(owner, Conn::Tunnel(tunnel));
			}
			Ok(Status::Closed) => self.close_tunnel(tunnel),
			Err(e) => {
				debug!("[{}] relay error ({})", tunnel.conn_id(), e);
				self.close_tunnel(tunnel);
			}
		}
	}

	/// Close both sides of a tunnel already taken out of the map.
	fn close_tunnel(&mut self, mut tunnel: Box<Tunnel>) {
		tunnel.close(self.poll.registry());
		self.conns.remove(&tunnel.remote_token());
	}

	/// Close a client already taken out of the map.
	///
	/// A client that was resolving or connecting gets a failure reply
	/// first.
	fn close_client(&mut self, mut client: Box<Client>, err: Option<Error>) {
		match &err {
			Some(Error::Socks(e)) => warn!("[{}] rejected {} ({})", client.id, client.peer, e),
			Some(Error::Io(e)) => debug!("[{}] IO error ({})", client.id, e),
			Some(e) => info!("[{}] {}", client.id, e),
			None => {}
		}
		if let Some(id) = client.session.query() {
			self.resolver.cancel(id);
		}
		if matches!(client.session.phase(), Phase::Resolving | Phase::Dialing) {
			let reply = client.session.fail();
			client.send_best_effort(reply);
		}
		if let Some(remote_token) = client.deregister(self.poll.registry()) {
			self.conns.remove(&remote_token);
		}
		info!("[{}] connection from {} closed", client.id, client.peer);
	}

	/// Release every connection and the sockets owned by the reactor.
	fn shutdown(&mut self) {
		let count = self.connection_count();
		let registry = self.poll.registry();
		for (_, conn) in self.conns.drain() {
			match conn {
				Conn::Client(mut client) => {
					client.deregister(registry);
				}
				Conn::Tunnel(mut tunnel) => tunnel.close(registry),
				Conn::Remote(_) => {}
			}
		}
		if let Err(e) = registry.deregister(&mut self.listener) {
			debug!("Cannot deregister listener ({})", e);
		}
		self.resolver.deregister(registry);
		info!("Server stopped, {} connections released", count);
	}
}
