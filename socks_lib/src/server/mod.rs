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

//! The reactor.
//!
//! A single thread owns one [`mio::Poll`] and every socket: the listener,
//! the DNS socket, client sockets and remote sockets. Each connection is a
//! [`Conn`] in one map keyed by token.

mod builder;
mod conn;
pub mod dns;
mod error;
mod serve;

pub use builder::{BuildError, Builder};
pub use error::Error;

use crate::{prelude::*, proxy::socks5::CredentialValidator};
use conn::Conn;
use dns::Resolver;
use mio::{net::TcpListener, Poll, Token, Waker};
use std::{
	collections::HashMap,
	sync::atomic::{AtomicBool, Ordering},
};

const LISTENER: Token = Token(0);
const RESOLVER: Token = Token(1);
const WAKER: Token = Token(2);
const FIRST_CONN_TOKEN: usize = 3;

const EVENTS_CAPACITY: usize = 1024;

pub struct Server {
	poll: Poll,
	listener: TcpListener,
	local_addr: SocketAddr,
	resolver: Resolver,
	validator: Box<dyn CredentialValidator + Send>,
	conns: HashMap<Token, Conn>,
	next_token: usize,
	relay_buffer_size: usize,
	running: Arc<AtomicBool>,
	waker: Arc<Waker>,
}

impl Server {
	/// The address the listener is actually bound to.
	#[inline]
	#[must_use]
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// A handle that can stop [`Server::serve`] from another thread.
	#[must_use]
	pub fn stop_handle(&self) -> StopHandle {
		StopHandle {
			running: self.running.clone(),
			waker: self.waker.clone(),
		}
	}

	/// Number of client connections (negotiating or tunnelled).
	#[must_use]
	pub fn connection_count(&self) -> usize {
		self.conns
			.values()
			.filter(|c| !matches!(c, Conn::Remote(_)))
			.count()
	}

	fn next_token(&mut self) -> Token {
		let token = Token(self.next_token);
		self.next_token += 1;
		token
	}
}

/// Stops a running [`Server`].
#[derive(Clone)]
pub struct StopHandle {
	running: Arc<AtomicBool>,
	waker: Arc<Waker>,
}

impl StopHandle {
	/// Ask the server to stop.
	///
	/// The event loop finishes the events it is handling, releases every
	/// connection and returns from [`Server::serve`].
	pub fn stop(&self) {
		self.running.store(false, Ordering::Release);
		if let Err(e) = self.waker.wake() {
			error!("Cannot wake up server ({})", e);
		}
	}
}
