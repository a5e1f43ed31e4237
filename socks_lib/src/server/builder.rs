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
	dns::{self, Resolver},
	Server, FIRST_CONN_TOKEN, LISTENER, RESOLVER, WAKER,
};
use crate::{
	prelude::*,
	proxy::socks5::{CredentialValidator, StaticValidator},
	utils::relay::DEFAULT_BUFFER_SIZE,
};
use mio::{net::TcpListener, Interest, Poll, Waker};
use std::{
	collections::HashMap,
	sync::atomic::AtomicBool,
};

const DEFAULT_PORT: u16 = 1080;

fn default_bind_ip() -> IpAddr {
	Ipv4Addr::LOCALHOST.into()
}

fn default_port() -> u16 {
	DEFAULT_PORT
}

fn default_relay_buffer_size() -> usize {
	DEFAULT_BUFFER_SIZE
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
	#[error("value of '{0}' cannot be zero")]
	ValueIsZero(Cow<'static, str>),
	#[error("no DNS server configured")]
	EmptyDnsServers,
	#[error("cannot bind {addr} ({err})")]
	Bind { addr: SocketAddr, err: io::Error },
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
#[cfg_attr(
	feature = "use_serde",
	derive(serde::Deserialize),
	serde(deny_unknown_fields)
)]
pub struct Builder {
	#[cfg_attr(feature = "use_serde", serde(default = "default_bind_ip"))]
	pub bind_ip: IpAddr,
	#[cfg_attr(feature = "use_serde", serde(default = "default_port"))]
	pub port: u16,
	/// Username to password. The demo accounts are used if this is empty.
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub users: HashMap<String, String>,
	#[cfg_attr(feature = "use_serde", serde(default))]
	pub dns: dns::Config,
	/// Size of each of the two buffers of a tunnel.
	#[cfg_attr(feature = "use_serde", serde(default = "default_relay_buffer_size"))]
	pub relay_buffer_size: usize,
}

impl Default for Builder {
	fn default() -> Self {
		Self {
			bind_ip: default_bind_ip(),
			port: default_port(),
			users: HashMap::new(),
			dns: dns::Config::default(),
			relay_buffer_size: default_relay_buffer_size(),
		}
	}
}

impl Builder {
	/// Creates a [`Server`] that checks credentials against `users`.
	///
	/// # Errors
	///
	/// Returns an error if the configuration is invalid or if the listener
	/// or the DNS socket cannot be opened.
	pub fn build(self) -> Result<Server, BuildError> {
		let validator = if self.users.is_empty() {
			warn!("No user configured, using demo accounts");
			StaticValidator::with_demo_users()
		} else {
			StaticValidator::new(self.users.clone())
		};
		self.build_with_validator(Box::new(validator))
	}

	/// Creates a [`Server`] that checks credentials with `validator`.
	/// `users` is ignored.
	///
	/// # Errors
	///
	/// Same as [`Builder::build`].
	pub fn build_with_validator(
		self,
		validator: Box<dyn CredentialValidator + Send>,
	) -> Result<Server, BuildError> {
		if self.relay_buffer_size == 0 {
			return Err(BuildError::ValueIsZero("relay_buffer_size".into()));
		}
		if self.dns.query_timeout_ms == 0 {
			return Err(BuildError::ValueIsZero("dns.query_timeout_ms".into()));
		}
		if self.dns.servers.is_empty() {
			return Err(BuildError::EmptyDnsServers);
		}

		let poll = Poll::new()?;
		let addr = SocketAddr::new(self.bind_ip, self.port);
		let mut listener = TcpListener::bind(addr).map_err(|err| BuildError::Bind { addr, err })?;
		let local_addr = listener.local_addr()?;
		poll.registry()
			.register(&mut listener, LISTENER, Interest::READABLE)?;
		let waker = Waker::new(poll.registry(), WAKER)?;
		let resolver = Resolver::new(&self.dns, poll.registry(), RESOLVER)?;

		Ok(Server {
			poll,
			listener,
			local_addr,
			resolver,
			validator,
			conns: HashMap::new(),
			next_token: FIRST_CONN_TOKEN,
			relay_buffer_size: self.relay_buffer_size,
			running: Arc::new(AtomicBool::new(true)),
			waker: Arc::new(waker),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn local_builder() -> Builder {
		Builder {
			port: 0,
			..Builder::default()
		}
	}

	#[test]
	fn test_defaults() {
		let b = Builder::default();
		assert_eq!(b.bind_ip, IpAddr::from(Ipv4Addr::LOCALHOST));
		assert_eq!(b.port, 1080);
		assert_eq!(b.relay_buffer_size, 32 * 1024);
		assert_eq!(b.dns.servers.len(), 3);
		assert_eq!(b.dns.query_timeout_ms, 5000);
	}

	#[test]
	fn test_build_errors() {
		let mut b = local_builder();
		b.relay_buffer_size = 0;
		assert!(matches!(b.build(), Err(BuildError::ValueIsZero(_))));

		let mut b = local_builder();
		b.dns.query_timeout_ms = 0;
		assert!(matches!(b.build(), Err(BuildError::ValueIsZero(_))));

		let mut b = local_builder();
		b.dns.servers.clear();
		assert!(matches!(b.build(), Err(BuildError::EmptyDnsServers)));
	}

	#[test]
	fn test_bind_error() {
		let server = local_builder().build().unwrap();
		let b = Builder {
			port: server.local_addr().port(),
			..Builder::default()
		};
		assert!(matches!(b.build(), Err(BuildError::Bind { .. })));
	}

	#[cfg(feature = "use_serde")]
	#[test]
	fn test_deserialize() {
		let b: Builder = toml::from_str(
			r#"
port = 2080
relay_buffer_size = 4096

[users]
alice = "secret"

[dns]
servers = ["127.0.0.1:5353"]
"#,
		)
		.unwrap();
		assert_eq!(b.port, 2080);
		assert_eq!(b.bind_ip, IpAddr::from(Ipv4Addr::LOCALHOST));
		assert_eq!(b.relay_buffer_size, 4096);
		assert_eq!(b.users.get("alice").map(String::as_str), Some("secret"));
		assert_eq!(b.dns.servers, vec!["127.0.0.1:5353".parse().unwrap()]);
		assert_eq!(b.dns.query_timeout_ms, 5000);

		assert!(toml::from_str::<Builder>("unknown = 1").is_err());
	}
}
