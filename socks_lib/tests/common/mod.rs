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

#![allow(dead_code)]

use log::{error, trace};
use socks_lib::{Server, ServerBuilder, StopHandle};
use std::{
	io,
	net::{Ipv4Addr, SocketAddr, UdpSocket},
	thread::{self, JoinHandle},
	time::Duration,
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	time::timeout,
};
use trust_dns_proto::{
	op::{Message, MessageType},
	rr::{RData, Record},
};

pub const TIMEOUT_DUR: Duration = Duration::from_secs(5);
pub const USER: &str = "alice";
pub const PASS: &str = "wonderland";

pub fn setup_logger() {
	let _ = env_logger::builder().is_test(true).try_init();
}

/// A proxy server running on its own thread, stopped when dropped.
pub struct ProxyGuard {
	pub addr: SocketAddr,
	stop: StopHandle,
	thread: Option<JoinHandle<io::Result<()>>>,
}

impl ProxyGuard {
	pub fn start(server: Server) -> Self {
		let addr = server.local_addr();
		let stop = server.stop_handle();
		let thread = thread::spawn(move || server.serve());
		Self {
			addr,
			stop,
			thread: Some(thread),
		}
	}

	/// Stop the server and wait for the event loop to return.
	pub fn stop(mut self) -> io::Result<()> {
		self.stop.stop();
		self.thread.take().unwrap().join().unwrap()
	}
}

impl Drop for ProxyGuard {
	fn drop(&mut self) {
		if let Some(thread) = self.thread.take() {
			self.stop.stop();
			if let Err(e) = thread.join().unwrap() {
				error!("Proxy server exited with error ({})", e);
			}
		}
	}
}

/// Server on a random loopback port with one user and the given DNS server.
pub fn builder(dns_server: SocketAddr) -> ServerBuilder {
	let mut builder = ServerBuilder {
		port: 0,
		..ServerBuilder::default()
	};
	builder.users.insert(USER.to_owned(), PASS.to_owned());
	builder.dns.servers = vec![dns_server];
	builder
}

/// Echo every connection until it closes.
pub async fn spawn_echo_server() -> SocketAddr {
	spawn_echo_server_on("127.0.0.1:0").await.unwrap()
}

/// Same as [`spawn_echo_server`], listening on `bind_addr`.
pub async fn spawn_echo_server_on(bind_addr: &str) -> io::Result<SocketAddr> {
	let listener = TcpListener::bind(bind_addr).await?;
	let addr = listener.local_addr()?;
	tokio::spawn(async move {
		loop {
			let (mut stream, _) = match listener.accept().await {
				Ok(res) => res,
				Err(_) => return,
			};
			tokio::spawn(async move {
				let mut buffer = [0_u8; 4 * 1024];
				loop {
					let len = match stream.read(&mut buffer).await {
						Ok(0) | Err(_) => break,
						Ok(len) => len,
					};
					trace!("Echo server received {} bytes of data, responding...", len);
					if stream.write_all(&buffer[..len]).await.is_err() {
						break;
					}
				}
			});
		}
	});
	Ok(addr)
}

/// A DNS server answering A queries from `table`, forever.
///
/// Unknown names get a response without answers.
pub fn spawn_dns_server(table: Vec<(&'static str, Ipv4Addr)>) -> SocketAddr {
	let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
	let addr = socket.local_addr().unwrap();
	thread::spawn(move || {
		let mut buf = [0_u8; 512];
		while let Ok((len, from)) = socket.recv_from(&mut buf) {
			let query = match Message::from_vec(&buf[..len]) {
				Ok(q) => q,
				Err(_) => continue,
			};
			let mut response = Message::new();
			response
				.set_id(query.id())
				.set_message_type(MessageType::Response)
				.set_op_code(query.op_code())
				.set_recursion_desired(true)
				.set_recursion_available(true);
			for q in query.queries() {
				response.add_query(q.clone());
				let name = q.name().to_ascii();
				for (n, ip) in &table {
					if n.eq_ignore_ascii_case(name.trim_end_matches('.')) {
						response.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(*ip)));
					}
				}
			}
			let _ = socket.send_to(&response.to_vec().unwrap(), from);
		}
	});
	addr
}

/// An address where no UDP socket is bound, so queries sent there fail
/// with "connection refused".
pub fn closed_udp_port() -> SocketAddr {
	let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
	socket.local_addr().unwrap()
}

/// A UDP socket that never answers. Kept alive by the returned value.
pub fn silent_dns_server() -> (SocketAddr, UdpSocket) {
	let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
	(socket.local_addr().unwrap(), socket)
}

pub async fn read_exact_timeout(stream: &mut TcpStream, buf: &mut [u8]) {
	timeout(TIMEOUT_DUR, stream.read_exact(buf))
		.await
		.expect("read timed out")
		.unwrap();
}

/// Returns `true` if the peer closed the connection (EOF or reset).
pub async fn is_closed(stream: &mut TcpStream) -> bool {
	let mut buf = [0_u8; 64];
	match timeout(TIMEOUT_DUR, stream.read(&mut buf))
		.await
		.expect("read timed out")
	{
		Ok(0) | Err(_) => true,
		Ok(_) => false,
	}
}

pub fn auth_bytes(user: &str, pass: &str) -> Vec<u8> {
	let mut buf = vec![1, user.len() as u8];
	buf.extend_from_slice(user.as_bytes());
	buf.push(pass.len() as u8);
	buf.extend_from_slice(pass.as_bytes());
	buf
}

pub fn request_ip(addr: SocketAddr) -> Vec<u8> {
	let mut buf = vec![5, 1, 0];
	match addr {
		SocketAddr::V4(a) => {
			buf.push(1);
			buf.extend_from_slice(&a.ip().octets());
		}
		SocketAddr::V6(a) => {
			buf.push(4);
			buf.extend_from_slice(&a.ip().octets());
		}
	}
	buf.extend_from_slice(&addr.port().to_be_bytes());
	buf
}

pub fn request_name(name: &str, port: u16) -> Vec<u8> {
	let mut buf = vec![5, 1, 0, 3, name.len() as u8];
	buf.extend_from_slice(name.as_bytes());
	buf.extend_from_slice(&port.to_be_bytes());
	buf
}

/// Greet and log in as the test user.
pub async fn login(proxy: SocketAddr) -> TcpStream {
	let mut stream = TcpStream::connect(proxy).await.unwrap();
	stream.write_all(&[5, 1, 2]).await.unwrap();
	let mut reply = [0_u8; 2];
	read_exact_timeout(&mut stream, &mut reply).await;
	assert_eq!(reply, [5, 2]);
	stream.write_all(&auth_bytes(USER, PASS)).await.unwrap();
	read_exact_timeout(&mut stream, &mut reply).await;
	assert_eq!(reply, [1, 0]);
	stream
}

/// Log in, send `request` and return the reply to it.
pub async fn connect(proxy: SocketAddr, request: &[u8]) -> (TcpStream, [u8; 10]) {
	let mut stream = login(proxy).await;
	stream.write_all(request).await.unwrap();
	let mut reply = [0_u8; 10];
	read_exact_timeout(&mut stream, &mut reply).await;
	(stream, reply)
}

pub const SUCCEEDED: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];
pub const FAILED: [u8; 10] = [5, 1, 0, 1, 0, 0, 0, 0, 0, 0];

/// Write `data` and expect it echoed back, reading while writing.
pub async fn check_echo(stream: TcpStream, data: Vec<u8>) -> TcpStream {
	let (mut r, mut w) = stream.into_split();
	let len = data.len();
	let write_task = tokio::spawn(async move {
		w.write_all(&data).await.unwrap();
		(w, data)
	});
	let mut result = vec![0_u8; len];
	timeout(TIMEOUT_DUR, r.read_exact(&mut result))
		.await
		.expect("echo timed out")
		.unwrap();
	let (w, data) = write_task.await.unwrap();
	assert!(result == data, "echoed data differs");
	r.reunite(w).unwrap()
}
