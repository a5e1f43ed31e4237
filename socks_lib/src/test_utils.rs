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

use crate::prelude::*;
use std::{
	net::{TcpListener, TcpStream, UdpSocket},
	thread::{self, JoinHandle},
};
use trust_dns_proto::{
	op::{Message, MessageType},
	rr::{RData, Record},
};

const TIMEOUT_DUR: Duration = Duration::from_secs(3);

pub fn init_log() {
	let _ = env_logger::builder().is_test(true).try_init();
}

/// Returns a connected pair of a non-blocking mio stream and a blocking
/// std stream.
pub fn mio_tcp_pair() -> (mio::net::TcpStream, TcpStream) {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
	let (stream, _) = listener.accept().unwrap();
	stream.set_nonblocking(true).unwrap();
	peer.set_read_timeout(Some(TIMEOUT_DUR)).unwrap();
	(mio::net::TcpStream::from_std(stream), peer)
}

/// A DNS server answering A queries from a fixed table.
///
/// Names missing from the table get an empty answer section.
/// The thread exits after `max_queries` queries.
pub fn spawn_dns_server(
	table: Vec<(&'static str, Ipv4Addr)>,
	max_queries: usize,
) -> (SocketAddr, JoinHandle<()>) {
	let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
	socket.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
	let local_addr = socket.local_addr().unwrap();
	let handle = thread::spawn(move || {
		let mut buf = [0_u8; 512];
		for _ in 0..max_queries {
			let (len, from) = match socket.recv_from(&mut buf) {
				Ok(r) => r,
				Err(_) => return,
			};
			let query = Message::from_vec(&buf[..len]).unwrap();
			let response = make_response(&query, &table);
			socket.send_to(&response.to_vec().unwrap(), from).unwrap();
		}
	});
	(local_addr, handle)
}

pub fn make_response(query: &Message, table: &[(&str, Ipv4Addr)]) -> Message {
	let mut response = Message::new();
	response
		.set_id(query.id())
		.set_message_type(MessageType::Response)
		.set_op_code(query.op_code())
		.set_recursion_desired(query.recursion_desired())
		.set_recursion_available(true);
	for q in query.queries() {
		response.add_query(q.clone());
		let name = q.name().to_ascii();
		let name = name.trim_end_matches('.');
		for (n, ip) in table {
			if n.eq_ignore_ascii_case(name) {
				response.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(*ip)));
			}
		}
	}
	response
}
