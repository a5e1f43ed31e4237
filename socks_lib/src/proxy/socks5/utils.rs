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

use crate::{prelude::*, protocol::socks_addr::ReadError};
use num_enum::TryFromPrimitive;
use std::fmt::Display;

pub const VER5: u8 = 5;
/// Subnegotiation version.
///
/// See more at <https://datatracker.ietf.org/doc/html/rfc1929#section-2>
pub const SUB_VERS: u8 = 1_u8;
pub(super) const AUTH_SUCCESSFUL: u8 = 0;
pub(super) const AUTH_FAILED: u8 = 1;
pub(super) const VAL_USER_PASS: u8 = 2_u8;
pub(super) const VAL_NO_ACCEPTABLE: u8 = 0xff;

#[derive(Debug, TryFromPrimitive, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum CommandCode {
	Connect = 1,
	Bind = 2,
	Udp = 3,
}

impl Display for CommandCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			CommandCode::Connect => write!(f, "CONNECT"),
			CommandCode::Bind => write!(f, "BIND"),
			CommandCode::Udp => write!(f, "UDP_ASSOCIATE"),
		}?;
		write!(f, "({})", *self as u8)
	}
}

#[derive(Debug, TryFromPrimitive, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
/// SOCKS5 reply code.
///
/// Only `Succeeded` and `SocksFailure` are ever sent by this server.
///
/// See more at <https://datatracker.ietf.org/doc/html/rfc1928#section-6>.
pub enum ReplyCode {
	Succeeded = 0,
	SocksFailure = 1,
}

impl ReplyCode {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			ReplyCode::Succeeded => "succeeded",
			ReplyCode::SocksFailure => "socks failure",
		}
	}

	#[inline]
	#[must_use]
	pub const fn val(self) -> u8 {
		self as u8
	}
}

impl Display for ReplyCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Replies sent to the client while negotiating.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Reply {
	/// Method selection.
	///```not_rust
	/// +----+--------+
	/// |VER | METHOD |
	/// +----+--------+
	/// | 1  |   1    |
	/// +----+--------+
	///```
	Method(u8),
	/// Username/password subnegotiation status.
	///```not_rust
	/// +----+--------+
	/// |VER | STATUS |
	/// +----+--------+
	/// | 1  |   1    |
	/// +----+--------+
	///```
	Auth(u8),
	/// Reply to a CONNECT request. The bound address is always `0.0.0.0:0`.
	///```not_rust
	/// +----+-----+-------+------+----------+----------+
	/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
	/// +----+-----+-------+------+----------+----------+
	/// | 1  |  1  | X'00' |  1   |    4     |    2     |
	/// +----+-----+-------+------+----------+----------+
	///```
	Connect(ReplyCode),
}

impl Reply {
	pub fn write_into(self, buf: &mut Vec<u8>) {
		buf.clear();
		match self {
			Reply::Method(method) => buf.put_slice(&[VER5, method]),
			Reply::Auth(status) => buf.put_slice(&[SUB_VERS, status]),
			Reply::Connect(code) => {
				buf.put_u8(VER5);
				buf.put_u8(code.val());
				buf.put_u8(0);
				SocksAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0).write_to(buf);
			}
		}
	}

	#[must_use]
	pub fn to_vec(self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(10);
		self.write_into(&mut buf);
		buf
	}
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("wrong socks version '{0}'")]
	WrongVersion(u8),
	#[error("wrong subnegotiation version '{0}'")]
	WrongSubVersion(u8),
	#[error("no acceptable authentication method in {0:?}")]
	UnsupportedMethod(Vec<u8>),
	#[error("unknown command code '{0}'")]
	UnknownCommand(u8),
	#[error("unsupported command {0}")]
	UnsupportedCommand(CommandCode),
	#[error("failed authentication")]
	FailedAuthentication,
	#[error("cannot read address ({0})")]
	CannotReadAddr(ReadError),
	#[error("destination port is zero")]
	ZeroPort,
}

#[inline]
pub fn check_version(ver: u8) -> Result<(), Error> {
	if ver != VER5 {
		return Err(Error::WrongVersion(ver));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_reply_bytes() {
		assert_eq!(Reply::Method(VAL_USER_PASS).to_vec(), [5, 2]);
		assert_eq!(Reply::Method(VAL_NO_ACCEPTABLE).to_vec(), [5, 0xff]);
		assert_eq!(Reply::Auth(AUTH_SUCCESSFUL).to_vec(), [1, 0]);
		assert_eq!(Reply::Auth(AUTH_FAILED).to_vec(), [1, 1]);
		assert_eq!(
			Reply::Connect(ReplyCode::Succeeded).to_vec(),
			[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]
		);
		assert_eq!(
			Reply::Connect(ReplyCode::SocksFailure).to_vec(),
			[5, 1, 0, 1, 0, 0, 0, 0, 0, 0]
		);
	}

	#[test]
	fn test_write_into_clears() {
		let mut buf = vec![9_u8; 32];
		Reply::Auth(AUTH_SUCCESSFUL).write_into(&mut buf);
		assert_eq!(buf, [1, 0]);
	}

	#[test]
	fn test_command_code() {
		assert_eq!(CommandCode::try_from(1).unwrap(), CommandCode::Connect);
		assert!(CommandCode::try_from(9).is_err());
		assert_eq!(CommandCode::Udp.to_string(), "UDP_ASSOCIATE(3)");
	}
}
