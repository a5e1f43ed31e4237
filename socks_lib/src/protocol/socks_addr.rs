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

use crate::{prelude::*, utils::ReadInt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smol_str::SmolStr;
use std::{
	fmt::{self, Display},
	io,
};

const EMPTY_STRING: &str = "empty string";

// See more at <https://tools.ietf.org/html/rfc1928>
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AddrType {
	Ipv4 = 1_u8,
	Name = 3_u8,
	Ipv6 = 4_u8,
}

impl AddrType {
	#[inline]
	#[must_use]
	pub const fn val(self) -> u8 {
		self as u8
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("str is not utf8 ({0})")]
	StrNotUtf8(std::str::Utf8Error),
	#[error("unknown address type {0}")]
	UnknownAddressType(u8),
	#[error("invalid domain ({0})")]
	InvalidDomain(BoxStdErr),
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}

impl ReadError {
	/// Returns `true` if the input ended before a whole address was read,
	/// which means more bytes are needed rather than the input being invalid.
	#[inline]
	#[must_use]
	pub fn is_incomplete(&self) -> bool {
		matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
	}
}

// -------------------------------------------------------
//                     SocksDestination
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SocksDestination {
	/// Must be a valid domain name.
	Name(DomainName),
	Ip(IpAddr),
}

impl SocksDestination {
	#[inline]
	#[must_use]
	pub fn atyp(&self) -> AddrType {
		match self {
			SocksDestination::Name(_) => AddrType::Name,
			SocksDestination::Ip(IpAddr::V4(_)) => AddrType::Ipv4,
			SocksDestination::Ip(IpAddr::V6(_)) => AddrType::Ipv6,
		}
	}

	/// Creates a [`SocksDestination`] from address type `atyp` and byte stream `r`.
	///
	/// The format for each address type are as following:
	/// - [`AddrType::Ipv4`]: | 4 bytes |
	/// - [`AddrType::Ipv6`]: | 16 bytes |
	/// - [`AddrType::Name`]: | n, 1 byte | n bytes |
	///
	/// A name that is actually an IP literal is returned as [`SocksDestination::Ip`].
	///
	/// # Errors
	///
	/// [`ReadError`] will be returned if error occurred.
	pub fn read_from_atyp<R>(r: &mut R, atyp: AddrType) -> Result<Self, ReadError>
	where
		R: std::io::Read,
	{
		Ok(match atyp {
			AddrType::Ipv4 => Ipv4Addr::from(r.read_arr::<4>()?).into(),
			AddrType::Ipv6 => Ipv6Addr::from(r.read_arr::<16>()?).into(),
			AddrType::Name => {
				let len = usize::from(r.read_u8()?);
				// Domain length is a u8, which will never be larger than 256.
				let mut buffer = [0_u8; 256];
				let buffer = &mut buffer[..len];
				r.read_exact(buffer)?;
				if len == 0 {
					return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
				}
				let name = std::str::from_utf8(buffer).map_err(ReadError::StrNotUtf8)?;
				SocksDestination::from_str(name)?
			}
		})
	}

	pub fn write_to_no_atyp(&self, buf: &mut impl BufMut) {
		match self {
			SocksDestination::Name(name) => {
				buf.put_u8(name.len());
				buf.put(name.as_bytes());
			}
			SocksDestination::Ip(IpAddr::V4(ipv4)) => buf.put(&ipv4.octets()[..]),
			SocksDestination::Ip(IpAddr::V6(ipv6)) => buf.put(&ipv6.octets()[..]),
		}
	}
}

impl FromStr for SocksDestination {
	type Err = ReadError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() {
			return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
		}
		if let Ok(ip) = IpAddr::from_str(s) {
			return Ok(Self::Ip(ip));
		}
		DomainName::from_str(s).map(Self::Name)
	}
}

impl From<DomainName> for SocksDestination {
	#[inline]
	fn from(domain: DomainName) -> Self {
		Self::Name(domain)
	}
}

impl From<IpAddr> for SocksDestination {
	#[inline]
	fn from(ip: IpAddr) -> Self {
		Self::Ip(ip)
	}
}

impl From<Ipv4Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv4Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl From<Ipv6Addr> for SocksDestination {
	#[inline]
	fn from(ip: Ipv6Addr) -> Self {
		Self::Ip(ip.into())
	}
}

impl Display for SocksDestination {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ip(ip) => ip.fmt(f),
			Self::Name(name) => name.fmt(f),
		}
	}
}

// -------------------------------------------------------
//                       SocksAddr
// -------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocksAddr {
	pub dest: SocksDestination,
	pub port: u16,
}

impl SocksAddr {
	#[inline]
	#[must_use]
	pub fn new(dest: SocksDestination, port: u16) -> Self {
		Self { dest, port }
	}

	/// Creates a [`SocksAddr`] from byte stream `r`.
	///
	/// This function will try to read in the following format:
	/// ```not_rust
	/// +------+----------------+----------------+
	/// | ATYP |  Destination   |     Port       |
	/// +------+----------------+----------------+
	/// | u8   | various bytes  |   2 bytes      |
	/// |      |                | big endian u16 |
	/// +------+----------------+----------------+
	/// ```
	///
	/// # Errors
	///
	/// If there is any error, an [`ReadError`] will be returned.
	pub fn read_from<R>(r: &mut R) -> Result<Self, ReadError>
	where
		R: std::io::Read,
	{
		let atyp_num = r.read_u8()?;
		let atyp =
			AddrType::try_from(atyp_num).map_err(|_| ReadError::UnknownAddressType(atyp_num))?;
		let dest = SocksDestination::read_from_atyp(r, atyp)?;
		let port = r.read_u16()?;
		Ok(Self::new(dest, port))
	}

	/// Reads an address from the front of `buf` and returns it
	/// together with the number of bytes it took.
	///
	/// # Errors
	///
	/// This function returns the same error as [`Self::read_from`].
	/// If `buf` holds only part of an address, the error
	/// satisfies [`ReadError::is_incomplete`].
	#[inline]
	pub fn read_from_bytes(buf: &[u8]) -> Result<(Self, usize), ReadError> {
		let mut cur = io::Cursor::new(buf);
		let addr = Self::read_from(&mut cur)?;
		// Cursor position never exceeds buf.len().
		#[allow(clippy::cast_possible_truncation)]
		let n = cur.position() as usize;
		Ok((addr, n))
	}

	/// Write the address into `buf` in [SOCKS5 address format].
	///
	/// [SOCKS5 address format]: https://tools.ietf.org/html/rfc1928#section-5
	#[inline]
	pub fn write_to<B: BufMut>(&self, buf: &mut B) {
		buf.put_u8(self.dest.atyp().val());
		self.dest.write_to_no_atyp(buf);
		buf.put_u16(self.port);
	}
}

impl Display for SocksAddr {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.dest {
			SocksDestination::Name(name) => write!(f, "{}:{}", name, self.port),
			SocksDestination::Ip(ip) => SocketAddr::new(*ip, self.port).fmt(f),
		}
	}
}

// -------------------------------------------------------
//                     DomainName
// -------------------------------------------------------

/// A lowercase ASCII domain string that's guaranteed to be at most 253 bytes.
///
/// Names go through UTS #46 mapping without the STD3 character rules, so
/// labels such as `_svc` or `my_host` are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DomainName(SmolStr);

impl DomainName {
	#[inline]
	#[must_use]
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}

	#[allow(clippy::cast_possible_truncation)]
	#[inline]
	#[must_use]
	pub fn len(&self) -> u8 {
		// Length is guaranteed to be u8
		self.0.len() as u8
	}

	#[inline]
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	#[inline]
	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		self.0.as_bytes()
	}
}

impl std::str::FromStr for DomainName {
	type Err = ReadError;

	fn from_str(v: &str) -> Result<Self, ReadError> {
		if v.is_empty() {
			return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
		}
		// Remove the final dot '.' if possible.
		let v = v.strip_suffix('.').unwrap_or(v);
		// STD3 rules would reject '_', which is common in real hostnames.
		let name = idna::Config::default()
			.use_std3_ascii_rules(false)
			.verify_dns_length(true)
			.to_ascii(v)
			.map_err(|e| ReadError::InvalidDomain(format!("{:?}", e).into()))?;
		if name.is_empty() {
			return Err(ReadError::InvalidDomain(EMPTY_STRING.into()));
		}
		if name.len() > 255 {
			return Err(ReadError::InvalidDomain("too long".into()));
		}
		Ok(Self(SmolStr::new(&name)))
	}
}

impl Display for DomainName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}

// -------------------------------------------------------
//                          Tests
// -------------------------------------------------------
