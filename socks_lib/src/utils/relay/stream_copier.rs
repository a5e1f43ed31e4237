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
use std::io::{Read, Write};

/// What stopped a [`StreamCopier::copy`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
	/// The reader has nothing more for now and the buffer is empty.
	Idle,
	/// The writer cannot take more bytes. Reading is suspended until it can.
	Blocked,
	/// The reader reached EOF.
	Eof,
}

/// Copy bytes from a non-blocking reader into a non-blocking writer
/// through a fixed size buffer.
///
/// Bytes that the writer refuses stay in the buffer, and nothing more is
/// read until the buffer has been flushed, so memory per direction is
/// bounded by the buffer capacity.
pub struct StreamCopier {
	buf: Box<[u8]>,
	start: usize,
	end: usize,
	count: u64,
	tag: Arc<str>,
}

impl StreamCopier {
	pub fn new(capacity: usize, tag: Arc<str>) -> Self {
		Self {
			buf: vec![0_u8; capacity].into_boxed_slice(),
			start: 0,
			end: 0,
			count: 0,
			tag,
		}
	}

	/// Create a copier whose buffer already holds `pending`.
	///
	/// The buffer is enlarged if `pending` does not fit.
	pub fn with_pending(capacity: usize, pending: &[u8], tag: Arc<str>) -> Self {
		let mut copier = Self::new(std::cmp::max(capacity, pending.len()), tag);
		copier.buf[..pending.len()].copy_from_slice(pending);
		copier.end = pending.len();
		copier
	}

	/// Returns `true` if there are no bytes waiting to be written.
	#[inline]
	pub fn is_drained(&self) -> bool {
		self.start == self.end
	}

	#[inline]
	pub fn pending(&self) -> &[u8] {
		&self.buf[self.start..self.end]
	}

	/// Number of bytes written into the writer so far.
	#[inline]
	pub fn count(&self) -> u64 {
		self.count
	}

	/// Flush pending bytes, then keep reading and writing until either
	/// side would block or the reader reaches EOF.
	///
	/// # Errors
	///
	/// Returns any I/O error other than `WouldBlock` and `Interrupted`.
	/// A writer that accepts zero bytes is reported as `WriteZero`.
	pub fn copy<R, W>(&mut self, r: &mut R, w: &mut W) -> io::Result<Flow>
	where
		R: Read + ?Sized,
		W: Write + ?Sized,
	{
		loop {
			if !self.is_drained() {
				match w.write(&self.buf[self.start..self.end]) {
					Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
					Ok(n) => {
						trace!("{} wrote {} bytes", self.tag, n);
						self.start += n;
						self.count += n as u64;
					}
					Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Blocked),
					Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
					Err(e) => return Err(e),
				}
				continue;
			}
			self.start = 0;
			self.end = 0;
			match r.read(&mut self.buf) {
				Ok(0) => {
					debug!("{} reader reached EOF", self.tag);
					return Ok(Flow::Eof);
				}
				Ok(n) => {
					trace!("{} read {} bytes", self.tag, n);
					self.end = n;
				}
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Idle),
				Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => return Err(e),
			}
		}
	}
}
