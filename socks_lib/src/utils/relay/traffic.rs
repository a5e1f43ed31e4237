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

use std::{fmt, time::Duration};

const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// What a tunnel moved before it was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Traffic {
	/// Client ---> Remote
	pub sent: u64,
	/// Client <--- Remote
	pub received: u64,
	pub lasted: Duration,
}

impl fmt::Display for Traffic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} received, {} sent, lasted {:.2}s",
			Size(self.received),
			Size(self.sent),
			self.lasted.as_secs_f64()
		)
	}
}

/// Byte count with a binary unit and two decimals, e.g. `1.50KiB`.
struct Size(u64);

impl fmt::Display for Size {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let n = self.0;
		if n < 1024 {
			return write!(f, "{}B", n);
		}
		let mut unit = 0;
		let mut scale: u64 = 1024;
		while unit + 1 < UNITS.len() && n / scale >= 1024 {
			scale *= 1024;
			unit += 1;
		}
		// Rounded to the nearest hundredth.
		let scale = u128::from(scale);
		let hundredths = (u128::from(n) * 100 + scale / 2) / scale;
		write!(
			f,
			"{}.{:02}{}",
			hundredths / 100,
			hundredths % 100,
			UNITS[unit]
		)
	}
}
