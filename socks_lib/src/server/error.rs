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

use super::dns::{LookupError, ResolveError};
use crate::proxy::socks5;
use std::io;
use thiserror::Error as ThisError;

/// Reason a client connection was closed.
#[derive(Debug, ThisError)]
pub enum Error {
	#[error("socks5 error ({0})")]
	Socks(#[from] socks5::Error),
	#[error("cannot resolve destination ({0})")]
	Resolve(#[from] ResolveError),
	#[error("lookup failed ({0})")]
	Lookup(#[from] LookupError),
	#[error("IO error ({0})")]
	Io(#[from] io::Error),
}
