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
use std::collections::HashMap;

/// Both the username and the password are at most this long on the wire.
const MAX_FIELD_LEN: usize = 255;

const DEMO_USERS: &[(&str, &str)] = &[
	("admin", "admin123"),
	("user", "password123"),
	("test", "test"),
];

/// Checks username/password pairs sent during SOCKS5 subnegotiation.
pub trait CredentialValidator {
	/// Returns `true` if `user` may log in with `pass`.
	fn validate(&self, user: &str, pass: &[u8]) -> bool;
}

impl<F> CredentialValidator for F
where
	F: Fn(&str, &[u8]) -> bool,
{
	#[inline]
	fn validate(&self, user: &str, pass: &[u8]) -> bool {
		self(user, pass)
	}
}

/// In-memory username to password map.
#[derive(Debug, Default, Clone)]
pub struct StaticValidator {
	users: HashMap<String, String>,
}

impl StaticValidator {
	pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
		Self {
			users: users.into_iter().collect(),
		}
	}

	/// A small fixed set of accounts for trying the server out.
	#[must_use]
	pub fn with_demo_users() -> Self {
		Self::new(
			DEMO_USERS
				.iter()
				.map(|(user, pass)| ((*user).to_owned(), (*pass).to_owned())),
		)
	}

	#[inline]
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.users.is_empty()
	}

	#[inline]
	#[must_use]
	pub fn len(&self) -> usize {
		self.users.len()
	}
}

impl CredentialValidator for StaticValidator {
	fn validate(&self, user: &str, pass: &[u8]) -> bool {
		if user.is_empty() || pass.is_empty() {
			return false;
		}
		if user.len() > MAX_FIELD_LEN || pass.len() > MAX_FIELD_LEN {
			return false;
		}
		if let Some(correct_pass) = self.users.get(user) {
			if pass == correct_pass.as_bytes() {
				return true;
			}
		}
		trace!("No matching credentials for user '{}'", user);
		false
	}
}
