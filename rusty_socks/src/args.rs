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

use super::BoxStdErr;
use clap::{CommandFactory, Parser};

#[cfg(feature = "parse-config")]
use super::config::Format;

#[derive(Parser)]
#[command(name = "rusty_socks")]
pub struct AppOptions {
	/// Set the format of the config file. Can be 'toml' (default) or 'json'.
	#[cfg(feature = "parse-config")]
	#[arg(short, long)]
	format: Option<Format>,

	/// Read config from file.
	#[cfg(feature = "parse-config")]
	#[arg(short, long, value_name = "FILE")]
	config: Option<String>,

	/// Listen on PORT, overriding the config file.
	#[arg(short, long, value_name = "PORT")]
	port: Option<u16>,

	/// Print version.
	#[arg(long)]
	version: bool,

	/// Set the log level. Must be one of ["trace", "debug", "info" (default), "warn", "error", "off"]
	#[arg(long, value_name = "LEVEL")]
	log: Option<log::LevelFilter>,

	/// Set the output for log. Can be a file path, '@stdout' (default), '@stderr' or '@none'.
	#[arg(long, value_name = "OUTPUT")]
	log_out: Option<String>,
}

impl AppOptions {
	pub fn new_from_args() -> Self {
		Self::parse()
	}

	pub fn into_action(self) -> Result<Action, BoxStdErr> {
		if self.version {
			return Ok(Action::CheckVersion);
		}

		let coms = ActionCommons {
			port: self.port,
			log: self.log,
			log_out: self.log_out,
		};

		#[cfg(feature = "parse-config")]
		if let Some(path) = self.config {
			let path = std::path::PathBuf::from(path);
			let format = self.format.unwrap_or_else(|| {
				let mut format = Format::default();
				if let Some(ext) = path.extension() {
					if ext.eq_ignore_ascii_case("json") {
						format = Format::Json;
					}
				}
				format
			});
			return Ok(Action::Serve(ServeAction::File { coms, path, format }));
		}
		#[cfg(feature = "parse-config")]
		if self.format.is_some() {
			return Err("option --format requires --config".into());
		}

		if coms.port.is_some() {
			return Ok(Action::Serve(ServeAction::Default { coms }));
		}

		let mut cmd = Self::command();
		cmd.print_help()?;
		std::process::exit(1);
	}
}

pub enum Action {
	CheckVersion,
	Serve(ServeAction),
}

/// Options that override whatever the config says.
pub struct ActionCommons {
	pub port: Option<u16>,
	pub log: Option<log::LevelFilter>,
	pub log_out: Option<String>,
}

pub enum ServeAction {
	#[cfg(feature = "parse-config")]
	File {
		coms: ActionCommons,
		path: std::path::PathBuf,
		format: Format,
	},
	/// Built-in defaults, used when only `--port` is given.
	Default { coms: ActionCommons },
}
