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

use crate::{args::ActionCommons, BoxStdErr};
use fern::colors::{Color, ColoredLevelConfig};
use log::{Level, LevelFilter};
use socks_lib::ServerBuilder;
use std::{borrow::Cow, str::FromStr};

#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
	Toml,
	Json,
}

impl FromStr for Format {
	type Err = Cow<'static, str>;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut s = s.to_string();
		s.make_ascii_lowercase();
		Ok(match s.as_str() {
			"toml" => Self::Toml,
			"json" => Self::Json,
			_ => return Err("must be either 'toml' or 'json'".into()),
		})
	}
}

impl Default for Format {
	fn default() -> Self {
		Format::Toml
	}
}

// ------------------- Logging -------------------
const STR_STDOUT: &str = "@stdout";
const STR_STDERR: &str = "@stderr";
const STR_NONE: &str = "@none";

#[derive(Debug, PartialEq, Eq)]
pub enum LogOutput {
	Stdout,
	Stderr,
	File(String),
}

impl LogOutput {
	pub fn is_colorful(&self) -> bool {
		matches!(self, Self::Stdout | Self::Stderr)
	}

	/// Returns `None` for `@none`.
	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			STR_NONE => None,
			STR_STDOUT | "" => Some(LogOutput::Stdout),
			STR_STDERR => Some(LogOutput::Stderr),
			_ => Some(LogOutput::File(s.to_string())),
		}
	}
}

#[cfg(feature = "parse-config")]
fn deserialize_output<'de, D>(deserializer: D) -> Result<Option<LogOutput>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let s = <String as serde::Deserialize<'de>>::deserialize(deserializer)?;
	Ok(LogOutput::from_str(&s))
}

#[cfg_attr(
	feature = "parse-config",
	derive(serde::Deserialize),
	serde(deny_unknown_fields)
)]
pub struct Log {
	#[cfg_attr(feature = "parse-config", serde(default = "default_log_level"))]
	pub level: LevelFilter,
	#[cfg_attr(
		feature = "parse-config",
		serde(default = "default_output"),
		serde(deserialize_with = "deserialize_output")
	)]
	pub output: Option<LogOutput>,
}

impl Log {
	/// Initialize logger.
	///
	/// DO NOT call this function more than once!
	pub fn init_logger(&self) -> Result<(), BoxStdErr> {
		let output = if let Some(output) = &self.output {
			output
		} else {
			// Logging disabled
			return Ok(());
		};
		let time_format =
			time::format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second]Z")?;
		let colors = ColoredLevelConfig::new()
			.info(Color::Blue)
			.trace(Color::Magenta);
		let levels: [String; 5] = {
			let all = [
				Level::Error,
				Level::Warn,
				Level::Info,
				Level::Debug,
				Level::Trace,
			];
			if output.is_colorful() {
				all.map(|l| colors.color(l).to_string())
			} else {
				all.map(|l| l.to_string())
			}
		};
		let dispatch = fern::Dispatch::new()
			.level(self.level)
			.format(move |out, message, record| {
				let time = time::OffsetDateTime::now_utc()
					.format(&time_format)
					.unwrap_or_default();
				let level = levels[record.level() as usize - 1].as_str();
				let target = record.target();
				out.finish(format_args!("[{} {} {}] {}", time, level, target, message));
			});
		match output {
			LogOutput::Stdout => dispatch.chain(std::io::stdout()),
			LogOutput::Stderr => dispatch.chain(std::io::stderr()),
			LogOutput::File(f) => dispatch.chain(fern::log_file(f)?),
		}
		.apply()?;
		Ok(())
	}
}

impl Default for Log {
	fn default() -> Self {
		Log {
			level: default_log_level(),
			output: Some(LogOutput::Stdout),
		}
	}
}

fn default_log_level() -> LevelFilter {
	LevelFilter::Info
}

#[allow(clippy::unnecessary_wraps)]
#[allow(dead_code)]
fn default_output() -> Option<LogOutput> {
	Some(LogOutput::Stdout)
}

// ------------------- Config -------------------
#[derive(Default)]
#[cfg_attr(feature = "parse-config", derive(serde::Deserialize))]
pub struct Config {
	#[cfg_attr(feature = "parse-config", serde(default))]
	pub log: Log,
	#[cfg_attr(feature = "parse-config", serde(flatten))]
	pub server: ServerBuilder,
}

impl Config {
	/// Apply command line overrides.
	pub fn apply(&mut self, coms: ActionCommons) {
		if let Some(port) = coms.port {
			self.server.port = port;
		}
		if let Some(level) = coms.log {
			self.log.level = level;
		}
		if let Some(log_out) = coms.log_out {
			self.log.output = LogOutput::from_str(&log_out);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_log_output_from_str() {
		assert_eq!(LogOutput::from_str("@none"), None);
		assert_eq!(LogOutput::from_str(""), Some(LogOutput::Stdout));
		assert_eq!(LogOutput::from_str("@stdout"), Some(LogOutput::Stdout));
		assert_eq!(LogOutput::from_str("@stderr"), Some(LogOutput::Stderr));
		assert_eq!(
			LogOutput::from_str("proxy.log"),
			Some(LogOutput::File("proxy.log".into()))
		);
	}

	#[test]
	fn test_format_from_str() {
		assert_eq!(Format::from_str("TOML").unwrap(), Format::Toml);
		assert_eq!(Format::from_str("json").unwrap(), Format::Json);
		assert!(Format::from_str("yaml").is_err());
	}

	#[test]
	fn test_apply() {
		let mut conf = Config::default();
		conf.apply(ActionCommons {
			port: Some(9050),
			log: Some(LevelFilter::Debug),
			log_out: Some("@none".into()),
		});
		assert_eq!(conf.server.port, 9050);
		assert_eq!(conf.log.level, LevelFilter::Debug);
		assert!(conf.log.output.is_none());

		let mut conf = Config::default();
		conf.apply(ActionCommons {
			port: None,
			log: None,
			log_out: None,
		});
		assert_eq!(conf.server.port, 1080);
		assert_eq!(conf.log.level, LevelFilter::Info);
		assert_eq!(conf.log.output, Some(LogOutput::Stdout));
	}
}
