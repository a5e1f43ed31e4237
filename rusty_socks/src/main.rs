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

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::default_trait_access)]

use args::{Action, AppOptions, ServeAction};
use config::Config;
use log::{error, info};
use socks_lib::StopHandle;
use std::{borrow::Cow, io, thread};

mod args;
mod config;
#[cfg(feature = "parse-config")]
mod parse_config_impl;

type BoxStdErr = Box<dyn std::error::Error + Send + Sync>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
enum Error {
	#[error("[IO error] {0}")]
	Io(#[from] io::Error),
	#[error("[input] {0}")]
	Input(Cow<'static, str>),
	#[error("[config] {0}")]
	Config(BoxStdErr),
	#[error("[runtime] {0}")]
	Runtime(BoxStdErr),
}

fn main() {
	let action = match AppOptions::new_from_args().into_action() {
		Ok(action) => action,
		Err(err) => {
			eprintln!("Invalid arguments: {}", err);
			std::process::exit(exitcode::USAGE);
		}
	};
	match action {
		Action::CheckVersion => println!("{}", VERSION),
		Action::Serve(action) => {
			if let Err(err) = serve(action) {
				eprintln!("Error happened during initialization:\n {}\n", err);
				std::process::exit(match err {
					Error::Io(_) => exitcode::IOERR,
					Error::Input(_) | Error::Config(_) => exitcode::CONFIG,
					Error::Runtime(_) => exitcode::SOFTWARE,
				});
			}
		}
	}
}

fn make_config(action: ServeAction) -> Result<Config, Error> {
	let (mut conf, coms) = match action {
		#[cfg(feature = "parse-config")]
		ServeAction::File { coms, path, format } => {
			let conf_str = std::fs::read_to_string(&path).map_err(|e| {
				Error::Input(format!("cannot read config '{}': {}", path.display(), e).into())
			})?;
			(parse_config_impl::make_config(format, &conf_str)?, coms)
		}
		ServeAction::Default { coms } => (Config::default(), coms),
	};
	conf.apply(coms);
	Ok(conf)
}

fn serve(action: ServeAction) -> Result<(), Error> {
	let conf = make_config(action)?;
	conf.log.init_logger().map_err(Error::Config)?;

	let server = conf
		.server
		.build()
		.map_err(|e| Error::Config(Box::new(e)))?;
	info!(
		"rusty_socks {} listening on {}",
		VERSION,
		server.local_addr()
	);
	watch_ctrl_c(server.stop_handle())?;
	server.serve().map_err(|e| Error::Runtime(Box::new(e)))?;
	info!("Server stopped");
	Ok(())
}

/// Stop the server on Ctrl-C.
///
/// The signal is awaited on a helper thread with its own runtime,
/// the server keeps the main thread.
fn watch_ctrl_c(stop: StopHandle) -> Result<(), Error> {
	let rt = tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()?;
	thread::Builder::new()
		.name("signal".into())
		.spawn(move || {
			match rt.block_on(tokio::signal::ctrl_c()) {
				Ok(()) => {
					info!("Ctrl-C received, stopping server");
					stop.stop();
				}
				Err(e) => error!("Cannot listen for Ctrl-C ({})", e),
			}
		})?;
	Ok(())
}
