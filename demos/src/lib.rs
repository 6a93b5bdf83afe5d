//! Shared CLI scaffolding for the `server`/`client` demo binaries (§6 "CLI
//! surface"). Grounded on spec.md's `-h`/`-p`/`-v`/`-c`/`-l` surface; no
//! teacher precedent exists for this crate since the teacher ships no
//! binary target, so the flag parsing (`clap`) and logger wiring follow
//! the rest of the workspace's `log`-facade convention instead.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use log::LevelFilter;

use io::logger::Logger;

static LOGGER: Logger = Logger;

/// Shared connection/traffic flags for both the client and server demos.
#[derive(Parser, Debug)]
pub struct Args {
	/// Host to bind (server) or connect to (client).
	#[arg(short = 'h', long, default_value = "127.0.0.1")]
	pub host: String,

	/// UDP port to bind (server) or connect to (client).
	#[arg(short = 'p', long, default_value_t = 9000)]
	pub port: u16,

	/// Enable verbose (debug-level) logging.
	#[arg(short = 'v', long)]
	pub verbose: bool,

	/// Number of packets to send (client only).
	#[arg(short = 'c', long, default_value_t = 10)]
	pub count: u32,

	/// Payload length in bytes of each sent packet (client only).
	#[arg(short = 'l', long, default_value_t = 64)]
	pub length: usize,
}

impl Args {
	pub fn socket_addr(&self) -> Option<SocketAddr> {
		self.host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, self.port)).or_else(|| {
			// Bare "0.0.0.0"/"localhost" style fallbacks a real resolver would
			// handle; the demo only needs to bind its own address.
			if self.host == "localhost" {
				Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port))
			} else {
				None
			}
		})
	}
}

/// Installs [`io::logger::Logger`] at a level derived from `-v`.
pub fn init_logging(verbose: bool) {
	let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
	log::set_max_level(level);
	let _ = log::set_logger(&LOGGER);
}
