//! Example server: binds a [`engine::Host`] and prints every event it
//! observes until interrupted (§6 "CLI surface", §8 scenario 1).

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use engine::{Event, Host};
use seqnet_demos::{init_logging, Args};

fn main() -> ExitCode {
	let args = Args::parse();
	init_logging(args.verbose);

	let Some(addr) = args.socket_addr() else {
		error!("could not parse host {:?}", args.host);
		return ExitCode::FAILURE;
	};

	let mut host = match Host::create(addr, 32, 2, 0, 0) {
		Ok(host) => host,
		Err(()) => {
			error!("failed to bind host to {addr}");
			return ExitCode::FAILURE;
		}
	};

	info!("listening on {}", host.address());

	let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
	let flag = running.clone();
	let _ = ctrlc::set_handler(move || flag.store(false, std::sync::atomic::Ordering::SeqCst));

	while running.load(std::sync::atomic::Ordering::SeqCst) {
		match host.service(Duration::from_millis(1000)) {
			Ok(Some(Event::Connect { peer, data })) => info!("peer {peer} connected (data={data})"),
			Ok(Some(Event::Disconnect { peer, data })) => info!("peer {peer} disconnected (data={data})"),
			Ok(Some(Event::Receive { peer, channel, packet })) => {
				info!("peer {peer} channel {channel}: {} bytes", packet.len());
			}
			Ok(None) => {}
			Err(()) => {
				warn!("service error, continuing");
			}
		}
	}

	info!("shutting down");
	ExitCode::SUCCESS
}
