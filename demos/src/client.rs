//! Example client: connects to a [`engine::Host`], sends `-c` packets of
//! `-l` bytes at a one-second interval, then disconnects (§6 "CLI
//! surface", §8 scenario 1).

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use engine::{Event, Host, Packet, PacketFlags};
use seqnet_demos::{init_logging, Args};

fn main() -> ExitCode {
	let args = Args::parse();
	init_logging(args.verbose);

	let Some(addr) = args.socket_addr() else {
		error!("could not parse host {:?}", args.host);
		return ExitCode::FAILURE;
	};

	let bind_addr: std::net::SocketAddr = "0.0.0.0:0".parse().unwrap();
	let mut host = match Host::create(bind_addr, 1, 2, 0, 0) {
		Ok(host) => host,
		Err(()) => {
			error!("failed to create local host");
			return ExitCode::FAILURE;
		}
	};

	let peer = match host.connect(addr, 2, 0) {
		Ok(peer) => peer,
		Err(()) => {
			error!("failed to queue connection to {addr}");
			return ExitCode::FAILURE;
		}
	};

	info!("connecting to {addr}");

	let connected = loop {
		match host.service(Duration::from_secs(5)) {
			Ok(Some(Event::Connect { peer: p, .. })) if p == peer => break true,
			Ok(Some(Event::Disconnect { peer: p, .. })) if p == peer => break false,
			Ok(_) => continue,
			Err(()) => break false,
		}
	};

	if !connected {
		error!("failed to connect to {addr}");
		return ExitCode::FAILURE;
	}

	info!("connected, sending {} packets of {} bytes", args.count, args.length);

	for i in 0..args.count {
		let mut payload = format!("packet {i}").into_bytes();
		payload.resize(args.length.max(payload.len()), 0);

		let packet = Packet::new(&payload, PacketFlags::RELIABLE);
		if host.send(peer, 0, packet).is_err() {
			warn!("failed to queue packet {i}");
		}

		host.flush();

		let deadline = std::time::Instant::now() + Duration::from_secs(1);
		while std::time::Instant::now() < deadline {
			match host.service(deadline.saturating_duration_since(std::time::Instant::now())) {
				Ok(Some(Event::Receive { channel, packet, .. })) => {
					info!("received {} bytes on channel {channel}", packet.len());
				}
				Ok(Some(Event::Disconnect { .. })) => break,
				_ => {}
			}
		}
	}

	host.disconnect(peer, 0);

	loop {
		match host.service(Duration::from_secs(3)) {
			Ok(Some(Event::Disconnect { .. })) => {
				info!("disconnected");
				break;
			}
			Ok(None) => {
				warn!("disconnect timed out");
				break;
			}
			_ => continue,
		}
	}

	ExitCode::SUCCESS
}
