//! End-to-end scenarios over real loopback UDP sockets (§8).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use engine::{Event, Host, Packet, PacketFlags};

fn loopback() -> SocketAddr {
	SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
}

/// Drives both hosts until `pred` returns `Some` for an event from `which`
/// (0 = first host, 1 = second), or the round budget is exhausted.
fn run_until(client: &mut Host, server: &mut Host, mut pred: impl FnMut(usize, &Event) -> bool) -> bool {
	for _ in 0..2000 {
		for (i, host) in [&mut *client, &mut *server].into_iter().enumerate() {
			if let Some(event) = host.service(Duration::from_millis(5)).unwrap() {
				if pred(i, &event) {
					return true;
				}
			}
		}
	}
	false
}

#[test]
fn scenario_connect_send_and_disconnect() {
	let mut server = Host::create(loopback(), 8, 2, 0, 0).unwrap();
	let server_addr = server.address();

	let mut client = Host::create(loopback(), 1, 2, 0, 0).unwrap();
	let client_peer = client.connect(server_addr, 2, 0).unwrap();

	let mut server_peer = None;
	let connected = run_until(&mut client, &mut server, |i, event| {
		if let Event::Connect { peer, .. } = event {
			if i == 1 {
				server_peer = Some(*peer);
			}
			return i == 0 && *peer == client_peer;
		}
		false
	});
	assert!(connected, "client never observed CONNECT");

	// Drive a little further so the server side also completes its half.
	run_until(&mut client, &mut server, |i, event| {
		if i == 1 {
			if let Event::Connect { peer, .. } = event {
				server_peer = Some(*peer);
				return true;
			}
		}
		false
	});
	let server_peer = server_peer.expect("server never observed CONNECT");

	for i in 0..10u32 {
		let payload = format!("packet {i}").into_bytes();
		client.send(client_peer, 0, Packet::new(&payload, PacketFlags::RELIABLE)).unwrap();
	}
	client.flush();

	let mut received: Vec<String> = Vec::new();
	run_until(&mut client, &mut server, |i, event| {
		if i == 1 {
			if let Event::Receive { packet, .. } = event {
				received.push(String::from_utf8(packet.as_slice().to_vec()).unwrap());
			}
		}
		received.len() == 10
	});

	assert_eq!(received, (0..10).map(|i| format!("packet {i}")).collect::<Vec<_>>());

	client.disconnect(client_peer, 0);
	let disconnected = run_until(&mut client, &mut server, |i, event| matches!(event, Event::Disconnect { .. }) && i == 1);
	assert!(disconnected, "server never observed DISCONNECT");
	let _ = server_peer;
}

#[test]
fn scenario_fragmentation_reassembles_large_packet() {
	let mut server = Host::create(loopback(), 8, 1, 0, 0).unwrap();
	let server_addr = server.address();

	let mut client = Host::create(loopback(), 1, 1, 0, 0).unwrap();
	let client_peer = client.connect(server_addr, 1, 0).unwrap();

	run_until(&mut client, &mut server, |i, event| i == 0 && matches!(event, Event::Connect { .. }));
	run_until(&mut client, &mut server, |i, event| i == 1 && matches!(event, Event::Connect { .. }));

	let payload: Vec<u8> = (0..6666u32).map(|i| (i % 251) as u8).collect();
	client.send(client_peer, 0, Packet::new(&payload, PacketFlags::RELIABLE)).unwrap();
	client.flush();

	let mut assembled = None;
	run_until(&mut client, &mut server, |i, event| {
		if i == 1 {
			if let Event::Receive { packet, .. } = event {
				assembled = Some(packet.as_slice().to_vec());
				return true;
			}
		}
		false
	});

	assert_eq!(assembled.expect("fragment never reassembled"), payload);
}

#[test]
fn scenario_disconnect_later_drains_queue_first() {
	let mut server = Host::create(loopback(), 8, 1, 0, 0).unwrap();
	let server_addr = server.address();

	let mut client = Host::create(loopback(), 1, 1, 0, 0).unwrap();
	let client_peer = client.connect(server_addr, 1, 0).unwrap();

	run_until(&mut client, &mut server, |i, event| i == 0 && matches!(event, Event::Connect { .. }));
	run_until(&mut client, &mut server, |i, event| i == 1 && matches!(event, Event::Connect { .. }));

	for i in 0..5u32 {
		let payload = format!("queued {i}").into_bytes();
		client.send(client_peer, 0, Packet::new(&payload, PacketFlags::RELIABLE)).unwrap();
	}
	client.disconnect_later(client_peer, 0);
	client.flush();

	let mut received = 0;
	let mut disconnect_seen_before_all_received = false;

	run_until(&mut client, &mut server, |i, event| {
		if i != 1 {
			return false;
		}
		match event {
			Event::Receive { .. } => received += 1,
			Event::Disconnect { .. } => {
				if received < 5 {
					disconnect_seen_before_all_received = true;
				}
				return true;
			}
			_ => {}
		}
		false
	});

	assert_eq!(received, 5, "all 5 queued packets must be delivered before disconnect");
	assert!(!disconnect_seen_before_all_received);
}

#[test]
fn scenario_duplicate_peer_limit_rejects_third_connect() {
	let mut server = Host::create(loopback(), 8, 1, 0, 0).unwrap();
	server.set_duplicate_peers(2);
	let server_addr = server.address();

	let mut clients: Vec<Host> = (0..3).map(|_| Host::create(loopback(), 1, 1, 0, 0).unwrap()).collect();
	let peer_ids: Vec<_> = clients.iter_mut().map(|c| c.connect(server_addr, 1, 0).unwrap()).collect();

	let mut connected = 0;
	for _ in 0..500 {
		for client in clients.iter_mut() {
			if let Some(Event::Connect { .. }) = client.service(Duration::from_millis(2)).unwrap() {
				connected += 1;
			}
		}
		if let Some(Event::Connect { .. }) = server.service(Duration::from_millis(2)).unwrap() {}
	}

	assert_eq!(connected, 2, "only duplicate_peers clients from one address may connect");
	let _ = peer_ids;
}
