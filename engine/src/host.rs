//! The host engine: owns the socket, the peer array, bandwidth accounting,
//! and the `service` tick that orchestrates receive → dispatch → send
//! (§3 "Host", §4.6, §4.7, §4.8, §4.9, §4.10).
//!
//! Grounded on `original_source/devils_host.c` and `devils_protocol.c` for
//! the algorithms; the owning-thread, polled-method shape replaces the
//! teacher's `stakker` actor loop (`dspeyrer-net/wireguard/src/lib.rs`),
//! per the Open Question resolution recorded in DESIGN.md.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use utils::bytes::cast;
use utils::endian::u16be;
use utils::error::{Ext, Result};

use io::time::Clock;
use io::Socket;

use crate::compress::Compressor;
use crate::constants::*;
use crate::event::Event;
use crate::fragment;
use crate::packet::{Packet, PacketFlags};
use crate::peer::{Acknowledgement, Command, IncomingCommand, OutgoingCommand, Peer, PeerId, PeerState};
use crate::protocol;
use crate::wire::{self, CommandKind};

const MAXIMUM_DATAGRAMS_PER_TICK: usize = 256;

/// A datagram-framed, multi-peer transport endpoint.
///
/// Every public method here must be called from the single thread that owns
/// the `Host` (§5): nothing here is `Send`/`Sync`, and nothing reenters.
pub struct Host {
	socket: Socket,
	clock: Clock,
	address: SocketAddr,

	incoming_bandwidth: u32,
	outgoing_bandwidth: u32,
	bandwidth_throttle_epoch: u32,
	recalculate_bandwidth_limits: bool,

	mtu: usize,
	channel_limit: usize,
	duplicate_peers: usize,
	maximum_packet_size: usize,
	maximum_waiting_data: usize,

	peers: Vec<Peer>,
	service_time: u32,
	dispatch_queue: VecDeque<PeerId>,

	connected_peers: usize,
	bandwidth_limited_peers: usize,
	total_sent_data: u64,
	total_received_data: u64,

	compressor: Option<Box<dyn Compressor>>,
	checksum: Option<Box<dyn Fn(&[&[u8]]) -> u32>>,
	intercept: Option<Box<dyn FnMut(&[u8], SocketAddr) -> bool>>,

	receive_buffer: Vec<u8>,
}

impl Host {
	/// Binds a socket to `address` and preallocates `peer_count` peer slots,
	/// each with `channel_limit` channels, mirroring `devils_host_create`.
	pub fn create(address: SocketAddr, peer_count: usize, channel_limit: usize, incoming_bandwidth: u32, outgoing_bandwidth: u32) -> Result<Self> {
		let socket = Socket::bind(address)?;
		let bound = socket.local_addr()?;

		let channel_limit = channel_limit.clamp(PROTOCOL_MIN_CHANNEL_COUNT, PROTOCOL_MAX_CHANNEL_COUNT);
		let placeholder: SocketAddr = "0.0.0.0:0".parse().unwrap();

		Ok(Self {
			socket,
			clock: Clock::new(),
			address: bound,

			incoming_bandwidth,
			outgoing_bandwidth,
			bandwidth_throttle_epoch: 0,
			recalculate_bandwidth_limits: false,

			mtu: HOST_DEFAULT_MTU,
			channel_limit,
			duplicate_peers: PROTOCOL_MAXIMUM_PEER_ID as usize,
			maximum_packet_size: HOST_DEFAULT_MAXIMUM_PACKET_SIZE,
			maximum_waiting_data: HOST_DEFAULT_MAXIMUM_WAITING_DATA,

			peers: (0..peer_count)
				.map(|i| {
					let mut peer = Peer::new(channel_limit, HOST_DEFAULT_MTU, placeholder);
					peer.incoming_peer_id = i as u16;
					peer
				})
				.collect(),
			service_time: 0,
			dispatch_queue: VecDeque::new(),

			connected_peers: 0,
			bandwidth_limited_peers: 0,
			total_sent_data: 0,
			total_received_data: 0,

			compressor: None,
			checksum: None,
			intercept: None,

			receive_buffer: vec![0u8; PROTOCOL_MAXIMUM_MTU],
		})
	}

	pub fn address(&self) -> SocketAddr {
		self.address
	}

	pub fn peer(&self, id: PeerId) -> Option<&Peer> {
		self.peers.get(id)
	}

	pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
		self.peers.get_mut(id)
	}

	pub fn set_channel_limit(&mut self, limit: usize) {
		self.channel_limit = limit.clamp(PROTOCOL_MIN_CHANNEL_COUNT, PROTOCOL_MAX_CHANNEL_COUNT);
	}

	/// Caps how many non-terminal peers may share a single IP address
	/// (§4.2). A `CONNECT` from an address already at the cap is rejected
	/// without allocating a peer slot.
	pub fn set_duplicate_peers(&mut self, limit: usize) {
		self.duplicate_peers = limit;
	}

	pub fn set_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
		self.incoming_bandwidth = incoming;
		self.outgoing_bandwidth = outgoing;
		self.recalculate_bandwidth_limits = true;
	}

	pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
		self.compressor = compressor;
	}

	pub fn set_checksum(&mut self, checksum: Option<Box<dyn Fn(&[&[u8]]) -> u32>>) {
		self.checksum = checksum;
	}

	pub fn set_intercept(&mut self, intercept: Option<Box<dyn FnMut(&[u8], SocketAddr) -> bool>>) {
		self.intercept = intercept;
	}

	fn find_free_peer(&self) -> Option<PeerId> {
		self.peers.iter().position(|p| p.state == PeerState::Disconnected)
	}

	/// Initiates an active connection, per §4.2's "outbound connect" path.
	pub fn connect(&mut self, address: SocketAddr, channel_count: usize, data: u32) -> Result<PeerId> {
		let id = self.find_free_peer().ok_or_else(|| warn!("no free peer slot for {address}"))?;
		let channel_count = channel_count.clamp(PROTOCOL_MIN_CHANNEL_COUNT, self.channel_limit);

		let peer = &mut self.peers[id];
		peer.reset();
		peer.address = address;
		peer.channels = (0..channel_count).map(|_| Default::default()).collect();
		peer.connect_id = rand::random();
		peer.state = PeerState::Connecting;
		peer.event_data = data;
		peer.mtu = self.mtu;
		peer.incoming_session_id = 0xFF;
		peer.outgoing_session_id = 0xFF;

		let cmd = protocol::build_connect(
			peer.incoming_peer_id,
			peer.incoming_session_id,
			peer.outgoing_session_id,
			peer.mtu as u32,
			peer.window_size,
			channel_count as u32,
			self.incoming_bandwidth,
			self.outgoing_bandwidth,
			peer.packet_throttle_interval,
			peer.packet_throttle_acceleration,
			peer.packet_throttle_deceleration,
			peer.connect_id,
			data,
		);

		let mut cmd = cmd;
		cmd.reliable_sequence_number = peer.next_peer_reliable_sequence_number();
		peer.queue_outgoing(cmd, None, 0, 0);

		debug!("connecting to {address}, peer slot {id}");
		Ok(id)
	}

	/// Queues `packet` for delivery to every connected peer on `channel_id`
	/// (§6, a thin wrapper over repeated `send`).
	pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
		let ids: Vec<PeerId> = self
			.peers
			.iter()
			.enumerate()
			.filter(|(_, p)| protocol::is_active(p.state))
			.map(|(i, _)| i)
			.collect();

		for id in ids {
			let _ = self.send(id, channel_id, packet.clone());
		}
	}

	/// Enqueues `packet` for delivery to `peer` on `channel_id` (§4.4 for
	/// the fragmentation decision, §3 "Outgoing command" for the record
	/// shape).
	pub fn send(&mut self, peer_id: PeerId, channel_id: u8, packet: Packet) -> Result<()> {
		let has_checksum = self.checksum.is_some();
		let mtu = self.peers.get(peer_id).map(|p| p.mtu).unwrap_or(self.mtu);
		let max_fragment_length = fragment::max_fragment_length(mtu, has_checksum);

		let peer = self.peers.get_mut(peer_id).ok_or_else(|| warn!("send to unknown peer {peer_id}"))?;

		if !protocol::is_active(peer.state) {
			return Err(warn!("send to peer {peer_id} in non-active state {:?}", peer.state));
		}

		if channel_id as usize >= peer.channel_count() {
			return Err(warn!("send on out-of-range channel {channel_id}"));
		}

		if peer.total_waiting_data + packet.len() > self.maximum_waiting_data {
			return Err(warn!("peer {peer_id} exceeded maximum waiting data"));
		}

		let flags = packet.flags();
		let reliable = flags.contains(PacketFlags::RELIABLE);
		let unsequenced = flags.contains(PacketFlags::UNSEQUENCED);

		let needs_fragmenting = packet.len() > max_fragment_length;

		if needs_fragmenting {
			let specs = fragment::plan(packet.len(), max_fragment_length)
				.ok_or_else(|| warn!("packet of {} bytes needs too many fragments", packet.len()))?;

			let start_sequence_number = peer.next_reliable_sequence_number(channel_id).wrapping_add(1);
			// Roll the counter back; each fragment below claims its own slot.
			peer.channels[channel_id as usize].outgoing_reliable_sequence_number = start_sequence_number.wrapping_sub(1);

			for spec in &specs {
				let reliable_sequence_number = peer.next_reliable_sequence_number(channel_id);
				let cmd = protocol::build_send_fragment(
					channel_id,
					reliable,
					start_sequence_number,
					spec.length as u16,
					specs.len() as u32,
					spec.index,
					packet.len() as u32,
					spec.offset,
				);
				let mut cmd = cmd;
				cmd.reliable_sequence_number = reliable_sequence_number;
				peer.queue_outgoing(cmd, Some(packet.clone()), spec.offset, spec.length as u16);
			}
		} else if reliable {
			let reliable_sequence_number = peer.next_reliable_sequence_number(channel_id);
			let mut cmd = protocol::build_send_reliable(channel_id, packet.len() as u16);
			cmd.reliable_sequence_number = reliable_sequence_number;
			peer.queue_outgoing(cmd, Some(packet.clone()), 0, packet.len() as u16);
		} else if unsequenced {
			let group = peer.next_unsequenced_group();
			let mut cmd = protocol::build_send_unsequenced(channel_id, packet.len() as u16);
			cmd.unsequenced_group = group;
			peer.queue_outgoing(cmd, Some(packet.clone()), 0, packet.len() as u16);
		} else {
			let (reliable_sequence_number, unreliable_sequence_number) = peer.next_unreliable_sequence_number(channel_id);
			let mut cmd = protocol::build_send_unreliable(channel_id, packet.len() as u16);
			cmd.reliable_sequence_number = reliable_sequence_number;
			cmd.unreliable_sequence_number = unreliable_sequence_number;
			peer.queue_outgoing(cmd, Some(packet.clone()), 0, packet.len() as u16);
		}

		peer.total_waiting_data += packet.len();
		Ok(())
	}

	pub fn ping(&mut self, peer_id: PeerId) {
		if let Some(peer) = self.peers.get_mut(peer_id) {
			if protocol::is_active(peer.state) {
				let mut cmd = protocol::build_ping();
				cmd.reliable_sequence_number = peer.next_peer_reliable_sequence_number();
				peer.queue_outgoing(cmd, None, 0, 0);
			}
		}
	}

	/// Graceful, confirmed disconnect (§4.2, §7).
	pub fn disconnect(&mut self, peer_id: PeerId, data: u32) {
		let Some(peer) = self.peers.get_mut(peer_id) else { return };

		if peer.state.is_terminal() {
			return;
		}

		peer.reset_queues();
		peer.event_data = data;

		if peer.state == PeerState::Connecting || peer.state == PeerState::AcknowledgingConnect {
			peer.state = PeerState::Zombie;
			self.enqueue_dispatch(peer_id);
			return;
		}

		peer.state = PeerState::Disconnecting;
		let mut cmd = protocol::build_disconnect(data);
		cmd.reliable_sequence_number = peer.next_peer_reliable_sequence_number();
		peer.queue_outgoing(cmd, None, 0, 0);
	}

	/// Drains queued packets before disconnecting (§4.2 "Deferred disconnect").
	pub fn disconnect_later(&mut self, peer_id: PeerId, data: u32) {
		let Some(peer) = self.peers.get_mut(peer_id) else { return };

		if !protocol::is_active(peer.state) {
			return self.disconnect(peer_id, data);
		}

		if peer.outgoing_commands.is_empty() && peer.sent_reliable_commands.is_empty() {
			return self.disconnect(peer_id, data);
		}

		peer.event_data = data;
		peer.state = PeerState::DisconnectLater;
	}

	/// Best-effort, unconfirmed disconnect (§7 "Application-initiated
	/// disconnect"): no event is emitted locally, the peer is reset at once.
	pub fn disconnect_now(&mut self, peer_id: PeerId, data: u32) {
		let Some(peer) = self.peers.get_mut(peer_id) else { return };

		if peer.state.is_terminal() {
			return;
		}

		if protocol::is_active(peer.state) {
			let cmd = protocol::build_disconnect_unsequenced(data);
			let encoded = cmd.encode();
			let header = self.encode_header(peer_id, false, false);
			let datagram = [&header[..], &encoded[..]].concat();
			let address = self.peers[peer_id].address;
			let _ = self.socket.send(&datagram, address);
		}

		self.peers[peer_id].reset();
	}

	fn enqueue_dispatch(&mut self, peer_id: PeerId) {
		if self.peers[peer_id].dispatch() {
			self.dispatch_queue.push_back(peer_id);
		}
	}

	// ---- service tick (§4.7) -------------------------------------------------

	/// Performs one send pass over every non-terminal peer, unconditionally
	/// and without blocking (§4.7 `flush`).
	pub fn flush(&mut self) {
		self.service_time = self.clock.now();
		self.send_outgoing_commands();
	}

	/// Pops one dispatchable event without advancing time or touching the
	/// network (§4.7 `check_events`).
	pub fn check_events(&mut self) -> Option<Event> {
		self.dispatch_one()
	}

	/// The canonical entry point (§4.7): drains one pending event if already
	/// available, else services the host (bandwidth throttle, send, receive,
	/// send again) until an event appears or `timeout` elapses.
	pub fn service(&mut self, timeout: Duration) -> Result<Option<Event>> {
		if let Some(event) = self.dispatch_one() {
			return Ok(Some(event));
		}

		self.service_time = self.clock.now();
		let deadline = Instant::now() + timeout;

		loop {
			self.bandwidth_throttle_if_due();
			self.send_outgoing_commands();

			if self.receive_incoming_commands()? {
				self.send_outgoing_commands();
			}

			if let Some(event) = self.dispatch_one() {
				return Ok(Some(event));
			}

			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return Ok(None);
			}

			if !self.socket.wait(Some(remaining))? {
				return Ok(None);
			}

			self.service_time = self.clock.now();
		}
	}

	/// Pops the next peer from the dispatch queue and emits at most one
	/// event for it (§4.10). A peer with further dispatched commands
	/// re-enqueues itself.
	fn dispatch_one(&mut self) -> Option<Event> {
		while let Some(peer_id) = self.dispatch_queue.pop_front() {
			let peer = &mut self.peers[peer_id];
			peer.needs_dispatch = false;

			match peer.state {
				PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
					peer.state = PeerState::Connected;
					self.connected_peers += 1;
					let data = peer.event_data;
					trace!("peer {peer_id} connected");
					return Some(Event::Connect { peer: peer_id, data });
				}
				PeerState::Zombie => {
					let data = peer.event_data;
					self.reset_peer(peer_id);
					trace!("peer {peer_id} disconnected");
					return Some(Event::Disconnect { peer: peer_id, data });
				}
				_ => {
					if let Some((channel, packet)) = self.peers[peer_id].dispatched_commands.pop_front() {
						if !self.peers[peer_id].dispatched_commands.is_empty() {
							self.enqueue_dispatch(peer_id);
						}
						return Some(Event::Receive { peer: peer_id, channel, packet });
					}
				}
			}
		}

		None
	}

	fn reset_peer(&mut self, peer_id: PeerId) {
		if self.connected_peers > 0 && protocol::is_active(self.peers[peer_id].state) {
			self.connected_peers -= 1;
		}
		self.peers[peer_id].reset();
	}

	// ---- bandwidth throttle (§4.6) -------------------------------------------

	fn bandwidth_throttle_if_due(&mut self) {
		let elapsed = self.service_time.wrapping_sub(self.bandwidth_throttle_epoch);

		if elapsed < HOST_BANDWIDTH_THROTTLE_INTERVAL && !self.recalculate_bandwidth_limits {
			return;
		}

		self.bandwidth_throttle_epoch = self.service_time;
		self.recalculate_bandwidth_limits = false;

		if self.connected_peers == 0 {
			return;
		}

		let elapsed = elapsed.max(1);

		let data_total: u64 = self.peers.iter().filter(|p| protocol::is_active(p.state)).map(|p| p.outgoing_data_total as u64).sum();

		if self.outgoing_bandwidth == 0 {
			// Unthrottled: every peer may use its full throttle limit.
			for peer in self.peers.iter_mut().filter(|p| protocol::is_active(p.state)) {
				peer.packet_throttle_limit = PEER_PACKET_THROTTLE_SCALE;
			}
		} else {
			let bandwidth_budget = self.outgoing_bandwidth as u64 * elapsed as u64 / 1000;

			// Phase 1: peers whose own incoming-bandwidth cap is already
			// tighter than their share get exactly that share; track how
			// much of the total budget they consume.
			let mut needs_adjustment = true;
			let mut bandwidth_limited_peers = 0usize;
			let mut throttled_data_total = data_total;
			let mut peers_remaining = self.peers.iter().filter(|p| protocol::is_active(p.state)).count().max(1);
			let mut budget_remaining = bandwidth_budget;

			while needs_adjustment && peers_remaining > 0 {
				needs_adjustment = false;
				let fair_share = budget_remaining / peers_remaining as u64;

				for peer in self.peers.iter_mut().filter(|p| protocol::is_active(p.state)) {
					if peer.incoming_bandwidth != 0 && peer.outgoing_data_total as u64 > fair_share {
						let limit = (peer.incoming_bandwidth as u64 * PEER_PACKET_THROTTLE_SCALE as u64 / self.outgoing_bandwidth.max(1) as u64)
							.min(PEER_PACKET_THROTTLE_SCALE as u64) as u32;

						if limit < peer.packet_throttle_limit || peer.packet_throttle_limit == 0 {
							peer.packet_throttle_limit = limit;
							bandwidth_limited_peers += 1;
							needs_adjustment = true;
							throttled_data_total = throttled_data_total.saturating_sub(peer.outgoing_data_total as u64);
							budget_remaining = throttled_data_total.min(bandwidth_budget);
						}
					}
				}

				peers_remaining = peers_remaining.saturating_sub(bandwidth_limited_peers).max(1);
			}

			self.bandwidth_limited_peers = bandwidth_limited_peers;

			// Phase 2: remaining peers split whatever budget is left evenly.
			let unlimited = self.peers.iter().filter(|p| protocol::is_active(p.state)).count().saturating_sub(bandwidth_limited_peers).max(1);
			let fair_share = (bandwidth_budget / unlimited as u64).min(PEER_PACKET_THROTTLE_SCALE as u64 * 64 * 1024) as u32;

			for peer in self.peers.iter_mut().filter(|p| protocol::is_active(p.state)) {
				if peer.incoming_bandwidth == 0 || peer.outgoing_data_total as u64 <= fair_share as u64 {
					peer.packet_throttle_limit = PEER_PACKET_THROTTLE_SCALE;
				}
			}
		}

		for peer in self.peers.iter_mut().filter(|p| protocol::is_active(p.state)) {
			peer.outgoing_data_total = 0;
			peer.incoming_data_total = 0;
		}

		let ids: Vec<PeerId> = (0..self.peers.len()).filter(|&i| protocol::is_active(self.peers[i].state)).collect();
		for id in ids {
			let (incoming, outgoing) = (self.incoming_bandwidth, self.outgoing_bandwidth);
			let peer = &mut self.peers[id];
			let mut cmd = protocol::build_bandwidth_limit(incoming, outgoing);
			cmd.reliable_sequence_number = peer.next_peer_reliable_sequence_number();
			peer.queue_outgoing(cmd, None, 0, 0);
		}
	}

	// ---- send path (§4.8) -----------------------------------------------------

	fn encode_header(&self, peer_id: PeerId, compressed: bool, sent_time: bool) -> Vec<u8> {
		let peer = &self.peers[peer_id];
		let mut peer_word = peer.outgoing_peer_id & !wire::HEADER_SESSION_MASK;
		peer_word |= (peer.outgoing_session_id as u16) << wire::HEADER_SESSION_SHIFT;

		if compressed {
			peer_word |= wire::HEADER_FLAG_COMPRESSED;
		}
		if sent_time {
			peer_word |= wire::HEADER_FLAG_SENT_TIME;
		}

		let mut buf = Vec::with_capacity(4);
		wire::push_u16(&mut buf, peer_word);
		if sent_time {
			wire::push_u16(&mut buf, self.service_time as u16);
		}
		buf
	}

	/// Returns whether any datagram was sent, used by `service` to decide
	/// whether a second receive/send pass is warranted.
	fn send_outgoing_commands(&mut self) -> bool {
		let mut sent_any = false;

		for peer_id in 0..self.peers.len() {
			if self.peers[peer_id].state.is_terminal() {
				continue;
			}

			if self.check_timeouts(peer_id) {
				sent_any |= self.send_peer_datagram(peer_id);
				continue;
			}

			sent_any |= self.send_peer_datagram(peer_id);
		}

		sent_any
	}

	/// Checks `sentReliableCommands` for expiry, requeueing timed-out
	/// commands at the head of `outgoingCommands` with doubled timeout, and
	/// declares the peer dead if it has exceeded the liveness bounds (§4.5,
	/// §4.2). Returns `true` if the peer was torn down by this call.
	fn check_timeouts(&mut self, peer_id: PeerId) -> bool {
		let now = self.service_time;
		let peer = &mut self.peers[peer_id];

		let mut expired = Vec::new();
		let mut i = 0;
		while i < peer.sent_reliable_commands.len() {
			let cmd = &peer.sent_reliable_commands[i];
			let elapsed = now.wrapping_sub(cmd.sent_time);

			if elapsed >= cmd.round_trip_timeout {
				expired.push(i);
			}
			i += 1;
		}

		if expired.is_empty() {
			return false;
		}

		for &idx in expired.iter().rev() {
			let mut cmd = peer.sent_reliable_commands.remove(idx).unwrap();

			let since_send = now.wrapping_sub(cmd.sent_time);
			if since_send >= peer.timeout_maximum || (cmd.send_attempts > 0 && since_send >= peer.timeout_minimum && cmd.round_trip_timeout >= cmd.round_trip_timeout_limit) {
				peer.state = PeerState::Zombie;
				peer.event_data = 0;
				self.dispatch_queue.push_back(peer_id);
				peer.needs_dispatch = true;
				return true;
			}

			peer.packets_lost += 1;
			cmd.round_trip_timeout = cmd.round_trip_timeout.saturating_mul(2);
			peer.outgoing_commands.push_front(cmd);
		}

		false
	}

	/// Builds and sends (at most) one datagram for `peer`, per §4.8.
	fn send_peer_datagram(&mut self, peer_id: PeerId) -> bool {
		let peer = &mut self.peers[peer_id];

		if peer.state.is_terminal() {
			return false;
		}

		let mtu = peer.mtu;
		let has_checksum = self.checksum.is_some();
		let header_budget = 4 + if has_checksum { 4 } else { 0 };
		let mut budget = mtu.saturating_sub(header_budget);

		let mut body = Vec::new();
		let mut command_count = 0usize;
		let mut used_sent_time = false;

		// ACKs first.
		while command_count < PROTOCOL_MAXIMUM_PACKET_COMMANDS {
			let Some(ack) = peer.acknowledgements.front() else { break };
			let size = ack.command.wire_size();
			if size > budget {
				break;
			}

			let ack = peer.acknowledgements.pop_front().unwrap();
			body.extend_from_slice(&ack.command.encode());
			budget -= size;
			command_count += 1;
		}

		// Window-bounded walk over outgoing_commands (§4.3, §4.8).
		let window_cap = {
			let scaled = (peer.window_size as u64 * peer.packet_throttle as u64 / PEER_PACKET_THROTTLE_SCALE as u64) as u32;
			scaled.max(peer.mtu as u32)
		};

		let mut requeue = VecDeque::new();

		while command_count < PROTOCOL_MAXIMUM_PACKET_COMMANDS {
			let Some(outgoing) = peer.outgoing_commands.pop_front() else { break };

			let reliable = outgoing.command.kind != CommandKind::SendUnreliable && outgoing.command.kind != CommandKind::SendUnsequenced;
			let size = outgoing.command.wire_size() + outgoing.packet.as_ref().map(|p| p.len().min(outgoing.fragment_length as usize)).unwrap_or(0);

			if size > budget {
				requeue.push_back(outgoing);
				break;
			}

			// Peer-wide commands (CONNECT, DISCONNECT, PING, BANDWIDTH_LIMIT,
			// THROTTLE_CONFIGURE) carry wire channel id 0xFF and are not
			// subject to any channel's sliding window.
			let channel_bound = (outgoing.command.channel_id as usize) < peer.channels.len();

			if reliable && channel_bound {
				let window_full = {
					let channel = &peer.channels[outgoing.command.channel_id as usize];
					let window = (outgoing.command.reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE) as usize % PEER_RELIABLE_WINDOWS;
					channel.reliable_windows[window] >= PEER_RELIABLE_WINDOW_SIZE
				};

				if window_full || peer.reliable_data_in_transit + outgoing.fragment_length as u32 > window_cap {
					requeue.push_back(outgoing);
					break;
				}
			} else if !reliable && !peer.should_send_unreliable() {
				// Dropped per throttle decision; references released on drop.
				continue;
			}

			let mut outgoing = outgoing;
			outgoing.sent_time = self.service_time;
			outgoing.send_attempts += 1;
			if outgoing.round_trip_timeout == 0 {
				outgoing.round_trip_timeout = peer.round_trip_time + 4 * peer.round_trip_time_variance;
				outgoing.round_trip_timeout_limit = outgoing.round_trip_timeout * peer.timeout_limit;
			}

			let needs_ack = outgoing.command.flags & wire::COMMAND_FLAG_ACKNOWLEDGE != 0;
			used_sent_time |= needs_ack;

			body.extend_from_slice(&outgoing.command.encode());
			if let Some(packet) = &outgoing.packet {
				let start = outgoing.fragment_offset as usize;
				let end = (start + outgoing.fragment_length as usize).min(packet.len());
				body.extend_from_slice(&packet.as_slice()[start..end]);
			}

			budget -= size;
			command_count += 1;

			if reliable {
				// Window/in-transit accounting only applies to channel-bound
				// commands on their first send attempt; a retransmission must
				// not double-count a window slot it already occupies, and
				// peer-wide commands (channel 0xFF) have no channel to index.
				if channel_bound && outgoing.send_attempts == 1 {
					let window = (outgoing.command.reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE) as usize % PEER_RELIABLE_WINDOWS;
					peer.channels[outgoing.command.channel_id as usize].reliable_windows[window] += 1;
					peer.channels[outgoing.command.channel_id as usize].used_reliable_windows |= 1 << window;
					peer.reliable_data_in_transit += outgoing.fragment_length as u32;
				}
				peer.sent_reliable_commands.push_back(outgoing);
			} else if outgoing.packet.is_some() {
				peer.sent_unreliable_commands.push_back(outgoing);
			}
		}

		while let Some(outgoing) = requeue.pop_back() {
			peer.outgoing_commands.push_front(outgoing);
		}

		if command_count == 0 {
			if self.service_time.wrapping_sub(peer.last_receive_time) >= peer.ping_interval && peer.last_send_time != 0 {
				let mut cmd = protocol::build_ping();
				cmd.reliable_sequence_number = peer.next_peer_reliable_sequence_number();
				peer.queue_outgoing(cmd, None, 0, 0);
				return self.send_peer_datagram(peer_id);
			}
			return false;
		}

		// Packet-loss smoothing, rolled every PEER_PACKET_LOSS_INTERVAL ms
		// once at least one packet has gone out since the last roll (§4.5).
		if peer.packet_loss_epoch == 0 {
			peer.packet_loss_epoch = self.service_time;
		} else if self.service_time.wrapping_sub(peer.packet_loss_epoch) >= PEER_PACKET_LOSS_INTERVAL && peer.packets_sent > 0 {
			let packet_loss = peer.packets_lost * PEER_PACKET_LOSS_SCALE / peer.packets_sent;

			peer.packet_loss_variance = (peer.packet_loss_variance * 3 + packet_loss.abs_diff(peer.packet_loss)) / 4;
			peer.packet_loss = (peer.packet_loss * 7 + packet_loss) / 8;

			peer.packet_loss_epoch = self.service_time;
			peer.packets_sent = 0;
			peer.packets_lost = 0;
		}

		let peer = &mut self.peers[peer_id];
		let address = peer.address;

		let payload = if let Some(compressor) = &mut self.compressor {
			let mut out = vec![0u8; body.len()];
			let n = compressor.compress(&body, &mut out);
			if n > 0 && n < body.len() {
				out.truncate(n);
				Some(out)
			} else {
				None
			}
		} else {
			None
		};

		let compressed = payload.is_some();
		let header = self.encode_header(peer_id, compressed, used_sent_time);
		let final_body = payload.unwrap_or(body);

		let mut datagram = header;
		if let Some(checksum_fn) = &self.checksum {
			let seed_body = [datagram.as_slice(), &final_body];
			let checksum = checksum_fn(&seed_body);
			wire::push_u32(&mut datagram, checksum);
		}
		datagram.extend_from_slice(&final_body);

		match self.socket.send(&datagram, address) {
			Ok(true) => {
				let peer = &mut self.peers[peer_id];
				peer.last_send_time = self.service_time;
				peer.packets_sent += 1;
				peer.outgoing_data_total += datagram.len() as u32;
				self.total_sent_data += datagram.len() as u64;

				for outgoing in peer.sent_unreliable_commands.drain(..) {
					if let Some(packet) = &outgoing.packet {
						packet.mark_sent();
					}
				}
				true
			}
			_ => false,
		}
	}

	// ---- receive path (§4.9) ---------------------------------------------------

	/// Drains up to `MAXIMUM_DATAGRAMS_PER_TICK` pending datagrams. Returns
	/// whether any were processed.
	fn receive_incoming_commands(&mut self) -> Result<bool> {
		let mut processed = false;

		for _ in 0..MAXIMUM_DATAGRAMS_PER_TICK {
			let mut buf = std::mem::take(&mut self.receive_buffer);
			let received = self.socket.receive(&mut buf);
			self.receive_buffer = buf;

			let Some((len, from)) = received? else { break };
			processed = true;

			if let Some(intercept) = &mut self.intercept {
				if intercept(&self.receive_buffer[..len], from) {
					continue;
				}
			}

			self.total_received_data += len as u64;
			if let Err(()) = self.handle_datagram(len, from) {
				trace!("dropped malformed datagram from {from}");
			}
		}

		Ok(processed)
	}

	fn handle_datagram(&mut self, len: usize, from: SocketAddr) -> Result<()> {
		if len < 4 {
			return Err(warn!("datagram from {from} shorter than header"));
		}

		let raw = self.receive_buffer[..len].to_vec();
		let header: &wire::Header = cast(&raw[..4]);
		let peer_word: u16 = header.peer_id.get();

		let target_id = peer_word & wire::MAXIMUM_PEER_ID;
		let session_id = ((peer_word & wire::HEADER_SESSION_MASK) >> wire::HEADER_SESSION_SHIFT) as u8;
		let compressed = peer_word & wire::HEADER_FLAG_COMPRESSED != 0;
		let has_sent_time = peer_word & wire::HEADER_FLAG_SENT_TIME != 0;

		let mut offset = 2;
		let sent_time = if has_sent_time {
			if len < offset + 2 {
				return Err(warn!("datagram from {from} truncated sent-time field"));
			}
			let t: u16be = *cast(&raw[offset..offset + 2]);
			offset += 2;
			Some(t.get())
		} else {
			None
		};

		let peer_id = if target_id == wire::MAXIMUM_PEER_ID {
			None
		} else {
			let id = target_id as usize;
			let peer = self.peers.get(id).ok_or_else(|| warn!("datagram targets out-of-range peer {id}"))?;

			if peer.state.is_terminal() {
				return Err(());
			}
			if peer.address != from {
				return Err(warn!("datagram from {from} address mismatch for peer {id}"));
			}
			if peer.incoming_session_id != 0xFF && peer.incoming_session_id != session_id {
				return Err(warn!("datagram from {from} session mismatch"));
			}

			Some(id)
		};

		if let Some(checksum_fn) = &self.checksum {
			if len < offset + 4 {
				return Err(warn!("datagram from {from} truncated checksum field"));
			}

			let expected = u32::from_be_bytes(raw[offset..offset + 4].try_into().unwrap());
			let seed = peer_id.map(|id| self.peers[id].connect_id).unwrap_or(0);

			let mut stamped = raw.clone();
			stamped[offset..offset + 4].copy_from_slice(&seed.to_be_bytes());
			let actual = checksum_fn(&[&stamped]);

			if actual != expected {
				return Err(warn!("checksum mismatch from {from}"));
			}
			offset += 4;
		}

		let body = if compressed {
			let Some(compressor) = &mut self.compressor else {
				return Err(warn!("compressed datagram but no compressor installed"));
			};
			let mut out = vec![0u8; self.maximum_packet_size.min(64 * 1024)];
			let n = compressor.decompress(&raw[offset..], &mut out);
			if n == 0 {
				return Err(warn!("decompression failed for datagram from {from}"));
			}
			out.truncate(n);
			out
		} else {
			raw[offset..].to_vec()
		};

		if let Some(id) = peer_id {
			self.peers[id].last_receive_time = self.service_time;
			self.peers[id].incoming_data_total += len as u32;
		}

		self.dispatch_commands(peer_id, from, &body, sent_time)
	}

	fn dispatch_commands(&mut self, mut peer_id: Option<PeerId>, from: SocketAddr, body: &[u8], sent_time: Option<u16>) -> Result<()> {
		let mut pos = 0;

		while pos < body.len() {
			if pos + 4 > body.len() {
				break;
			}

			let flags_byte = body[pos];
			let kind = CommandKind::from_u8(flags_byte).ok_or_else(|| warn!("illegal command id from {from}"))?;
			let ack_requested = flags_byte & wire::COMMAND_FLAG_ACKNOWLEDGE != 0;
			let channel_id = body[pos + 1];
			let reliable_sequence_number = u16::from_be_bytes([body[pos + 2], body[pos + 3]]);

			let size = kind.size();
			if pos + size > body.len() {
				return Err(warn!("short command payload from {from}"));
			}

			// `record` is the full fixed-layout struct (generic header
			// included) for commands parsed via `Cast`; `payload` is the
			// kind-specific tail used by the hand-parsed SEND_* handlers,
			// which read their fields starting right after the header.
			let record = &body[pos..pos + size];
			let payload = &body[pos + 4..pos + size];
			let trailing = &body[pos + size..];

			let result = match kind {
				CommandKind::Nothing => Ok(0),
				CommandKind::Connect => self.handle_connect(peer_id, from, record).map(|id| {
					peer_id = Some(id);
					0
				}),
				CommandKind::VerifyConnect => self.handle_verify_connect(peer_id, record).map(|_| 0),
				CommandKind::Acknowledge => self.handle_acknowledge(peer_id, record).map(|_| 0),
				CommandKind::Disconnect => self.handle_disconnect(peer_id).map(|_| 0),
				CommandKind::Ping => Ok(0),
				CommandKind::SendReliable => self.handle_send_reliable(peer_id, channel_id, reliable_sequence_number, payload, trailing),
				CommandKind::SendUnreliable => self.handle_send_unreliable(peer_id, channel_id, reliable_sequence_number, payload, trailing),
				CommandKind::SendUnsequenced => self.handle_send_unsequenced(peer_id, channel_id, payload, trailing),
				CommandKind::SendFragment | CommandKind::SendUnreliableFragment => {
					self.handle_send_fragment(peer_id, channel_id, reliable_sequence_number, kind, payload, trailing)
				}
				CommandKind::BandwidthLimit => self.handle_bandwidth_limit(peer_id, record).map(|_| 0),
				CommandKind::ThrottleConfigure => self.handle_throttle_configure(peer_id, record).map(|_| 0),
			};

			let consumed = match result {
				Ok(extra) => extra,
				Err(()) => return Err(()),
			};

			pos += size + consumed;

			if ack_requested {
				if let (Some(id), Some(sent_time)) = (peer_id, sent_time) {
					let cmd = protocol::build_acknowledge(channel_id, reliable_sequence_number, sent_time);
					self.peers[id].acknowledgements.push_back(Acknowledgement { command: cmd, sent_time: self.service_time });
				}
			}
		}

		Ok(())
	}

	// ---- inbound command handlers (§4.9) ---------------------------------------

	fn handle_connect(&mut self, existing: Option<PeerId>, from: SocketAddr, record: &[u8]) -> Result<PeerId> {
		let connect: &wire::Connect = cast(record);
		let remote_incoming_peer_id = connect.outgoing_peer_id.get();
		let connect_id = connect.connect_id.get();

		if let Some(id) = existing {
			if self.peers[id].address == from && self.peers[id].connect_id == connect_id {
				return Ok(id); // duplicate CONNECT, already being handled.
			}
		}

		let same_address_count = self.peers.iter().filter(|p| !p.state.is_terminal() && p.address.ip() == from.ip()).count();
		if same_address_count >= self.duplicate_peers {
			return Err(warn!("duplicate peer limit reached for {from}"));
		}

		let id = self.find_free_peer().ok_or_else(|| warn!("no free peer slot for incoming connect from {from}"))?;

		let channel_count = protocol::clamp_channel_count(connect.channel_count.get());
		let mtu = protocol::clamp_mtu(connect.mtu.get()).min(self.mtu);
		let window_size = protocol::clamp_window_size(connect.window_size.get());

		let mut incoming_session_id = connect.incoming_session_id;
		if incoming_session_id == 0xFF {
			incoming_session_id = 0;
		} else {
			incoming_session_id = incoming_session_id.wrapping_add(1) % 4;
			if incoming_session_id == id as u8 % 4 {
				incoming_session_id = incoming_session_id.wrapping_add(1) % 4;
			}
		}

		let peer = &mut self.peers[id];
		peer.reset();
		peer.address = from;
		peer.channels = (0..channel_count).map(|_| Default::default()).collect();
		peer.connect_id = connect_id;
		peer.outgoing_peer_id = remote_incoming_peer_id;
		peer.incoming_session_id = incoming_session_id;
		peer.outgoing_session_id = connect.outgoing_session_id;
		peer.mtu = mtu;
		peer.window_size = window_size;
		peer.incoming_bandwidth = connect.incoming_bandwidth.get();
		peer.outgoing_bandwidth = connect.outgoing_bandwidth.get();
		peer.packet_throttle_interval = connect.packet_throttle_interval.get();
		peer.packet_throttle_acceleration = connect.packet_throttle_acceleration.get();
		peer.packet_throttle_deceleration = connect.packet_throttle_deceleration.get();
		peer.event_data = connect.data.get();
		peer.state = PeerState::AcknowledgingConnect;

		let verify = protocol::build_verify_connect(
			peer.incoming_peer_id,
			peer.incoming_session_id,
			peer.outgoing_session_id,
			peer.mtu as u32,
			peer.window_size,
			channel_count as u32,
			self.incoming_bandwidth,
			self.outgoing_bandwidth,
			peer.packet_throttle_interval,
			peer.packet_throttle_acceleration,
			peer.packet_throttle_deceleration,
			peer.connect_id,
		);
		peer.queue_outgoing(verify, None, 0, 0);

		Ok(id)
	}

	fn handle_verify_connect(&mut self, peer_id: Option<PeerId>, record: &[u8]) -> Result<()> {
		let id = peer_id.ok_or_else(|| warn!("VERIFY_CONNECT without bound peer"))?;
		let verify: &wire::VerifyConnect = cast(record);

		let peer = &mut self.peers[id];
		if peer.state != PeerState::Connecting {
			return Ok(());
		}

		if verify.connect_id.get() != peer.connect_id {
			peer.state = PeerState::Zombie;
			self.enqueue_dispatch(id);
			return Err(warn!("VERIFY_CONNECT connect id mismatch"));
		}

		peer.channels.truncate(protocol::clamp_channel_count(verify.channel_count.get()).min(peer.channels.len()));
		peer.outgoing_peer_id = verify.outgoing_peer_id.get();
		peer.incoming_session_id = verify.incoming_session_id;
		peer.outgoing_session_id = verify.outgoing_session_id;
		peer.mtu = protocol::clamp_mtu(verify.mtu.get()).min(peer.mtu);
		peer.window_size = protocol::clamp_window_size(verify.window_size.get());
		peer.incoming_bandwidth = verify.incoming_bandwidth.get();
		peer.outgoing_bandwidth = verify.outgoing_bandwidth.get();
		peer.packet_throttle_interval = verify.packet_throttle_interval.get();
		peer.packet_throttle_acceleration = verify.packet_throttle_acceleration.get();
		peer.packet_throttle_deceleration = verify.packet_throttle_deceleration.get();
		peer.state = PeerState::ConnectionSucceeded;

		self.enqueue_dispatch(id);
		Ok(())
	}

	fn handle_acknowledge(&mut self, peer_id: Option<PeerId>, record: &[u8]) -> Result<()> {
		let id = peer_id.ok_or_else(|| warn!("ACK without bound peer"))?;
		let ack: &wire::Acknowledge = cast(record);

		let received_reliable_sequence_number = ack.received_reliable_sequence_number.get();
		let received_sent_time = ack.received_sent_time.get();

		let now = self.service_time;
		let reconstructed = {
			let high = now & 0xFFFF_0000;
			let mut full = high | received_sent_time as u32;
			if full > now && (full.wrapping_sub(now)) > 0x8000 {
				full = full.wrapping_sub(0x10000);
			}
			full
		};

		let peer = &mut self.peers[id];

		let index = peer.sent_reliable_commands.iter().position(|c| c.command.reliable_sequence_number == received_reliable_sequence_number);

		let Some(index) = index else { return Ok(()) };
		let acked = peer.sent_reliable_commands.remove(index).unwrap();

		// Peer-wide commands (channel 0xFF) never touched a channel's window
		// or `reliable_data_in_transit` when sent (see `send_peer_datagram`),
		// so there's nothing to undo here either.
		if (acked.command.channel_id as usize) < peer.channels.len() {
			let window = (acked.command.reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE) as usize % PEER_RELIABLE_WINDOWS;
			let channel = &mut peer.channels[acked.command.channel_id as usize];
			if channel.reliable_windows[window] > 0 {
				channel.reliable_windows[window] -= 1;
			}
			if channel.reliable_windows[window] == 0 {
				channel.used_reliable_windows &= !(1 << window);
			}

			peer.reliable_data_in_transit = peer.reliable_data_in_transit.saturating_sub(acked.fragment_length as u32);
		}

		let rtt = now.wrapping_sub(reconstructed);
		if peer.last_receive_time != 0 {
			peer.update_round_trip_time(rtt);
		} else {
			peer.round_trip_time = rtt.max(1);
			peer.lowest_round_trip_time = peer.round_trip_time;
		}
		peer.throttle(rtt);

		if now.wrapping_sub(peer.packet_throttle_epoch) >= peer.packet_throttle_interval {
			peer.roll_round_trip_baseline();
			peer.packet_throttle_epoch = now;
		}

		if peer.state == PeerState::Disconnecting && peer.outgoing_commands.is_empty() && peer.sent_reliable_commands.is_empty() {
			peer.state = PeerState::Zombie;
			self.enqueue_dispatch(id);
		} else if peer.state == PeerState::DisconnectLater && peer.outgoing_commands.is_empty() && peer.sent_reliable_commands.is_empty() {
			let data = peer.event_data;
			self.disconnect(id, data);
		}

		if let Some(packet) = acked.packet {
			drop(packet);
		}

		Ok(())
	}

	fn handle_disconnect(&mut self, peer_id: Option<PeerId>) -> Result<()> {
		let id = peer_id.ok_or_else(|| warn!("DISCONNECT without bound peer"))?;
		let peer = &mut self.peers[id];

		if peer.state.is_terminal() {
			return Ok(());
		}

		peer.reset_queues();

		if peer.state == PeerState::Connecting {
			peer.state = PeerState::Zombie;
		} else {
			peer.state = PeerState::Zombie;
		}
		peer.event_data = 0;
		self.enqueue_dispatch(id);
		Ok(())
	}

	fn handle_send_reliable(&mut self, peer_id: Option<PeerId>, channel_id: u8, reliable_sequence_number: u16, payload: &[u8], trailing: &[u8]) -> Result<usize> {
		let id = peer_id.ok_or_else(|| warn!("SEND_RELIABLE without bound peer"))?;
		let data_length = u16::from_be_bytes(payload[..2].try_into().unwrap()) as usize;

		if trailing.len() < data_length {
			return Err(warn!("short SEND_RELIABLE payload"));
		}

		if channel_id as usize >= self.peers[id].channel_count() {
			return Err(warn!("SEND_RELIABLE on out-of-range channel"));
		}

		{
			let peer = &self.peers[id];
			if peer.total_waiting_data + data_length > self.maximum_waiting_data {
				return Err(warn!("incoming data would exceed maximum waiting data"));
			}
			if !peer.channels[channel_id as usize].reliable_window_in_range(reliable_sequence_number) {
				return Ok(data_length); // stale/too-far-ahead, silently drop (§7).
			}
		}

		let command = Command {
			kind: CommandKind::SendReliable,
			flags: wire::COMMAND_FLAG_ACKNOWLEDGE,
			channel_id,
			reliable_sequence_number,
			unreliable_sequence_number: 0,
			unsequenced_group: 0,
			body: Vec::new(),
		};

		let incoming = IncomingCommand {
			reliable_sequence_number,
			unreliable_sequence_number: 0,
			command,
			buffer: trailing[..data_length].to_vec(),
			fragment_count: 1,
			fragments_remaining: 0,
			fragments_received: Vec::new(),
		};

		self.queue_incoming_reliable(id, channel_id, incoming);
		Ok(data_length)
	}

	/// §5 "Unreliable commands ... are delivered after the current reliable
	/// predecessor and in non-decreasing unreliable order". A command whose
	/// reliable predecessor hasn't dispatched yet is parked in
	/// `incoming_unreliable_commands` (keyed by the reliable sequence number
	/// it rides on) and released by `drain_contiguous_reliable` once that
	/// checkpoint is reached.
	fn handle_send_unreliable(&mut self, peer_id: Option<PeerId>, channel_id: u8, reliable_sequence_number: u16, payload: &[u8], trailing: &[u8]) -> Result<usize> {
		let id = peer_id.ok_or_else(|| warn!("SEND_UNRELIABLE without bound peer"))?;
		let unreliable_sequence_number = u16::from_be_bytes(payload[..2].try_into().unwrap());
		let data_length = u16::from_be_bytes(payload[2..4].try_into().unwrap()) as usize;

		if trailing.len() < data_length {
			return Err(warn!("short SEND_UNRELIABLE payload"));
		}

		let peer = &self.peers[id];
		if channel_id as usize >= peer.channel_count() || !peer.channels[channel_id as usize].reliable_window_in_range(reliable_sequence_number) {
			return Ok(data_length);
		}

		let channel = &mut self.peers[id].channels[channel_id as usize];

		if channel.incoming_reliable_sequence_number != reliable_sequence_number {
			let command = Command {
				kind: CommandKind::SendUnreliable,
				flags: 0,
				channel_id,
				reliable_sequence_number,
				unreliable_sequence_number,
				unsequenced_group: 0,
				body: Vec::new(),
			};
			channel.incoming_unreliable_commands.push_back(IncomingCommand {
				reliable_sequence_number,
				unreliable_sequence_number,
				command,
				buffer: trailing[..data_length].to_vec(),
				fragment_count: 1,
				fragments_remaining: 0,
				fragments_received: Vec::new(),
			});
			return Ok(data_length);
		}

		if unreliable_sequence_number <= channel.incoming_unreliable_sequence_number && channel.incoming_unreliable_sequence_number != 0 {
			return Ok(data_length); // older than current checkpoint.
		}

		channel.incoming_unreliable_sequence_number = unreliable_sequence_number;

		let packet = Packet::new(&trailing[..data_length], PacketFlags::empty());
		self.peers[id].dispatched_commands.push_back((channel_id, packet));
		self.enqueue_dispatch(id);

		Ok(data_length)
	}

	fn handle_send_unsequenced(&mut self, peer_id: Option<PeerId>, channel_id: u8, payload: &[u8], trailing: &[u8]) -> Result<usize> {
		let id = peer_id.ok_or_else(|| warn!("SEND_UNSEQUENCED without bound peer"))?;
		let group = u16::from_be_bytes(payload[..2].try_into().unwrap());
		let data_length = u16::from_be_bytes(payload[2..4].try_into().unwrap()) as usize;

		if trailing.len() < data_length {
			return Err(warn!("short SEND_UNSEQUENCED payload"));
		}

		let peer = &mut self.peers[id];

		let relative = group.wrapping_sub(peer.incoming_unsequenced_group);
		if relative as usize >= PEER_FREE_UNSEQUENCED_WINDOWS * 32 && (peer.incoming_unsequenced_group.wrapping_sub(group) as usize) < PEER_FREE_UNSEQUENCED_WINDOWS * 32 {
			return Ok(data_length); // too old.
		}

		if relative as usize >= PEER_UNSEQUENCED_WINDOW_SIZE as usize {
			// far enough ahead to rotate the bitmap.
			peer.unsequenced_window = [0; PEER_UNSEQUENCED_WINDOW_SIZE as usize / 32];
			peer.incoming_unsequenced_group = group;
		}

		let slot = (group % PEER_UNSEQUENCED_WINDOW_SIZE as u16) as usize;
		let word = slot / 32;
		let bit = 1u32 << (slot % 32);

		if peer.unsequenced_window[word] & bit != 0 {
			return Ok(data_length); // duplicate.
		}
		peer.unsequenced_window[word] |= bit;

		let packet = Packet::new(&trailing[..data_length], PacketFlags::UNSEQUENCED);
		peer.dispatched_commands.push_back((channel_id, packet));
		self.enqueue_dispatch(id);

		Ok(data_length)
	}

	#[allow(clippy::too_many_arguments)]
	fn handle_send_fragment(&mut self, peer_id: Option<PeerId>, channel_id: u8, reliable_sequence_number: u16, kind: CommandKind, payload: &[u8], trailing: &[u8]) -> Result<usize> {
		let id = peer_id.ok_or_else(|| warn!("SEND_FRAGMENT without bound peer"))?;

		let start_sequence_number = u16::from_be_bytes(payload[..2].try_into().unwrap());
		let data_length = u16::from_be_bytes(payload[2..4].try_into().unwrap()) as usize;
		let fragment_count = u32::from_be_bytes(payload[4..8].try_into().unwrap());
		let fragment_number = u32::from_be_bytes(payload[8..12].try_into().unwrap());
		let total_length = u32::from_be_bytes(payload[12..16].try_into().unwrap());
		let fragment_offset = u32::from_be_bytes(payload[16..20].try_into().unwrap());

		if trailing.len() < data_length {
			return Err(warn!("short SEND_FRAGMENT payload"));
		}

		if fragment_count > PROTOCOL_MAXIMUM_FRAGMENT_COUNT || fragment_number >= fragment_count || fragment_offset as usize + data_length > total_length as usize {
			return Err(warn!("malformed fragment geometry"));
		}

		let peer = &self.peers[id];
		if channel_id as usize >= peer.channel_count() {
			return Err(warn!("SEND_FRAGMENT on out-of-range channel"));
		}

		let reliable = kind == CommandKind::SendFragment;
		let in_window = peer.channels[channel_id as usize].reliable_window_in_range(start_sequence_number);

		if !in_window {
			if reliable {
				return Ok(data_length);
			}
			// §4.4: an unreliable fragment group with any member outside the
			// window is discarded as a whole, not just this one fragment.
			self.peers[id].channels[channel_id as usize].incoming_unreliable_commands.retain(|c| c.reliable_sequence_number != start_sequence_number);
			return Ok(data_length);
		}

		let existing_index = if reliable {
			self.peers[id].channels[channel_id as usize].incoming_reliable_commands.iter().position(|c| c.reliable_sequence_number == start_sequence_number)
		} else {
			self.peers[id].channels[channel_id as usize].incoming_unreliable_commands.iter().position(|c| c.reliable_sequence_number == start_sequence_number)
		};

		if let Some(idx) = existing_index {
			let channel = &mut self.peers[id].channels[channel_id as usize];
			let queue = if reliable { &mut channel.incoming_reliable_commands } else { &mut channel.incoming_unreliable_commands };
			queue[idx].write_fragment(fragment_number, fragment_offset as usize, &trailing[..data_length]);

			// A completed reliable fragment group stays in
			// `incoming_reliable_commands` and is released (in order, with
			// its predecessors) by `drain_contiguous_reliable` below; a
			// completed unreliable one has no predecessor to wait on and
			// dispatches immediately.
			if !reliable && queue[idx].complete() {
				let incoming = queue.remove(idx).unwrap();
				let packet = incoming.into_packet(PacketFlags::empty());
				self.peers[id].dispatched_commands.push_back((channel_id, packet));
				self.enqueue_dispatch(id);
			}
		} else {
			let mut fragments_received = vec![false; fragment_count as usize];
			fragments_received[fragment_number as usize] = true;

			let mut buffer = vec![0u8; total_length as usize];
			let end = (fragment_offset as usize + data_length).min(buffer.len());
			buffer[fragment_offset as usize..end].copy_from_slice(&trailing[..end - fragment_offset as usize]);

			let command = Command {
				kind,
				flags: if reliable { wire::COMMAND_FLAG_ACKNOWLEDGE } else { 0 },
				channel_id,
				reliable_sequence_number: start_sequence_number,
				unreliable_sequence_number: 0,
				unsequenced_group: 0,
				body: Vec::new(),
			};

			let incoming = IncomingCommand {
				reliable_sequence_number: start_sequence_number,
				unreliable_sequence_number: 0,
				command,
				buffer,
				fragment_count,
				fragments_remaining: fragment_count - 1,
				fragments_received,
			};

			if reliable {
				self.insert_reliable(id, channel_id, incoming);
			} else {
				self.peers[id].channels[channel_id as usize].incoming_unreliable_commands.push_back(incoming);
			}
		}

		if reliable {
			self.drain_contiguous_reliable(id, channel_id);
		}

		let _ = reliable_sequence_number;
		Ok(data_length)
	}

	fn handle_bandwidth_limit(&mut self, peer_id: Option<PeerId>, record: &[u8]) -> Result<()> {
		let id = peer_id.ok_or_else(|| warn!("BANDWIDTH_LIMIT without bound peer"))?;
		let limit: &wire::BandwidthLimit = cast(record);

		let peer = &mut self.peers[id];
		peer.incoming_bandwidth = limit.incoming_bandwidth.get();
		peer.outgoing_bandwidth = limit.outgoing_bandwidth.get();

		if peer.incoming_bandwidth == 0 && self.outgoing_bandwidth == 0 {
			peer.packet_throttle_limit = PEER_PACKET_THROTTLE_SCALE;
		}

		self.recalculate_bandwidth_limits = true;
		Ok(())
	}

	fn handle_throttle_configure(&mut self, peer_id: Option<PeerId>, record: &[u8]) -> Result<()> {
		let id = peer_id.ok_or_else(|| warn!("THROTTLE_CONFIGURE without bound peer"))?;
		let cfg: &wire::ThrottleConfigure = cast(record);

		self.peers[id].throttle_configure(cfg.packet_throttle_interval.get(), cfg.packet_throttle_acceleration.get(), cfg.packet_throttle_deceleration.get());
		Ok(())
	}

	/// Pushes a fully-assembled or freshly-reassembled reliable command into
	/// its channel queue, then drains the prefix of commands whose reliable
	/// sequence numbers are now contiguous, dispatching each in order
	/// (§4.2, §5 ordering guarantees).
	/// Inserts `incoming` into its channel's ordered reliable-assembly queue
	/// (sorted by sequence distance), dropping it silently if its sequence
	/// number is already queued (a retransmission of a command still
	/// awaiting completion or dispatch).
	fn insert_reliable(&mut self, peer_id: PeerId, channel_id: u8, incoming: IncomingCommand) {
		let channel = &mut self.peers[peer_id].channels[channel_id as usize];

		let pos = channel.incoming_reliable_commands.iter().position(|c| c.reliable_sequence_number == incoming.reliable_sequence_number);
		if pos.is_some() {
			return; // duplicate retransmission, already queued.
		}

		let insert_at = channel
			.incoming_reliable_commands
			.iter()
			.position(|c| c.reliable_sequence_number.wrapping_sub(incoming.reliable_sequence_number) < 0x8000)
			.unwrap_or(channel.incoming_reliable_commands.len());
		channel.incoming_reliable_commands.insert(insert_at, incoming);
	}

	fn queue_incoming_reliable(&mut self, peer_id: PeerId, channel_id: u8, incoming: IncomingCommand) {
		self.insert_reliable(peer_id, channel_id, incoming);
		self.drain_contiguous_reliable(peer_id, channel_id);
	}

	/// Dispatches the prefix of `incoming_reliable_commands` that is both
	/// complete and contiguous with the channel's current checkpoint, in
	/// order (§5 "delivered ... in strictly increasing reliable sequence
	/// order"). Each time the checkpoint advances, any `incoming_unreliable_
	/// commands` riding on that now-current reliable sequence number are
	/// released too, sorted by unreliable sequence number, and anything left
	/// over from an older checkpoint is dropped (§5, §4.3).
	fn drain_contiguous_reliable(&mut self, peer_id: PeerId, channel_id: u8) {
		loop {
			let channel = &self.peers[peer_id].channels[channel_id as usize];
			let Some(front) = channel.incoming_reliable_commands.front() else { break };

			let expected = channel.incoming_reliable_sequence_number.wrapping_add(1);
			if front.reliable_sequence_number != expected || !front.complete() {
				break;
			}

			let incoming = self.peers[peer_id].channels[channel_id as usize].incoming_reliable_commands.pop_front().unwrap();
			self.peers[peer_id].channels[channel_id as usize].incoming_reliable_sequence_number = expected;
			self.peers[peer_id].channels[channel_id as usize].incoming_unreliable_sequence_number = 0;

			let packet = incoming.into_packet(PacketFlags::RELIABLE);
			self.peers[peer_id].dispatched_commands.push_back((channel_id, packet));
			self.enqueue_dispatch(peer_id);

			self.release_unreliable_checkpoint(peer_id, channel_id, expected);
		}
	}

	/// Releases, in unreliable-sequence order, every parked unreliable
	/// command tied to the reliable sequence number that just became
	/// current; drops anything tied to an older, already-passed checkpoint.
	fn release_unreliable_checkpoint(&mut self, peer_id: PeerId, channel_id: u8, checkpoint: u16) {
		let mut ready = Vec::new();

		{
			let channel = &mut self.peers[peer_id].channels[channel_id as usize];
			let mut i = 0;
			while i < channel.incoming_unreliable_commands.len() {
				let seq = channel.incoming_unreliable_commands[i].reliable_sequence_number;
				let stale = seq != checkpoint && seq.wrapping_sub(checkpoint) >= 0x8000;

				if seq == checkpoint || stale {
					let entry = channel.incoming_unreliable_commands.remove(i).unwrap();
					if seq == checkpoint {
						ready.push(entry);
					}
				} else {
					i += 1;
				}
			}
		}

		ready.sort_by_key(|c| c.unreliable_sequence_number);

		for incoming in ready {
			self.peers[peer_id].channels[channel_id as usize].incoming_unreliable_sequence_number = incoming.unreliable_sequence_number;
			let packet = incoming.into_packet(PacketFlags::empty());
			self.peers[peer_id].dispatched_commands.push_back((channel_id, packet));
			self.enqueue_dispatch(peer_id);
		}
	}
}

