//! Per-peer lifecycle, queues, sliding windows, RTT smoothing and the
//! bandwidth throttle (§3 "Peer", §4.2, §4.3, §4.5, §4.6).
//!
//! Grounded on `original_source/devils_peer.c` for the algorithms; the
//! sliding-window bitmask shape is adapted from `dspeyrer-net`'s
//! `tunnel/window.rs` anti-replay window, generalized from a monotonic
//! window to ENet's bounded 16×4096 reliable / 32×1024-bit unsequenced
//! circular windows. Intrusive list splicing (§9 REDESIGN FLAGS) is
//! replaced throughout by owned `VecDeque`s.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::channel::Channel;
use crate::constants::*;
use crate::packet::Packet;
use crate::wire;
use crate::wire::MAXIMUM_PEER_ID;

/// A stable handle identifying a peer slot within `Host.peers`. Distinct
/// from the wire-level 12-bit peer id exchanged in datagram headers,
/// which is reused across connections; `PeerId` is just the slot index.
pub type PeerId = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PeerState {
	Disconnected,
	Connecting,
	AcknowledgingConnect,
	ConnectionPending,
	ConnectionSucceeded,
	Connected,
	DisconnectLater,
	Disconnecting,
	AcknowledgingDisconnect,
	Zombie,
}

impl PeerState {
	pub fn is_terminal(self) -> bool {
		matches!(self, PeerState::Disconnected | PeerState::Zombie)
	}
}

/// A command record plus whatever packet bytes trail it, ready to be
/// written to the wire or still pending a slot in the window.
#[derive(Clone)]
pub struct Command {
	pub kind: wire::CommandKind,
	pub flags: u8,
	pub channel_id: u8,
	pub reliable_sequence_number: u16,
	pub unreliable_sequence_number: u16,
	pub unsequenced_group: u16,
	/// Extra fixed-layout fields a given command kind carries, encoded
	/// ready for `push`; kept as pre-serialized bytes so `Command` stays a
	/// single homogeneous type across all 12 wire records.
	pub body: Vec<u8>,
}

impl Command {
	/// Serializes the generic command header followed by this command's
	/// pre-encoded kind-specific fields (§4.1).
	///
	/// `SEND_UNRELIABLE`/`SEND_UNSEQUENCED` carry a sequence field
	/// (unreliable sequence number / unsequenced group) that is only known
	/// once the command is actually admitted to the send path (see
	/// `Peer::next_unreliable_sequence_number`/`next_unsequenced_group`),
	/// so it is written here from `self.unreliable_sequence_number`/
	/// `self.unsequenced_group` rather than baked into `body` at build time.
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(self.wire_size());
		buf.push(self.kind as u8 | self.flags);
		buf.push(self.channel_id);
		wire::push_u16(&mut buf, self.reliable_sequence_number);
		match self.kind {
			wire::CommandKind::SendUnreliable => wire::push_u16(&mut buf, self.unreliable_sequence_number),
			wire::CommandKind::SendUnsequenced => wire::push_u16(&mut buf, self.unsequenced_group),
			_ => {}
		}
		buf.extend_from_slice(&self.body);
		buf
	}

	fn sequence_field_size(&self) -> usize {
		match self.kind {
			wire::CommandKind::SendUnreliable | wire::CommandKind::SendUnsequenced => 2,
			_ => 0,
		}
	}

	pub fn wire_size(&self) -> usize {
		4 + self.sequence_field_size() + self.body.len()
	}
}

/// An enqueued, unsent-or-awaiting-ack command (§3 "Outgoing command").
pub struct OutgoingCommand {
	pub command: Command,
	pub packet: Option<Packet>,
	pub fragment_offset: u32,
	pub fragment_length: u16,
	pub send_attempts: u32,
	pub sent_time: u32,
	pub round_trip_timeout: u32,
	pub round_trip_timeout_limit: u32,
}

/// A received-or-assembling command (§3 "Incoming command").
///
/// `buffer` holds the receive packet being assembled: for a
/// non-fragmented command it is already complete on construction; for a
/// fragmented one it is allocated to `totalLength` up front and filled in
/// as fragments arrive (§4.4).
pub struct IncomingCommand {
	pub reliable_sequence_number: u16,
	pub unreliable_sequence_number: u16,
	pub command: Command,
	pub buffer: Vec<u8>,
	pub fragment_count: u32,
	pub fragments_remaining: u32,
	pub fragments_received: Vec<bool>,
}

impl IncomingCommand {
	/// True once every fragment of a multi-fragment command has arrived
	/// (or immediately, for a non-fragmented command).
	pub fn complete(&self) -> bool {
		self.fragments_remaining == 0
	}

	/// Writes one fragment's payload into the assembly buffer at
	/// `offset`, marking its bit and decrementing the remaining count.
	/// Duplicate fragments (bit already set) are ignored.
	pub fn write_fragment(&mut self, fragment_number: u32, offset: usize, data: &[u8]) {
		let idx = fragment_number as usize;

		if idx >= self.fragments_received.len() || self.fragments_received[idx] {
			return;
		}

		self.fragments_received[idx] = true;
		self.fragments_remaining -= 1;

		let end = (offset + data.len()).min(self.buffer.len());
		if offset < end {
			self.buffer[offset..end].copy_from_slice(&data[..end - offset]);
		}
	}

	pub fn into_packet(self, flags: crate::packet::PacketFlags) -> Packet {
		Packet::new(&self.buffer, flags)
	}
}

pub struct Peer {
	pub outgoing_peer_id: u16,
	pub incoming_peer_id: u16,
	pub connect_id: u32,
	pub outgoing_session_id: u8,
	pub incoming_session_id: u8,
	pub address: SocketAddr,
	pub state: PeerState,
	pub channels: Vec<Channel>,

	pub incoming_bandwidth: u32,
	pub outgoing_bandwidth: u32,
	pub incoming_bandwidth_throttle_epoch: u32,
	pub outgoing_bandwidth_throttle_epoch: u32,
	pub incoming_data_total: u32,
	pub outgoing_data_total: u32,

	pub last_send_time: u32,
	pub last_receive_time: u32,
	pub next_timeout: u32,
	pub earliest_timeout: u32,
	pub packet_loss_epoch: u32,
	pub packets_sent: u32,
	pub packets_lost: u32,
	pub packet_loss: u32,
	pub packet_loss_variance: u32,

	pub packet_throttle: u32,
	pub packet_throttle_limit: u32,
	pub packet_throttle_counter: u32,
	pub packet_throttle_epoch: u32,
	pub packet_throttle_acceleration: u32,
	pub packet_throttle_deceleration: u32,
	pub packet_throttle_interval: u32,

	pub ping_interval: u32,
	pub timeout_limit: u32,
	pub timeout_minimum: u32,
	pub timeout_maximum: u32,

	pub last_round_trip_time: u32,
	pub lowest_round_trip_time: u32,
	pub last_round_trip_time_variance: u32,
	pub highest_round_trip_time_variance: u32,
	pub round_trip_time: u32,
	pub round_trip_time_variance: u32,

	pub mtu: usize,
	pub window_size: u32,
	pub reliable_data_in_transit: u32,
	pub outgoing_reliable_sequence_number: u16,

	pub acknowledgements: VecDeque<Acknowledgement>,
	pub sent_reliable_commands: VecDeque<OutgoingCommand>,
	pub sent_unreliable_commands: VecDeque<OutgoingCommand>,
	pub outgoing_commands: VecDeque<OutgoingCommand>,
	pub dispatched_commands: VecDeque<(u8, Packet)>,

	pub needs_dispatch: bool,

	pub incoming_unsequenced_group: u16,
	pub outgoing_unsequenced_group: u16,
	/// 1024-bit receive window for unsequenced commands, 32 words of 32 bits.
	pub unsequenced_window: [u32; PEER_UNSEQUENCED_WINDOW_SIZE as usize / 32],

	pub event_data: u32,
	pub total_waiting_data: usize,
}

pub struct Acknowledgement {
	pub command: Command,
	pub sent_time: u32,
}

impl Peer {
	pub fn new(channel_count: usize, mtu: usize, address: SocketAddr) -> Self {
		Self {
			outgoing_peer_id: MAXIMUM_PEER_ID,
			incoming_peer_id: 0,
			connect_id: 0,
			outgoing_session_id: 0xFF,
			incoming_session_id: 0xFF,
			address,
			state: PeerState::Disconnected,
			channels: (0..channel_count).map(|_| Channel::new()).collect(),

			incoming_bandwidth: 0,
			outgoing_bandwidth: 0,
			incoming_bandwidth_throttle_epoch: 0,
			outgoing_bandwidth_throttle_epoch: 0,
			incoming_data_total: 0,
			outgoing_data_total: 0,

			last_send_time: 0,
			last_receive_time: 0,
			next_timeout: 0,
			earliest_timeout: 0,
			packet_loss_epoch: 0,
			packets_sent: 0,
			packets_lost: 0,
			packet_loss: 0,
			packet_loss_variance: 0,

			packet_throttle: PEER_PACKET_THROTTLE_SCALE,
			packet_throttle_limit: PEER_PACKET_THROTTLE_SCALE,
			packet_throttle_counter: 0,
			packet_throttle_epoch: 0,
			packet_throttle_acceleration: PEER_PACKET_THROTTLE_ACCELERATION,
			packet_throttle_deceleration: PEER_PACKET_THROTTLE_DECELERATION,
			packet_throttle_interval: PEER_PACKET_THROTTLE_INTERVAL,

			ping_interval: PEER_PING_INTERVAL,
			timeout_limit: PEER_TIMEOUT_LIMIT,
			timeout_minimum: PEER_TIMEOUT_MINIMUM,
			timeout_maximum: PEER_TIMEOUT_MAXIMUM,

			last_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
			lowest_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
			last_round_trip_time_variance: 0,
			highest_round_trip_time_variance: 0,
			round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
			round_trip_time_variance: 0,

			mtu,
			window_size: PEER_WINDOW_SIZE_SCALE,
			reliable_data_in_transit: 0,
			outgoing_reliable_sequence_number: 0,

			acknowledgements: VecDeque::new(),
			sent_reliable_commands: VecDeque::new(),
			sent_unreliable_commands: VecDeque::new(),
			outgoing_commands: VecDeque::new(),
			dispatched_commands: VecDeque::new(),

			needs_dispatch: false,

			incoming_unsequenced_group: 0,
			outgoing_unsequenced_group: 0,
			unsequenced_window: [0; PEER_UNSEQUENCED_WINDOW_SIZE as usize / 32],

			event_data: 0,
			total_waiting_data: 0,
		}
	}

	pub fn channel_count(&self) -> usize {
		self.channels.len()
	}

	/// Mean packet loss over the last `PEER_PACKET_LOSS_INTERVAL` window,
	/// scaled by `PEER_PACKET_LOSS_SCALE` (§4.5). `packet_loss_variance` is
	/// scaled the same way.
	pub fn packet_loss(&self) -> u32 {
		self.packet_loss
	}

	/// Drains every queue and resets sequencing/throttle state, releasing
	/// packet references as each entry is dropped (§3 "On peer reset").
	pub fn reset_queues(&mut self) {
		self.acknowledgements.clear();
		self.sent_reliable_commands.clear();
		self.sent_unreliable_commands.clear();
		self.outgoing_commands.clear();
		self.dispatched_commands.clear();
		self.needs_dispatch = false;

		for channel in &mut self.channels {
			channel.incoming_reliable_commands.clear();
			channel.incoming_unreliable_commands.clear();
		}
	}

	pub fn reset(&mut self) {
		self.outgoing_peer_id = MAXIMUM_PEER_ID;
		self.connect_id = 0;
		self.state = PeerState::Disconnected;
		self.incoming_bandwidth = 0;
		self.outgoing_bandwidth = 0;
		self.incoming_bandwidth_throttle_epoch = 0;
		self.outgoing_bandwidth_throttle_epoch = 0;
		self.incoming_data_total = 0;
		self.outgoing_data_total = 0;
		self.last_send_time = 0;
		self.last_receive_time = 0;
		self.next_timeout = 0;
		self.earliest_timeout = 0;
		self.packet_loss_epoch = 0;
		self.packets_sent = 0;
		self.packets_lost = 0;
		self.packet_loss = 0;
		self.packet_loss_variance = 0;
		self.packet_throttle = PEER_PACKET_THROTTLE_SCALE;
		self.packet_throttle_limit = PEER_PACKET_THROTTLE_SCALE;
		self.packet_throttle_counter = 0;
		self.packet_throttle_epoch = 0;
		self.packet_throttle_acceleration = PEER_PACKET_THROTTLE_ACCELERATION;
		self.packet_throttle_deceleration = PEER_PACKET_THROTTLE_DECELERATION;
		self.packet_throttle_interval = PEER_PACKET_THROTTLE_INTERVAL;
		self.ping_interval = PEER_PING_INTERVAL;
		self.timeout_limit = PEER_TIMEOUT_LIMIT;
		self.timeout_minimum = PEER_TIMEOUT_MINIMUM;
		self.timeout_maximum = PEER_TIMEOUT_MAXIMUM;
		self.last_round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
		self.lowest_round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
		self.last_round_trip_time_variance = 0;
		self.highest_round_trip_time_variance = 0;
		self.round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
		self.round_trip_time_variance = 0;
		self.reliable_data_in_transit = 0;
		self.outgoing_reliable_sequence_number = 0;
		self.incoming_unsequenced_group = 0;
		self.outgoing_unsequenced_group = 0;
		self.unsequenced_window = [0; PEER_UNSEQUENCED_WINDOW_SIZE as usize / 32];
		self.event_data = 0;
		self.total_waiting_data = 0;

		for channel in &mut self.channels {
			*channel = Channel::new();
		}

		self.reset_queues();
	}

	pub fn throttle_configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
		self.packet_throttle_interval = interval;
		self.packet_throttle_acceleration = acceleration;
		self.packet_throttle_deceleration = deceleration;
	}

	/// Adapts the throttle on receipt of an ACK (§4.6). Returns whether the
	/// throttle increased (`Some(true)`), decreased (`Some(false)`), or was
	/// left unchanged (`None`), mirroring `devils_peer_throttle`'s
	/// tri-state return.
	pub fn throttle(&mut self, rtt: u32) -> Option<bool> {
		if self.last_round_trip_time <= self.last_round_trip_time_variance {
			self.packet_throttle = self.packet_throttle_limit;
			return None;
		}

		if rtt <= self.last_round_trip_time {
			self.packet_throttle = (self.packet_throttle + self.packet_throttle_acceleration).min(self.packet_throttle_limit);
			return Some(true);
		}

		if rtt > self.last_round_trip_time + 2 * self.last_round_trip_time_variance {
			self.packet_throttle = self.packet_throttle.saturating_sub(self.packet_throttle_deceleration);
			return Some(false);
		}

		None
	}

	/// Running RTT/variance update on receipt of an acknowledgement (§4.5).
	pub fn update_round_trip_time(&mut self, rtt: u32) {
		self.round_trip_time_variance -= self.round_trip_time_variance / 4;

		if rtt >= self.round_trip_time {
			let diff = rtt - self.round_trip_time;
			self.round_trip_time_variance += diff / 4;
			self.round_trip_time += diff / 8;
		} else {
			let diff = self.round_trip_time - rtt;
			self.round_trip_time_variance += diff / 4;
			self.round_trip_time -= diff / 8;
		}

		if self.round_trip_time < self.lowest_round_trip_time {
			self.lowest_round_trip_time = self.round_trip_time;
		}

		if self.round_trip_time_variance > self.highest_round_trip_time_variance {
			self.highest_round_trip_time_variance = self.round_trip_time_variance;
		}
	}

	/// Rolls the lowest-RTT/highest-variance accumulators into the "last"
	/// baseline every `packet_throttle_interval` ms, per §4.5.
	pub fn roll_round_trip_baseline(&mut self) {
		self.last_round_trip_time = self.lowest_round_trip_time;
		self.last_round_trip_time_variance = self.highest_round_trip_time_variance.max(1);
		self.lowest_round_trip_time = self.round_trip_time;
		self.highest_round_trip_time_variance = self.round_trip_time_variance;
		self.packet_throttle_epoch = 0; // caller stamps the real epoch
	}

	/// Whether an unreliable packet should be sent this time, per the
	/// `PACKET_THROTTLE_COUNTER` modulo-scale coin flip in §4.6.
	pub fn should_send_unreliable(&mut self) -> bool {
		self.packet_throttle_counter = (self.packet_throttle_counter + PEER_PACKET_THROTTLE_COUNTER) % PEER_PACKET_THROTTLE_SCALE;
		self.packet_throttle_counter <= self.packet_throttle
	}

	/// Assigns the next reliable sequence number on `channel_id`, occupying
	/// a slot in its sliding window (§4.3).
	pub fn next_reliable_sequence_number(&mut self, channel_id: u8) -> u16 {
		let channel = &mut self.channels[channel_id as usize];
		channel.outgoing_reliable_sequence_number = channel.outgoing_reliable_sequence_number.wrapping_add(1);
		channel.outgoing_reliable_sequence_number
	}

	/// Assigns the next unreliable sequence number on `channel_id`, tied to
	/// the channel's *current* (not incremented) reliable sequence number.
	pub fn next_unreliable_sequence_number(&mut self, channel_id: u8) -> (u16, u16) {
		let channel = &mut self.channels[channel_id as usize];
		channel.outgoing_unreliable_sequence_number = channel.outgoing_unreliable_sequence_number.wrapping_add(1);
		(channel.outgoing_reliable_sequence_number, channel.outgoing_unreliable_sequence_number)
	}

	/// Assigns the next reliable sequence number for a peer-wide command
	/// (CONNECT, DISCONNECT, PING, ACKNOWLEDGE, BANDWIDTH_LIMIT,
	/// THROTTLE_CONFIGURE — wire channel id `0xFF`), which is not subject to
	/// any channel's sliding window.
	pub fn next_peer_reliable_sequence_number(&mut self) -> u16 {
		self.outgoing_reliable_sequence_number = self.outgoing_reliable_sequence_number.wrapping_add(1);
		self.outgoing_reliable_sequence_number
	}

	pub fn next_unsequenced_group(&mut self) -> u16 {
		self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
		self.outgoing_unsequenced_group
	}

	pub fn queue_outgoing(&mut self, command: Command, packet: Option<Packet>, fragment_offset: u32, fragment_length: u16) {
		self.outgoing_commands.push_back(OutgoingCommand {
			command,
			packet,
			fragment_offset,
			fragment_length,
			send_attempts: 0,
			sent_time: 0,
			round_trip_timeout: 0,
			round_trip_timeout_limit: 0,
		});
	}

	/// Marks this peer as needing to be visited by the dispatch queue,
	/// returning whether it wasn't already marked (§4.10).
	pub fn dispatch(&mut self) -> bool {
		if self.needs_dispatch {
			false
		} else {
			self.needs_dispatch = true;
			true
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn new_peer() -> Peer {
		Peer::new(2, HOST_DEFAULT_MTU, "127.0.0.1:0".parse().unwrap())
	}

	#[test]
	fn throttle_increases_when_rtt_stays_low() {
		let mut peer = new_peer();
		peer.packet_throttle = 16;
		peer.last_round_trip_time = 100;
		peer.last_round_trip_time_variance = 10;

		assert_eq!(peer.throttle(50), Some(true));
		assert_eq!(peer.packet_throttle, 16 + PEER_PACKET_THROTTLE_ACCELERATION);
	}

	#[test]
	fn throttle_decreases_when_rtt_spikes() {
		let mut peer = new_peer();
		peer.packet_throttle = 16;
		peer.last_round_trip_time = 100;
		peer.last_round_trip_time_variance = 10;

		assert_eq!(peer.throttle(1000), Some(false));
		assert_eq!(peer.packet_throttle, 16 - PEER_PACKET_THROTTLE_DECELERATION);
	}

	#[test]
	fn throttle_floors_at_zero() {
		let mut peer = new_peer();
		peer.packet_throttle = 1;
		peer.last_round_trip_time = 100;
		peer.last_round_trip_time_variance = 10;

		peer.throttle(10_000);
		assert_eq!(peer.packet_throttle, 0);
	}

	#[test]
	fn throttle_monotonicity_in_steady_state() {
		// §8 "Throttle monotonicity in steady state": RTT held constant at
		// `r` with zero variance should walk the throttle up to its limit.
		let mut peer = new_peer();
		peer.packet_throttle = 0;
		peer.packet_throttle_limit = PEER_PACKET_THROTTLE_SCALE;
		peer.last_round_trip_time = 50;
		peer.last_round_trip_time_variance = 0;

		for _ in 0..64 {
			peer.throttle(50);
		}

		assert_eq!(peer.packet_throttle, PEER_PACKET_THROTTLE_SCALE);
	}

	#[test]
	fn round_trip_time_converges_toward_repeated_sample() {
		let mut peer = new_peer();
		let initial = peer.round_trip_time;
		assert_eq!(initial, PEER_DEFAULT_ROUND_TRIP_TIME);

		for _ in 0..200 {
			peer.update_round_trip_time(100);
		}

		// The `diff/8` smoothing term floors to zero once the estimate is
		// within 8ms of the sample, so convergence stalls there rather than
		// reaching the sample exactly.
		assert!((peer.round_trip_time as i64 - 100).abs() <= 8, "rtt settled at {}", peer.round_trip_time);
		assert_eq!(peer.lowest_round_trip_time, peer.round_trip_time);
	}

	#[test]
	fn reliable_sequence_numbers_increment_per_channel() {
		let mut peer = new_peer();
		assert_eq!(peer.next_reliable_sequence_number(0), 1);
		assert_eq!(peer.next_reliable_sequence_number(0), 2);
		assert_eq!(peer.next_reliable_sequence_number(1), 1);
	}

	#[test]
	fn unreliable_sequence_number_ties_to_current_reliable() {
		let mut peer = new_peer();
		peer.next_reliable_sequence_number(0);
		let (reliable, unreliable) = peer.next_unreliable_sequence_number(0);
		assert_eq!(reliable, 1);
		assert_eq!(unreliable, 1);
	}

	#[test]
	fn dispatch_marks_once() {
		let mut peer = new_peer();
		assert!(peer.dispatch());
		assert!(!peer.dispatch());
	}

	#[test]
	fn reset_clears_queues_and_sequence_state() {
		let mut peer = new_peer();
		peer.next_reliable_sequence_number(0);
		peer.outgoing_commands.push_back(OutgoingCommand {
			command: Command {
				kind: crate::wire::CommandKind::Ping,
				flags: 0,
				channel_id: 0xFF,
				reliable_sequence_number: 0,
				unreliable_sequence_number: 0,
				unsequenced_group: 0,
				body: Vec::new(),
			},
			packet: None,
			fragment_offset: 0,
			fragment_length: 0,
			send_attempts: 0,
			sent_time: 0,
			round_trip_timeout: 0,
			round_trip_timeout_limit: 0,
		});

		peer.reset();

		assert!(peer.outgoing_commands.is_empty());
		assert_eq!(peer.channels[0].outgoing_reliable_sequence_number, 0);
		assert_eq!(peer.state, PeerState::Disconnected);
	}
}
