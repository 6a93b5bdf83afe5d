//! Command record builders (§4.1) and the inbound dispatch table (§4.9),
//! grounded on `original_source/devils_protocol.c`'s `devils_protocol_handle_*`
//! family.

use crate::constants::*;
use crate::peer::{Command, PeerState};
use crate::wire::{self, CommandKind};

fn header(kind: CommandKind, channel_id: u8, reliable_sequence_number: u16, ack: bool, unsequenced: bool) -> Command {
	let mut flags = 0u8;
	if ack {
		flags |= wire::COMMAND_FLAG_ACKNOWLEDGE;
	}
	if unsequenced {
		flags |= wire::COMMAND_FLAG_UNSEQUENCED;
	}

	Command {
		kind,
		flags,
		channel_id,
		reliable_sequence_number,
		unreliable_sequence_number: 0,
		unsequenced_group: 0,
		body: Vec::new(),
	}
}

pub fn build_acknowledge(channel_id: u8, reliable_sequence_number: u16, received_sent_time: u16) -> Command {
	let mut cmd = header(CommandKind::Acknowledge, channel_id, reliable_sequence_number, false, false);
	wire::push_u16(&mut cmd.body, reliable_sequence_number);
	wire::push_u16(&mut cmd.body, received_sent_time);
	cmd
}

#[allow(clippy::too_many_arguments)]
pub fn build_connect(
	outgoing_peer_id: u16,
	incoming_session_id: u8,
	outgoing_session_id: u8,
	mtu: u32,
	window_size: u32,
	channel_count: u32,
	incoming_bandwidth: u32,
	outgoing_bandwidth: u32,
	packet_throttle_interval: u32,
	packet_throttle_acceleration: u32,
	packet_throttle_deceleration: u32,
	connect_id: u32,
	data: u32,
) -> Command {
	let mut cmd = header(CommandKind::Connect, 0xFF, 0, true, false);
	wire::push_u16(&mut cmd.body, outgoing_peer_id);
	cmd.body.push(incoming_session_id);
	cmd.body.push(outgoing_session_id);
	for v in [
		mtu,
		window_size,
		channel_count,
		incoming_bandwidth,
		outgoing_bandwidth,
		packet_throttle_interval,
		packet_throttle_acceleration,
		packet_throttle_deceleration,
		connect_id,
		data,
	] {
		wire::push_u32(&mut cmd.body, v);
	}
	cmd
}

#[allow(clippy::too_many_arguments)]
pub fn build_verify_connect(
	outgoing_peer_id: u16,
	incoming_session_id: u8,
	outgoing_session_id: u8,
	mtu: u32,
	window_size: u32,
	channel_count: u32,
	incoming_bandwidth: u32,
	outgoing_bandwidth: u32,
	packet_throttle_interval: u32,
	packet_throttle_acceleration: u32,
	packet_throttle_deceleration: u32,
	connect_id: u32,
) -> Command {
	let mut cmd = header(CommandKind::VerifyConnect, 0xFF, 0, true, false);
	wire::push_u16(&mut cmd.body, outgoing_peer_id);
	cmd.body.push(incoming_session_id);
	cmd.body.push(outgoing_session_id);
	for v in [
		mtu,
		window_size,
		channel_count,
		incoming_bandwidth,
		outgoing_bandwidth,
		packet_throttle_interval,
		packet_throttle_acceleration,
		packet_throttle_deceleration,
		connect_id,
	] {
		wire::push_u32(&mut cmd.body, v);
	}
	cmd
}

pub fn build_disconnect(data: u32) -> Command {
	let mut cmd = header(CommandKind::Disconnect, 0xFF, 0, true, false);
	wire::push_u32(&mut cmd.body, data);
	cmd
}

pub fn build_disconnect_unsequenced(data: u32) -> Command {
	let mut cmd = header(CommandKind::Disconnect, 0xFF, 0, false, true);
	wire::push_u32(&mut cmd.body, data);
	cmd
}

pub fn build_ping() -> Command {
	header(CommandKind::Ping, 0xFF, 0, true, false)
}

pub fn build_send_reliable(channel_id: u8, data_length: u16) -> Command {
	let mut cmd = header(CommandKind::SendReliable, channel_id, 0, true, false);
	wire::push_u16(&mut cmd.body, data_length);
	cmd
}

/// The unreliable sequence number is written by `Command::encode` from
/// `cmd.unreliable_sequence_number`, which the caller fills in once
/// `Peer::next_unreliable_sequence_number` assigns it — `body` only ever
/// carries the trailing `data_length` field for this command.
pub fn build_send_unreliable(channel_id: u8, data_length: u16) -> Command {
	let mut cmd = header(CommandKind::SendUnreliable, channel_id, 0, false, false);
	wire::push_u16(&mut cmd.body, data_length);
	cmd
}

/// The unsequenced group is written by `Command::encode` from
/// `cmd.unsequenced_group`, filled in by the caller from
/// `Peer::next_unsequenced_group`.
pub fn build_send_unsequenced(channel_id: u8, data_length: u16) -> Command {
	let mut cmd = header(CommandKind::SendUnsequenced, channel_id, 0, false, true);
	wire::push_u16(&mut cmd.body, data_length);
	cmd
}

#[allow(clippy::too_many_arguments)]
pub fn build_send_fragment(
	channel_id: u8,
	reliable: bool,
	start_sequence_number: u16,
	data_length: u16,
	fragment_count: u32,
	fragment_number: u32,
	total_length: u32,
	fragment_offset: u32,
) -> Command {
	let kind = if reliable { CommandKind::SendFragment } else { CommandKind::SendUnreliableFragment };
	let mut cmd = header(kind, channel_id, 0, reliable, false);
	wire::push_u16(&mut cmd.body, start_sequence_number);
	wire::push_u16(&mut cmd.body, data_length);
	for v in [fragment_count, fragment_number, total_length, fragment_offset] {
		wire::push_u32(&mut cmd.body, v);
	}
	cmd
}

pub fn build_bandwidth_limit(incoming_bandwidth: u32, outgoing_bandwidth: u32) -> Command {
	let mut cmd = header(CommandKind::BandwidthLimit, 0xFF, 0, true, false);
	wire::push_u32(&mut cmd.body, incoming_bandwidth);
	wire::push_u32(&mut cmd.body, outgoing_bandwidth);
	cmd
}

pub fn build_throttle_configure(interval: u32, acceleration: u32, deceleration: u32) -> Command {
	let mut cmd = header(CommandKind::ThrottleConfigure, 0xFF, 0, true, false);
	for v in [interval, acceleration, deceleration] {
		wire::push_u32(&mut cmd.body, v);
	}
	cmd
}

/// Whether `state` denotes a peer that has completed its handshake and can
/// still receive/send application traffic (§4.2).
pub fn is_active(state: PeerState) -> bool {
	matches!(state, PeerState::Connected | PeerState::DisconnectLater)
}

pub fn clamp_channel_count(n: u32) -> usize {
	(n as usize).clamp(PROTOCOL_MIN_CHANNEL_COUNT, PROTOCOL_MAX_CHANNEL_COUNT)
}

pub fn clamp_mtu(n: u32) -> usize {
	(n as usize).clamp(wire::MINIMUM_MTU, wire::MAXIMUM_MTU)
}

pub fn clamp_window_size(n: u32) -> u32 {
	n.clamp(wire::MINIMUM_WINDOW_SIZE, wire::MAXIMUM_WINDOW_SIZE)
}
