//! Wire layout for the protocol header and the twelve command records.
//!
//! Every struct here is `#[repr(C, packed)]` with `Cast`/`Unaligned`
//! derived, exactly the way the teacher's own `packet.rs` laid out its
//! handshake messages: a zero-copy view over a received byte slice, cast
//! in place rather than parsed field-by-field. All multi-byte fields are
//! big-endian (network byte order), matching `DEVILS_HOST_TO_NET_16/32`.

use utils::bytes::Cast;
use utils::endian::{u16be, u32be};

pub const MINIMUM_MTU: usize = 576;
pub const MAXIMUM_MTU: usize = 4096;
pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
pub const MINIMUM_CHANNEL_COUNT: usize = 1;
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
pub const MAXIMUM_PEER_ID: u16 = 0x0FFF;
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

/// Command discriminant, occupying the low 4 bits of the command+flags byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CommandKind {
	Nothing = 0,
	Acknowledge = 1,
	Connect = 2,
	VerifyConnect = 3,
	Disconnect = 4,
	Ping = 5,
	SendReliable = 6,
	SendUnreliable = 7,
	SendFragment = 8,
	SendUnsequenced = 9,
	BandwidthLimit = 10,
	ThrottleConfigure = 11,
	SendUnreliableFragment = 12,
}

pub const COMMAND_MASK: u8 = 0x0F;
pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;

pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
pub const HEADER_SESSION_SHIFT: u16 = 12;
pub const HEADER_SESSION_MASK: u16 = 3 << HEADER_SESSION_SHIFT;

impl CommandKind {
	pub fn from_u8(v: u8) -> Option<Self> {
		use CommandKind::*;
		Some(match v & COMMAND_MASK {
			0 => Nothing,
			1 => Acknowledge,
			2 => Connect,
			3 => VerifyConnect,
			4 => Disconnect,
			5 => Ping,
			6 => SendReliable,
			7 => SendUnreliable,
			8 => SendFragment,
			9 => SendUnsequenced,
			10 => BandwidthLimit,
			11 => ThrottleConfigure,
			12 => SendUnreliableFragment,
			_ => return None,
		})
	}

	/// Fixed size, in bytes, of this command's record (header included,
	/// payload bytes that trail the record excluded).
	pub fn size(self) -> usize {
		use core::mem::size_of;
		use CommandKind::*;
		match self {
			Nothing => 0,
			Acknowledge => size_of::<Acknowledge>(),
			Connect => size_of::<Connect>(),
			VerifyConnect => size_of::<VerifyConnect>(),
			Disconnect => size_of::<Disconnect>(),
			Ping => size_of::<Ping>(),
			SendReliable => size_of::<SendReliable>(),
			SendUnreliable => size_of::<SendUnreliable>(),
			SendFragment | SendUnreliableFragment => size_of::<SendFragment>(),
			SendUnsequenced => size_of::<SendUnsequenced>(),
			BandwidthLimit => size_of::<BandwidthLimit>(),
			ThrottleConfigure => size_of::<ThrottleConfigure>(),
		}
	}
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct Header {
	/// Bits 0..12 target peer id (0xFFF = none yet), bits 12..14 session id,
	/// bit 14 `COMPRESSED`, bit 15 `SENT_TIME`.
	pub peer_id: u16be,
	/// Only present on the wire when `HEADER_FLAG_SENT_TIME` is set; callers
	/// must not read this field unless they know the flag was set.
	pub sent_time: u16be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct CommandHeader {
	/// Low 4 bits: [`CommandKind`]. Bit 6: `UNSEQUENCED`. Bit 7: `ACKNOWLEDGE`.
	pub command: u8,
	pub channel_id: u8,
	pub reliable_sequence_number: u16be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct Acknowledge {
	pub header: CommandHeader,
	pub received_reliable_sequence_number: u16be,
	pub received_sent_time: u16be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct Connect {
	pub header: CommandHeader,
	pub outgoing_peer_id: u16be,
	pub incoming_session_id: u8,
	pub outgoing_session_id: u8,
	pub mtu: u32be,
	pub window_size: u32be,
	pub channel_count: u32be,
	pub incoming_bandwidth: u32be,
	pub outgoing_bandwidth: u32be,
	pub packet_throttle_interval: u32be,
	pub packet_throttle_acceleration: u32be,
	pub packet_throttle_deceleration: u32be,
	pub connect_id: u32be,
	pub data: u32be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct VerifyConnect {
	pub header: CommandHeader,
	pub outgoing_peer_id: u16be,
	pub incoming_session_id: u8,
	pub outgoing_session_id: u8,
	pub mtu: u32be,
	pub window_size: u32be,
	pub channel_count: u32be,
	pub incoming_bandwidth: u32be,
	pub outgoing_bandwidth: u32be,
	pub packet_throttle_interval: u32be,
	pub packet_throttle_acceleration: u32be,
	pub packet_throttle_deceleration: u32be,
	pub connect_id: u32be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct BandwidthLimit {
	pub header: CommandHeader,
	pub incoming_bandwidth: u32be,
	pub outgoing_bandwidth: u32be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct ThrottleConfigure {
	pub header: CommandHeader,
	pub packet_throttle_interval: u32be,
	pub packet_throttle_acceleration: u32be,
	pub packet_throttle_deceleration: u32be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct Disconnect {
	pub header: CommandHeader,
	pub data: u32be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct Ping {
	pub header: CommandHeader,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct SendReliable {
	pub header: CommandHeader,
	pub data_length: u16be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct SendUnreliable {
	pub header: CommandHeader,
	pub unreliable_sequence_number: u16be,
	pub data_length: u16be,
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct SendUnsequenced {
	pub header: CommandHeader,
	pub unsequenced_group: u16be,
	pub data_length: u16be,
}

pub fn push_u16(buf: &mut Vec<u8>, v: u16) {
	buf.extend_from_slice(&v.to_be_bytes());
}

pub fn push_u32(buf: &mut Vec<u8>, v: u32) {
	buf.extend_from_slice(&v.to_be_bytes());
}

#[derive(Clone, Copy, Cast)]
#[repr(C, packed)]
pub struct SendFragment {
	pub header: CommandHeader,
	pub start_sequence_number: u16be,
	pub data_length: u16be,
	pub fragment_count: u32be,
	pub fragment_number: u32be,
	pub total_length: u32be,
	pub fragment_offset: u32be,
}

#[cfg(test)]
mod tests {
	use super::*;
	use utils::bytes::cast;

	#[test]
	fn command_kind_round_trips_through_the_low_nibble() {
		for kind in [
			CommandKind::Acknowledge,
			CommandKind::Connect,
			CommandKind::VerifyConnect,
			CommandKind::Disconnect,
			CommandKind::Ping,
			CommandKind::SendReliable,
			CommandKind::SendUnreliable,
			CommandKind::SendFragment,
			CommandKind::SendUnsequenced,
			CommandKind::BandwidthLimit,
			CommandKind::ThrottleConfigure,
			CommandKind::SendUnreliableFragment,
		] {
			let byte = kind as u8 | COMMAND_FLAG_ACKNOWLEDGE;
			assert_eq!(CommandKind::from_u8(byte), Some(kind));
		}
	}

	#[test]
	fn illegal_command_id_is_rejected() {
		assert_eq!(CommandKind::from_u8(13), None);
		assert_eq!(CommandKind::from_u8(15), None);
	}

	#[test]
	fn connect_record_casts_over_its_encoded_bytes() {
		let mut buf = Vec::new();
		buf.push(CommandKind::Connect as u8 | COMMAND_FLAG_ACKNOWLEDGE);
		buf.push(0xFF);
		push_u16(&mut buf, 7); // reliable_sequence_number

		push_u16(&mut buf, 42); // outgoing_peer_id
		buf.push(1); // incoming_session_id
		buf.push(2); // outgoing_session_id
		for v in [1400u32, 65536, 2, 0, 0, 5000, 2, 2, 0xDEAD_BEEF, 99] {
			push_u32(&mut buf, v);
		}

		let record: &Connect = cast(&buf[..]);
		assert_eq!(record.header.channel_id, 0xFF);
		assert_eq!(record.header.reliable_sequence_number.get(), 7);
		assert_eq!(record.outgoing_peer_id.get(), 42);
		assert_eq!(record.incoming_session_id, 1);
		assert_eq!(record.mtu.get(), 1400);
		assert_eq!(record.connect_id.get(), 0xDEAD_BEEF);
		assert_eq!(record.data.get(), 99);
	}

	#[test]
	fn header_peer_id_bitfield_layout() {
		let mut buf = Vec::new();
		let peer_word = 42u16 | (2u16 << HEADER_SESSION_SHIFT) | HEADER_FLAG_SENT_TIME;
		push_u16(&mut buf, peer_word);
		push_u16(&mut buf, 0x1234);

		let header: &Header = cast(&buf[..]);
		let word = header.peer_id.get();
		assert_eq!(word & MAXIMUM_PEER_ID, 42);
		assert_eq!((word & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT, 2);
		assert_ne!(word & HEADER_FLAG_SENT_TIME, 0);
		assert_eq!(header.sent_time.get(), 0x1234);
	}
}
