//! Per-peer, per-channel sequencing state (§3 "Channel", §4.3).

use std::collections::VecDeque;

use crate::constants::*;
use crate::peer::IncomingCommand;

/// A logical sub-stream of a peer, numbered `0..=254` (channel id `0xFF` is
/// reserved for peer-wide reliable commands such as CONNECT/DISCONNECT).
pub struct Channel {
	pub outgoing_reliable_sequence_number: u16,
	pub outgoing_unreliable_sequence_number: u16,
	/// Bitmask of which of the 16 reliable windows currently hold
	/// in-flight commands (bit `i` ⇔ `reliable_windows[i] != 0`).
	pub used_reliable_windows: u16,
	/// Count of unacknowledged commands occupying each of the 16 windows
	/// of `PEER_RELIABLE_WINDOW_SIZE` (4096) sequence-number slots.
	pub reliable_windows: [u16; PEER_RELIABLE_WINDOWS],
	pub incoming_reliable_sequence_number: u16,
	pub incoming_unreliable_sequence_number: u16,
	/// Reassembled/whole reliable commands waiting on predecessors before
	/// they can be dispatched to the application in order.
	pub incoming_reliable_commands: VecDeque<IncomingCommand>,
	/// Unreliable commands waiting on the current reliable checkpoint.
	pub incoming_unreliable_commands: VecDeque<IncomingCommand>,
}

impl Channel {
	pub fn new() -> Self {
		Self {
			outgoing_reliable_sequence_number: 0,
			outgoing_unreliable_sequence_number: 0,
			used_reliable_windows: 0,
			reliable_windows: [0; PEER_RELIABLE_WINDOWS],
			incoming_reliable_sequence_number: 0,
			incoming_unreliable_sequence_number: 0,
			incoming_reliable_commands: VecDeque::new(),
			incoming_unreliable_commands: VecDeque::new(),
		}
	}

	/// `[currentWindow, currentWindow + FREE_WINDOWS - 1]` acceptance test
	/// for a reliable sequence number, per §4.3.
	pub fn reliable_window_in_range(&self, reliable_sequence_number: u16) -> bool {
		let window = reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE;
		let current_window = self.incoming_reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE;

		let relative = window.wrapping_sub(current_window) % (PEER_RELIABLE_WINDOWS as u16);

		(relative as usize) < PEER_FREE_RELIABLE_WINDOWS
	}
}

impl Default for Channel {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_current_and_free_windows() {
		let channel = Channel::new();
		assert!(channel.reliable_window_in_range(0));
		assert!(channel.reliable_window_in_range(PEER_RELIABLE_WINDOW_SIZE * (PEER_FREE_RELIABLE_WINDOWS as u16 - 1)));
	}

	#[test]
	fn rejects_window_beyond_free_range() {
		let channel = Channel::new();
		let too_far = PEER_RELIABLE_WINDOW_SIZE * PEER_FREE_RELIABLE_WINDOWS as u16;
		assert!(!channel.reliable_window_in_range(too_far));
	}

	#[test]
	fn rejects_window_already_passed() {
		let mut channel = Channel::new();
		channel.incoming_reliable_sequence_number = PEER_RELIABLE_WINDOW_SIZE * 5;
		assert!(!channel.reliable_window_in_range(0));
	}

	#[test]
	fn window_slides_with_incoming_sequence() {
		let mut channel = Channel::new();
		channel.incoming_reliable_sequence_number = PEER_RELIABLE_WINDOW_SIZE * 2;
		assert!(channel.reliable_window_in_range(PEER_RELIABLE_WINDOW_SIZE * 2));
		assert!(channel.reliable_window_in_range(PEER_RELIABLE_WINDOW_SIZE * (2 + PEER_FREE_RELIABLE_WINDOWS as u16 - 1)));
		assert!(!channel.reliable_window_in_range(PEER_RELIABLE_WINDOW_SIZE));
	}
}
