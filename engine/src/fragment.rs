//! Outbound fragmentation planning (§4.4).
//!
//! Adapted from `dspeyrer-net/net/src/ip/fragment.rs`'s offset-sorted IP
//! fragment model, simplified to ENet's uniform-fragment-length scheme:
//! every fragment but the last is exactly `fragment_length` bytes, all
//! fragments share a `start_sequence_number`, and reassembly tracks
//! completion with a remaining-count rather than a sorted gap list.

use crate::wire;

/// One planned outbound fragment: its index, byte offset and length
/// within the original packet.
#[derive(Clone, Copy, Debug)]
pub struct FragmentSpec {
	pub index: u32,
	pub offset: u32,
	pub length: u32,
}

/// The largest single-datagram payload that fits under `mtu`, reserving
/// room for the protocol header, a command header, the fixed portion of
/// a `SEND_FRAGMENT` record, and (if present) a trailing checksum.
pub fn max_fragment_length(mtu: usize, has_checksum: bool) -> usize {
	let overhead = 2 /* peer id */ + 2 /* sent time, worst case present */
		+ wire::CommandKind::SendFragment.size()
		+ if has_checksum { 4 } else { 0 };

	mtu.saturating_sub(overhead).max(1)
}

/// Splits a `total_length`-byte packet into uniform-length fragments, per
/// §4.4: all but the last fragment are exactly `fragment_length` bytes.
/// Returns `None` if the packet would need more than
/// `MAXIMUM_FRAGMENT_COUNT` fragments.
pub fn plan(total_length: usize, fragment_length: usize) -> Option<Vec<FragmentSpec>> {
	if fragment_length == 0 {
		return None;
	}

	let fragment_count = total_length.div_ceil(fragment_length).max(1);

	if fragment_count as u32 > wire::MAXIMUM_FRAGMENT_COUNT {
		return None;
	}

	let mut specs = Vec::with_capacity(fragment_count);
	let mut offset = 0usize;

	for index in 0..fragment_count {
		let length = fragment_length.min(total_length - offset);
		specs.push(FragmentSpec { index: index as u32, offset: offset as u32, length: length as u32 });
		offset += length;
	}

	Some(specs)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn uniform_fragments_cover_whole_packet() {
		let specs = plan(6666, 1400 - 36).unwrap();
		assert_eq!(specs.len(), 5);

		let total: u32 = specs.iter().map(|s| s.length).sum();
		assert_eq!(total, 6666);

		for (i, s) in specs.iter().enumerate() {
			assert_eq!(s.index, i as u32);
		}
	}

	#[test]
	fn single_fragment_for_small_packet() {
		let specs = plan(10, 1000).unwrap();
		assert_eq!(specs.len(), 1);
		assert_eq!(specs[0].length, 10);
	}
}
