//! The 32-bit wrapping millisecond clock sampled at the host's external
//! service points.

use std::time::Instant;

/// An epoch against which [`Clock::now`] measures elapsed milliseconds,
/// wrapping at `u32::MAX` the same way the wire `sentTime` field does.
pub struct Clock {
	start: Instant,
}

impl Clock {
	/// Captures the current instant as the clock's zero point.
	pub fn new() -> Self {
		Self { start: Instant::now() }
	}

	/// Milliseconds elapsed since the clock was created, truncated to 32 bits.
	pub fn now(&self) -> u32 {
		self.start.elapsed().as_millis() as u32
	}
}

impl Default for Clock {
	fn default() -> Self {
		Self::new()
	}
}

/// The overflow constant wrap-safe comparisons below are defined against
/// (§6): half a day in milliseconds. Two timestamps more than this far
/// apart, in either direction, are considered to have wrapped rather than
/// to be genuinely that far apart.
pub const OVERFLOW: u32 = 86_400_000;

/// `a` is "before" `b` on the wrapping 32-bit clock: true both for the
/// ordinary case and for the case where `b` has wrapped past `a`.
pub fn less(a: u32, b: u32) -> bool {
	a.wrapping_sub(b) >= OVERFLOW
}

/// `a` is "after" `b`, i.e. `less(b, a)`.
pub fn greater(a: u32, b: u32) -> bool {
	less(b, a)
}

/// Wrap-safe distance between two clock samples: the smaller of the two
/// directed differences.
pub fn difference(a: u32, b: u32) -> u32 {
	a.wrapping_sub(b).min(b.wrapping_sub(a))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn less_holds_across_forward_offsets() {
		let a: u32 = 0xFFFF_0000;
		for k in [1u32, 1000, OVERFLOW - 1] {
			assert!(less(a, a.wrapping_add(k)), "k={k}");
		}
	}

	#[test]
	fn difference_matches_offset_below_overflow() {
		let a: u32 = 12_345;
		for k in [1u32, 1000, OVERFLOW - 1] {
			assert_eq!(difference(a, a.wrapping_add(k)), k, "k={k}");
		}
	}

	#[test]
	fn difference_is_symmetric() {
		assert_eq!(difference(100, 200), difference(200, 100));
	}
}
