//! The application payload carrier (§3 "Packet").
//!
//! Grounded on the teacher's refcounted buffer types
//! (`dspeyrer-net/collections/src/bytes/rc`) for the shape of the
//! invariant — "destroyed exactly when the last reference drops" — but
//! reimplemented directly on `std::rc::Rc` since nothing else in this
//! tree needs a custom allocator or serde support. `NO_ALLOCATE` borrows
//! are modeled by keeping the caller's bytes behind a raw pointer rather
//! than copying into a fresh owned allocation, and by running the
//! free-callback exactly once on drop of the last clone.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

bitflags::bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
	pub struct PacketFlags: u8 {
		/// Delivered exactly once, in order, or the connection is considered broken.
		const RELIABLE = 1 << 0;
		/// Not assigned a place in the channel's ordering.
		const UNSEQUENCED = 1 << 1;
		/// `data` is borrowed, not owned; never freed by the engine.
		const NO_ALLOCATE = 1 << 2;
		/// Forced to fragment even under the unreliable path.
		const UNRELIABLE_FRAGMENT = 1 << 3;
		/// Set once the packet has actually gone out on the wire.
		const SENT = 1 << 4;
	}
}

enum Storage {
	Owned(Box<[u8]>),
	Borrowed { data: *const u8, len: usize, free: Option<Box<dyn FnOnce()>> },
}

impl Drop for Storage {
	fn drop(&mut self) {
		if let Storage::Borrowed { free, .. } = self {
			if let Some(free) = free.take() {
				free();
			}
		}
	}
}

struct Inner {
	storage: Storage,
	flags: Cell<PacketFlags>,
	user_data: Cell<usize>,
}

/// A reference-counted, immutable application payload.
///
/// Cloning a `Packet` increments the shared reference count the same way
/// every queue entry referencing it is expected to; the payload is freed
/// (and any [`NO_ALLOCATE`](PacketFlags::NO_ALLOCATE) free-callback invoked)
/// exactly when the last clone is dropped.
#[derive(Clone)]
pub struct Packet {
	inner: Rc<Inner>,
}

impl Packet {
	/// Copies `data` into a freshly owned allocation.
	pub fn new(data: &[u8], flags: PacketFlags) -> Self {
		Self {
			inner: Rc::new(Inner {
				storage: Storage::Owned(data.into()),
				flags: Cell::new(flags - PacketFlags::NO_ALLOCATE),
				user_data: Cell::new(0),
			}),
		}
	}

	/// Borrows `data` without copying. `data` must remain valid until
	/// `free` (if any) is invoked; the engine never writes through this
	/// pointer. Carries the [`NO_ALLOCATE`](PacketFlags::NO_ALLOCATE) flag.
	///
	/// # Safety
	/// `data` must remain valid for as long as the returned `Packet` (and
	/// any of its clones) is alive.
	pub unsafe fn new_borrowed(data: *const u8, len: usize, free: Option<Box<dyn FnOnce()>>) -> Self {
		Self {
			inner: Rc::new(Inner {
				storage: Storage::Borrowed { data, len, free },
				flags: Cell::new(PacketFlags::NO_ALLOCATE),
				user_data: Cell::new(0),
			}),
		}
	}

	pub fn flags(&self) -> PacketFlags {
		self.inner.flags.get()
	}

	pub fn len(&self) -> usize {
		self.as_slice().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn as_slice(&self) -> &[u8] {
		match &self.inner.storage {
			Storage::Owned(b) => b,
			// SAFETY: see `new_borrowed`'s contract.
			Storage::Borrowed { data, len, .. } => unsafe { std::slice::from_raw_parts(*data, *len) },
		}
	}

	/// The number of live clones of this packet (reference count).
	pub fn reference_count(&self) -> usize {
		Rc::strong_count(&self.inner)
	}

	pub fn user_data(&self) -> usize {
		self.inner.user_data.get()
	}

	pub fn set_user_data(&self, data: usize) {
		self.inner.user_data.set(data);
	}

	/// Marks the packet as having gone out on the wire at least once.
	/// Observable via [`flags`](Self::flags) afterwards; every clone sees it.
	pub(crate) fn mark_sent(&self) {
		self.inner.flags.set(self.inner.flags.get() | PacketFlags::SENT);
	}
}

impl fmt::Debug for Packet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Packet").field("len", &self.len()).field("flags", &self.flags()).finish()
	}
}
