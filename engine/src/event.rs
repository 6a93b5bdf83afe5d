//! The polled event API returned from `Host::service`/`check_events` (§6).

use crate::packet::Packet;
use crate::peer::PeerId;

/// An event observed on a `Host`, as returned by [`Host::service`](crate::host::Host::service).
#[derive(Debug)]
pub enum Event {
	/// A peer completed its handshake. `data` is the 32-bit application
	/// payload carried on the CONNECT/VERIFY_CONNECT exchange.
	Connect { peer: PeerId, data: u32 },
	/// A peer disconnected, gracefully or by timeout. `data` is whatever
	/// the disconnecting side attached (`0` for a timeout-induced reset).
	Disconnect { peer: PeerId, data: u32 },
	/// An application payload was delivered on `channel`. The caller owns
	/// `packet` and is responsible for letting it drop.
	Receive { peer: PeerId, channel: u8, packet: Packet },
}
