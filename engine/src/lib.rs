//! A reliable, sequenced, multi-channel transport over UDP.
//!
//! The crate's surface is [`host::Host`]: bind one to a local address,
//! drive it with [`host::Host::service`], [`host::Host::connect`] /
//! [`host::Host::send`] / [`host::Host::disconnect`], and react to the
//! [`event::Event`]s it hands back. Everything else — channels, peers,
//! the wire codec, fragmentation, the throttle, compression — is internal
//! machinery the host orchestrates; see each module's doc comment for the
//! piece of the protocol it owns.

pub mod channel;
pub mod compress;
pub mod constants;
pub mod error;
pub mod event;
pub mod fragment;
pub mod host;
pub mod packet;
pub mod peer;
pub mod protocol;
pub mod wire;

pub use error::Result;
pub use event::Event;
pub use host::Host;
pub use packet::{Packet, PacketFlags};
pub use peer::{PeerId, PeerState};
