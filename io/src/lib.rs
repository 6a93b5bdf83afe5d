//! Non-blocking datagram I/O adapter.
//!
//! A thin wrapper over a UDP socket exposing exactly the primitives the
//! protocol engine needs to drive its own service loop: bind, send,
//! receive and wait-with-timeout. No reactor, no background thread, no
//! callback forwarding — the caller polls it the same way it polls
//! everything else about a `Host`.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

pub mod logger;
pub mod time;

use log::error;
use utils::error::Result;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLIN};
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use windows_sys::Win32::Networking::WinSock::{WSAPoll as poll, SOCKET as RawFd, WSAPOLLFD as Poll, POLLRDNORM as POLLIN};
}

use sys::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

fn as_raw(socket: &UdpSocket) -> RawFd {
	#[cfg(target_family = "unix")]
	{
		socket.as_raw_fd()
	}
	#[cfg(target_family = "windows")]
	{
		socket.as_raw_socket() as RawFd
	}
}

fn would_block(err: &io::Error) -> bool {
	matches!(err.kind(), ErrorKind::WouldBlock)
}

/// A single non-blocking UDP socket, bound to one local address.
///
/// Maps directly onto the `socket_create`/`bind`/`set_option`/`send`/
/// `receive`/`wait`/`destroy` surface: `Socket::bind` folds the first two
/// together, `destroy` is just `Drop`.
pub struct Socket {
	inner: UdpSocket,
}

impl Socket {
	/// Creates a socket bound to `addr` and puts it into non-blocking mode.
	pub fn bind(addr: SocketAddr) -> Result<Self> {
		let inner = UdpSocket::bind(addr).map_err(|err| error!("Failed to bind socket to {addr}: {err}"))?;

		inner.set_nonblocking(true).map_err(|err| error!("Failed to set socket non-blocking: {err}"))?;

		Ok(Self { inner })
	}

	/// The address this socket is bound to.
	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.inner.local_addr().map_err(|err| error!("Failed to read local address: {err}"))
	}

	/// Sets whether the socket may send to and receive from the broadcast address.
	pub fn set_broadcast(&self, enable: bool) -> Result {
		self.inner.set_broadcast(enable).map_err(|err| error!("Failed to set broadcast option: {err}"))
	}

	/// Sends a single datagram to `addr`. Returns `Ok(false)` if the send
	/// would block (the caller should retry after the next readiness wait).
	pub fn send(&self, buf: &[u8], addr: SocketAddr) -> Result<bool> {
		match self.inner.send_to(buf, addr) {
			Ok(n) if n == buf.len() => Ok(true),
			Ok(n) => {
				error!("Only sent {n}/{} bytes to {addr}", buf.len());
				Err(())
			}
			Err(err) if would_block(&err) => Ok(false),
			Err(err) => {
				error!("Failed to send to {addr}: {err}");
				Err(())
			}
		}
	}

	/// Receives a single datagram into `buf`. Returns `None` if there is
	/// nothing waiting.
	pub fn receive(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
		match self.inner.recv_from(buf) {
			Ok((n, addr)) => Ok(Some((n, addr))),
			Err(err) if would_block(&err) => Ok(None),
			Err(err) => {
				error!("Failed to receive from socket: {err}");
				Err(())
			}
		}
	}

	/// Blocks until the socket is readable or `timeout` elapses. Returns
	/// whether the socket became readable. `None` blocks indefinitely.
	pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
		let mut fd = Poll { fd: as_raw(&self.inner), events: POLLIN, revents: 0 };

		let ret = unsafe { poll(&mut fd, 1, as_timeout(timeout)) };

		if ret < 0 {
			error!("poll() failed: {}", io::Error::last_os_error());
			return Err(());
		}

		Ok(ret > 0)
	}
}
