//! Zero-copy L2 transport on the real-time network.
//!
//! One datagram socket per plane, bound to `(interface, ethertype)`. The
//! socket pool is extended beyond the stack default so that one burst
//! window cannot exhaust the buffers and invert priorities. TDMA cycle
//! synchronization goes through the RTmac ioctl interface of the same
//! socket.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use log::{debug, error};
use thiserror::Error;

use super::EtherAddr;
use crate::net::codec::Frame;

/// Transport failures. Fatal to the task owning the socket.
#[derive(Debug, Error)]
pub enum TransportErr {
	#[error("failed to bind RT socket: {0}")]
	BindFailed(#[source] io::Error),
	#[error("failed to send packet: {0}")]
	SendFailed(#[source] io::Error),
	#[error("receive timed out")]
	RecvTimeout,
	#[error("failed to receive packet: {0}")]
	RecvFailed(#[source] io::Error),
	#[error("TDMA synchronization failed: {0}")]
	TdmaSync(#[source] io::Error),
}

// RTDM ioctl encoding, as in the Linux _IOC macros.
const IOC_WRITE: libc::c_ulong = 1;
const fn iow(class: u8, nr: u8, size: usize) -> libc::c_ulong {
	(IOC_WRITE << 30) | ((size as libc::c_ulong & 0x3FFF) << 16) | ((class as libc::c_ulong) << 8) | nr as libc::c_ulong
}

/// RTDM device classes.
const RTDM_CLASS_NETWORK: u8 = 2;
const RTDM_CLASS_RTMAC: u8 = 6;

/// Extend the socket packet pool (`RTNET_RTIOC_EXTPOOL`).
const RTIOC_EXTPOOL: libc::c_ulong = iow(RTDM_CLASS_NETWORK, 0x12, mem::size_of::<libc::c_uint>());

/// Wait for a TDMA cycle (`RTMAC_RTIOC_WAITONCYCLE_EX`).
const RTIOC_WAITONCYCLE_EX: libc::c_ulong =
	iow(RTDM_CLASS_RTMAC, 0x10, mem::size_of::<RtmacWaitinfo>());

/// Block until the TDMA sync frame.
const TDMA_WAIT_ON_SYNC: libc::c_uint = 1;

/// Cycle information returned by the RTmac wait ioctl.
#[repr(C)]
#[allow(dead_code)]
struct RtmacWaitinfo {
	wait_type: libc::c_uint,
	size: libc::size_t,
	cycle_no: libc::c_ulong,
	cycle_period: i64,
	clock_offset: i64,
}

/// A socket on the real-time network, bound to one ethertype.
pub struct RtNet {
	fd: RawFd,
	ifindex: libc::c_int,
	protocol: u16,
}

impl RtNet {
	/// Open a socket for `protocol` on `ifname` and extend its packet
	/// pool to `rtskbs` buffers.
	pub fn open(ifname: &str, protocol: u16, rtskbs: u32) -> Result<Self, TransportErr> {
		// SAFETY: plain socket(2) call.
		let fd = unsafe {
			libc::socket(
				libc::AF_PACKET,
				libc::SOCK_DGRAM,
				(protocol as u16).to_be() as libc::c_int,
			)
		};
		if fd < 0 {
			return Err(TransportErr::BindFailed(io::Error::last_os_error()));
		}
		let mut sock = Self {
			fd,
			ifindex: 0,
			protocol,
		};

		// Find the interface index.
		let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
		for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.bytes()) {
			*dst = src as libc::c_char;
		}
		// SAFETY: ifr is a properly initialized ifreq.
		if unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) } < 0 {
			return Err(TransportErr::BindFailed(io::Error::last_os_error()));
		}
		let ifindex = unsafe { ifr.ifr_ifru.ifru_ifindex };

		// Bind to (interface, ethertype).
		let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
		addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
		addr.sll_protocol = (protocol as u16).to_be();
		addr.sll_ifindex = ifindex;
		// SAFETY: addr is a valid sockaddr_ll for this socket family.
		let ret = unsafe {
			libc::bind(
				fd,
				&addr as *const libc::sockaddr_ll as *const libc::sockaddr,
				mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
			)
		};
		if ret < 0 {
			return Err(TransportErr::BindFailed(io::Error::last_os_error()));
		}

		// Extend the packet pool.
		let count: libc::c_uint = rtskbs;
		// SAFETY: RTIOC_EXTPOOL takes a c_uint.
		let ret = unsafe { libc::ioctl(fd, RTIOC_EXTPOOL, &count) };
		if ret < 0 {
			return Err(TransportErr::BindFailed(io::Error::last_os_error()));
		}
		debug!("extended RT socket pool to {rtskbs} buffers on '{ifname}'");

		sock.ifindex = ifindex;
		Ok(sock)
	}

	/// Send one frame to `dst`.
	pub fn send(&self, frame: &Frame, dst: &EtherAddr) -> Result<(), TransportErr> {
		let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
		addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
		addr.sll_protocol = (self.protocol as u16).to_be();
		addr.sll_ifindex = self.ifindex;
		addr.sll_halen = 6;
		addr.sll_addr[..6].copy_from_slice(&dst.0);

		let bytes = frame.as_bytes();
		// SAFETY: the buffer and address are valid for the duration of
		// the call.
		let sent = unsafe {
			libc::sendto(
				self.fd,
				bytes.as_ptr() as *const libc::c_void,
				bytes.len(),
				0,
				&addr as *const libc::sockaddr_ll as *const libc::sockaddr,
				mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
			)
		};
		if sent < 0 {
			return Err(TransportErr::SendFailed(io::Error::last_os_error()));
		}
		Ok(())
	}

	/// Receive one frame, waiting at most `timeout_ns` when given.
	/// Returns the sender's hardware address.
	pub fn recv(&self, frame: &mut Frame, timeout_ns: Option<u64>) -> Result<EtherAddr, TransportErr> {
		if let Some(ns) = timeout_ns {
			let mut pfd = libc::pollfd {
				fd: self.fd,
				events: libc::POLLIN,
				revents: 0,
			};
			let timeout_ms = ns.div_ceil(1_000_000).min(i32::MAX as u64) as libc::c_int;
			// SAFETY: pfd points to one valid pollfd.
			let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
			if ready < 0 {
				return Err(TransportErr::RecvFailed(io::Error::last_os_error()));
			}
			if ready == 0 {
				return Err(TransportErr::RecvTimeout);
			}
		}

		frame.clear();
		let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
		let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
		let buf = frame.buffer_mut();
		// SAFETY: the buffer is valid for buf.len() bytes, the address
		// struct for addr_len.
		let received = unsafe {
			libc::recvfrom(
				self.fd,
				buf.as_mut_ptr() as *mut libc::c_void,
				buf.len(),
				0,
				&mut addr as *mut libc::sockaddr_ll as *mut libc::sockaddr,
				&mut addr_len,
			)
		};
		if received < 0 {
			return Err(TransportErr::RecvFailed(io::Error::last_os_error()));
		}
		frame.set_len(received as usize);

		let mut src = EtherAddr::default();
		src.0.copy_from_slice(&addr.sll_addr[..6]);
		Ok(src)
	}

	/// Wait for the next TDMA sync frame and return its cycle number.
	pub fn wait_tdma(&self) -> Result<u32, TransportErr> {
		let mut info = RtmacWaitinfo {
			wait_type: TDMA_WAIT_ON_SYNC,
			size: mem::size_of::<RtmacWaitinfo>(),
			cycle_no: 0,
			cycle_period: 0,
			clock_offset: 0,
		};
		// SAFETY: info is a properly sized rtmac_waitinfo.
		let ret = unsafe { libc::ioctl(self.fd, RTIOC_WAITONCYCLE_EX, &mut info) };
		if ret < 0 {
			return Err(TransportErr::TdmaSync(io::Error::last_os_error()));
		}
		Ok(info.cycle_no as u32)
	}

	/// Wait until TDMA cycle `target`. If the cycle has already passed,
	/// logs and returns immediately with the current cycle: the sync
	/// window was missed.
	pub fn wait_tdma_cycle(&self, target: u32) -> Result<u32, TransportErr> {
		loop {
			let current = self.wait_tdma()?;
			if current < target {
				continue;
			}
			if current > target {
				error!("tried to sync on a TDMA cycle in the past ({current} > {target})");
			}
			return Ok(current);
		}
	}
}

impl Drop for RtNet {
	fn drop(&mut self) {
		// SAFETY: fd was returned by socket(2) and is owned by self.
		unsafe { libc::close(self.fd) };
	}
}
