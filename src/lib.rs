//! Distributed acquisition service for ATMD-GPX time-to-digital converters.
//!
//! The crate is split between the agent side, which drives one converter
//! board and streams acquired starts over the real-time network, and the
//! master side, which assembles the per-agent streams into measures and
//! persists them. The two daemons in `bin/` are thin wrappers around
//! [`agent::run`] and [`master::run`].

#![warn(rust_2018_idioms)]

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

pub mod config;
pub mod drivers;
pub mod env;
pub mod logging;
pub mod mat;
pub mod measure;
pub mod net;
pub mod rt;
pub mod time;

pub mod agent;
pub mod master;

/// Version string exchanged during the broadcast handshake. Master and
/// agents refuse to talk across versions.
pub const VERSION: &str = "3.0";

/// Process-wide termination flag.
///
/// Set from signal context or from fatal error branches; never cleared.
/// Every blocking loop in the crate is time-bounded and polls this flag
/// between iterations.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Request process shutdown. Async-signal-safe.
pub fn request_shutdown() {
	SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Check whether shutdown was requested.
pub fn shutdown_requested() -> bool {
	SHUTDOWN.load(Ordering::Relaxed)
}

/// Lifecycle status of a board, physical or virtual.
///
/// `Unknown` is the state before the control plane serves the board;
/// the master's virtual board reports it until its control task is up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
	Unknown = 0,
	Idle = 1,
	Finished = 2,
	Running = 3,
	Error = 4,
	Starting = 5,
}

/// Board status shared between tasks.
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
	pub const fn new(status: Status) -> Self {
		Self(AtomicU8::new(status as u8))
	}

	pub fn load(&self) -> Status {
		match self.0.load(Ordering::Relaxed) {
			1 => Status::Idle,
			2 => Status::Finished,
			3 => Status::Running,
			4 => Status::Error,
			5 => Status::Starting,
			_ => Status::Unknown,
		}
	}

	pub fn store(&self, status: Status) {
		self.0.store(status as u8, Ordering::Relaxed);
	}
}
