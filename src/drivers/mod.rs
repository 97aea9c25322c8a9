//! Hardware drivers.

pub mod gpx;

/// A common error module for drivers. [`error::DriverError`] values are
/// passed on to higher layers.
pub mod error {
	use thiserror::Error;

	use crate::drivers::gpx::{AcquireErr, HardwareFault};

	#[derive(Debug, Error)]
	pub enum DriverError {
		#[error("GPX board fault: {0}")]
		Hardware(#[from] HardwareFault),
		#[error("acquisition failed: {0}")]
		Acquire(#[from] AcquireErr),
	}
}
