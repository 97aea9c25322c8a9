//! Monotonic time base.
//!
//! All window and measure timings are nanoseconds of `CLOCK_MONOTONIC`,
//! matching the resolution the measure loops are specified in.

use std::mem::MaybeUninit;
use std::time::Duration;

/// Current monotonic time in nanoseconds.
pub fn monotonic_ns() -> u64 {
	let mut ts = MaybeUninit::<libc::timespec>::uninit();
	// clock_gettime on CLOCK_MONOTONIC cannot fail with a valid pointer.
	let ts = unsafe {
		libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr());
		ts.assume_init()
	};
	ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Sleep for the given number of nanoseconds.
pub fn sleep_ns(ns: u64) {
	std::thread::sleep(Duration::from_nanos(ns));
}
