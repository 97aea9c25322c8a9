//! Real-time scheduling of the acquisition threads.
//!
//! The measure and ingest paths run under SCHED_FIFO; failure to acquire
//! the policy is logged but not fatal, the daemon then runs best-effort.

use std::mem;

use log::{debug, warn};

/// Give the calling thread a SCHED_FIFO priority.
pub fn set_realtime_priority(priority: i32) {
	let param = libc::sched_param {
		sched_priority: priority,
	};
	// SAFETY: affects only the calling thread.
	let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
	if ret != 0 {
		warn!("cannot set SCHED_FIFO priority {priority} (error {ret})");
	} else {
		debug!("running with SCHED_FIFO priority {priority}");
	}
}

/// Pin the calling thread to the last online CPU, away from the
/// housekeeping load on CPU 0.
pub fn pin_to_isolated_cpu() {
	// SAFETY: sysconf has no memory effects.
	let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
	if cpus <= 1 {
		return;
	}
	let cpu = (cpus - 1) as usize;

	let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
	unsafe {
		libc::CPU_ZERO(&mut set);
		libc::CPU_SET(cpu, &mut set);
	}
	// SAFETY: set is a properly initialized cpu_set_t.
	let ret = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) };
	if ret != 0 {
		warn!("cannot pin to CPU {cpu}");
	} else {
		debug!("pinned to CPU {cpu}");
	}
}

/// Lock current and future pages into RAM.
pub fn lock_memory() {
	// SAFETY: plain mlockall(2) call.
	if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
		warn!("mlockall failed, page faults may hit the measure loop");
	}
}
