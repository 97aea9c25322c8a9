//! The measure thread.
//!
//! Gated by a message queue: each received [`MeasureDef`] runs one
//! measure. The thread synchronizes to the TDMA schedule, acquires starts
//! back to back into a reused event buffer, streams every start out on
//! the data plane and closes the measure with a `TERM` frame.

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error};

use crate::config::{ATMD_BLOCK, ATMD_TDMA_OFFSET};
use crate::drivers::gpx::buffer::EventBuffer;
use crate::drivers::gpx::{AcquireErr, GpxBoard, GpxBus};
use crate::net::codec::{encode_data, encode_term, Frame};
use crate::net::rtnet::{RtNet, TransportErr};
use crate::net::EtherAddr;
use crate::time::monotonic_ns;
use crate::{shutdown_requested, AtomicStatus, Status};

/// Timings of one measure, handed to the measure thread on start.
#[derive(Clone, Debug, Default)]
pub struct MeasureDef {
	/// Total measure duration in ns.
	pub measure_time: u64,
	/// Acquisition window per start in ns.
	pub window_time: u64,
	/// Maximum wait for a start pulse in ns.
	pub timeout: u64,
	/// Pause between starts in ns, yielding the cable.
	pub deadtime: u64,
	/// Master's reference TDMA cycle.
	pub tdma_cycle: u32,
}

/// Everything the measure thread needs, moved in at spawn time.
pub(crate) struct MeasureCtx<B> {
	pub queue: Receiver<MeasureDef>,
	pub board: Arc<Mutex<GpxBoard<B>>>,
	pub sock: Arc<RtNet>,
	pub master: EtherAddr,
	pub stop: Arc<std::sync::atomic::AtomicBool>,
	pub status: Arc<AtomicStatus>,
}

pub(crate) fn measure_task<B: GpxBus>(ctx: MeasureCtx<B>) {
	crate::rt::set_realtime_priority(98);
	crate::rt::pin_to_isolated_cpu();

	let mut events = EventBuffer::new();
	if events.reserve(ATMD_BLOCK).is_err() {
		error!("failed to reserve the initial event buffer");
		crate::request_shutdown();
		return;
	}
	let mut frame = Frame::new();

	loop {
		if shutdown_requested() {
			return;
		}

		// Wait for a start command. The 1 s timeout bounds both the
		// shutdown latency and how long a lost measure definition can
		// keep the thread waiting.
		let def = match ctx.queue.recv_timeout(Duration::from_secs(1)) {
			Ok(def) => def,
			Err(RecvTimeoutError::Timeout) => continue,
			Err(RecvTimeoutError::Disconnected) => return,
		};
		ctx.status.store(Status::Running);

		// Synchronize to the TDMA schedule, a fixed number of cycles
		// after the master's reference cycle so that all agents share an
		// epoch.
		if let Err(err) = ctx
			.sock
			.wait_tdma_cycle(def.tdma_cycle + ATMD_TDMA_OFFSET)
		{
			error!("TDMA synchronization failed: {err}");
			ctx.status.store(Status::Error);
			continue;
		}

		let mut board = ctx.board.lock().unwrap_or_else(|poison| poison.into_inner());

		let measure_start = monotonic_ns();
		let mut measure_end = measure_start;
		let mut index: u32 = 0;
		let mut failed = false;

		while measure_end - measure_start < def.measure_time.saturating_sub(def.window_time) {
			if shutdown_requested() || ctx.stop.load(Ordering::Relaxed) {
				break;
			}

			events.clear();
			match board.acquire_start(def.window_time, def.timeout, &ctx.stop, &mut events) {
				Ok(()) => {}
				Err(AcquireErr::NoStart) => {
					// No start pulse inside the timeout; the start is
					// abandoned, the measure goes on.
					measure_end = monotonic_ns();
					continue;
				}
				Err(err) => {
					error!("failed to get start: {err}; terminating measure");
					measure_end = monotonic_ns();
					failed = true;
					break;
				}
			}

			if let Err(err) = send_start(index, &events, &ctx.sock, &ctx.master, &mut frame) {
				error!("failed to send start data: {err}; terminating measure");
				measure_end = monotonic_ns();
				failed = true;
				break;
			}

			index += 1;
			measure_end = monotonic_ns();

			if ctx.stop.load(Ordering::Relaxed) {
				break;
			}

			// Yield the cable to the TDMA schedule.
			crate::time::sleep_ns(def.deadtime);
		}

		debug!("measure finished after {index} starts");

		// Close the measure on the data plane.
		encode_term(&mut frame, measure_start, measure_end - measure_start);
		if let Err(err) = ctx.sock.send(&frame, &ctx.master) {
			error!("failed to send the measure termination packet: {err}");
			crate::request_shutdown();
			return;
		}

		ctx.stop.store(false, Ordering::Relaxed);
		ctx.status
			.store(if failed { Status::Error } else { Status::Idle });
	}
}

/// Stream one start over the data plane, splitting at the frame size.
fn send_start(
	id: u32,
	events: &EventBuffer,
	sock: &RtNet,
	master: &EtherAddr,
	frame: &mut Frame,
) -> Result<(), TransportErr> {
	let window_time = events.end() - events.begin();
	let mut next = 0;
	loop {
		next = encode_data(
			frame,
			id,
			events.begin(),
			window_time,
			events.ch(),
			events.stoptime(),
			events.retrig(),
			next,
		);
		sock.send(frame, master)?;
		if next >= events.len() {
			return Ok(());
		}
	}
}
