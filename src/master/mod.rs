//! The master daemon: the Virtual Board.
//!
//! N agents are presented to clients as one board with 8·N channels. The
//! control task owns the control socket and drives discovery and measure
//! control; the ingest task moves data frames off the real-time plane
//! into a queue; the assembly task reconstructs starts and measures from
//! the queue; the client task serves the text protocol.

pub mod client;
pub mod control;
pub mod data;
pub mod save;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{error, info};
use thiserror::Error;

use self::save::{PersistErr, SaveFormat};
use crate::config::{
	ATMD_AUTORETRIG, ATMD_DEF_HSDIV, ATMD_DEF_REFCLKDIV, ATMD_DEF_STARTOFFSET, ATMD_PROTO_CTRL,
	ATMD_PROTO_DATA, ATMD_TREF_PS,
};
use crate::env::{Args, Config};
use crate::measure::Measure;
use crate::net::codec::MeasSet;
use crate::net::rtnet::{RtNet, TransportErr};
use crate::net::EtherAddr;
use crate::{AtomicStatus, Status};

/// One discovered agent: its configured ordinal and hardware address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgentDescriptor {
	pub id: usize,
	pub addr: EtherAddr,
}

/// Measure parameters of the virtual board.
///
/// Channel masks are kept per virtual channel; the slice belonging to an
/// agent is cut out when its `MEAS_SET` is built.
#[derive(Clone, Debug)]
pub struct MeasureConfig {
	pub start_rising: bool,
	pub start_falling: bool,
	pub ch_rising: Vec<bool>,
	pub ch_falling: Vec<bool>,
	pub measure_time: u64,
	pub window_time: u64,
	pub timeout: u64,
	pub deadtime: u64,
	pub start_offset: u32,
	pub refclkdiv: u16,
	pub hsdiv: u16,
	/// Autosave threshold in starts, 0 = disabled.
	pub autosave: u32,
	/// Filename prefix for autosaved measures.
	pub prefix: String,
	pub format: SaveFormat,
}

impl MeasureConfig {
	fn new(agents: usize, config: &Config) -> Self {
		let format = config
			.format
			.as_deref()
			.and_then(|name| name.parse().ok())
			.unwrap_or_default();

		Self {
			start_rising: true,
			start_falling: false,
			ch_rising: vec![true; 8 * agents],
			ch_falling: vec![false; 8 * agents],
			// Timings a client would normally push through the
			// configuration surface; the compiled defaults give a one
			// minute measure of 1 ms windows.
			measure_time: 60_000_000_000,
			window_time: 1_000_000,
			timeout: 1_000_000_000,
			deadtime: 100_000,
			start_offset: ATMD_DEF_STARTOFFSET,
			refclkdiv: ATMD_DEF_REFCLKDIV,
			hsdiv: ATMD_DEF_HSDIV,
			autosave: config.autosave,
			prefix: config.prefix.clone(),
			format,
		}
	}

	/// Time bin for the configured resolution, in ps.
	pub fn time_bin_ps(&self) -> f64 {
		crate::config::time_bin_ps(self.refclkdiv, self.hsdiv)
	}

	/// Stop channel masks of one agent, cut from the virtual channel
	/// configuration.
	pub fn masks_for(&self, agent: usize) -> (u8, u8) {
		let mut rising = 0u8;
		let mut falling = 0u8;
		for k in 0..8 {
			let ch = agent * 8 + k;
			if self.ch_rising.get(ch).copied().unwrap_or(false) {
				rising |= 1 << k;
			}
			if self.ch_falling.get(ch).copied().unwrap_or(false) {
				falling |= 1 << k;
			}
		}
		(rising, falling)
	}

	/// Build the `MEAS_SET` payload for one agent.
	pub fn meas_set_for(&self, agent: usize) -> MeasSet {
		let (rising_mask, falling_mask) = self.masks_for(agent);
		MeasSet {
			agent_id: agent as u32,
			start_rising: self.start_rising as u8,
			start_falling: self.start_falling as u8,
			rising_mask,
			falling_mask,
			measure_time: self.measure_time,
			window_time: self.window_time,
			timeout: self.timeout,
			deadtime: self.deadtime,
			start_offset: self.start_offset,
			refclk: self.refclkdiv,
			hsdiv: self.hsdiv,
		}
	}
}

/// Shared state of the master.
pub struct VirtualBoard {
	agents: Vec<AgentDescriptor>,
	status: AtomicStatus,
	config: Mutex<MeasureConfig>,
	measures: Mutex<Vec<Measure>>,
	autosave_counter: AtomicU32,
}

impl VirtualBoard {
	pub fn new(agents: Vec<AgentDescriptor>, config: &Config) -> Self {
		let measure_config = MeasureConfig::new(agents.len(), config);
		Self {
			agents,
			// Unknown until the control task starts serving the board.
			status: AtomicStatus::new(Status::Unknown),
			config: Mutex::new(measure_config),
			measures: Mutex::new(Vec::new()),
			autosave_counter: AtomicU32::new(0),
		}
	}

	pub fn agents(&self) -> &[AgentDescriptor] {
		&self.agents
	}

	/// Ordinal of the agent with the given address.
	pub fn find_agent(&self, addr: &EtherAddr) -> Option<usize> {
		self.agents
			.iter()
			.find(|agent| agent.addr == *addr)
			.map(|agent| agent.id)
	}

	pub fn status(&self) -> Status {
		self.status.load()
	}

	pub fn set_status(&self, status: Status) {
		self.status.store(status);
	}

	pub fn config(&self) -> MutexGuard<'_, MeasureConfig> {
		self.config.lock().unwrap_or_else(|poison| poison.into_inner())
	}

	fn measures(&self) -> MutexGuard<'_, Vec<Measure>> {
		self.measures
			.lock()
			.unwrap_or_else(|poison| poison.into_inner())
	}

	/// Store a completed measure.
	pub fn add_measure(&self, measure: Measure) {
		self.measures().push(measure);
	}

	pub fn count_measures(&self) -> usize {
		self.measures().len()
	}

	/// Number of starts in measure `num`.
	pub fn stat_measure(&self, num: usize) -> Option<usize> {
		self.measures().get(num).map(Measure::count_starts)
	}

	/// Per-measure start counts, for `LST`.
	pub fn list_measures(&self) -> Vec<usize> {
		self.measures().iter().map(Measure::count_starts).collect()
	}

	/// Per-start stop counts by virtual channel. Slot 0 holds the window
	/// duration in autoretrigger periods, slots 1..=8·N the per-channel
	/// counts (slope-insensitive).
	pub fn stat_stops(&self, num: usize) -> Option<Vec<Vec<u32>>> {
		let retrig_period_ns = (ATMD_AUTORETRIG as u64 + 1) * ATMD_TREF_PS / 1000;
		let channels = 8 * self.agents.len();

		let measures = self.measures();
		let measure = measures.get(num)?;
		let mut stats = Vec::with_capacity(measure.count_starts());
		for start in measure.starts() {
			let mut counts = vec![0u32; channels + 1];
			counts[0] = (start.window_duration() / retrig_period_ns) as u32;
			for event in start.events() {
				let ch = event.channel.unsigned_abs() as usize;
				if (1..=channels).contains(&ch) {
					counts[ch] += 1;
				}
			}
			stats.push(counts);
		}
		Some(stats)
	}

	pub fn delete_measure(&self, num: usize) -> bool {
		let mut measures = self.measures();
		if num < measures.len() {
			measures.remove(num);
			true
		} else {
			false
		}
	}

	pub fn clear_measures(&self) {
		self.measures().clear();
	}

	/// Serialize stored measure `num` to `path`.
	///
	/// The measure is cloned out under the lock; the heavy serialization
	/// runs on the copy. The stored measure stays until the client
	/// deletes it.
	pub fn save_measure(&self, num: usize, path: &str, format: SaveFormat) -> Result<(), PersistErr> {
		let measure = self
			.measures()
			.get(num)
			.cloned()
			.ok_or(PersistErr::InvalidPath)?;
		save::save_measure(&measure, path, format, None)
	}

	/// File name for the next autosaved measure.
	pub fn next_autosave_path(&self) -> String {
		let counter = self.autosave_counter.fetch_add(1, Ordering::Relaxed);
		let config = self.config();
		format!("{}{:06}{}", config.prefix, counter, config.format.extension())
	}
}

#[derive(Debug, Error)]
pub enum MasterError {
	#[error(transparent)]
	Transport(#[from] TransportErr),
	#[error("failed to spawn task: {0}")]
	Spawn(#[from] std::io::Error),
}

/// Bring up the master: discover the configured agents, start the data
/// path and serve clients until shutdown.
pub fn run(args: &Args, config: &Config) -> Result<(), MasterError> {
	let ctrl_sock = RtNet::open(&config.rtif, ATMD_PROTO_CTRL, config.rtskbs)?;
	let data_sock = RtNet::open(&config.rtif, ATMD_PROTO_DATA, config.rtskbs)?;

	// Agents first: the data path needs the finished table.
	let agents = control::discover(&ctrl_sock, &config.agents)?;
	info!("discovered {} agent(s)", agents.len());

	let vb = Arc::new(VirtualBoard::new(agents, config));

	let (cmd_tx, cmd_rx) = mpsc::channel();
	let (queue_tx, queue_rx) = mpsc::channel();

	let ctrl_thread = {
		let vb = Arc::clone(&vb);
		thread::Builder::new()
			.name("atmd-ctrl".into())
			.spawn(move || control::control_task(ctrl_sock, vb, cmd_rx))?
	};

	let ingest_thread = {
		let vb = Arc::clone(&vb);
		thread::Builder::new()
			.name("atmd-rt-data".into())
			.spawn(move || data::ingest_task(data_sock, vb, queue_tx))?
	};

	let assembly_thread = {
		let vb = Arc::clone(&vb);
		thread::Builder::new()
			.name("atmd-data".into())
			.spawn(move || data::assembly_task(queue_rx, vb))?
	};

	// The client protocol runs on the main thread.
	client::serve(args, &vb, &cmd_tx);

	drop(cmd_tx);
	for (name, handle) in [
		("control", ctrl_thread),
		("ingest", ingest_thread),
		("assembly", assembly_thread),
	] {
		if handle.join().is_err() {
			error!("{name} task panicked");
		}
	}
	Ok(())
}
