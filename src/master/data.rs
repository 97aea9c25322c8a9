//! Master data path: real-time ingest and the assembly pipeline.
//!
//! The ingest task does nothing but move frames off the real-time plane:
//! receive, tag with the sender's agent ordinal, push into the queue. The
//! assembly task drains the queue, gathers per-agent packet sequences
//! into starts, merges starts across agents and accumulates them into
//! measures.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use smallvec::SmallVec;
use thiserror::Error;

use super::save;
use super::VirtualBoard;
use crate::measure::{remap_channel, Measure, StartData, StopEvent};
use crate::net::codec::{decode_data, DataMsg, Frame};
use crate::net::rtnet::TransportErr;
use crate::net::rtnet::RtNet;
use crate::{shutdown_requested, Status};

/// Receive/queue poll timeout, bounds shutdown latency.
const POLL_TIMEOUT_NS: u64 = 100_000_000;

/// One data frame tagged with the agent it came from.
pub struct TaggedFrame {
	pub agent: usize,
	pub frame: Box<Frame>,
}

/// Frame-local assembly violations. The frame is dropped, the pipeline
/// continues.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyErr {
	#[error("second TERM from the same agent")]
	DuplicateTerm,
	#[error("data packet after TERM")]
	PostTermPacket,
	#[error("data packet out of sequence")]
	MismatchedId,
	#[error("missed the first packet of a start")]
	MissedFirst,
}

/// Hot loop on the data socket. Must not do any work beyond the
/// agent-table lookup; everything else happens behind the queue.
pub fn ingest_task(sock: RtNet, vb: Arc<VirtualBoard>, queue: Sender<TaggedFrame>) {
	crate::rt::set_realtime_priority(75);
	let mut frame = Frame::new();

	while !shutdown_requested() {
		let src = match sock.recv(&mut frame, Some(POLL_TIMEOUT_NS)) {
			Ok(src) => src,
			Err(TransportErr::RecvTimeout) => continue,
			Err(err) => {
				error!("data socket failed: {err}");
				crate::request_shutdown();
				return;
			}
		};

		// Unknown sources are dropped silently.
		let Some(agent) = vb.find_agent(&src) else {
			continue;
		};

		let tagged = TaggedFrame {
			agent,
			frame: Box::new(frame.clone()),
		};
		if queue.send(tagged).is_err() {
			error!("data queue is gone, terminating");
			crate::request_shutdown();
			return;
		}
	}
}

/// Queue consumer: decode and assemble until shutdown.
pub fn assembly_task(queue: Receiver<TaggedFrame>, vb: Arc<VirtualBoard>) {
	let mut assembler = Assembler::new(vb);

	while !shutdown_requested() {
		let tagged = match queue.recv_timeout(Duration::from_nanos(POLL_TIMEOUT_NS)) {
			Ok(tagged) => tagged,
			Err(RecvTimeoutError::Timeout) => continue,
			Err(RecvTimeoutError::Disconnected) => break,
		};

		let msg = match decode_data(tagged.frame.as_bytes()) {
			Ok(msg) => msg,
			Err(err) => {
				warn!("dropping bad data frame from agent {}: {err}", tagged.agent);
				assembler.protocol_errors += 1;
				continue;
			}
		};

		if let Err(err) = assembler.process(tagged.agent, msg) {
			warn!("agent {}: {err}", tagged.agent);
		}
	}
}

/// Reassembly state across all agents.
pub struct Assembler {
	vb: Arc<VirtualBoard>,
	/// Start currently being received, per agent.
	partial: Vec<Option<StartData>>,
	/// Start id the partial belongs to, per agent.
	partial_id: Vec<u32>,
	/// Agent delivered the final packet of the current start.
	agents_done: SmallVec<[bool; 8]>,
	/// Agent sent TERM for the current measure.
	agents_end: SmallVec<[bool; 8]>,
	/// Measure being assembled, created lazily on the first packet.
	current: Option<Measure>,
	/// Longest measure duration reported by a TERM so far.
	elapsed_ns: u64,
	/// Dropped-frame counter.
	pub protocol_errors: u64,
}

impl Assembler {
	pub fn new(vb: Arc<VirtualBoard>) -> Self {
		let n = vb.agents().len();
		Self {
			vb,
			partial: (0..n).map(|_| None).collect(),
			partial_id: vec![0; n],
			agents_done: SmallVec::from_elem(false, n),
			agents_end: SmallVec::from_elem(false, n),
			current: None,
			elapsed_ns: 0,
			protocol_errors: 0,
		}
	}

	/// Feed one decoded message from `agent` into the pipeline.
	pub fn process(&mut self, agent: usize, msg: DataMsg) -> Result<(), AssemblyErr> {
		let (kind, id, header, events) = match msg {
			DataMsg::Term {
				window_time: elapsed,
				..
			} => {
				return self.handle_term(agent, elapsed);
			}
			DataMsg::Start {
				kind,
				id,
				header,
				events,
			} => (kind, id, header, events),
		};

		if self.agents_end[agent] {
			self.protocol_errors += 1;
			return Err(AssemblyErr::PostTermPacket);
		}

		if self.current.is_none() {
			self.current = Some(Measure::new(self.vb.config().time_bin_ps()));
			self.partial_id.fill(0);
		}

		match self.partial[agent].take() {
			None => {
				// A new start must open with its header packet.
				let Some(header) = header else {
					self.protocol_errors += 1;
					return Err(AssemblyErr::MissedFirst);
				};
				let mut start = StartData::new(header.window_start, header.window_time);
				push_events(&mut start, agent, &events);
				self.partial[agent] = Some(start);
				self.partial_id[agent] = id;
			}
			Some(mut start) => {
				// The id must not change until the start is sealed.
				if self.partial_id[agent] != id {
					self.partial[agent] = Some(start);
					self.protocol_errors += 1;
					return Err(AssemblyErr::MismatchedId);
				}
				push_events(&mut start, agent, &events);
				self.partial[agent] = Some(start);
			}
		}

		if kind.is_final() {
			self.agents_done[agent] = true;
		}

		// Seal the start once every agent delivered its share.
		if self.agents_done.iter().all(|&done| done) {
			let parts: Vec<StartData> = self.partial.iter_mut().filter_map(Option::take).collect();
			let merged = StartData::merge(parts);
			if let Some(measure) = &mut self.current {
				measure.add_start(merged);
			}
			self.agents_done.fill(false);

			// Autosave once enough starts accumulated.
			let autosave = self.vb.config().autosave;
			if autosave > 0 {
				let full = self
					.current
					.as_ref()
					.is_some_and(|m| m.count_starts() as u32 >= autosave);
				if full {
					self.flush(false);
				}
			}
		}

		Ok(())
	}

	fn handle_term(&mut self, agent: usize, elapsed: u64) -> Result<(), AssemblyErr> {
		if self.agents_end[agent] {
			self.protocol_errors += 1;
			return Err(AssemblyErr::DuplicateTerm);
		}
		self.agents_end[agent] = true;
		self.elapsed_ns = self.elapsed_ns.max(elapsed);
		debug!("agent {agent} terminated its measure after {elapsed} ns");

		if !self.agents_end.iter().all(|&end| end) {
			return Ok(());
		}

		// Every agent is done: close out the measure.
		let autosave = self.vb.config().autosave;
		if autosave > 0 {
			self.flush(true);
			self.vb.set_status(Status::Idle);
		} else {
			self.finalize_to_store();
			self.vb.set_status(Status::Finished);
		}
		self.agents_end.fill(false);
		Ok(())
	}

	/// Move the current measure into the store.
	fn finalize_to_store(&mut self) {
		let Some(measure) = self.take_measure() else {
			return;
		};
		info!(
			"measure complete: {} starts, {} ns",
			measure.count_starts(),
			measure.elapsed_ns()
		);
		self.vb.add_measure(measure);
	}

	/// Move the current measure out and hand it to the persistence
	/// bridge. `measure_end` marks the final flush of a measure run.
	fn flush(&mut self, measure_end: bool) {
		let Some(measure) = self.take_measure() else {
			return;
		};

		let config = self.vb.config();
		if config.prefix.is_empty() {
			// Nowhere to autosave to; keep the data reachable instead of
			// dropping it.
			drop(config);
			error!("autosave is enabled but no prefix is configured, storing measure");
			self.vb.add_measure(measure);
			return;
		}
		let format = config.format;
		drop(config);

		let path = self.vb.next_autosave_path();
		info!(
			"autosaving {} starts to '{path}'{}",
			measure.count_starts(),
			if measure_end { " (measure end)" } else { "" }
		);
		if let Err(err) = save::save_measure(&measure, &path, format, None) {
			error!("autosave to '{path}' failed: {err}");
		}
	}

	/// Detach the current measure, folding in the termination time and
	/// whatever partial state would be lost.
	fn take_measure(&mut self) -> Option<Measure> {
		let mut measure = self.current.take()?;
		measure.set_elapsed_ns(self.elapsed_ns);
		self.elapsed_ns = 0;

		// Unsealed per-agent portions mean the measure was cut short.
		if self.partial.iter().any(Option::is_some) {
			measure.set_incomplete(true);
			for slot in &mut self.partial {
				*slot = None;
			}
		}
		self.agents_done.fill(false);
		Some(measure)
	}
}

fn push_events(start: &mut StartData, agent: usize, events: &[StopEvent]) {
	for event in events {
		start.push(StopEvent {
			channel: remap_channel(event.channel, agent),
			..*event
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::env::Config;
	use crate::master::AgentDescriptor;
	use crate::net::codec::{encode_data, encode_term};
	use crate::net::EtherAddr;

	fn two_agent_board(autosave: u32) -> Arc<VirtualBoard> {
		let agents = vec![
			AgentDescriptor {
				id: 0,
				addr: EtherAddr([2, 0, 0, 0, 0, 1]),
			},
			AgentDescriptor {
				id: 1,
				addr: EtherAddr([2, 0, 0, 0, 0, 2]),
			},
		];
		let config = Config {
			autosave,
			..Config::default()
		};
		let vb = Arc::new(VirtualBoard::new(agents, &config));
		// The control task would flip the board out of the unknown state.
		vb.set_status(crate::Status::Idle);
		vb
	}

	fn only_frame(id: u32, events: &[(i8, i32, u32)]) -> DataMsg {
		let ch: Vec<i8> = events.iter().map(|e| e.0).collect();
		let stop: Vec<i32> = events.iter().map(|e| e.1).collect();
		let retrig: Vec<u32> = events.iter().map(|e| e.2).collect();
		let mut frame = Frame::new();
		encode_data(&mut frame, id, 1_000, 500, &ch, &stop, &retrig, 0);
		decode_data(frame.as_bytes()).unwrap()
	}

	fn term_frame() -> DataMsg {
		let mut frame = Frame::new();
		encode_term(&mut frame, 0, 42);
		decode_data(frame.as_bytes()).unwrap()
	}

	#[test]
	fn two_agent_merge_remaps_channels() {
		let vb = two_agent_board(0);
		let mut asm = Assembler::new(Arc::clone(&vb));

		// Agent 1 first: sealing must wait for agent 0 regardless of
		// arrival order.
		asm.process(1, only_frame(7, &[(-3, 20, 0)])).unwrap();
		assert_eq!(vb.count_measures(), 0);
		asm.process(0, only_frame(7, &[(1, 10, 0)])).unwrap();

		asm.process(0, term_frame()).unwrap();
		asm.process(1, term_frame()).unwrap();

		assert_eq!(vb.count_measures(), 1);
		assert_eq!(vb.stat_measure(0), Some(1));

		// Channel remap: agent 0 keeps 1, agent 1's -3 becomes -11.
		let mut channels: Vec<i8> = Vec::new();
		{
			let measures = vb.measures();
			for event in measures[0].starts()[0].events() {
				channels.push(event.channel);
			}
		}
		channels.sort_unstable();
		assert_eq!(channels, vec![-11, 1]);
	}

	#[test]
	fn out_of_sequence_packet_is_dropped() {
		let vb = two_agent_board(0);
		let mut asm = Assembler::new(vb);

		asm.process(0, only_frame(1, &[(1, 10, 0)])).unwrap();
		// Continuation for a different id while the start is open on the
		// other agent's side.
		asm.process(1, only_frame(1, &[(2, 10, 0)])).unwrap();

		// Agent 0 opens id 2 while agent 1 is still missing for id... a
		// DATA packet without FIRST is refused.
		let msg = DataMsg::Start {
			kind: crate::net::codec::DataKind::Data,
			id: 3,
			header: None,
			events: vec![],
		};
		assert_eq!(asm.process(0, msg), Err(AssemblyErr::MissedFirst));
		assert_eq!(asm.protocol_errors, 1);
	}

	#[test]
	fn mismatched_id_is_dropped() {
		let vb = two_agent_board(0);
		let mut asm = Assembler::new(vb);

		// Open a multi-packet start on agent 0.
		let n = 200;
		let ch = vec![1i8; n];
		let stop: Vec<i32> = (0..n as i32).collect();
		let retrig = vec![0u32; n];
		let mut frame = Frame::new();
		let next = encode_data(&mut frame, 5, 0, 0, &ch, &stop, &retrig, 0);
		asm.process(0, decode_data(frame.as_bytes()).unwrap()).unwrap();

		// Continuation with the wrong id.
		encode_data(&mut frame, 6, 0, 0, &ch, &stop, &retrig, next);
		let msg = decode_data(frame.as_bytes()).unwrap();
		assert_eq!(asm.process(0, msg), Err(AssemblyErr::MismatchedId));
	}

	#[test]
	fn packets_after_term_are_dropped() {
		let vb = two_agent_board(0);
		let mut asm = Assembler::new(vb);

		asm.process(0, term_frame()).unwrap();
		assert_eq!(asm.process(0, term_frame()), Err(AssemblyErr::DuplicateTerm));
		assert_eq!(
			asm.process(0, only_frame(0, &[(1, 1, 0)])),
			Err(AssemblyErr::PostTermPacket)
		);
	}

	#[test]
	fn measure_seals_only_after_all_terms() {
		let vb = two_agent_board(0);
		let mut asm = Assembler::new(Arc::clone(&vb));

		asm.process(0, only_frame(0, &[(1, 1, 0)])).unwrap();
		asm.process(1, only_frame(0, &[(2, 2, 0)])).unwrap();
		asm.process(0, term_frame()).unwrap();
		assert_eq!(vb.count_measures(), 0);
		assert_eq!(vb.status(), crate::Status::Idle);

		asm.process(1, term_frame()).unwrap();
		assert_eq!(vb.count_measures(), 1);
		assert_eq!(vb.status(), crate::Status::Finished);
	}
}
