//! Frame codec for the master/agent protocol.
//!
//! Control frames share the layout `[u16 type][u16 size][payload]`, data
//! frames `[u16 type][u16 numev][u32 start_id][optional header][events]`.
//! Integers are host-native: the wire is a closed TDMA segment between
//! machines of the same architecture.

use std::mem::size_of;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{ATMD_EV_SIZE, ATMD_PACKET_SIZE, ATMD_VER_LEN};
use crate::measure::StopEvent;

/// Message types.
pub const MSG_BADTYPE: u16 = 0;
pub const MSG_BRD: u16 = 1;
pub const MSG_HELLO: u16 = 2;
/// Reserved for protocol negotiation.
pub const MSG_PROTO: u16 = 3;
pub const MSG_MEAS_SET: u16 = 4;
pub const MSG_MEAS_CTR: u16 = 5;
pub const MSG_ACK: u16 = 6;
pub const DT_FIRST: u16 = 7;
pub const DT_ONLY: u16 = 8;
pub const DT_DATA: u16 = 9;
pub const DT_LAST: u16 = 10;
pub const DT_TERM: u16 = 11;
pub const MSG_BUSY: u16 = 12;
pub const MSG_ERROR: u16 = 13;

/// Frame-local protocol violations. The offending frame is dropped and
/// counted; the stream continues.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErr {
	#[error("unknown message type")]
	UnknownType,
	#[error("peer runs an incompatible protocol version")]
	BadVersion,
	#[error("data packet out of sequence")]
	OutOfSequence,
	#[error("truncated frame")]
	Truncated,
}

/// A reusable, fixed-size frame buffer.
#[derive(Clone)]
pub struct Frame {
	buf: [u8; ATMD_PACKET_SIZE],
	len: usize,
}

impl Frame {
	pub fn new() -> Self {
		Self {
			buf: [0; ATMD_PACKET_SIZE],
			len: 0,
		}
	}

	/// The encoded part of the frame.
	pub fn as_bytes(&self) -> &[u8] {
		&self.buf[..self.len]
	}

	/// The whole backing buffer, for receiving into.
	pub fn buffer_mut(&mut self) -> &mut [u8; ATMD_PACKET_SIZE] {
		&mut self.buf
	}

	pub fn set_len(&mut self, len: usize) {
		debug_assert!(len <= ATMD_PACKET_SIZE);
		self.len = len;
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn clear(&mut self) {
		self.buf.fill(0);
		self.len = 0;
	}
}

impl Default for Frame {
	fn default() -> Self {
		Self::new()
	}
}

/// Measure settings carried by `MEAS_SET`, in wire layout.
#[derive(
	Clone, Copy, Debug, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C, packed)]
pub struct MeasSet {
	pub agent_id: u32,
	pub start_rising: u8,
	pub start_falling: u8,
	pub rising_mask: u8,
	pub falling_mask: u8,
	/// Total measure duration in ns.
	pub measure_time: u64,
	/// Acquisition window per start in ns.
	pub window_time: u64,
	/// Maximum wait for a start pulse in ns.
	pub timeout: u64,
	/// Idle time between starts in ns, yielding the cable to the TDMA
	/// schedule.
	pub deadtime: u64,
	pub start_offset: u32,
	pub refclk: u16,
	pub hsdiv: u16,
}

/// `MEAS_CTR` actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Action {
	NoAction = 0,
	Start = 1,
	Stop = 2,
}

impl TryFrom<u16> for Action {
	type Error = ProtocolErr;

	fn try_from(value: u16) -> Result<Self, ProtocolErr> {
		match value {
			0 => Ok(Action::NoAction),
			1 => Ok(Action::Start),
			2 => Ok(Action::Stop),
			_ => Err(ProtocolErr::UnknownType),
		}
	}
}

/// A decoded control-plane message.
#[derive(Clone, Debug, PartialEq)]
pub enum CtrlMsg {
	Brd { version: String },
	Hello { version: String },
	MeasSet(MeasSet),
	MeasCtr { action: Action, tdma_cycle: u32 },
	Ack,
	Busy,
	Error,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
struct CtrlHdr {
	mtype: u16,
	size: u16,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
struct MeasCtrWire {
	action: u16,
	tdma_cycle: u32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
struct DataHdr {
	mtype: u16,
	numev: u16,
	id: u32,
}

/// Extra header carried by `FIRST` and `ONLY` packets.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
struct StartHdr {
	total_events: u32,
	window_start: u64,
	window_time: u64,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
struct EventWire {
	ch: i8,
	stoptime: i32,
	retrig: u32,
}

/// Body of a `TERM` frame, after the `[u16 type][u16 0]` prefix.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C, packed)]
struct TermWire {
	window_start: u64,
	window_time: u64,
}

const CTRL_HDR_SIZE: usize = size_of::<CtrlHdr>();
const DATA_HDR_SIZE: usize = size_of::<DataHdr>();
const START_HDR_SIZE: usize = size_of::<StartHdr>();

/// Events that fit into the first packet of a start.
pub const EV_PER_FIRST: usize = (ATMD_PACKET_SIZE - DATA_HDR_SIZE - START_HDR_SIZE) / ATMD_EV_SIZE;
/// Events that fit into a continuation packet.
pub const EV_PER_DATA: usize = (ATMD_PACKET_SIZE - DATA_HDR_SIZE) / ATMD_EV_SIZE;

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) -> usize {
	buf[offset..offset + bytes.len()].copy_from_slice(bytes);
	offset + bytes.len()
}

/// Encode a control message into `frame`.
pub fn encode_ctrl(msg: &CtrlMsg, frame: &mut Frame) {
	frame.clear();
	let buf = frame.buffer_mut();
	let mut offset = CTRL_HDR_SIZE;

	let mtype = match msg {
		CtrlMsg::Brd { version } | CtrlMsg::Hello { version } => {
			let bytes = version.as_bytes();
			let len = bytes.len().min(ATMD_VER_LEN - 1);
			offset = put(buf, offset, &bytes[..len]);
			offset += 1; // NUL terminator, buffer is already zeroed
			if matches!(msg, CtrlMsg::Brd { .. }) {
				MSG_BRD
			} else {
				MSG_HELLO
			}
		}
		CtrlMsg::MeasSet(set) => {
			offset = put(buf, offset, set.as_bytes());
			MSG_MEAS_SET
		}
		CtrlMsg::MeasCtr { action, tdma_cycle } => {
			let wire = MeasCtrWire {
				action: *action as u16,
				tdma_cycle: *tdma_cycle,
			};
			offset = put(buf, offset, wire.as_bytes());
			MSG_MEAS_CTR
		}
		CtrlMsg::Ack => MSG_ACK,
		CtrlMsg::Busy => MSG_BUSY,
		CtrlMsg::Error => MSG_ERROR,
	};

	let hdr = CtrlHdr {
		mtype,
		size: offset as u16,
	};
	put(buf, 0, hdr.as_bytes());
	frame.set_len(offset);
}

/// Decode a control message.
pub fn decode_ctrl(bytes: &[u8]) -> Result<CtrlMsg, ProtocolErr> {
	let (hdr, rest) = CtrlHdr::read_from_prefix(bytes).map_err(|_| ProtocolErr::Truncated)?;
	if hdr.size as usize > bytes.len() {
		return Err(ProtocolErr::Truncated);
	}

	match hdr.mtype {
		MSG_BRD | MSG_HELLO => {
			let window = rest.get(..ATMD_VER_LEN.min(rest.len())).unwrap_or(rest);
			let nul = window
				.iter()
				.position(|&b| b == 0)
				.ok_or(ProtocolErr::Truncated)?;
			let version = std::str::from_utf8(&window[..nul])
				.map_err(|_| ProtocolErr::BadVersion)?
				.to_string();
			if hdr.mtype == MSG_BRD {
				Ok(CtrlMsg::Brd { version })
			} else {
				Ok(CtrlMsg::Hello { version })
			}
		}
		MSG_MEAS_SET => {
			let (set, _) = MeasSet::read_from_prefix(rest).map_err(|_| ProtocolErr::Truncated)?;
			Ok(CtrlMsg::MeasSet(set))
		}
		MSG_MEAS_CTR => {
			let (wire, _) =
				MeasCtrWire::read_from_prefix(rest).map_err(|_| ProtocolErr::Truncated)?;
			Ok(CtrlMsg::MeasCtr {
				action: Action::try_from(wire.action)?,
				tdma_cycle: wire.tdma_cycle,
			})
		}
		MSG_ACK => Ok(CtrlMsg::Ack),
		MSG_BUSY => Ok(CtrlMsg::Busy),
		MSG_ERROR => Ok(CtrlMsg::Error),
		_ => Err(ProtocolErr::UnknownType),
	}
}

/// Position of a data packet within its start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataKind {
	/// Start spans more packets; carries the start header.
	First,
	/// Start fits in one packet; carries the start header.
	Only,
	/// Continuation.
	Data,
	/// Final packet of the start.
	Last,
}

impl DataKind {
	/// Whether this packet closes its start.
	pub fn is_final(&self) -> bool {
		matches!(self, DataKind::Only | DataKind::Last)
	}
}

/// Start header fields of a `FIRST`/`ONLY` packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
	pub total_events: u32,
	pub window_start: u64,
	pub window_time: u64,
}

/// A decoded data-plane message.
#[derive(Clone, Debug, PartialEq)]
pub enum DataMsg {
	/// The agent finished its measure.
	Term { window_start: u64, window_time: u64 },
	/// Events of one start.
	Start {
		kind: DataKind,
		id: u32,
		header: Option<DataHeader>,
		events: Vec<StopEvent>,
	},
}

/// Encode one data packet for the start `id`, beginning at event index
/// `start`. Returns the index of the first event not yet sent; the caller
/// repeats until all events went out.
///
/// The first packet (`start == 0`) carries the start header and becomes
/// `ONLY` if everything fits, otherwise `FIRST`; later packets become
/// `DATA` or `LAST`.
pub fn encode_data(
	frame: &mut Frame,
	id: u32,
	window_start: u64,
	window_time: u64,
	ch: &[i8],
	stoptime: &[i32],
	retrig: &[u32],
	start: usize,
) -> usize {
	debug_assert_eq!(ch.len(), stoptime.len());
	debug_assert_eq!(ch.len(), retrig.len());

	frame.clear();
	let buf = frame.buffer_mut();
	let mut offset = DATA_HDR_SIZE;

	let mut mtype = if start == 0 {
		let hdr = StartHdr {
			total_events: ch.len() as u32,
			window_start,
			window_time,
		};
		offset = put(buf, offset, hdr.as_bytes());
		DT_FIRST
	} else {
		DT_DATA
	};

	let mut index = start;
	let mut count: u16 = 0;
	while index < ch.len() && offset + ATMD_EV_SIZE <= ATMD_PACKET_SIZE {
		let event = EventWire {
			ch: ch[index],
			stoptime: stoptime[index],
			retrig: retrig[index],
		};
		offset = put(buf, offset, event.as_bytes());
		index += 1;
		count += 1;
	}

	if index >= ch.len() {
		mtype = if mtype == DT_FIRST { DT_ONLY } else { DT_LAST };
	}

	let hdr = DataHdr {
		mtype,
		numev: count,
		id,
	};
	put(buf, 0, hdr.as_bytes());
	frame.set_len(offset);
	index
}

/// Encode a `TERM` packet announcing the end of the measure.
pub fn encode_term(frame: &mut Frame, window_start: u64, window_time: u64) {
	frame.clear();
	let buf = frame.buffer_mut();
	let mut offset = put(buf, 0, &DT_TERM.to_ne_bytes());
	offset = put(buf, offset, &0u16.to_ne_bytes());
	let wire = TermWire {
		window_start,
		window_time,
	};
	offset = put(buf, offset, wire.as_bytes());
	frame.set_len(offset);
}

/// Decode a data-plane frame.
pub fn decode_data(bytes: &[u8]) -> Result<DataMsg, ProtocolErr> {
	let (hdr, _) = DataHdr::read_from_prefix(bytes).map_err(|_| ProtocolErr::Truncated)?;

	if hdr.mtype == DT_TERM {
		let (term, _) = TermWire::read_from_prefix(&bytes[4..])
			.map_err(|_| ProtocolErr::Truncated)?;
		return Ok(DataMsg::Term {
			window_start: term.window_start,
			window_time: term.window_time,
		});
	}

	let kind = match hdr.mtype {
		DT_FIRST => DataKind::First,
		DT_ONLY => DataKind::Only,
		DT_DATA => DataKind::Data,
		DT_LAST => DataKind::Last,
		_ => return Err(ProtocolErr::UnknownType),
	};

	let mut offset = DATA_HDR_SIZE;
	let header = if matches!(kind, DataKind::First | DataKind::Only) {
		let (start_hdr, _) = StartHdr::read_from_prefix(&bytes[offset..])
			.map_err(|_| ProtocolErr::Truncated)?;
		offset += START_HDR_SIZE;
		Some(DataHeader {
			total_events: start_hdr.total_events,
			window_start: start_hdr.window_start,
			window_time: start_hdr.window_time,
		})
	} else {
		None
	};

	let numev = hdr.numev as usize;
	if offset + numev * ATMD_EV_SIZE > bytes.len() {
		return Err(ProtocolErr::Truncated);
	}

	let mut events = Vec::with_capacity(numev);
	for _ in 0..numev {
		let (event, _) =
			EventWire::read_from_prefix(&bytes[offset..]).map_err(|_| ProtocolErr::Truncated)?;
		events.push(StopEvent {
			channel: event.ch,
			stoptime: event.stoptime,
			retrig: event.retrig,
		});
		offset += ATMD_EV_SIZE;
	}

	Ok(DataMsg::Start {
		kind,
		id: hdr.id,
		header,
		events,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wire_sizes() {
		assert_eq!(CTRL_HDR_SIZE, 4);
		assert_eq!(DATA_HDR_SIZE, 8);
		assert_eq!(START_HDR_SIZE, 20);
		assert_eq!(size_of::<EventWire>(), ATMD_EV_SIZE);
		assert_eq!(size_of::<MeasSet>(), 48);
		assert_eq!(EV_PER_FIRST, 163);
		assert_eq!(EV_PER_DATA, 165);
	}

	#[test]
	fn ctrl_round_trip() {
		let messages = [
			CtrlMsg::Brd {
				version: "3.0".into(),
			},
			CtrlMsg::Hello {
				version: "3.0".into(),
			},
			CtrlMsg::MeasSet(MeasSet {
				agent_id: 1,
				start_rising: 1,
				start_falling: 0,
				rising_mask: 0xFF,
				falling_mask: 0x0F,
				measure_time: 60_000_000_000,
				window_time: 500_000,
				timeout: 1_000_000_000,
				deadtime: 100_000,
				start_offset: 2000,
				refclk: 7,
				hsdiv: 183,
			}),
			CtrlMsg::MeasCtr {
				action: Action::Start,
				tdma_cycle: 1234,
			},
			CtrlMsg::Ack,
			CtrlMsg::Busy,
			CtrlMsg::Error,
		];

		let mut frame = Frame::new();
		for msg in messages {
			encode_ctrl(&msg, &mut frame);
			assert_eq!(decode_ctrl(frame.as_bytes()).unwrap(), msg);
		}
	}

	#[test]
	fn ctrl_rejects_unknown_type() {
		let mut bytes = [0u8; 16];
		bytes[0] = 0xEE;
		assert_eq!(decode_ctrl(&bytes), Err(ProtocolErr::UnknownType));
	}

	#[test]
	fn ctrl_rejects_truncated() {
		assert_eq!(decode_ctrl(&[1]), Err(ProtocolErr::Truncated));
	}

	#[test]
	fn single_packet_start() {
		// Three events fit in one ONLY frame of 55 bytes.
		let ch = [1i8, -2, 5];
		let stop = [100i32, 250, 400];
		let retrig = [0u32, 0, 0];

		let mut frame = Frame::new();
		let next = encode_data(&mut frame, 42, 1_000_000, 500_000, &ch, &stop, &retrig, 0);
		assert_eq!(next, 3);
		assert_eq!(frame.len(), 55);

		match decode_data(frame.as_bytes()).unwrap() {
			DataMsg::Start {
				kind,
				id,
				header,
				events,
			} => {
				assert_eq!(kind, DataKind::Only);
				assert_eq!(id, 42);
				let header = header.unwrap();
				assert_eq!(header.total_events, 3);
				assert_eq!(header.window_start, 1_000_000);
				assert_eq!(header.window_time, 500_000);
				assert_eq!(events.len(), 3);
				assert_eq!(
					events[1],
					StopEvent {
						channel: -2,
						stoptime: 250,
						retrig: 0
					}
				);
			}
			other => panic!("unexpected message: {other:?}"),
		}
	}

	#[test]
	fn multi_packet_start_splits_at_mtu() {
		let n = 200;
		let ch: Vec<i8> = (0..n).map(|i| (i % 8 + 1) as i8).collect();
		let stop: Vec<i32> = (0..n as i32).collect();
		let retrig = vec![0u32; n];

		let mut frame = Frame::new();
		let next = encode_data(&mut frame, 43, 0, 0, &ch, &stop, &retrig, 0);
		assert_eq!(next, EV_PER_FIRST);

		let first = decode_data(frame.as_bytes()).unwrap();
		let DataMsg::Start {
			kind: DataKind::First,
			events: first_events,
			..
		} = first
		else {
			panic!("expected FIRST, got {first:?}");
		};
		assert_eq!(first_events.len(), 163);

		let done = encode_data(&mut frame, 43, 0, 0, &ch, &stop, &retrig, next);
		assert_eq!(done, n);

		let last = decode_data(frame.as_bytes()).unwrap();
		let DataMsg::Start {
			kind: DataKind::Last,
			events: last_events,
			..
		} = last
		else {
			panic!("expected LAST, got {last:?}");
		};
		assert_eq!(last_events.len(), 37);

		// Emission order is preserved across the split.
		let all: Vec<i32> = first_events
			.iter()
			.chain(last_events.iter())
			.map(|e| e.stoptime)
			.collect();
		let expected: Vec<i32> = (0..n as i32).collect();
		assert_eq!(all, expected);
	}

	#[test]
	fn term_round_trip() {
		let mut frame = Frame::new();
		encode_term(&mut frame, 77, 88);
		assert_eq!(frame.len(), 20);
		assert_eq!(
			decode_data(frame.as_bytes()).unwrap(),
			DataMsg::Term {
				window_start: 77,
				window_time: 88
			}
		);
	}

	#[test]
	fn data_decode_rejects_unknown_and_truncated() {
		let mut bytes = vec![0u8; 16];
		bytes[0] = 0xEE;
		assert_eq!(decode_data(&bytes), Err(ProtocolErr::UnknownType));

		// Claim more events than the buffer holds.
		let ch = [1i8];
		let stop = [0i32];
		let retrig = [0u32];
		let mut frame = Frame::new();
		encode_data(&mut frame, 1, 0, 0, &ch, &stop, &retrig, 0);
		let mut bytes = frame.as_bytes().to_vec();
		bytes[2] = 0xFF;
		bytes[3] = 0xFF;
		assert_eq!(decode_data(&bytes), Err(ProtocolErr::Truncated));
	}

	#[test]
	fn decoded_bytes_reencode_identically() {
		let ch = [3i8, -4];
		let stop = [10i32, 20];
		let retrig = [0u32, 1];
		let mut frame = Frame::new();
		encode_data(&mut frame, 9, 5, 6, &ch, &stop, &retrig, 0);
		let original = frame.as_bytes().to_vec();

		let DataMsg::Start { id, header, events, .. } = decode_data(&original).unwrap() else {
			panic!("expected start");
		};
		let header = header.unwrap();
		let ch2: Vec<i8> = events.iter().map(|e| e.channel).collect();
		let stop2: Vec<i32> = events.iter().map(|e| e.stoptime).collect();
		let retrig2: Vec<u32> = events.iter().map(|e| e.retrig).collect();

		let mut frame2 = Frame::new();
		encode_data(
			&mut frame2,
			id,
			header.window_start,
			header.window_time,
			&ch2,
			&stop2,
			&retrig2,
			0,
		);
		assert_eq!(frame2.as_bytes(), &original[..]);
	}
}
