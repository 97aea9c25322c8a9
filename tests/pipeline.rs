//! End-to-end exercise of the data path: events acquired on the agent
//! side are encoded into wire frames, decoded on the master side and
//! assembled into measures, exactly as the two daemons would do it over
//! the TDMA segment.

use std::fs;
use std::sync::Arc;

use atmd::drivers::gpx::buffer::EventBuffer;
use atmd::env::Config;
use atmd::master::data::Assembler;
use atmd::master::{AgentDescriptor, VirtualBoard};
use atmd::net::codec::{decode_data, encode_data, encode_term, DataMsg, Frame};
use atmd::net::EtherAddr;
use atmd::Status;

fn board(agents: usize, autosave: u32, prefix: &str) -> Arc<VirtualBoard> {
	let agents = (0..agents)
		.map(|id| AgentDescriptor {
			id,
			addr: EtherAddr([2, 0, 0, 0, 0, id as u8 + 1]),
		})
		.collect();
	let config = Config {
		autosave,
		prefix: prefix.to_string(),
		format: Some("BINPS".to_string()),
		..Config::default()
	};
	let vb = Arc::new(VirtualBoard::new(agents, &config));
	// The control task would flip the board out of the unknown state.
	vb.set_status(Status::Idle);
	vb
}

/// Encode one start the way the agent's measure thread does and feed
/// every resulting frame to the assembler.
fn transmit_start(assembler: &mut Assembler, agent: usize, id: u32, events: &EventBuffer) {
	let mut frame = Frame::new();
	let window = events.end() - events.begin();
	let mut next = 0;
	loop {
		next = encode_data(
			&mut frame,
			id,
			events.begin(),
			window,
			events.ch(),
			events.stoptime(),
			events.retrig(),
			next,
		);
		let msg = decode_data(frame.as_bytes()).expect("wire frame must decode");
		assembler.process(agent, msg).expect("frame must assemble");
		if next >= events.len() {
			return;
		}
	}
}

fn transmit_term(assembler: &mut Assembler, agent: usize, elapsed: u64) {
	let mut frame = Frame::new();
	encode_term(&mut frame, 0, elapsed);
	match decode_data(frame.as_bytes()).expect("TERM must decode") {
		msg @ DataMsg::Term { .. } => assembler.process(agent, msg).expect("TERM must assemble"),
		other => panic!("expected TERM, decoded {other:?}"),
	}
}

#[test]
fn single_agent_multi_packet_start() {
	let vb = board(1, 0, "");
	let mut assembler = Assembler::new(Arc::clone(&vb));

	// 200 events split over FIRST and LAST at the 1500-byte MTU.
	let mut events = EventBuffer::new();
	events.set_begin(1_000_000);
	events.set_end(1_500_000);
	for i in 0..200 {
		events
			.push((i % 8 + 1) as i8, i as i32, 0)
			.expect("buffer growth");
	}

	transmit_start(&mut assembler, 0, 0, &events);
	transmit_term(&mut assembler, 0, 2_000_000);

	assert_eq!(vb.count_measures(), 1);
	assert_eq!(vb.stat_measure(0), Some(1));
	assert_eq!(vb.status(), Status::Finished);

	// All 200 events survive the split.
	let stats = vb.stat_stops(0).expect("measure exists");
	let total: u32 = stats[0][1..].iter().sum();
	assert_eq!(total, 200);
	// Window duration in 5 µs autoretrigger periods.
	assert_eq!(stats[0][0], 100);
}

#[test]
fn two_agents_merge_into_virtual_channels() {
	let vb = board(2, 0, "");
	let mut assembler = Assembler::new(Arc::clone(&vb));

	// Agent 0: channel 1. Agent 1: channel -3, remapped to -11. The
	// start seals only once both agents delivered, whatever the order.
	let mut a0 = EventBuffer::new();
	a0.set_begin(100);
	a0.set_end(200);
	a0.push(1, 10, 0).unwrap();

	let mut a1 = EventBuffer::new();
	a1.set_begin(105);
	a1.set_end(205);
	a1.push(-3, 20, 0).unwrap();

	transmit_start(&mut assembler, 1, 7, &a1);
	transmit_start(&mut assembler, 0, 7, &a0);
	transmit_term(&mut assembler, 0, 1_000);
	transmit_term(&mut assembler, 1, 1_000);

	assert_eq!(vb.count_measures(), 1);
	let stats = vb.stat_stops(0).expect("measure exists");
	assert_eq!(stats.len(), 1);
	assert_eq!(stats[0][1], 1, "agent 0 keeps channel 1");
	assert_eq!(stats[0][11], 1, "agent 1 channel 3 lands on 11");
	let total: u32 = stats[0][1..].iter().sum();
	assert_eq!(total, 2);
}

#[test]
fn autosave_rotates_measures() {
	let dir = std::env::temp_dir().join(format!("atmd-autosave-{}", std::process::id()));
	fs::create_dir_all(&dir).unwrap();
	let prefix = format!("{}/run_", dir.display());

	let vb = board(1, 2, &prefix);
	let mut assembler = Assembler::new(Arc::clone(&vb));

	// Three starts with autosave every 2: one file after the second
	// start, one file with the remainder when the measure ends.
	for id in 0..3u32 {
		let mut events = EventBuffer::new();
		events.set_begin(1_000 * id as u64);
		events.set_end(1_000 * id as u64 + 500);
		events.push(1, id as i32, 0).unwrap();
		transmit_start(&mut assembler, 0, id, &events);
	}
	transmit_term(&mut assembler, 0, 3_000);

	assert_eq!(vb.status(), Status::Idle);
	// Nothing reaches the in-memory store under autosave.
	assert_eq!(vb.count_measures(), 0);

	let mut files: Vec<_> = fs::read_dir(&dir)
		.unwrap()
		.map(|entry| entry.unwrap().path())
		.collect();
	files.sort();
	assert_eq!(files.len(), 2, "files: {files:?}");

	// First file holds two starts, second the remaining one.
	let first = fs::read(&files[0]).unwrap();
	let second = fs::read(&files[1]).unwrap();
	assert_eq!(u32::from_ne_bytes(first[..4].try_into().unwrap()), 1);
	assert_eq!(first.len(), 2 * (4 + 10));
	assert_eq!(second.len(), 4 + 10);

	fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn save_and_delete_through_the_store() {
	let dir = std::env::temp_dir().join(format!("atmd-store-{}", std::process::id()));
	fs::create_dir_all(&dir).unwrap();

	let vb = board(1, 0, "");
	let mut assembler = Assembler::new(Arc::clone(&vb));

	let mut events = EventBuffer::new();
	events.set_begin(0);
	events.set_end(500);
	events.push(2, 40, 0).unwrap();
	events.push(-2, 80, 0).unwrap();
	transmit_start(&mut assembler, 0, 0, &events);
	transmit_term(&mut assembler, 0, 1_000);

	let path = dir.join("measure.mat");
	vb.save_measure(0, path.to_str().unwrap(), "MATPS3".parse().unwrap())
		.expect("save must succeed");

	let bytes = fs::read(&path).unwrap();
	assert!(bytes.len() > 128);
	assert!(bytes.starts_with(b"MATLAB 5.0 MAT-file"));

	assert!(vb.delete_measure(0));
	assert_eq!(vb.count_measures(), 0);

	fs::remove_dir_all(&dir).unwrap();
}
