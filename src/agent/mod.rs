//! The agent daemon: one converter board, one master.
//!
//! A single control loop owns the control socket. It waits for the
//! master's broadcast, answers with `HELLO`, and then serves control
//! packets: measure configuration is applied to the board directly, the
//! measure itself runs on a separate real-time thread that is gated by a
//! message queue (see [`measure`]).

pub mod measure;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, info, warn};
use thiserror::Error;

use self::measure::MeasureDef;
use crate::config::{ATMD_PROTO_CTRL, ATMD_PROTO_DATA};
use crate::drivers::error::DriverError;
use crate::drivers::gpx::{BoardConfig, GpxBoard, GpxBus, HardwareFault};
use crate::env::Config;
use crate::net::codec::{decode_ctrl, encode_ctrl, Action, CtrlMsg, Frame, MeasSet};
use crate::net::rtnet::{RtNet, TransportErr};
use crate::net::EtherAddr;
use crate::{shutdown_requested, AtomicStatus, Status, VERSION};

/// Receive timeout of the control loop; bounds the shutdown latency.
const CTRL_RECV_TIMEOUT_NS: u64 = 10_000_000;

#[derive(Debug, Error)]
pub enum AgentError {
	#[error(transparent)]
	Transport(#[from] TransportErr),
	#[error(transparent)]
	Driver(#[from] DriverError),
	#[error("failed to spawn measure thread: {0}")]
	Spawn(#[from] std::io::Error),
}

impl From<HardwareFault> for AgentError {
	fn from(fault: HardwareFault) -> Self {
		AgentError::Driver(fault.into())
	}
}

/// Locate the converter and run the agent until shutdown.
#[cfg(target_arch = "x86_64")]
pub fn run(config: &Config) -> Result<(), AgentError> {
	let bus = crate::drivers::gpx::PortBus::probe()?;
	run_with_board(config, GpxBoard::new(bus))
}

/// Run the agent on an already constructed board. Entry point for
/// simulated buses.
pub fn run_with_board<B: GpxBus + Send + 'static>(
	config: &Config,
	board: GpxBoard<B>,
) -> Result<(), AgentError> {
	let ctrl_sock = RtNet::open(&config.rtif, ATMD_PROTO_CTRL, config.rtskbs)?;
	let data_sock = Arc::new(RtNet::open(&config.rtif, ATMD_PROTO_DATA, config.rtskbs)?);
	debug!("control and data sockets ready on '{}'", config.rtif);

	// Wait for the master broadcast.
	let mut frame = Frame::new();
	let master = loop {
		if shutdown_requested() {
			return Ok(());
		}

		let src = match ctrl_sock.recv(&mut frame, Some(CTRL_RECV_TIMEOUT_NS)) {
			Ok(src) => src,
			Err(TransportErr::RecvTimeout) => continue,
			Err(err) => {
				error!("failed to receive a packet waiting for master broadcast: {err}");
				return Err(err.into());
			}
		};

		match decode_ctrl(frame.as_bytes()) {
			Ok(CtrlMsg::Brd { version }) => {
				if version != VERSION {
					warn!(
						"received a broadcast from an ATMD server with wrong version ({version} != {VERSION})"
					);
					continue;
				}
				debug!("received broadcast from master with address '{src}'");
				break src;
			}
			Ok(_) => continue,
			Err(err) => {
				warn!("received packet that failed to decode: {err}");
				continue;
			}
		}
	};

	// Answer the master.
	send_hello(&ctrl_sock, &master)?;
	debug!("answered to master");

	// Shared state between the control loop and the measure thread.
	let board = Arc::new(Mutex::new(board));
	let stop = Arc::new(AtomicBool::new(false));
	let status = Arc::new(AtomicStatus::new(Status::Idle));
	let (meas_tx, meas_rx) = mpsc::channel::<MeasureDef>();

	let measure_thread = {
		let ctx = measure::MeasureCtx {
			queue: meas_rx,
			board: Arc::clone(&board),
			sock: Arc::clone(&data_sock),
			master,
			stop: Arc::clone(&stop),
			status: Arc::clone(&status),
		};
		thread::Builder::new()
			.name("atmd-measure".into())
			.spawn(move || measure::measure_task(ctx))?
	};
	debug!("successfully spawned the measure thread");

	// Pending measure timings, filled in by MEAS_SET.
	let mut pending = MeasureDef::default();

	// Serve control packets until shutdown.
	while !shutdown_requested() {
		let src = match ctrl_sock.recv(&mut frame, Some(CTRL_RECV_TIMEOUT_NS)) {
			Ok(src) => src,
			Err(TransportErr::RecvTimeout) => continue,
			Err(err) => {
				error!("failed to receive packet from master: {err}");
				crate::request_shutdown();
				continue;
			}
		};

		// Only our master may drive us.
		if src != master {
			warn!("received a control packet from an unknown master, address was '{src}'");
			continue;
		}

		let msg = match decode_ctrl(frame.as_bytes()) {
			Ok(msg) => msg,
			Err(err) => {
				error!("failed to decode a control packet: {err}");
				continue;
			}
		};

		match msg {
			CtrlMsg::Brd { .. } => {
				// Master restarted: abort whatever is in flight and
				// handshake again.
				info!("master restarted, handshaking again");
				if send_hello(&ctrl_sock, &master).is_err() {
					crate::request_shutdown();
					continue;
				}
				if status.load() == Status::Running {
					stop.store(true, Ordering::Relaxed);
				}
				board
					.lock()
					.unwrap_or_else(|poison| poison.into_inner())
					.reset_config();
			}

			CtrlMsg::Hello { .. } | CtrlMsg::Ack | CtrlMsg::Busy | CtrlMsg::Error => {
				warn!("received an unexpected control packet, ignoring");
			}

			CtrlMsg::MeasSet(set) => {
				debug!("received a measurement settings packet from master");
				let reply = match apply_settings(&board, &set, &mut pending) {
					Ok(()) => {
						debug!("board correctly configured");
						CtrlMsg::Ack
					}
					Err(err) => {
						error!("failed to configure board: {err}");
						status.store(Status::Error);
						CtrlMsg::Error
					}
				};
				if send_reply(&ctrl_sock, &master, &reply).is_err() {
					crate::request_shutdown();
				}
			}

			CtrlMsg::MeasCtr { action, tdma_cycle } => match action {
				Action::Start => {
					let reply = if status.load() == Status::Idle {
						pending.tdma_cycle = tdma_cycle;
						stop.store(false, Ordering::Relaxed);
						status.store(Status::Starting);
						if meas_tx.send(pending.clone()).is_err() {
							error!("failed to send settings to the measure thread");
							crate::request_shutdown();
							continue;
						}
						debug!("starting measurement at TDMA cycle {tdma_cycle}");
						CtrlMsg::Ack
					} else if status.load() == Status::Error {
						CtrlMsg::Error
					} else {
						CtrlMsg::Busy
					};
					if send_reply(&ctrl_sock, &master, &reply).is_err() {
						crate::request_shutdown();
					}
				}
				Action::Stop => {
					let reply = if status.load() == Status::Running {
						stop.store(true, Ordering::Relaxed);
						CtrlMsg::Ack
					} else {
						CtrlMsg::Error
					};
					if send_reply(&ctrl_sock, &master, &reply).is_err() {
						crate::request_shutdown();
					}
				}
				Action::NoAction => {
					warn!("received a measure control packet with no action");
				}
			},
		}
	}

	// The measure thread exits once the queue disconnects.
	drop(meas_tx);
	if measure_thread.join().is_err() {
		error!("measure thread panicked");
	}
	Ok(())
}

/// Store the measure settings into the board and program it.
fn apply_settings<B: GpxBus>(
	board: &Mutex<GpxBoard<B>>,
	set: &MeasSet,
	pending: &mut MeasureDef,
) -> Result<(), HardwareFault> {
	pending.measure_time = set.measure_time;
	pending.window_time = set.window_time;
	pending.timeout = set.timeout;
	pending.deadtime = set.deadtime;
	pending.tdma_cycle = 0;

	let mut board = board.lock().unwrap_or_else(|poison| poison.into_inner());
	board.set_config(BoardConfig {
		start_rising: set.start_rising != 0,
		start_falling: set.start_falling != 0,
		rising_mask: set.rising_mask,
		falling_mask: set.falling_mask,
		start_offset: set.start_offset,
		refclkdiv: set.refclk,
		hsdiv: set.hsdiv,
		..BoardConfig::default()
	});
	board.apply()
}

fn send_hello(sock: &RtNet, master: &EtherAddr) -> Result<(), TransportErr> {
	send_reply(
		sock,
		master,
		&CtrlMsg::Hello {
			version: VERSION.into(),
		},
	)
}

fn send_reply(sock: &RtNet, master: &EtherAddr, msg: &CtrlMsg) -> Result<(), TransportErr> {
	let mut frame = Frame::new();
	encode_ctrl(msg, &mut frame);
	sock.send(&frame, master).inspect_err(|err| {
		error!("failed to send control packet to master: {err}");
	})
}
