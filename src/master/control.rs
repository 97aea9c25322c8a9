//! Master control task: discovery and measure control on the control
//! plane.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;

use super::{AgentDescriptor, VirtualBoard};
use crate::config::ATMD_TDMA_OFFSET;
use crate::net::codec::{decode_ctrl, encode_ctrl, Action, CtrlMsg, Frame};
use crate::net::rtnet::{RtNet, TransportErr};
use crate::net::EtherAddr;
use crate::{shutdown_requested, Status, VERSION};

/// Receive timeout while idling, bounds shutdown latency.
const IDLE_RECV_TIMEOUT_NS: u64 = 10_000_000;
/// How long an agent may take to acknowledge a command.
const ACK_TIMEOUT_NS: u64 = 500_000_000;

/// Requests from the client handler to the control task.
pub enum Command {
	StartMeasure,
	StopMeasure,
}

/// A command with its reply channel.
pub struct Request {
	pub command: Command,
	pub reply: Sender<Result<(), ControlErr>>,
}

#[derive(Debug, Error)]
pub enum ControlErr {
	#[error("board is not idle")]
	NotIdle,
	#[error("no measure is running")]
	NotRunning,
	#[error("agent {0} refused the command")]
	AgentRefused(usize),
	#[error("agent {0} did not answer")]
	AgentTimeout(usize),
	#[error(transparent)]
	Transport(#[from] TransportErr),
}

/// Broadcast our presence and collect `HELLO` replies until every
/// configured agent is accounted for.
pub fn discover(sock: &RtNet, configured: &[EtherAddr]) -> Result<Vec<AgentDescriptor>, TransportErr> {
	let mut frame = Frame::new();
	encode_ctrl(
		&CtrlMsg::Brd {
			version: VERSION.into(),
		},
		&mut frame,
	);
	sock.send(&frame, &EtherAddr::BROADCAST)?;
	debug!("sent broadcast, waiting for {} agent(s)", configured.len());

	let mut agents: Vec<AgentDescriptor> = Vec::with_capacity(configured.len());
	while agents.len() < configured.len() {
		if shutdown_requested() {
			break;
		}

		let src = match sock.recv(&mut frame, Some(IDLE_RECV_TIMEOUT_NS)) {
			Ok(src) => src,
			Err(TransportErr::RecvTimeout) => continue,
			Err(err) => return Err(err),
		};

		match decode_ctrl(frame.as_bytes()) {
			Ok(CtrlMsg::Hello { version }) => {
				if version != VERSION {
					debug!("received HELLO with wrong version ('{version}' instead of '{VERSION}')");
					continue;
				}
			}
			Ok(other) => {
				debug!("received an unexpected packet during discovery: {other:?}");
				continue;
			}
			Err(err) => {
				warn!("received undecodable packet during discovery: {err}");
				continue;
			}
		}

		// The sender must be configured and not yet registered.
		let Some(id) = configured.iter().position(|mac| *mac == src) else {
			warn!("ignoring HELLO from unconfigured agent '{src}'");
			continue;
		};
		if agents.iter().any(|agent| agent.addr == src) {
			continue;
		}

		info!("registered agent {id} at '{src}'");
		agents.push(AgentDescriptor { id, addr: src });
	}

	agents.sort_by_key(|agent| agent.id);
	Ok(agents)
}

/// Serve measure commands and stray control traffic until shutdown.
pub fn control_task(sock: RtNet, vb: Arc<VirtualBoard>, requests: Receiver<Request>) {
	crate::rt::set_realtime_priority(75);
	let mut frame = Frame::new();

	// The board leaves the unknown state once commands are served.
	vb.set_status(Status::Idle);

	while !shutdown_requested() {
		// Commands from the client handler first.
		while let Ok(request) = requests.try_recv() {
			let result = match request.command {
				Command::StartMeasure => start_measure(&sock, &vb, &mut frame),
				Command::StopMeasure => stop_measure(&sock, &vb, &mut frame),
			};
			if let Err(err) = &result {
				error!("measure command failed: {err}");
			}
			// The client may have gone away; nothing to do then.
			let _ = request.reply.send(result);
		}

		// Late traffic: an agent that rebooted answers a later broadcast
		// with HELLO again. Keep its registration.
		match sock.recv(&mut frame, Some(IDLE_RECV_TIMEOUT_NS)) {
			Ok(src) => match decode_ctrl(frame.as_bytes()) {
				Ok(CtrlMsg::Hello { .. }) => {
					if vb.find_agent(&src).is_some() {
						info!("agent '{src}' restarted, keeping registration");
					} else {
						warn!("ignoring HELLO from unconfigured agent '{src}'");
					}
				}
				Ok(other) => debug!("ignoring unexpected control packet: {other:?}"),
				Err(err) => debug!("dropping undecodable control packet: {err}"),
			},
			Err(TransportErr::RecvTimeout) => {}
			Err(err) => {
				error!("control socket failed: {err}");
				crate::request_shutdown();
			}
		}
	}
}

/// Push the measure configuration to every agent, then schedule the
/// synchronized start.
fn start_measure(sock: &RtNet, vb: &VirtualBoard, frame: &mut Frame) -> Result<(), ControlErr> {
	if vb.status() != Status::Idle && vb.status() != Status::Finished {
		return Err(ControlErr::NotIdle);
	}

	let config = vb.config().clone();

	// Configure all agents and collect their ACKs.
	for agent in vb.agents() {
		let set = config.meas_set_for(agent.id);
		encode_ctrl(&CtrlMsg::MeasSet(set), frame);
		sock.send(frame, &agent.addr)?;
		expect_ack(sock, frame, agent, "MEAS_SET")?;
	}

	// Reference cycle in the near future; agents add their own offset.
	let cycle = sock.wait_tdma()? + ATMD_TDMA_OFFSET;

	for agent in vb.agents() {
		encode_ctrl(
			&CtrlMsg::MeasCtr {
				action: Action::Start,
				tdma_cycle: cycle,
			},
			frame,
		);
		sock.send(frame, &agent.addr)?;
		expect_ack(sock, frame, agent, "MEAS_CTR start")?;
	}

	vb.set_status(Status::Running);
	info!("measure started, reference TDMA cycle {cycle}");
	Ok(())
}

/// Ask every agent to stop the running measure.
fn stop_measure(sock: &RtNet, vb: &VirtualBoard, frame: &mut Frame) -> Result<(), ControlErr> {
	if vb.status() != Status::Running {
		return Err(ControlErr::NotRunning);
	}

	for agent in vb.agents() {
		encode_ctrl(
			&CtrlMsg::MeasCtr {
				action: Action::Stop,
				tdma_cycle: 0,
			},
			frame,
		);
		sock.send(frame, &agent.addr)?;
		expect_ack(sock, frame, agent, "MEAS_CTR stop")?;
	}

	info!("measure stop requested");
	Ok(())
}

/// Wait for an `ACK` from one agent, skipping unrelated traffic.
fn expect_ack(
	sock: &RtNet,
	frame: &mut Frame,
	agent: &AgentDescriptor,
	what: &str,
) -> Result<(), ControlErr> {
	let deadline = crate::time::monotonic_ns() + ACK_TIMEOUT_NS;
	loop {
		let now = crate::time::monotonic_ns();
		if now >= deadline {
			error!("agent {} did not acknowledge {what}", agent.id);
			return Err(ControlErr::AgentTimeout(agent.id));
		}

		let src = match sock.recv(frame, Some(deadline - now)) {
			Ok(src) => src,
			Err(TransportErr::RecvTimeout) => continue,
			Err(err) => return Err(err.into()),
		};
		if src != agent.addr {
			debug!("ignoring packet from '{src}' while waiting for agent {}", agent.id);
			continue;
		}

		match decode_ctrl(frame.as_bytes()) {
			Ok(CtrlMsg::Ack) => return Ok(()),
			Ok(CtrlMsg::Busy) | Ok(CtrlMsg::Error) => {
				error!("agent {} refused {what}", agent.id);
				return Err(ControlErr::AgentRefused(agent.id));
			}
			Ok(other) => {
				debug!("ignoring unexpected packet while waiting for ACK: {other:?}");
			}
			Err(err) => {
				warn!("dropping undecodable packet while waiting for ACK: {err}");
			}
		}
	}
}
