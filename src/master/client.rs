//! Minimal client text protocol.
//!
//! Line-based, CRLF-terminated. Only the `MSR` command family is
//! implemented; `SET`/`GET`/`EXT` belong to the configuration surface
//! outside the core and are answered with a fixed error.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use super::control::{Command, ControlErr, Request};
use super::VirtualBoard;
use crate::{shutdown_requested, Status};

/// Error codes sent to the client.
const ERR_BAD_PARAM: u32 = 3;
const ERR_START: u32 = 5;
const ERR_STOP: u32 = 6;
const ERR_SAV: u32 = 8;
const ERR_DEL: u32 = 9;

/// How long a measure command may take end to end, agent ACKs included.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept one client at a time and serve it until shutdown.
pub fn serve(args: &crate::env::Args, vb: &Arc<VirtualBoard>, requests: &Sender<Request>) {
	let listener = match TcpListener::bind((args.listen.as_str(), args.port)) {
		Ok(listener) => listener,
		Err(err) => {
			error!("cannot listen on {}:{}: {err}", args.listen, args.port);
			crate::request_shutdown();
			return;
		}
	};
	if let Err(err) = listener.set_nonblocking(true) {
		error!("cannot configure listening socket: {err}");
		crate::request_shutdown();
		return;
	}
	info!("listening for clients on {}:{}", args.listen, args.port);

	while !shutdown_requested() {
		match listener.accept() {
			Ok((stream, peer)) => {
				info!("client connected from {peer}");
				if let Err(err) = handle_client(stream, vb, requests) {
					warn!("client connection failed: {err}");
				}
				info!("client disconnected");

				// A vanished client must not leave the fabric measuring.
				if vb.status() == Status::Running {
					warn!("client left with a measure running, stopping it");
					let _ = send_command(requests, Command::StopMeasure);
				}
			}
			Err(err) if err.kind() == ErrorKind::WouldBlock => {
				std::thread::sleep(Duration::from_millis(100));
			}
			Err(err) => {
				error!("accept failed: {err}");
				std::thread::sleep(Duration::from_millis(100));
			}
		}
	}
}

fn handle_client(
	mut stream: TcpStream,
	vb: &Arc<VirtualBoard>,
	requests: &Sender<Request>,
) -> std::io::Result<()> {
	stream.set_read_timeout(Some(Duration::from_millis(100)))?;

	let mut pending = Vec::new();
	let mut chunk = [0u8; 512];
	while !shutdown_requested() {
		let read = match stream.read(&mut chunk) {
			Ok(0) => return Ok(()),
			Ok(read) => read,
			Err(err)
				if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
			{
				continue;
			}
			Err(err) => return Err(err),
		};
		pending.extend_from_slice(&chunk[..read]);

		while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
			let raw: Vec<u8> = pending.drain(..=pos).collect();
			let line = String::from_utf8_lossy(&raw);
			let line = line.trim_end_matches(['\r', '\n']).trim();
			if line.is_empty() {
				continue;
			}

			let reply = handle_line(line, vb, requests);
			stream.write_all(reply.as_bytes())?;
			stream.write_all(b"\r\n")?;
		}
	}
	Ok(())
}

/// Execute one command line and build the reply.
fn handle_line(line: &str, vb: &Arc<VirtualBoard>, requests: &Sender<Request>) -> String {
	let mut words = line.split_whitespace();
	match words.next() {
		Some("MSR") => handle_msr(words, vb, requests),
		Some("SET") | Some("GET") | Some("EXT") => format!("ERR {ERR_BAD_PARAM}"),
		_ => format!("ERR {ERR_BAD_PARAM}"),
	}
}

fn handle_msr<'a>(
	mut words: impl Iterator<Item = &'a str>,
	vb: &Arc<VirtualBoard>,
	requests: &Sender<Request>,
) -> String {
	match words.next() {
		Some("START") => match send_command(requests, Command::StartMeasure) {
			Ok(()) => "ACK".into(),
			Err(err) => {
				warn!("start refused: {err}");
				format!("ERR {ERR_START}")
			}
		},
		Some("STOP") | Some("ABORT") => match send_command(requests, Command::StopMeasure) {
			Ok(()) => "ACK".into(),
			Err(err) => {
				warn!("stop refused: {err}");
				format!("ERR {ERR_STOP}")
			}
		},
		Some("STATUS") => format!("VAL STATUS {}", status_str(vb.status())),
		Some("LST") => {
			let counts = vb.list_measures();
			let mut reply = format!("VAL LST {}", counts.len());
			for count in counts {
				reply.push_str(&format!(" {count}"));
			}
			reply
		}
		Some("STAT") => match words.next().and_then(|w| w.parse::<usize>().ok()) {
			Some(num) => match vb.stat_measure(num) {
				Some(starts) => format!("VAL STAT {num} {starts}"),
				None => format!("ERR {ERR_BAD_PARAM}"),
			},
			None => format!("ERR {ERR_BAD_PARAM}"),
		},
		Some("SAV") => {
			let num = words.next().and_then(|w| w.parse::<usize>().ok());
			let format = words.next().and_then(|w| w.parse().ok());
			let path = words.next().and_then(sanitize_path);
			match (num, format, path) {
				(Some(num), Some(format), Some(path)) => {
					if num >= vb.count_measures() {
						return format!("ERR {ERR_BAD_PARAM}");
					}
					match vb.save_measure(num, &path, format) {
						Ok(()) => "ACK".into(),
						Err(err) => {
							error!("save failed: {err}");
							format!("ERR {ERR_SAV}")
						}
					}
				}
				_ => format!("ERR {ERR_BAD_PARAM}"),
			}
		}
		Some("DEL") => match words.next().and_then(|w| w.parse::<usize>().ok()) {
			Some(num) if vb.delete_measure(num) => "ACK".into(),
			Some(_) => format!("ERR {ERR_DEL}"),
			None => format!("ERR {ERR_BAD_PARAM}"),
		},
		Some("CLR") => {
			vb.clear_measures();
			"ACK".into()
		}
		_ => format!("ERR {ERR_BAD_PARAM}"),
	}
}

fn status_str(status: Status) -> &'static str {
	match status {
		Status::Unknown => "UNKN",
		Status::Idle => "IDLE",
		Status::Finished => "FINISHED",
		Status::Running | Status::Starting => "RUNNING",
		Status::Error => "ERR 1",
	}
}

/// Send a command to the control task and wait for its outcome.
fn send_command(requests: &Sender<Request>, command: Command) -> Result<(), ControlErr> {
	let (reply_tx, reply_rx) = mpsc::channel();
	let request = Request {
		command,
		reply: reply_tx,
	};
	if requests.send(request).is_err() {
		return Err(ControlErr::NotIdle);
	}
	match reply_rx.recv_timeout(COMMAND_TIMEOUT) {
		Ok(result) => result,
		Err(_) => {
			error!("control task did not answer");
			Err(ControlErr::NotIdle)
		}
	}
}

/// Save paths are restricted to `/home` with a safe character set;
/// parent-directory segments are stripped.
fn sanitize_path(path: &str) -> Option<String> {
	let rest = path.strip_prefix("/home/")?;
	if rest.is_empty()
		|| !rest
			.bytes()
			.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'))
	{
		return None;
	}

	let mut clean = String::from("/home");
	for segment in rest.split('/') {
		if segment.is_empty() || segment == ".." {
			continue;
		}
		clean.push('/');
		clean.push_str(segment);
	}
	if clean == "/home" {
		return None;
	}
	Some(clean)
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;
	use crate::env::Config;
	use crate::master::AgentDescriptor;
	use crate::measure::Measure;
	use crate::net::EtherAddr;

	fn board() -> Arc<VirtualBoard> {
		let agents = vec![AgentDescriptor {
			id: 0,
			addr: EtherAddr([2, 0, 0, 0, 0, 1]),
		}];
		Arc::new(VirtualBoard::new(agents, &Config::default()))
	}

	#[test]
	fn sanitize_accepts_home_paths() {
		assert_eq!(
			sanitize_path("/home/data/run-1.mat"),
			Some("/home/data/run-1.mat".into())
		);
	}

	#[test]
	fn sanitize_strips_parent_segments() {
		assert_eq!(
			sanitize_path("/home/data/../../etc/passwd"),
			Some("/home/data/etc/passwd".into())
		);
	}

	#[test]
	fn sanitize_rejects_outside_home() {
		assert_eq!(sanitize_path("/etc/passwd"), None);
		assert_eq!(sanitize_path("/home/bad name"), None);
		assert_eq!(sanitize_path("/home/"), None);
	}

	#[test]
	fn status_and_store_commands() {
		let vb = board();
		let (tx, _rx) = mpsc::channel();

		// Before the control task serves the board its state is unknown.
		assert_eq!(handle_line("MSR STATUS", &vb, &tx), "VAL STATUS UNKN");
		vb.set_status(crate::Status::Idle);
		assert_eq!(handle_line("MSR STATUS", &vb, &tx), "VAL STATUS IDLE");
		assert_eq!(handle_line("MSR LST", &vb, &tx), "VAL LST 0");
		assert_eq!(handle_line("MSR STAT 0", &vb, &tx), "ERR 3");

		vb.add_measure(Measure::new(81.0));
		assert_eq!(handle_line("MSR LST", &vb, &tx), "VAL LST 1 0");
		assert_eq!(handle_line("MSR STAT 0", &vb, &tx), "VAL STAT 0 0");
		assert_eq!(handle_line("MSR DEL 0", &vb, &tx), "ACK");
		assert_eq!(handle_line("MSR DEL 0", &vb, &tx), "ERR 9");

		vb.add_measure(Measure::new(81.0));
		assert_eq!(handle_line("MSR CLR", &vb, &tx), "ACK");
		assert_eq!(vb.count_measures(), 0);

		assert_eq!(handle_line("SET whatever", &vb, &tx), "ERR 3");
		assert_eq!(handle_line("bogus", &vb, &tx), "ERR 3");
	}

	#[test]
	fn start_goes_through_the_control_channel() {
		let vb = board();
		let (tx, rx) = mpsc::channel::<Request>();

		let control = thread::spawn(move || {
			let request = rx.recv().unwrap();
			assert!(matches!(request.command, Command::StartMeasure));
			request.reply.send(Ok(())).unwrap();
		});

		assert_eq!(handle_line("MSR START", &vb, &tx), "ACK");
		control.join().unwrap();
	}

	#[test]
	fn refused_start_maps_to_error_code() {
		let vb = board();
		let (tx, rx) = mpsc::channel::<Request>();

		let control = thread::spawn(move || {
			let request = rx.recv().unwrap();
			request.reply.send(Err(ControlErr::NotIdle)).unwrap();
		});

		assert_eq!(handle_line("MSR START", &vb, &tx), "ERR 5");
		control.join().unwrap();
	}
}
