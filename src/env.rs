//! Command-line and configuration-file parsing.

use std::fs;
use std::str::FromStr;

use log::{debug, warn};

use crate::config::{ATMD_CONF_FILE, ATMD_DEF_LISTEN, ATMD_DEF_PORT, ATMD_DEF_RTSKBS, ATMD_PID_FILE};
use crate::net::EtherAddr;

/// Which daemon is parsing its command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
	Server,
	Agent,
}

/// Parsed command-line options.
#[derive(Debug, Clone)]
pub struct Args {
	pub debug: bool,
	pub pid_file: String,
	pub conf_file: String,
	/// Client protocol listening port (server only).
	pub port: u16,
	/// Client protocol listening address (server only).
	pub listen: String,
}

impl Default for Args {
	fn default() -> Self {
		Self {
			debug: false,
			pid_file: ATMD_PID_FILE.to_string(),
			conf_file: ATMD_CONF_FILE.to_string(),
			port: ATMD_DEF_PORT,
			listen: ATMD_DEF_LISTEN.to_string(),
		}
	}
}

/// Absolute paths restricted to a safe character set.
fn valid_path(s: &str) -> bool {
	s.starts_with('/')
		&& !s.is_empty()
		&& s.bytes()
			.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'))
}

/// Parse the command line of one of the daemons.
///
/// Accepted options: `-d` (debug), `-p <pid_file>`, `-c <conf_file>`; the
/// server additionally takes `-n <tcp_port>` and `-i <ip_address>`. Invalid
/// values fall back to the defaults with a warning, unknown options are
/// warned about and skipped.
pub fn parse_args<I: IntoIterator<Item = String>>(role: Role, args: I) -> Args {
	let mut parsed = Args::default();
	let mut words = args.into_iter();

	while let Some(word) = words.next() {
		match word.as_str() {
			"-d" => parsed.debug = true,
			"-p" => match words.next() {
				Some(path) if valid_path(&path) => parsed.pid_file = path,
				Some(path) => {
					warn!("supplied an invalid pid file name ({path}), using default");
				}
				None => warn!("option -p requires a value"),
			},
			"-c" => match words.next() {
				Some(path) if valid_path(&path) => parsed.conf_file = path,
				Some(path) => {
					warn!("supplied an invalid configuration file name ({path}), using default");
				}
				None => warn!("option -c requires a value"),
			},
			"-n" if role == Role::Server => match words.next().map(|w| w.parse::<u16>()) {
				Some(Ok(port)) => parsed.port = port,
				_ => warn!("option -n requires a port number"),
			},
			"-i" if role == Role::Server => match words.next() {
				Some(addr) => parsed.listen = addr,
				None => warn!("option -i requires a value"),
			},
			other => warn!("supplied unknown command line option \"{other}\""),
		}
	}

	parsed
}

/// Contents of the INI-like configuration file.
///
/// Only the `[server]` or `[agent]` section matching [`Role`] is read;
/// everything else is ignored.
#[derive(Debug, Clone)]
pub struct Config {
	/// Configured agent addresses, in ordinal order (server only).
	pub agents: Vec<EtherAddr>,
	/// Extended socket pool size.
	pub rtskbs: u32,
	/// Real-time network interface.
	pub rtif: String,
	/// TDMA device name.
	pub tdma_dev: String,
	/// Autosave threshold in starts, 0 = disabled (server only).
	pub autosave: u32,
	/// Filename prefix for autosaved measures (server only).
	pub prefix: String,
	/// Default save format name (server only).
	pub format: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			agents: Vec::new(),
			rtskbs: ATMD_DEF_RTSKBS,
			rtif: String::from("rteth0"),
			tdma_dev: String::from("TDMA0"),
			autosave: 0,
			prefix: String::new(),
			format: None,
		}
	}
}

impl Config {
	/// Read the configuration file at `path`.
	pub fn read(role: Role, path: &str) -> std::io::Result<Config> {
		let text = fs::read_to_string(path)?;
		Ok(Self::parse(role, &text))
	}

	fn parse(role: Role, text: &str) -> Config {
		let section = match role {
			Role::Server => "server",
			Role::Agent => "agent",
		};

		let mut config = Config::default();
		let mut good_sec = false;

		for line in text.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
				good_sec = name == section;
				if !good_sec {
					debug!("config: ignoring section '{name}'");
				}
				continue;
			}
			if !good_sec {
				continue;
			}

			let (key, value) = match line.split_once(char::is_whitespace) {
				Some((key, value)) => (key, value.trim()),
				None => (line, ""),
			};

			match key {
				"agent" if role == Role::Server => match EtherAddr::from_str(value) {
					Ok(addr) => {
						debug!("config: found agent with address '{addr}'");
						config.agents.push(addr);
					}
					Err(_) => {
						warn!("config: ignoring agent with invalid mac address '{value}'");
					}
				},
				"rtskbs" => match value.parse() {
					Ok(n) => config.rtskbs = n,
					Err(_) => warn!("config: invalid rtskbs value '{value}'"),
				},
				"rtif" => config.rtif = value.to_string(),
				"tdma" => config.tdma_dev = value.to_string(),
				"autosave" if role == Role::Server => match value.parse() {
					Ok(n) => config.autosave = n,
					Err(_) => warn!("config: invalid autosave value '{value}'"),
				},
				"prefix" if role == Role::Server => config.prefix = value.to_string(),
				"format" if role == Role::Server => config.format = Some(value.to_string()),
				other => debug!("config: ignoring unknown key '{other}'"),
			}
		}

		config
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn args_defaults_and_flags() {
		let args = parse_args(
			Role::Server,
			["-d", "-n", "2700", "-p", "/run/atmd.pid"].map(String::from),
		);
		assert!(args.debug);
		assert_eq!(args.port, 2700);
		assert_eq!(args.pid_file, "/run/atmd.pid");
		assert_eq!(args.conf_file, ATMD_CONF_FILE);
	}

	#[test]
	fn args_rejects_bad_pid_path() {
		let args = parse_args(Role::Agent, ["-p", "pid;rm -rf"].map(String::from));
		assert_eq!(args.pid_file, ATMD_PID_FILE);
	}

	#[test]
	fn agent_does_not_take_server_options() {
		let args = parse_args(Role::Agent, ["-n", "2700"].map(String::from));
		assert_eq!(args.port, ATMD_DEF_PORT);
	}

	#[test]
	fn config_sections_are_scoped() {
		let text = "\
# comment
[server]
agent 02:00:00:00:00:01
agent 02:00:00:00:00:02
rtskbs 512
autosave 100
[agent]
rtif rteth1
";
		let server = Config::parse(Role::Server, text);
		assert_eq!(server.agents.len(), 2);
		assert_eq!(server.rtskbs, 512);
		assert_eq!(server.autosave, 100);
		assert_eq!(server.rtif, "rteth0");

		let agent = Config::parse(Role::Agent, text);
		assert!(agent.agents.is_empty());
		assert_eq!(agent.rtif, "rteth1");
		assert_eq!(agent.rtskbs, ATMD_DEF_RTSKBS);
	}

	#[test]
	fn config_skips_invalid_mac() {
		let text = "[server]\nagent zz:00:00:00:00:01\n";
		let config = Config::parse(Role::Server, text);
		assert!(config.agents.is_empty());
	}
}
