//! Agent daemon: drives one ATMD-GPX converter next to the real-time
//! network.

use std::fs;
use std::process;

use atmd::env::{self, Role};
use log::{error, info, warn};

extern "C" fn term_handler(_signal: libc::c_int) {
	atmd::request_shutdown();
}

/// Route the usual termination and fault signals to the shutdown flag so
/// that the real-time sockets get closed on the way out.
fn install_signal_handlers() {
	let handler = term_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
	for signal in [
		libc::SIGHUP,
		libc::SIGINT,
		libc::SIGFPE,
		libc::SIGSEGV,
		libc::SIGPIPE,
	] {
		// SAFETY: the handler only stores into an atomic flag.
		unsafe { libc::signal(signal, handler) };
	}
}

fn main() {
	let args = env::parse_args(Role::Agent, std::env::args().skip(1));
	atmd::logging::init(args.debug);
	info!("starting atmd-agent version {}", atmd::VERSION);

	install_signal_handlers();

	let config = match env::Config::read(Role::Agent, &args.conf_file) {
		Ok(config) => config,
		Err(err) => {
			error!("cannot open configuration file '{}': {err}", args.conf_file);
			process::exit(1);
		}
	};

	if let Err(err) = fs::write(&args.pid_file, format!("{}\n", process::id())) {
		error!("could not write pid file '{}': {err}", args.pid_file);
		process::exit(1);
	}

	atmd::rt::lock_memory();

	#[cfg(target_arch = "x86_64")]
	let result = atmd::agent::run(&config);
	#[cfg(not(target_arch = "x86_64"))]
	let result: Result<(), atmd::agent::AgentError> = {
		let _ = &config;
		error!("the ATMD-GPX driver requires x86_64 port I/O");
		process::exit(1);
	};

	if let Err(err) = fs::remove_file(&args.pid_file) {
		warn!("could not remove pid file '{}': {err}", args.pid_file);
	}

	match result {
		Ok(()) => info!("atmd-agent terminated"),
		Err(err) => {
			error!("atmd-agent failed: {err}");
			process::exit(1);
		}
	}
}
