//! Protocol and hardware constants.

/// Maximum size of a frame on the real-time network. The TDMA segment does
/// not fragment above L2.
pub const ATMD_PACKET_SIZE: usize = 1500;

/// Size of one encoded stop event: `i8` channel, `i32` stoptime, `u32`
/// retrigger index.
pub const ATMD_EV_SIZE: usize = 9;

/// Maximum length of the version string in broadcast/hello frames,
/// terminator included.
pub const ATMD_VER_LEN: usize = 32;

/// Ethertype of the control plane.
pub const ATMD_PROTO_CTRL: u16 = 0x5555;

/// Ethertype of the data plane.
pub const ATMD_PROTO_DATA: u16 = 0x5115;

/// Default size of the extended socket packet pool, in buffers. Sized so
/// that one burst window cannot exhaust the pool.
pub const ATMD_DEF_RTSKBS: u32 = 250;

/// TDMA cycles an agent waits past the master's reference cycle before
/// starting the measure.
pub const ATMD_TDMA_OFFSET: u32 = 10;

/// Reference clock period of the converter (40 MHz), in picoseconds.
pub const ATMD_TREF_PS: u64 = 25_000;

/// Autoretrigger timer programmed into the start counter. One retrigger
/// period is `(ATMD_AUTORETRIG + 1) * ATMD_TREF_PS`.
pub const ATMD_AUTORETRIG: u32 = 199;

/// PLL defaults giving a time bin of about 81 ps.
pub const ATMD_DEF_REFCLKDIV: u16 = 7;
pub const ATMD_DEF_HSDIV: u16 = 183;

/// Default hardware start offset subtracted from every stop timestamp.
pub const ATMD_DEF_STARTOFFSET: u32 = 2000;

/// Allocation block of the agent event buffer, in events.
pub const ATMD_BLOCK: usize = 512;

/// Pool size of the master ingest queue, in bytes.
pub const ATMD_QUEUE_POOL: usize = 10_000_000;

/// Default pid file.
pub const ATMD_PID_FILE: &str = "/var/run/atmd_server.pid";

/// Default configuration file.
pub const ATMD_CONF_FILE: &str = "/etc/atmd.conf";

/// Default listening address and port of the client text protocol.
pub const ATMD_DEF_LISTEN: &str = "0.0.0.0";
pub const ATMD_DEF_PORT: u16 = 2606;

/// Time bin of the converter in picoseconds for the given PLL settings.
pub fn time_bin_ps(refclkdiv: u16, hsdiv: u16) -> f64 {
	ATMD_TREF_PS as f64 * f64::powi(2.0, refclkdiv as i32) / (216.0 * hsdiv as f64)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_resolution_is_81ps() {
		let tbin = time_bin_ps(ATMD_DEF_REFCLKDIV, ATMD_DEF_HSDIV);
		assert!((tbin - 80.95).abs() < 0.1, "tbin = {tbin}");
	}
}
