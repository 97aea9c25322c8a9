//! Driver for the ATMD-GPX time-to-digital converter board.
//!
//! The board couples an ACAM TDC-GPX chip to a PLX PCI bridge. All access
//! goes through a small I/O window: two 16-bit ports write the 28-bit
//! configuration registers of the chip, a direct-read-address port selects
//! which chip register the 32-bit read port returns, and two more ports
//! expose the motherboard status and control registers.

#![allow(clippy::unusual_byte_groupings)]

pub mod buffer;
pub mod retrig;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use self::buffer::EventBuffer;
use self::retrig::CounterState;
use crate::config::{ATMD_AUTORETRIG, ATMD_DEF_HSDIV, ATMD_DEF_REFCLKDIV, ATMD_DEF_STARTOFFSET};
use crate::time::monotonic_ns;

/// PCI identity of the PLX bridge carrying the converter.
const GPX_VENDOR_ID: u16 = 0x10b5;
const GPX_DEVICE_ID: u16 = 0x9050;
/// Module identification value read back at I/O offset 0x4.
const GPX_MODULE_ID: u16 = 0x8000;

/// Offset of the register write ports (low word, high word).
const REG_LO: u16 = 0x0;
const REG_HI: u16 = 0x2;
/// Offset of the direct-read-address port.
const DRA_ADDR: u16 = 0x4;
/// Offset of the motherboard status port.
const MB_STATUS: u16 = 0x8;
/// Offset of the motherboard control port.
const MB_CTRL: u16 = 0xC;

/// Direct-read addresses of interest.
const DRA_FIFO0: u16 = 0x0008;
const DRA_FIFO1: u16 = 0x0009;
const DRA_START01: u16 = 0x000A;
const DRA_STATUS: u16 = 0x000C;

/// Status register (reg 12 readback) bits.
/// PLL not locked.
const STATUS_PLL_UNLOCKED: u32 = 0x0000_0400;
/// End of mtimer, latched on the start pulse.
const STATUS_MTIMER_END: u32 = 0x0000_1000;

/// FIFO word layout.
const EV_STOPTIME_MASK: u32 = 0x0001_FFFF;
const EV_SLOPE_BIT: u32 = 0x0002_0000;
const EV_SC_MASK: u32 = 0x03FC_0000;
const EV_SC_SHIFT: u32 = 18;
const EV_CH_MASK: u32 = 0x0C00_0000;
const EV_CH_SHIFT: u32 = 26;

bitflags::bitflags! {
	/// Motherboard control register.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct MbConfig: u16 {
		/// Reset the TDC-GPX chip.
		const RESET_CHIP = 0x0001;
		/// Disable the inputs by hardware.
		const DISABLE_INPUTS = 0x0008;
		/// Reset the global start timer.
		const RESET_TIMER = 0x0100;
	}
}

bitflags::bitflags! {
	/// Motherboard status register.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct MbStatus: u16 {
		/// MSB of the start counter, toggles every 128 starts.
		const INTFLAG = 0x0020;
		/// FIFO0 holds no data.
		const FIFO0_EMPTY = 0x0800;
		/// FIFO1 holds no data.
		const FIFO1_EMPTY = 0x1000;
	}
}

/// Faults raised while locating or programming the board.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HardwareFault {
	#[error("TDC-GPX PLL not locked")]
	PllUnlocked,
	#[error("ATMD-GPX board not found on the PCI bus")]
	PciNotFound,
	#[error("direct I/O access privileges denied")]
	IoPrivDenied,
}

/// Errors local to one start acquisition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AcquireErr {
	/// Timed out waiting for a start pulse. The start is abandoned, the
	/// measure continues.
	#[error("timed out waiting for a start event")]
	NoStart,
	/// Event buffer growth failed. Fatal to the measure.
	#[error("event buffer allocation failed")]
	BufferAlloc,
	/// Window bookkeeping overflowed the monotonic range.
	#[error("acquisition window overflow")]
	WindowOverflow,
}

/// Register-level access to the converter.
///
/// The production implementation is [`PortBus`]; tests drive the driver
/// logic through a scripted fake.
pub trait GpxBus {
	/// Write a 28-bit value to the TDC-GPX configuration register selected
	/// by the 4 most significant bits of `value`.
	fn write_reg(&mut self, value: u32);
	/// Write the motherboard control register.
	fn mb_config(&mut self, cfg: MbConfig);
	/// Read the motherboard status register.
	fn mb_status(&mut self) -> MbStatus;
	/// Select the chip register returned by [`GpxBus::read_dra`].
	fn set_dra(&mut self, addr: u16);
	/// Read the selected chip register.
	fn read_dra(&mut self) -> u32;
}

/// Static configuration of one measure, programmed into the chip by
/// [`GpxBoard::apply`].
#[derive(Clone, Copy, Debug)]
pub struct BoardConfig {
	pub start_rising: bool,
	pub start_falling: bool,
	pub rising_mask: u8,
	pub falling_mask: u8,
	/// Offset subtracted from every stop timestamp, in bins.
	pub start_offset: u32,
	/// PLL reference clock divider.
	pub refclkdiv: u16,
	/// PLL high speed divider.
	pub hsdiv: u16,
	/// Trigger the mtimer on the start pulse.
	pub en_mtimer: bool,
	pub mtimer: u16,
	/// Disable starts arriving after the first start.
	pub start_dis_start: bool,
	/// Disable stops arriving before the start.
	pub stop_dis_start: bool,
	/// Unmask the start counter MSB to INTFLAG (as opposed to mtimer end).
	pub start_to_intflag: bool,
}

impl Default for BoardConfig {
	fn default() -> Self {
		Self {
			start_rising: true,
			start_falling: false,
			rising_mask: 0,
			falling_mask: 0,
			start_offset: ATMD_DEF_STARTOFFSET,
			refclkdiv: ATMD_DEF_REFCLKDIV,
			hsdiv: ATMD_DEF_HSDIV,
			en_mtimer: true,
			mtimer: 0,
			start_dis_start: true,
			stop_dis_start: true,
			start_to_intflag: true,
		}
	}
}

impl BoardConfig {
	/// Time bin for the configured PLL dividers, in ps.
	pub fn time_bin_ps(&self) -> f64 {
		crate::config::time_bin_ps(self.refclkdiv, self.hsdiv)
	}
}

/// The converter board. Owns all hardware state; nothing else in the
/// process touches the registers.
pub struct GpxBoard<B> {
	bus: B,
	config: BoardConfig,
}

impl<B: GpxBus> GpxBoard<B> {
	pub fn new(bus: B) -> Self {
		Self {
			bus,
			config: BoardConfig::default(),
		}
	}

	pub fn config(&self) -> &BoardConfig {
		&self.config
	}

	pub fn set_config(&mut self, config: BoardConfig) {
		self.config = config;
	}

	/// Reset the configuration to the power-up defaults.
	pub fn reset_config(&mut self) {
		self.config = BoardConfig::default();
	}

	/// Combined 9-bit edge masks: bit 0 is the start channel, bits 1..=8
	/// the stop channels.
	fn edge_masks(&self) -> (u16, u16) {
		let rising =
			(self.config.start_rising as u16) | ((self.config.rising_mask as u16) << 1);
		let falling =
			(self.config.start_falling as u16) | ((self.config.falling_mask as u16) << 1);
		(rising, falling)
	}

	/// Full board reset: chip and start timer, then inputs disabled.
	fn reset(&mut self) {
		info!("performing ATMD-GPX board reset");
		self.bus
			.mb_config(MbConfig::RESET_CHIP | MbConfig::RESET_TIMER);
		std::thread::sleep(Duration::from_micros(1));
		self.bus.mb_config(MbConfig::DISABLE_INPUTS);
	}

	/// TDC-GPX software master reset. The start timer keeps running.
	pub fn master_reset(&mut self) {
		let mut reg = 0x4240_0000 | ATMD_AUTORETRIG;
		if self.config.en_mtimer {
			// Trigger the mtimer on the start pulse.
			reg |= 0x0400_0000;
		}
		self.bus.write_reg(reg);
		std::thread::sleep(Duration::from_micros(1));
	}

	/// Reset the board and program configuration registers 0–12, then wait
	/// for the PLL to lock.
	pub fn apply(&mut self) -> Result<(), HardwareFault> {
		self.reset();

		let (rising, falling) = self.edge_masks();

		// Reg0: rising and falling edge sensitivity.
		let reg = 0x0000_0081 | ((rising as u32) << 10) | ((falling as u32) << 19);
		debug!("config: reg0: {reg:#010X}");
		self.bus.write_reg(reg);

		// Reg1: channel adjust, unused.
		self.bus.write_reg(0x1000_0000);

		// Reg2: channel disable and I-Mode.
		let chan_disable = !(rising | falling) & 0x01FF;
		let reg = 0x2000_0002 | ((chan_disable as u32) << 3);
		debug!("config: reg2: {reg:#010X}");
		self.bus.write_reg(reg);

		// Reg3: not used.
		self.bus.write_reg(0x3000_0000);

		// Reg4: start timer.
		let mut reg = 0x4200_0000 | ATMD_AUTORETRIG;
		if self.config.en_mtimer {
			reg |= 0x0400_0000;
		}
		debug!("config: reg4: {reg:#010X}");
		self.bus.write_reg(reg);

		// Reg5: start suppression and start offset.
		let mut reg = 0x5000_0000 | self.config.start_offset;
		if self.config.start_dis_start {
			reg |= 0x0040_0000;
		}
		if self.config.stop_dis_start {
			reg |= 0x0020_0000;
		}
		debug!("config: reg5: {reg:#010X}");
		self.bus.write_reg(reg);

		// Reg6: nothing relevant.
		self.bus.write_reg(0x6000_00FF);

		// Reg7: mtimer and PLL dividers.
		let reg = 0x7000_1800
			| (self.config.hsdiv as u32 & 0x00FF)
			| ((self.config.refclkdiv as u32 & 0x0007) << 8)
			| ((self.config.mtimer as u32) << 15);
		debug!("config: reg7: {reg:#010X}");
		self.bus.write_reg(reg);

		// Reg11: unmask error flags.
		self.bus.write_reg(0xB7FF_0000);

		// Reg12: MSB of start counter or mtimer end to INTFLAG.
		let reg = 0xC000_0000
			| if self.config.start_to_intflag {
				0x0400_0000
			} else {
				0x0200_0000
			};
		debug!("config: reg12: {reg:#010X}");
		self.bus.write_reg(reg);

		// Let the PLL lock.
		std::thread::sleep(Duration::from_millis(500));

		self.bus.set_dra(DRA_STATUS);
		let status = self.bus.read_dra();
		debug!("config: status register is {status:#X}");
		if status & STATUS_PLL_UNLOCKED != 0 {
			return Err(HardwareFault::PllUnlocked);
		}

		debug!(
			"config: TDC-GPX PLL locked, resolution {:.2} ps",
			self.config.time_bin_ps()
		);
		Ok(())
	}

	/// Acquire a single start into `events`.
	///
	/// Waits up to `timeout_ns` for the start pulse, then drains both
	/// FIFOs until the window of `window_ns` has elapsed (or `stop` was
	/// raised) and the FIFOs are empty. The start01 correction is folded
	/// into the buffer before returning.
	pub fn acquire_start(
		&mut self,
		window_ns: u64,
		timeout_ns: u64,
		stop: &AtomicBool,
		events: &mut EventBuffer,
	) -> Result<(), AcquireErr> {
		let en_channel = self.config.rising_mask | self.config.falling_mask;
		let en_fifo0 = en_channel & 0x0F != 0;
		let en_fifo1 = en_channel & 0xF0 != 0;
		let start_offset = self.config.start_offset as i32;

		self.master_reset();

		// Enable the inputs and watch reg12 for the end of the mtimer,
		// which latches on the start pulse.
		self.bus.mb_config(MbConfig::empty());
		self.bus.set_dra(DRA_STATUS);

		let wait_start = monotonic_ns();
		loop {
			if self.bus.read_dra() & STATUS_MTIMER_END != 0 {
				events.set_begin(monotonic_ns());
				break;
			}
			if monotonic_ns() - wait_start > timeout_ns {
				self.bus.mb_config(MbConfig::DISABLE_INPUTS);
				debug!("timed out waiting for a start event");
				return Err(AcquireErr::NoStart);
			}
		}

		let mut fifo0 = CounterState::new();
		let mut fifo1 = CounterState::new();
		let mut prev_intflag = false;
		let mut finish_window = false;
		let mut stop_fifo0 = false;
		let mut stop_fifo1 = false;

		loop {
			let mbs = self.bus.mb_status();

			// A falling INTFLAG edge means the start counter wrapped.
			let intflag = mbs.contains(MbStatus::INTFLAG);
			if prev_intflag && !intflag {
				fifo0.overflow();
				fifo1.overflow();
			}
			prev_intflag = intflag;

			// A stop request closes the window early.
			if stop.load(Ordering::Relaxed) && !finish_window {
				self.bus.mb_config(MbConfig::DISABLE_INPUTS);
				finish_window = true;
			}

			if en_fifo0 {
				if !mbs.contains(MbStatus::FIFO0_EMPTY) {
					self.bus.set_dra(DRA_FIFO0);
					let word = self.bus.read_dra();
					let (ch, stoptime, retrig) = decode_word(word, 1, start_offset, &mut fifo0);
					events
						.push(ch, stoptime, retrig)
						.map_err(|_| AcquireErr::BufferAlloc)?;
				} else {
					fifo0.on_empty();
					if finish_window {
						stop_fifo0 = true;
					}
				}
			}

			if en_fifo1 {
				if !mbs.contains(MbStatus::FIFO1_EMPTY) {
					self.bus.set_dra(DRA_FIFO1);
					let word = self.bus.read_dra();
					let (ch, stoptime, retrig) = decode_word(word, 5, start_offset, &mut fifo1);
					events
						.push(ch, stoptime, retrig)
						.map_err(|_| AcquireErr::BufferAlloc)?;
				} else {
					fifo1.on_empty();
					if finish_window {
						stop_fifo1 = true;
					}
				}
			}

			// Close the window once its time has elapsed.
			events.set_end(monotonic_ns());
			if !finish_window && events.end() - events.begin() > window_ns {
				self.bus.mb_config(MbConfig::DISABLE_INPUTS);
				finish_window = true;
			}

			if (!en_fifo0 || stop_fifo0) && (!en_fifo1 || stop_fifo1) {
				break;
			}
		}

		// Fold the start01 correction into the acquired events.
		self.bus.set_dra(DRA_START01);
		let start01 = self.bus.read_dra() & EV_STOPTIME_MASK;
		events.compute_start01(start01);

		Ok(())
	}
}

/// Decode one FIFO word into a signed channel, offset-corrected stop time
/// and reconstructed retrigger index. `ch_base` is 1 for FIFO0 and 5 for
/// FIFO1.
fn decode_word(word: u32, ch_base: i8, start_offset: i32, state: &mut CounterState) -> (i8, i32, u32) {
	let sc = ((word & EV_SC_MASK) >> EV_SC_SHIFT) as u8;
	let stoptime = (word & EV_STOPTIME_MASK) as i32 - start_offset;
	let mut ch = ((word & EV_CH_MASK) >> EV_CH_SHIFT) as i8 + ch_base;
	if word & EV_SLOPE_BIT == 0 {
		ch = -ch;
	}
	(ch, stoptime, state.on_word(sc))
}

/// Port-I/O implementation of [`GpxBus`] for the real board.
#[cfg(target_arch = "x86_64")]
pub use port::PortBus;

#[cfg(target_arch = "x86_64")]
mod port {
	use std::fs;
	use std::path::Path;

	use log::{debug, info, warn};
	use x86_64::instructions::port::Port;

	use super::*;

	pub struct PortBus {
		reg_lo: Port<u16>,
		reg_hi: Port<u16>,
		dra_addr: Port<u16>,
		mb_status: Port<u16>,
		mb_ctrl: Port<u16>,
		dra_read: Port<u32>,
	}

	impl PortBus {
		fn at(base: u16) -> Self {
			Self {
				reg_lo: Port::new(base + REG_LO),
				reg_hi: Port::new(base + REG_HI),
				dra_addr: Port::new(base + DRA_ADDR),
				mb_status: Port::new(base + MB_STATUS),
				mb_ctrl: Port::new(base + MB_CTRL),
				dra_read: Port::new(base),
			}
		}

		/// Scan the PCI bus for the converter and map its I/O window.
		///
		/// Requires I/O privileges; multiple boards are not supported, the
		/// first match wins.
		pub fn probe() -> Result<Self, HardwareFault> {
			// SAFETY: requesting I/O privilege level 3 only affects this
			// process.
			if unsafe { libc::iopl(3) } != 0 {
				return Err(HardwareFault::IoPrivDenied);
			}

			let devices = Path::new("/sys/bus/pci/devices");
			let entries = fs::read_dir(devices).map_err(|_| HardwareFault::PciNotFound)?;
			for entry in entries.flatten() {
				let path = entry.path();
				if read_hex(&path.join("vendor")) != Some(GPX_VENDOR_ID as u64)
					|| read_hex(&path.join("device")) != Some(GPX_DEVICE_ID as u64)
				{
					continue;
				}

				debug!("found PLX bridge at {}", path.display());
				for base in io_bars(&path) {
					// Check the module identification register.
					let mut id_port = Port::<u16>::new(base + DRA_ADDR);
					// SAFETY: iopl(3) was granted above.
					let id = unsafe { id_port.read() };
					if id == GPX_MODULE_ID {
						info!("ATMD-GPX board found at address {base:#x}");
						return Ok(Self::at(base));
					}
					warn!("I/O window at {base:#x} has unexpected module id {id:#x}");
				}
			}

			Err(HardwareFault::PciNotFound)
		}
	}

	fn read_hex(path: &Path) -> Option<u64> {
		let text = fs::read_to_string(path).ok()?;
		u64::from_str_radix(text.trim().trim_start_matches("0x"), 16).ok()
	}

	/// I/O-space base addresses of a PCI device, from its sysfs resource
	/// table.
	fn io_bars(dev: &Path) -> Vec<u16> {
		const IORESOURCE_IO: u64 = 0x100;

		let Ok(text) = fs::read_to_string(dev.join("resource")) else {
			return Vec::new();
		};
		text.lines()
			.filter_map(|line| {
				let mut cols = line.split_whitespace();
				let start = cols.next()?;
				let _end = cols.next()?;
				let flags = cols.next()?;
				let start = u64::from_str_radix(start.trim_start_matches("0x"), 16).ok()?;
				let flags = u64::from_str_radix(flags.trim_start_matches("0x"), 16).ok()?;
				(start != 0 && flags & IORESOURCE_IO != 0).then_some(start as u16)
			})
			.collect()
	}

	impl GpxBus for PortBus {
		fn write_reg(&mut self, value: u32) {
			// SAFETY: the ports were located by probe() and belong to the
			// converter's I/O window.
			unsafe {
				self.reg_lo.write((value & 0x0000_FFFF) as u16);
				self.reg_hi.write(((value & 0xFFFF_0000) >> 16) as u16);
			}
		}

		fn mb_config(&mut self, cfg: MbConfig) {
			unsafe { self.mb_ctrl.write(cfg.bits()) }
		}

		fn mb_status(&mut self) -> MbStatus {
			MbStatus::from_bits_retain(unsafe { self.mb_status.read() })
		}

		fn set_dra(&mut self, addr: u16) {
			unsafe { self.dra_addr.write(addr) }
		}

		fn read_dra(&mut self) -> u32 {
			unsafe { self.dra_read.read() }
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::VecDeque;
	use std::sync::atomic::AtomicBool;

	use super::*;

	/// Scripted bus: FIFO contents are queues, the status register is
	/// derived from them, INTFLAG follows a per-iteration script.
	#[derive(Default)]
	struct FakeBus {
		dra: u16,
		fifo0: VecDeque<u32>,
		fifo1: VecDeque<u32>,
		intflag: VecDeque<bool>,
		start01: u32,
		start_ready: bool,
		regs: Vec<u32>,
		ctrl: Vec<MbConfig>,
	}

	impl GpxBus for FakeBus {
		fn write_reg(&mut self, value: u32) {
			self.regs.push(value);
		}

		fn mb_config(&mut self, cfg: MbConfig) {
			self.ctrl.push(cfg);
		}

		fn mb_status(&mut self) -> MbStatus {
			let mut status = MbStatus::empty();
			if self.fifo0.is_empty() {
				status |= MbStatus::FIFO0_EMPTY;
			}
			if self.fifo1.is_empty() {
				status |= MbStatus::FIFO1_EMPTY;
			}
			if self.intflag.len() > 1 {
				if self.intflag.pop_front().unwrap() {
					status |= MbStatus::INTFLAG;
				}
			} else if self.intflag.front().copied().unwrap_or(false) {
				status |= MbStatus::INTFLAG;
			}
			status
		}

		fn set_dra(&mut self, addr: u16) {
			self.dra = addr;
		}

		fn read_dra(&mut self) -> u32 {
			match self.dra {
				DRA_FIFO0 => self.fifo0.pop_front().unwrap_or(0),
				DRA_FIFO1 => self.fifo1.pop_front().unwrap_or(0),
				DRA_START01 => self.start01,
				DRA_STATUS => {
					if self.start_ready {
						STATUS_MTIMER_END
					} else {
						0
					}
				}
				_ => 0,
			}
		}
	}

	fn word(sc: u8, bins: u32, ch_idx: u32, rising: bool) -> u32 {
		let mut w = ((sc as u32) << EV_SC_SHIFT) | (ch_idx << EV_CH_SHIFT) | (bins & EV_STOPTIME_MASK);
		if rising {
			w |= EV_SLOPE_BIT;
		}
		w
	}

	fn board_with(bus: FakeBus) -> GpxBoard<FakeBus> {
		let mut board = GpxBoard::new(bus);
		board.set_config(BoardConfig {
			rising_mask: 0xFF,
			start_offset: 0,
			..BoardConfig::default()
		});
		board
	}

	#[test]
	fn acquire_decodes_both_fifos() {
		let mut bus = FakeBus::default();
		bus.start_ready = true;
		bus.start01 = 0;
		bus.fifo0.push_back(word(0, 100, 0, true)); // ch 1
		bus.fifo0.push_back(word(0, 250, 1, false)); // ch -2
		bus.fifo1.push_back(word(0, 400, 0, true)); // ch 5

		let mut board = board_with(bus);
		let mut events = EventBuffer::new();
		let stop = AtomicBool::new(true); // close the window immediately
		board.acquire_start(0, 1_000_000, &stop, &mut events).unwrap();

		assert_eq!(events.ch(), &[1, 5, -2]);
		assert_eq!(events.stoptime(), &[100, 400, 250]);
		assert_eq!(events.retrig(), &[0, 0, 0]);
	}

	#[test]
	fn acquire_applies_start_offset() {
		let mut bus = FakeBus::default();
		bus.start_ready = true;
		bus.fifo0.push_back(word(0, 100, 0, true));

		let mut board = GpxBoard::new(bus);
		board.set_config(BoardConfig {
			rising_mask: 0x01,
			start_offset: 2000,
			..BoardConfig::default()
		});
		let mut events = EventBuffer::new();
		let stop = AtomicBool::new(true);
		board.acquire_start(0, 1_000_000, &stop, &mut events).unwrap();

		assert_eq!(events.stoptime(), &[100 - 2000]);
	}

	#[test]
	fn acquire_folds_start01_for_retriggered_events() {
		let mut bus = FakeBus::default();
		bus.start_ready = true;
		bus.start01 = 40;
		bus.fifo0.push_back(word(0, 100, 0, true));
		bus.fifo0.push_back(word(1, 10, 0, true));

		let mut board = board_with(bus);
		let mut events = EventBuffer::new();
		let stop = AtomicBool::new(true);
		board.acquire_start(0, 1_000_000, &stop, &mut events).unwrap();

		// Event with retrig 0 untouched; retrig 1 gets start01 folded in.
		assert_eq!(events.stoptime(), &[100, 50]);
		assert_eq!(events.retrig(), &[0, 0]);
	}

	#[test]
	fn acquire_times_out_without_start() {
		let bus = FakeBus::default();
		let mut board = board_with(bus);
		let mut events = EventBuffer::new();
		let stop = AtomicBool::new(false);
		let err = board.acquire_start(0, 10_000, &stop, &mut events).unwrap_err();
		assert_eq!(err, AcquireErr::NoStart);
		// Inputs must end up disabled.
		assert_eq!(board.bus.ctrl.last(), Some(&MbConfig::DISABLE_INPUTS));
	}

	#[test]
	fn apply_reports_pll_lock_failure() {
		// DRA_STATUS reads 0 when start_ready is false, so force the
		// unlocked bit through a fake with a scripted status.
		struct UnlockedBus(FakeBus);
		impl GpxBus for UnlockedBus {
			fn write_reg(&mut self, value: u32) {
				self.0.write_reg(value);
			}
			fn mb_config(&mut self, cfg: MbConfig) {
				self.0.mb_config(cfg);
			}
			fn mb_status(&mut self) -> MbStatus {
				self.0.mb_status()
			}
			fn set_dra(&mut self, addr: u16) {
				self.0.set_dra(addr);
			}
			fn read_dra(&mut self) -> u32 {
				STATUS_PLL_UNLOCKED
			}
		}

		let mut board = GpxBoard::new(UnlockedBus(FakeBus::default()));
		assert_eq!(board.apply(), Err(HardwareFault::PllUnlocked));
	}
}
