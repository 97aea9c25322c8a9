//! Persistence bridge: serialize a completed measure.
//!
//! Text and binary formats are written directly; the MAT formats build a
//! MATLAB 5.0 container that is streamed to its destination through the
//! scatter/gather reader, so no full-file copy ever exists in memory.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::str::FromStr;

use log::debug;
use thiserror::Error;

use crate::config::{ATMD_AUTORETRIG, ATMD_TREF_PS};
use crate::mat::{MatArray, MatObj};
use crate::measure::{Measure, StopEvent};

#[derive(Debug, Error)]
pub enum PersistErr {
	#[error("invalid save path")]
	InvalidPath,
	#[error("i/o error: {0}")]
	IoError(#[from] io::Error),
	#[error("upload failed or no upload target configured")]
	UploadFailed,
}

/// Where a MAT container goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatDest {
	/// Local file only.
	Local,
	/// Upload only, no local file.
	Ftp,
	/// Both.
	All,
}

/// Which vectors a MAT container carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatVersion {
	/// One `data` matrix: start, channel, stoptime in ps.
	V1,
	/// Separate vectors plus per-start window times.
	V2,
	/// V2 plus raw bins, retrigger counts and the time bin.
	V3,
}

/// Save formats of the persistence bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveFormat {
	/// Text, raw bins and retrigger counts.
	Raw,
	/// Text, stop times in ps.
	Ps,
	/// Text, stop times in µs.
	Us,
	/// Binary, stop times in ps.
	BinPs,
	/// Binary, raw retrigger counts and partial stop times.
	BinRaw,
	/// Tab-separated dump with window timings.
	Debug,
	/// MATLAB 5.0 container.
	Mat { version: MatVersion, dest: MatDest },
}

impl Default for SaveFormat {
	fn default() -> Self {
		SaveFormat::Mat {
			version: MatVersion::V3,
			dest: MatDest::Local,
		}
	}
}

impl SaveFormat {
	pub fn extension(&self) -> &'static str {
		match self {
			SaveFormat::Mat { .. } => ".mat",
			_ => ".dat",
		}
	}

	fn writes_local(&self) -> bool {
		!matches!(
			self,
			SaveFormat::Mat {
				dest: MatDest::Ftp,
				..
			}
		)
	}

	fn uploads(&self) -> bool {
		matches!(
			self,
			SaveFormat::Mat {
				dest: MatDest::Ftp | MatDest::All,
				..
			}
		)
	}
}

impl FromStr for SaveFormat {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, ()> {
		let (version, dest);
		match s.to_ascii_uppercase().as_str() {
			"RAW" => return Ok(SaveFormat::Raw),
			"PS" => return Ok(SaveFormat::Ps),
			"US" => return Ok(SaveFormat::Us),
			"BINPS" => return Ok(SaveFormat::BinPs),
			"BINRAW" => return Ok(SaveFormat::BinRaw),
			"DEBUG" => return Ok(SaveFormat::Debug),
			mat => {
				let rest = mat.strip_prefix("MATPS").ok_or(())?;
				version = match rest.get(..1) {
					Some("1") => MatVersion::V1,
					Some("2") => MatVersion::V2,
					Some("3") => MatVersion::V3,
					_ => return Err(()),
				};
				dest = match &rest[1..] {
					"" => MatDest::Local,
					"_FTP" => MatDest::Ftp,
					"_ALL" => MatDest::All,
					_ => return Err(()),
				};
			}
		}
		Ok(SaveFormat::Mat { version, dest })
	}
}

/// Transfer of a serialized container to the configured remote target.
/// The transfer itself is an external collaborator; the bridge only
/// hands over a streaming reader and the total size.
pub trait Upload {
	fn put(&mut self, name: &str, reader: &mut dyn Read, size: usize) -> Result<(), PersistErr>;
}

/// Stop time of one event in picoseconds.
///
/// The agent folds the start01 correction into the bin counts and
/// rebases the retrigger index before transmission, so here the bins
/// convert directly and every remaining retrigger period adds one whole
/// autoretrigger period on top.
pub fn stoptime_ps(event: &StopEvent, tbin_ps: f64) -> f64 {
	event.stoptime as f64 * tbin_ps
		+ event.retrig as f64 * (ATMD_AUTORETRIG + 1) as f64 * ATMD_TREF_PS as f64
}

/// Serialize `measure` to `path` in the given format.
pub fn save_measure(
	measure: &Measure,
	path: &str,
	format: SaveFormat,
	upload: Option<&mut dyn Upload>,
) -> Result<(), PersistErr> {
	debug!(
		"saving {} starts to '{path}' ({format:?})",
		measure.count_starts()
	);

	match format {
		SaveFormat::Raw | SaveFormat::Ps | SaveFormat::Us | SaveFormat::Debug => {
			let mut out = BufWriter::new(File::create(path)?);
			write_text(measure, format, &mut out)?;
			out.flush()?;
			Ok(())
		}
		SaveFormat::BinPs | SaveFormat::BinRaw => {
			let mut out = BufWriter::new(File::create(path)?);
			write_binary(measure, format, &mut out)?;
			out.flush()?;
			Ok(())
		}
		SaveFormat::Mat { version, .. } => {
			let mut obj = build_mat(measure, version);

			if format.writes_local() {
				let mut out = File::create(path)?;
				io::copy(&mut obj, &mut out)?;
			}
			if format.uploads() {
				let Some(upload) = upload else {
					return Err(PersistErr::UploadFailed);
				};
				obj.reset();
				let size = obj.total_size();
				let name = path.rsplit('/').next().unwrap_or(path);
				upload.put(name, &mut obj, size)?;
			}
			Ok(())
		}
	}
}

fn write_text(measure: &Measure, format: SaveFormat, out: &mut impl Write) -> io::Result<()> {
	let tbin = measure.time_bin_ps();

	if format == SaveFormat::Debug {
		writeln!(out, "start\twin_time\tchannel\tslope\trefcount\tstoptime")?;
	}

	for (index, start) in measure.starts().iter().enumerate() {
		for event in start.events() {
			let channel = event.channel.unsigned_abs();
			let slope = (event.channel > 0) as u8;
			match format {
				SaveFormat::Raw => writeln!(
					out,
					"{}\t{}\t{}\t{}\t{}",
					index + 1,
					channel,
					slope,
					event.retrig,
					event.stoptime
				)?,
				SaveFormat::Ps => writeln!(
					out,
					"{}\t{}\t{}\t{:.3}",
					index + 1,
					channel,
					slope,
					stoptime_ps(event, tbin)
				)?,
				SaveFormat::Us => writeln!(
					out,
					"{}\t{}\t{}\t{:.6}",
					index + 1,
					channel,
					slope,
					stoptime_ps(event, tbin) / 1e6
				)?,
				SaveFormat::Debug => {
					let (stoptime, refcount) = stoptime_raw_ps(event, tbin);
					writeln!(
						out,
						"{}\t{}\t{}\t{}\t{}\t{:.3}",
						index + 1,
						start.window_duration(),
						channel,
						slope,
						refcount,
						stoptime
					)?
				}
				_ => unreachable!(),
			}
		}
	}
	Ok(())
}

fn write_binary(measure: &Measure, format: SaveFormat, out: &mut impl Write) -> io::Result<()> {
	let tbin = measure.time_bin_ps();

	for start in measure.starts() {
		out.write_all(&(start.len() as u32).to_ne_bytes())?;
		for event in start.events() {
			let channel = event.channel.unsigned_abs();
			let slope = (event.channel > 0) as u8;
			out.write_all(&[channel, slope])?;
			if format == SaveFormat::BinRaw {
				let (stoptime, refcount) = stoptime_raw_ps(event, tbin);
				out.write_all(&refcount.to_ne_bytes())?;
				out.write_all(&stoptime.to_ne_bytes())?;
			} else {
				out.write_all(&stoptime_ps(event, tbin).to_ne_bytes())?;
			}
		}
	}
	Ok(())
}

/// Stop time without the retrigger contribution, plus the retrigger
/// count it would take to complete it.
fn stoptime_raw_ps(event: &StopEvent, tbin_ps: f64) -> (f64, u32) {
	(event.stoptime as f64 * tbin_ps, event.retrig)
}

fn build_mat(measure: &Measure, version: MatVersion) -> MatObj {
	let tbin = measure.time_bin_ps();
	let total: usize = measure.starts().iter().map(|s| s.len()).sum();

	let mut obj = MatObj::new();

	if version == MatVersion::V1 {
		// One N×3 matrix, column-major: start, channel, stoptime.
		let mut data = Vec::with_capacity(total * 3);
		for (index, start) in measure.starts().iter().enumerate() {
			data.extend(start.events().iter().map(|_| (index + 1) as f64));
		}
		for start in measure.starts() {
			data.extend(start.events().iter().map(|e| e.channel as f64));
		}
		for start in measure.starts() {
			data.extend(
				start
					.events()
					.iter()
					.map(|e| stoptime_ps(e, tbin)),
			);
		}
		obj.add_matrix(MatArray::num("data", total as u32, 3, &data));
		return obj;
	}

	let mut starts = Vec::with_capacity(total);
	let mut channels = Vec::with_capacity(total);
	let mut stoptimes = Vec::with_capacity(total);
	let mut bins = Vec::with_capacity(total);
	let mut retrigs = Vec::with_capacity(total);
	for (index, start) in measure.starts().iter().enumerate() {
		for event in start.events() {
			starts.push((index + 1) as u32);
			channels.push(event.channel);
			stoptimes.push(stoptime_ps(event, tbin));
			bins.push(event.stoptime);
			retrigs.push(event.retrig);
		}
	}

	obj.add_matrix(MatArray::vector("start", &starts));
	obj.add_matrix(MatArray::vector("channel", &channels));
	obj.add_matrix(MatArray::vector("stoptime", &stoptimes));

	// Per-start window timings in µs, column-major S×2.
	let count = measure.count_starts();
	let mut times = Vec::with_capacity(count * 2);
	times.extend(
		measure
			.starts()
			.iter()
			.map(|s| s.window_begin() as f64 / 1e3),
	);
	times.extend(
		measure
			.starts()
			.iter()
			.map(|s| s.window_duration() as f64 / 1e3),
	);
	obj.add_matrix(MatArray::num("times", count as u32, 2, &times));

	if version == MatVersion::V3 {
		obj.add_matrix(MatArray::vector("raw_bins", &bins));
		obj.add_matrix(MatArray::vector("retrig", &retrigs));
		obj.add_matrix(MatArray::scalar("tbin", tbin));
	}

	obj
}
