//! Reconstruction of the external retrigger counter.
//!
//! The converter publishes only the 8 low bits of its start counter in each
//! FIFO word. Overflows are signalled out of band by INTFLAG, which carries
//! the MSB of the counter and therefore toggles every 128 starts. A falling
//! INTFLAG edge alone does not tell whether the next FIFO word was captured
//! before or after the wrap; pairing the edge with the observed direction
//! of the 8-bit counter disambiguates it.

/// Per-FIFO reconstruction state.
#[derive(Clone, Copy, Debug)]
pub struct CounterState {
	/// A falling INTFLAG edge was seen and not yet attributed to a word.
	overflow_pending: bool,
	/// Last 8-bit start count read from this FIFO, −1 before the first.
	prev_sc: i16,
	/// Number of committed 256-start wraps.
	main_counter: u32,
}

impl CounterState {
	pub const fn new() -> Self {
		Self {
			overflow_pending: false,
			prev_sc: -1,
			main_counter: 0,
		}
	}

	/// Record a falling INTFLAG edge. Called for both FIFOs on every
	/// 1→0 transition of the flag.
	pub fn overflow(&mut self) {
		self.overflow_pending = true;
	}

	/// Account for a FIFO word carrying the 8-bit start count `sc` and
	/// return the reconstructed 32-bit retrigger index for that word.
	pub fn on_word(&mut self, sc: u8) -> u32 {
		if self.overflow_pending {
			if self.prev_sc == -1 {
				// First word of the window: it belongs past the wrap only
				// if the count restarted below 128.
				if sc < 128 {
					self.main_counter += 1;
					self.overflow_pending = false;
				}
			} else if self.prev_sc > sc as i16 {
				// The 8-bit count went backwards, the wrap happened.
				self.main_counter += 1;
				self.overflow_pending = false;
			}
			// Otherwise the word still belongs to the pre-overflow window;
			// leave the edge pending.
		}
		self.prev_sc = sc as i16;

		sc as u32 + 256 * self.main_counter
	}

	/// Account for reading the FIFO empty flag. With no word left to
	/// attribute the wrap to, a pending edge is committed here.
	pub fn on_empty(&mut self) {
		if self.overflow_pending {
			self.main_counter += 1;
			self.overflow_pending = false;
		}
	}
}

impl Default for CounterState {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Feeds a word stream with INTFLAG transitions at the given indices
	/// and collects the reconstructed indices.
	fn run(counts: impl IntoIterator<Item = u8>, edges: &[usize]) -> Vec<u32> {
		let mut state = CounterState::new();
		let mut intflag = false;
		let mut out = Vec::new();
		for (i, sc) in counts.into_iter().enumerate() {
			let new_flag = edges.iter().filter(|&&e| e <= i).count() % 2 == 1;
			if intflag && !new_flag {
				state.overflow();
			}
			intflag = new_flag;
			out.push(state.on_word(sc));
		}
		out
	}

	#[test]
	fn straight_sequence_reconstructs_without_gaps() {
		// INTFLAG rises at start 128 and falls at 256; the 8-bit count
		// wraps every 256 starts.
		let counts = (0u32..640).map(|i| (i % 256) as u8);
		let retrig = run(counts, &[128, 256, 384, 512]);
		let expected: Vec<u32> = (0..640).collect();
		assert_eq!(retrig, expected);
	}

	#[test]
	fn word_before_wrap_stays_in_old_window() {
		let mut state = CounterState::new();
		assert_eq!(state.on_word(250), 250);
		// The edge arrives while a pre-overflow word is still queued.
		state.overflow();
		assert_eq!(state.on_word(255), 255);
		// Count restarts: now the wrap is committed.
		assert_eq!(state.on_word(3), 259);
	}

	#[test]
	fn first_word_after_edge_commits_if_restarted() {
		let mut state = CounterState::new();
		state.overflow();
		assert_eq!(state.on_word(5), 261);
	}

	#[test]
	fn first_word_after_edge_holds_if_high() {
		let mut state = CounterState::new();
		state.overflow();
		// Still in the old window; the commit must wait.
		assert_eq!(state.on_word(200), 200);
		assert_eq!(state.on_word(1), 257);
	}

	#[test]
	fn empty_fifo_commits_pending_edge() {
		let mut state = CounterState::new();
		assert_eq!(state.on_word(255), 255);
		state.overflow();
		state.on_empty();
		assert_eq!(state.on_word(0), 256);
	}

	#[test]
	fn retrig_is_nondecreasing() {
		let counts = (0u32..1024).map(|i| (i % 256) as u8);
		let retrig = run(counts, &[128, 256, 384, 512, 640, 768, 896]);
		for pair in retrig.windows(2) {
			assert!(pair[0] <= pair[1]);
		}
	}
}
