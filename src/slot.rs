use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RawRwLock;
use parking_lot::lock_api::RawRwLock as _;

/// A slot's lifecycle state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
	Empty,
	Valid,
	ReadInProgress,
	WriteInProgress,
}

impl SlotStatus {
	pub fn is_in_progress(self) -> bool {
		matches!(self, Self::ReadInProgress | Self::WriteInProgress)
	}
}

/// One slot's metadata, guarded by the pool's control lock. Does not include
/// the page buffer itself (owned by the arena) or the LRU tick (tracked
/// separately so it stays touchable under a shared control lock, see
/// [`LruTicks`]).
#[derive(Debug)]
pub(crate) struct SlotMeta {
	pub page_number: u32,
	pub status: SlotStatus,
	pub dirty: bool,
	pub group_lsn: Vec<u64>,
}

impl SlotMeta {
	fn empty(lsn_groups_per_page: usize) -> Self {
		Self {
			page_number: 0,
			status: SlotStatus::Empty,
			dirty: false,
			group_lsn: vec![0; lsn_groups_per_page],
		}
	}

	/// The maximum LSN recorded for this page, or 0 if none is set or the
	/// pool carries no LSN groups (`lsn_groups_per_page == 0`).
	pub fn max_lsn(&self) -> u64 {
		self.group_lsn.iter().copied().max().unwrap_or(0)
	}

	pub fn zero_lsns(&mut self) {
		self.group_lsn.iter_mut().for_each(|lsn| *lsn = 0);
	}
}

/// All per-slot metadata protected by the control lock (spec.md §3), plus
/// the pool-wide `latest_page_number` pin.
pub(crate) struct ControlState {
	pub slots: Vec<SlotMeta>,
	pub latest_page_number: u32,
}

impl ControlState {
	pub fn new(slot_count: usize, lsn_groups_per_page: usize) -> Self {
		Self {
			slots: (0..slot_count)
				.map(|_| SlotMeta::empty(lsn_groups_per_page))
				.collect(),
			latest_page_number: 0,
		}
	}

	/// Slot table hit scan (spec.md §4.3 step 1): the slot already holding
	/// `pageno`, if any.
	pub fn find(&self, pageno: u32) -> Option<usize> {
		self.slots
			.iter()
			.position(|slot| slot.status != SlotStatus::Empty && slot.page_number == pageno)
	}
}

/// Per-slot reader-writer locks that gate I/O only (spec.md §4.4): metadata
/// lives in [`ControlState`] behind the pool's control lock, never here.
pub(crate) struct SlotLocks(Box<[RawRwLock]>);

impl SlotLocks {
	pub fn new(slot_count: usize) -> Self {
		Self((0..slot_count).map(|_| RawRwLock::INIT).collect())
	}

	pub fn lock_exclusive(&self, slot: usize) {
		self.0[slot].lock_exclusive();
	}

	/// # Safety
	/// The caller must currently hold the exclusive lock on `slot`.
	pub unsafe fn unlock_exclusive(&self, slot: usize) {
		unsafe { self.0[slot].unlock_exclusive() };
	}

	pub fn lock_shared(&self, slot: usize) {
		self.0[slot].lock_shared();
	}

	/// # Safety
	/// The caller must currently hold the shared lock on `slot`.
	pub unsafe fn unlock_shared(&self, slot: usize) {
		unsafe { self.0[slot].unlock_shared() };
	}

	pub fn try_lock_shared(&self, slot: usize) -> bool {
		self.0[slot].try_lock_shared()
	}
}

/// The pool-wide LRU tick counter and each slot's last-touched tick,
/// deliberately kept outside the control `RwLock` (spec.md §4.3 "Touch
/// protocol"): `read_page_readonly`'s fast path only ever holds the control
/// lock *shared*, yet still needs to mark a slot recently-used, so these
/// counters must tolerate concurrent, unsynchronized bumps. Torn updates are
/// corrected by the selector's repair step (invariant 7), never by locking
/// harder.
pub(crate) struct LruTicks {
	ticks: Box<[AtomicU32]>,
	current: AtomicU32,
}

impl LruTicks {
	pub fn new(slot_count: usize) -> Self {
		Self {
			ticks: (0..slot_count).map(|_| AtomicU32::new(0)).collect(),
			current: AtomicU32::new(0),
		}
	}

	/// `recently_used(slot)` (spec.md §4.3): safe to call under a shared
	/// control lock, since a torn read/write here only degrades to a
	/// suboptimal eviction choice, never an invariant violation.
	pub fn recently_used(&self, slot: usize) {
		let current = self.current.load(Ordering::Relaxed);
		if self.ticks[slot].load(Ordering::Relaxed) != current {
			let next = current.wrapping_add(1);
			self.current.store(next, Ordering::Relaxed);
			self.ticks[slot].store(next, Ordering::Relaxed);
		}
	}

	/// Post-increment advance of `current_lru_tick` (spec.md §4.3 step 2).
	pub fn advance(&self) -> u32 {
		self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
	}

	/// Signed delta between `cur` and this slot's last-observed tick
	/// (spec.md §4.3 step 3), via wrapping subtraction reinterpreted as
	/// signed.
	pub fn delta(&self, slot: usize, cur: u32) -> i32 {
		cur.wrapping_sub(self.ticks[slot].load(Ordering::Relaxed)) as i32
	}

	/// Repairs an out-of-range observation in place (invariant 7).
	pub fn repair(&self, slot: usize, cur: u32) {
		self.ticks[slot].store(cur, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hit_scan_finds_non_empty_match() {
		let mut state = ControlState::new(2, 0);
		state.slots[1].page_number = 7;
		state.slots[1].status = SlotStatus::Valid;
		assert_eq!(state.find(7), Some(1));
		assert_eq!(state.find(8), None);
	}

	#[test]
	fn recently_used_is_idempotent_until_advanced() {
		let ticks = LruTicks::new(2);
		ticks.recently_used(0);
		let first = ticks.delta(0, ticks.advance());
		ticks.recently_used(0);
		let second = ticks.delta(0, ticks.advance());
		assert!(second >= first);
	}

	#[test]
	fn repair_clamps_negative_delta_to_zero() {
		let ticks = LruTicks::new(1);
		ticks.repair(0, 100);
		assert_eq!(ticks.delta(0, 50), -50);
		ticks.repair(0, 50);
		assert_eq!(ticks.delta(0, 50), 0);
	}
}
