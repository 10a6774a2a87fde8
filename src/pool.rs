use std::{io, path::PathBuf, sync::Arc};

use log::{debug, error, info, warn};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use static_assertions::assert_impl_all;

use crate::{
	arena::PageArena,
	config::PoolConfig,
	consts::{PAGE_SIZE, PAGES_PER_SEGMENT},
	directory::{FsSegmentDirectory, SegmentDirectory},
	error::PoolError,
	mirror::{MirrorSink, NoMirror},
	physical::{FlushContext, FsPhysicalIo, PhysicalIo},
	slot::{ControlState, LruTicks, SlotLocks, SlotStatus},
	wal::{NoWal, WalFlush},
};

/// A page-level view gated by a still-held control lock, returned by
/// [`Pool::lock_shared`], [`Pool::lock_exclusive`] and embedded in
/// [`PageLease`]. Its only purpose is to prove to [`Pool::buffer`] that
/// the caller currently holds the control lock in some mode.
pub enum ControlGuard<'a> {
	Shared(RwLockReadGuard<'a, ControlState>),
	Exclusive(RwLockWriteGuard<'a, ControlState>),
}

/// A slot index plus the control lock that was still held when it was
/// returned, kept alive for as long as the caller needs the buffer (spec.md
/// §6: `zero_page`/`read_page` are specified as control held on entry *and
/// exit*; `read_page_readonly` keeps whatever mode it found the page under,
/// pinned to exclusive on its fallback path per spec.md §9). Dropping the
/// lease releases the control lock — callers that only need the index can
/// call [`PageLease::slot_index`] in the same statement and let the
/// temporary drop immediately, rather than holding the lock any longer than
/// that.
pub struct PageLease<'a> {
	pool: &'a Pool,
	guard: ControlGuard<'a>,
	slot_index: usize,
}

impl<'a> PageLease<'a> {
	pub fn slot_index(&self) -> usize {
		self.slot_index
	}

	pub fn guard(&self) -> &ControlGuard<'a> {
		&self.guard
	}

	pub fn buffer(&self) -> &[u8] {
		self.pool.buffer(&self.guard, self.slot_index)
	}
}

/// A single LRU page-buffer pool, one per log directory (spec.md §3). Shared
/// across threads; every public method synchronizes itself, acquiring and
/// releasing the control lock for its own duration except where the
/// interface explicitly leaves it held (`zero_page`, `read_page`,
/// `read_page_readonly` — each via a returned [`PageLease`] — plus
/// `lock_shared`/`lock_exclusive`).
pub struct Pool {
	name: String,
	config: PoolConfig,
	precedes: Box<dyn Fn(u32, u32) -> bool + Send + Sync>,
	directory: Arc<dyn SegmentDirectory>,
	physical: Box<dyn PhysicalIo>,
	wal: Box<dyn WalFlush>,
	mirror: Box<dyn MirrorSink>,
	arena: PageArena,
	slot_locks: SlotLocks,
	lru: LruTicks,
	control: RwLock<ControlState>,
}

assert_impl_all!(Pool: Send, Sync);

impl Pool {
	/// Builds a pool backed by real segment files under `directory`, with no
	/// WAL dependency and no mirror host configured. Use
	/// [`Pool::with_collaborators`] to wire in real `WalFlush`/`MirrorSink`
	/// implementations, or mocks for testing.
	pub fn new(
		name: impl Into<String>,
		directory: PathBuf,
		config: PoolConfig,
		precedes: impl Fn(u32, u32) -> bool + Send + Sync + 'static,
	) -> io::Result<Self> {
		let dir = Arc::new(FsSegmentDirectory::open(directory)?);
		let physical = Box::new(FsPhysicalIo::new(dir.clone()));
		Ok(Self::with_collaborators(
			name,
			dir,
			config,
			precedes,
			physical,
			Box::new(NoWal),
			Box::new(NoMirror),
		))
	}

	pub fn with_collaborators(
		name: impl Into<String>,
		directory: Arc<dyn SegmentDirectory>,
		config: PoolConfig,
		precedes: impl Fn(u32, u32) -> bool + Send + Sync + 'static,
		physical: Box<dyn PhysicalIo>,
		wal: Box<dyn WalFlush>,
		mirror: Box<dyn MirrorSink>,
	) -> Self {
		let slot_count = config.slot_count;
		Self {
			name: name.into(),
			arena: PageArena::new(slot_count),
			slot_locks: SlotLocks::new(slot_count),
			lru: LruTicks::new(slot_count),
			control: RwLock::new(ControlState::new(slot_count, config.lsn_groups_per_page)),
			precedes: Box::new(precedes),
			directory,
			physical,
			wal,
			mirror,
			config,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn config(&self) -> &PoolConfig {
		&self.config
	}

	/// Acquires the control lock shared, for callers that want to inspect
	/// one or more slot buffers via [`Pool::buffer`] without racing a
	/// concurrent eviction.
	pub fn lock_shared(&self) -> ControlGuard<'_> {
		ControlGuard::Shared(self.control.read())
	}

	pub fn lock_exclusive(&self) -> ControlGuard<'_> {
		ControlGuard::Exclusive(self.control.write())
	}

	/// Raw access to a slot's buffer, gated only by proof that the caller
	/// holds the control lock in some mode.
	///
	/// # Safety contract
	/// Holding the control lock prevents any *new* I/O from starting on
	/// `slot_index`, but does not by itself prove I/O already in flight
	/// has finished. Callers must only pass a `slot_index` whose status
	/// they know is not `ReadInProgress`/`WriteInProgress` (as returned by
	/// `read_page`, `zero_page`, or the readonly scan in
	/// `read_page_readonly`, each of which only ever hands back such a
	/// slot).
	pub fn buffer(&self, lock: &ControlGuard<'_>, slot_index: usize) -> &[u8] {
		let _ = lock;
		// Safety: see the safety contract above; the caller's held control
		// guard is how they prove they obtained `slot_index` from one of
		// the documented sources.
		unsafe { self.arena.slot(slot_index) }
	}

	/// Creates a fresh, in-memory page (spec.md §4 lifecycle, §6
	/// `zero_page`): zero-fills the buffer, marks it dirty, and pins it as
	/// `latest_page_number` so it is never chosen for eviction. Returns a
	/// [`PageLease`] still holding the control lock exclusively, per
	/// spec.md §6's "control held [on entry and exit]".
	///
	/// If the selector must evict a dirty victim to make room and that
	/// write fails, this panics rather than returning an error: this
	/// mirrors the original's `ereport(ERROR)` inside
	/// `SlruSelectLRUPage`, which is a non-local exit, not a recoverable
	/// return (see [`Pool::write_evict`]).
	pub fn zero_page(&self, pageno: u32) -> PageLease<'_> {
		let state = self.control.write();
		let (mut state, slot) = self.select_slot(state, pageno);

		state.slots[slot].page_number = pageno;
		state.slots[slot].status = SlotStatus::Valid;
		state.slots[slot].dirty = true;
		state.slots[slot].zero_lsns();
		state.latest_page_number = pageno;
		self.lru.recently_used(slot);

		// Safety: the control lock is held exclusively for this whole call,
		// including the memset below. The slot is already `Valid`, which
		// makes it readable by a thread that never touches the per-slot
		// lock (the read-only fast path); only the still-held control lock
		// keeps such a reader out until the zero-fill below has completed.
		unsafe { self.arena.slot_mut(slot).fill(0) };

		PageLease {
			pool: self,
			guard: ControlGuard::Exclusive(state),
			slot_index: slot,
		}
	}

	/// Reads a page into a slot, performing physical I/O if it is not
	/// already cached (spec.md §4.4 "Read (exclusive-path)"). Returns a
	/// [`PageLease`] still holding the control lock exclusively, per
	/// spec.md §6's "control held [on entry and exit]" — the returned slot
	/// index stays pinned against a concurrent eviction until the lease is
	/// dropped.
	pub fn read_page(
		&self,
		pageno: u32,
		write_ok: bool,
		xid: Option<u32>,
	) -> Result<PageLease<'_>, PoolError> {
		let state = self.control.write();
		let (state, result) = self.read_page_locked(state, pageno, write_ok);
		match result {
			Ok(slot) => Ok(PageLease {
				pool: self,
				guard: ControlGuard::Exclusive(state),
				slot_index: slot,
			}),
			Err(err) => {
				drop(state);
				self.report_io_error(&err, pageno, xid);
				Err(err)
			}
		}
	}

	/// Reads a page for read-only access (spec.md §4.4 "Read (read-only
	/// fast path)"): tries a shared-lock scan first, only upgrading to the
	/// full exclusive read path on a miss.
	pub fn read_page_readonly(
		&self,
		pageno: u32,
		xid: Option<u32>,
	) -> Result<PageLease<'_>, PoolError> {
		let shared = self.control.read();
		if let Some(slot) = shared.slots.iter().position(|meta| {
			meta.page_number == pageno
				&& meta.status != SlotStatus::Empty
				&& meta.status != SlotStatus::ReadInProgress
		}) {
			self.lru.recently_used(slot);
			return Ok(PageLease {
				pool: self,
				guard: ControlGuard::Shared(shared),
				slot_index: slot,
			});
		}
		drop(shared);

		let state = self.control.write();
		let (state, result) = self.read_page_locked(state, pageno, true);
		match result {
			Ok(slot) => Ok(PageLease {
				pool: self,
				guard: ControlGuard::Exclusive(state),
				slot_index: slot,
			}),
			Err(err) => {
				drop(state);
				self.report_io_error(&err, pageno, xid);
				Err(err)
			}
		}
	}

	/// Checks whether `pageno` exists, pulling it into cache if necessary
	/// (spec.md §4.9 / original `SimpleLruPageExists`): its own
	/// selector-driven loop, distinct from `read_page`, since it only
	/// waits out a concurrent *read*, not a concurrent write.
	pub fn page_exists(&self, pageno: u32) -> Result<bool, PoolError> {
		let mut state = self.control.write();
		loop {
			let (next_state, slot) = self.select_slot(state, pageno);
			state = next_state;

			let status = state.slots[slot].status;
			if state.slots[slot].page_number == pageno && status != SlotStatus::Empty {
				if status == SlotStatus::ReadInProgress {
					state = self.wait_for_io(state, slot);
					continue;
				}
				return Ok(true);
			}

			state.slots[slot].page_number = pageno;
			state.slots[slot].status = SlotStatus::ReadInProgress;
			state.slots[slot].dirty = false;
			state.slots[slot].zero_lsns();
			self.lru.recently_used(slot);

			self.slot_locks.lock_exclusive(slot);
			drop(state);

			let segment = pageno / PAGES_PER_SEGMENT;
			let offset = u64::from(pageno % PAGES_PER_SEGMENT) * PAGE_SIZE as u64;
			// Safety: slot is ReadInProgress and we hold its exclusive lock.
			let buf = unsafe { self.arena.slot_mut(slot) };
			let result =
				self.physical
					.read_page(segment, offset, pageno, buf, self.config.recovery_mode);

			let mut new_state = self.control.write();
			new_state.slots[slot].status = if result.is_ok() {
				SlotStatus::Valid
			} else {
				SlotStatus::Empty
			};
			// Safety: exclusive slot lock acquired above.
			unsafe { self.slot_locks.unlock_exclusive(slot) };

			return match result {
				Ok(()) => Ok(true),
				Err(err) => {
					self.report_io_error(&err, pageno, None);
					Err(err)
				}
			};
		}
	}

	/// Writes a slot back to disk if dirty (spec.md §4.4 "Write"). Pass a
	/// [`FlushContext`] to batch the write into a checkpoint; otherwise the
	/// write fsyncs on its own per `PoolConfig::fsync_enabled`.
	pub fn write_page(
		&self,
		slot_index: usize,
		flush_ctx: Option<&mut FlushContext>,
	) -> Result<(), PoolError> {
		let state = self.control.write();
		let pageno = state.slots[slot_index].page_number;
		let (state, result) = self.do_write(state, slot_index, pageno, flush_ctx);
		drop(state);
		result.inspect_err(|err| self.report_io_error(err, pageno, None))
	}

	/// Checkpoint flush (spec.md §4.5): writes every dirty slot, batching
	/// segment handles through a short-lived [`FlushContext`], then fsyncs
	/// and closes whatever handles the context accumulated.
	pub fn flush(&self, is_checkpoint: bool) -> Result<(), PoolError> {
		let mut ctx = FlushContext::new(self.config.max_flush_handles, self.config.fsync_enabled);
		let mut first_error = None;
		{
			let mut state = self.control.write();
			for slot in 0..self.config.slot_count {
				let pageno = state.slots[slot].page_number;
				let (next_state, result) = self.do_write(state, slot, pageno, Some(&mut ctx));
				state = next_state;
				if let Err(err) = result {
					self.report_io_error(&err, pageno, None);
					first_error.get_or_insert(err);
				}
				// A checkpoint flush cannot assert every slot ends up
				// clean: a concurrent client may have re-dirtied it
				// between this write and the end of the scan.
				debug_assert!(
					is_checkpoint
						|| state.slots[slot].status == SlotStatus::Empty
						|| (state.slots[slot].status == SlotStatus::Valid && !state.slots[slot].dirty)
				);
			}
		}
		let finish_result = ctx.finish();
		match first_error {
			Some(err) => Err(err),
			None => finish_result,
		}
	}

	/// Drops all segments strictly preceding `cutoff_page` in the client's
	/// page order (spec.md §4.6): acquires the control lock itself around
	/// the slot-eviction phase, then performs the directory unlink with it
	/// released.
	pub fn truncate(&self, cutoff_page: u32) {
		let state = self.control.write();
		if self.truncate_locked(state, cutoff_page) {
			self.finish_truncate(cutoff_page);
		}
	}

	/// Variant for callers whose own locking discipline already guarantees
	/// the in-memory slot table holds nothing below `cutoff_page` (spec.md
	/// §4.6 "a variant entry point assumes control is already held"): skips
	/// straight to the directory unlink.
	pub fn truncate_with_lock(&self, cutoff_page: u32) {
		let adjusted = cutoff_page - cutoff_page % PAGES_PER_SEGMENT;
		let latest = self.control.read().latest_page_number;
		if (self.precedes)(latest, adjusted) {
			warn!(
				"pool {:?}: refusing to truncate, apparent wraparound (latest page {latest}, cutoff {adjusted})",
				self.name
			);
			return;
		}
		self.finish_truncate(cutoff_page);
	}

	/// Enumerates segment files at or below `cutoff_page`'s segment
	/// boundary (spec.md §4.7), optionally deleting them. Returns whether
	/// any qualifying segment was found.
	pub fn scan_directory(&self, cutoff_page: u32, delete: bool) -> io::Result<bool> {
		let cutoff_page = cutoff_page - cutoff_page % PAGES_PER_SEGMENT;
		let mut found = false;
		let mut removed = 0usize;
		for segment in self.directory.list_segments()? {
			if !(self.precedes)(segment * PAGES_PER_SEGMENT, cutoff_page) {
				continue;
			}
			found = true;
			if delete {
				debug!("pool {:?}: removing segment {segment:04X}", self.name);
				self.directory.remove_segment(segment)?;
				self.mirror.notify_remove(segment);
				removed += 1;
			}
		}
		if delete && removed > 0 {
			info!(
				"pool {:?}: directory scan removed {removed} segment(s) below page {cutoff_page}",
				self.name
			);
		}
		Ok(found)
	}

	fn finish_truncate(&self, cutoff_page: u32) {
		if let Err(err) = self.scan_directory(cutoff_page, true) {
			warn!(
				"pool {:?}: directory scan during truncate failed: {err}",
				self.name
			);
		}
	}

	/// Returns whether the caller may proceed to the directory-unlink phase:
	/// `false` means an apparent wraparound refused the entire truncation,
	/// not merely the in-memory eviction.
	fn truncate_locked(
		&self,
		mut state: RwLockWriteGuard<'_, ControlState>,
		cutoff_page: u32,
	) -> bool {
		let cutoff_page = cutoff_page - cutoff_page % PAGES_PER_SEGMENT;

		'restart: loop {
			if (self.precedes)(state.latest_page_number, cutoff_page) {
				warn!(
					"pool {:?}: refusing to truncate, apparent wraparound (latest page {}, cutoff {cutoff_page})",
					self.name, state.latest_page_number
				);
				return false;
			}

			for slot in 0..self.config.slot_count {
				if state.slots[slot].status == SlotStatus::Empty {
					continue;
				}
				if !(self.precedes)(state.slots[slot].page_number, cutoff_page) {
					continue;
				}

				if state.slots[slot].status == SlotStatus::Valid && !state.slots[slot].dirty {
					state.slots[slot].status = SlotStatus::Empty;
					continue;
				}

				let pageno = state.slots[slot].page_number;
				if state.slots[slot].status == SlotStatus::Valid {
					let (next_state, result) = self.do_write(state, slot, pageno, None);
					state = next_state;
					if let Err(err) = result {
						self.report_io_error(&err, pageno, None);
					}
				} else {
					state = self.wait_for_io(state, slot);
				}
				continue 'restart;
			}

			return true;
		}
	}

	/// LRU victim selection (spec.md §4.3): returns a slot that already
	/// holds `pageno`, or one that is legally reusable for it. Always
	/// entered and exited with the control lock held exclusively.
	fn select_slot<'p>(
		&'p self,
		mut state: RwLockWriteGuard<'p, ControlState>,
		pageno: u32,
	) -> (RwLockWriteGuard<'p, ControlState>, usize) {
		loop {
			if let Some(slot) = state.find(pageno) {
				return (state, slot);
			}

			let cur = self.lru.advance();
			let mut best: Option<(usize, i32, u32)> = None;
			let mut empty_slot = None;

			for (i, meta) in state.slots.iter().enumerate() {
				if meta.status == SlotStatus::Empty {
					empty_slot = Some(i);
					break;
				}

				let mut delta = self.lru.delta(i, cur);
				if delta < 0 {
					self.lru.repair(i, cur);
					delta = 0;
				}

				if meta.page_number == state.latest_page_number {
					continue;
				}

				let better = match best {
					None => true,
					Some((_, best_delta, best_page)) => {
						delta > best_delta
							|| (delta == best_delta && (self.precedes)(meta.page_number, best_page))
					}
				};
				if better {
					best = Some((i, delta, meta.page_number));
				}
			}

			if let Some(slot) = empty_slot {
				return (state, slot);
			}

			let (victim, _, _) = best.expect(
				"a pool with more than one slot always has a non-latest candidate to evict",
			);

			match state.slots[victim].status {
				SlotStatus::Valid if !state.slots[victim].dirty => return (state, victim),
				SlotStatus::Valid => state = self.write_evict(state, victim),
				SlotStatus::ReadInProgress | SlotStatus::WriteInProgress => {
					state = self.wait_for_io(state, victim);
				}
				SlotStatus::Empty => unreachable!("empty slots are returned above"),
			}
		}
	}

	/// Write-evicts a dirty victim chosen by the selector. A failure here
	/// is treated as fatal (mirrors the original's non-local
	/// `ereport(ERROR)` exit from inside `SlruSelectLRUPage`): there is no
	/// well-defined way for `zero_page`'s infallible signature to recover,
	/// so this panics rather than threading a `Result` through the
	/// selector.
	fn write_evict<'p>(
		&'p self,
		state: RwLockWriteGuard<'p, ControlState>,
		slot: usize,
	) -> RwLockWriteGuard<'p, ControlState> {
		let pageno = state.slots[slot].page_number;
		let (state, result) = self.do_write(state, slot, pageno, None);
		if let Err(err) = result {
			panic!(
				"pool {:?}: failed to write back slot {slot} during eviction: {err}",
				self.name
			);
		}
		state
	}

	/// Wait-for-I/O helper (spec.md §4.4): releases control, blocks on the
	/// slot lock purely as a wait-barrier, then re-acquires control. If the
	/// slot is still `*_IN_PROGRESS` afterward, a non-blocking shared
	/// acquire is attempted; success means the prior I/O thread never
	/// cleaned up (it panicked or otherwise died), so the slot is rolled
	/// back in place.
	fn wait_for_io<'p>(
		&'p self,
		state: RwLockWriteGuard<'p, ControlState>,
		slot: usize,
	) -> RwLockWriteGuard<'p, ControlState> {
		drop(state);
		self.slot_locks.lock_shared(slot);
		// Safety: just acquired above.
		unsafe { self.slot_locks.unlock_shared(slot) };
		let mut state = self.control.write();

		let status = state.slots[slot].status;
		if status.is_in_progress() && self.slot_locks.try_lock_shared(slot) {
			warn!(
				"pool {:?}: recovering slot {slot} from an abandoned {status:?} I/O",
				self.name
			);
			match status {
				SlotStatus::ReadInProgress => state.slots[slot].status = SlotStatus::Empty,
				SlotStatus::WriteInProgress => {
					state.slots[slot].status = SlotStatus::Valid;
					state.slots[slot].dirty = true;
				}
				_ => unreachable!("checked is_in_progress above"),
			}
			// Safety: try_lock_shared above succeeded.
			unsafe { self.slot_locks.unlock_shared(slot) };
		}

		state
	}

	/// The exclusive-path read (spec.md §4.4 "Read (exclusive-path)"),
	/// shared by `read_page` and the fallback half of `read_page_readonly`.
	/// Entered and exited with the control lock held exclusively.
	fn read_page_locked<'p>(
		&'p self,
		mut state: RwLockWriteGuard<'p, ControlState>,
		pageno: u32,
		write_ok: bool,
	) -> (RwLockWriteGuard<'p, ControlState>, Result<usize, PoolError>) {
		loop {
			let (next_state, slot) = self.select_slot(state, pageno);
			state = next_state;

			let status = state.slots[slot].status;
			if state.slots[slot].page_number == pageno && status != SlotStatus::Empty {
				if status == SlotStatus::ReadInProgress
					|| (status == SlotStatus::WriteInProgress && !write_ok)
				{
					state = self.wait_for_io(state, slot);
					continue;
				}
				self.lru.recently_used(slot);
				return (state, Ok(slot));
			}

			debug_assert!(
				status == SlotStatus::Empty || (status == SlotStatus::Valid && !state.slots[slot].dirty)
			);

			state.slots[slot].page_number = pageno;
			state.slots[slot].status = SlotStatus::ReadInProgress;
			state.slots[slot].dirty = false;
			state.slots[slot].zero_lsns();
			self.lru.recently_used(slot);

			self.slot_locks.lock_exclusive(slot);
			drop(state);

			let segment = pageno / PAGES_PER_SEGMENT;
			let offset = u64::from(pageno % PAGES_PER_SEGMENT) * PAGE_SIZE as u64;
			// Safety: slot is ReadInProgress and we hold its exclusive lock.
			let buf = unsafe { self.arena.slot_mut(slot) };
			let result =
				self.physical
					.read_page(segment, offset, pageno, buf, self.config.recovery_mode);

			let mut new_state = self.control.write();
			debug_assert_eq!(new_state.slots[slot].page_number, pageno);
			debug_assert_eq!(new_state.slots[slot].status, SlotStatus::ReadInProgress);
			new_state.slots[slot].status = if result.is_ok() {
				SlotStatus::Valid
			} else {
				SlotStatus::Empty
			};
			// Safety: exclusive slot lock acquired above.
			unsafe { self.slot_locks.unlock_exclusive(slot) };

			return match result {
				Ok(()) => {
					self.lru.recently_used(slot);
					(new_state, Ok(slot))
				}
				Err(err) => (new_state, Err(err)),
			};
		}
	}

	/// Write protocol (spec.md §4.4 "Write"): entered with the control lock
	/// held exclusively, targeting a slot currently holding `pageno`. Does
	/// nothing if the slot isn't dirty or has since been repurposed.
	fn do_write<'p>(
		&'p self,
		mut state: RwLockWriteGuard<'p, ControlState>,
		slot: usize,
		pageno: u32,
		ctx: Option<&mut FlushContext>,
	) -> (RwLockWriteGuard<'p, ControlState>, Result<(), PoolError>) {
		while state.slots[slot].status == SlotStatus::WriteInProgress
			&& state.slots[slot].page_number == pageno
		{
			state = self.wait_for_io(state, slot);
		}

		let meta = &state.slots[slot];
		if !meta.dirty || meta.status != SlotStatus::Valid || meta.page_number != pageno {
			return (state, Ok(()));
		}

		state.slots[slot].status = SlotStatus::WriteInProgress;
		state.slots[slot].dirty = false;
		let max_lsn = state.slots[slot].max_lsn();

		self.slot_locks.lock_exclusive(slot);
		drop(state);

		if max_lsn != 0 {
			if let Err(err) = self.wal.flush(max_lsn) {
				panic!(
					"pool {:?}: WAL flush failed for page {pageno}, cannot continue safely: {err}",
					self.name
				);
			}
		}

		let segment = pageno / PAGES_PER_SEGMENT;
		let offset = u64::from(pageno % PAGES_PER_SEGMENT) * PAGE_SIZE as u64;
		// Safety: slot is WriteInProgress and we hold its exclusive lock.
		let buf = unsafe { self.arena.slot(slot) };
		let result = match ctx {
			Some(ctx) => self
				.physical
				.write_page_batched(segment, offset, pageno, buf, ctx),
			None => {
				self.physical
					.write_page(segment, offset, pageno, buf, self.config.fsync_enabled)
			}
		};

		if result.is_ok() {
			self.mirror.notify_write(segment);
		}

		let mut state = self.control.write();
		debug_assert_eq!(state.slots[slot].page_number, pageno);
		debug_assert_eq!(state.slots[slot].status, SlotStatus::WriteInProgress);

		if result.is_err() {
			state.slots[slot].dirty = true;
		}
		state.slots[slot].status = SlotStatus::Valid;

		// Safety: exclusive slot lock acquired above.
		unsafe { self.slot_locks.unlock_exclusive(slot) };

		(state, result)
	}

	fn report_io_error(&self, err: &PoolError, pageno: u32, xid: Option<u32>) {
		match xid {
			Some(xid) => error!("pool {:?}: page {pageno} (xid {xid}): {err}", self.name),
			None => error!("pool {:?}: page {pageno}: {err}", self.name),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::mpsc, thread};

	use pretty_assertions::assert_buf_eq;

	use super::*;
	use crate::{mirror::MockMirrorSink, physical::MockPhysicalIo, wal::MockWalFlush};

	/// The standard non-wrapping order used by most of these tests: plain
	/// numeric precedence, exactly as in spec.md's worked examples.
	fn numeric_precedes(a: u32, b: u32) -> bool {
		a < b
	}

	fn test_pool(slot_count: usize) -> (tempfile::TempDir, Pool) {
		let dir = tempfile::tempdir().unwrap();
		let config = PoolConfig {
			slot_count,
			fsync_enabled: false,
			..PoolConfig::default()
		};
		let pool = Pool::new("test", dir.path().to_path_buf(), config, numeric_precedes).unwrap();
		(dir, pool)
	}

	fn pool_with_physical(
		dir: &tempfile::TempDir,
		slot_count: usize,
		physical: Box<dyn PhysicalIo>,
	) -> Pool {
		let directory: Arc<dyn SegmentDirectory> =
			Arc::new(FsSegmentDirectory::open(dir.path()).unwrap());
		let config = PoolConfig {
			slot_count,
			fsync_enabled: false,
			..PoolConfig::default()
		};
		Pool::with_collaborators(
			"test",
			directory,
			config,
			numeric_precedes,
			physical,
			Box::new(NoWal),
			Box::new(NoMirror),
		)
	}

	#[test]
	fn zero_page_then_read_is_a_cache_hit() {
		let (_dir, pool) = test_pool(4);
		let slot = pool.zero_page(5).slot_index();
		assert_eq!(pool.read_page(5, true, None).unwrap().slot_index(), slot);
	}

	#[test]
	fn lru_eviction_spares_latest_page() {
		let (dir, pool) = test_pool(4);
		pool.zero_page(0);
		pool.zero_page(32);
		pool.zero_page(64);
		pool.zero_page(96);
		// A fifth page forces an eviction; page 96 (the latest) must never
		// be the victim, and page 0 (oldest, untouched since) should be.
		pool.zero_page(128);

		// Page 0 was dirty, so its eviction must have flushed segment 0000
		// to disk.
		assert!(dir.path().join("0000").exists());

		// Page 128 must still be resident: page_exists on a pool outside
		// recovery mode would fail reading a nonexistent segment 0004 if it
		// weren't cache-resident.
		assert!(!dir.path().join("0004").exists());
		assert!(pool.page_exists(128).unwrap());
	}

	#[test]
	fn zero_write_evict_read_round_trips_to_an_all_zero_buffer() {
		let (_dir, pool) = test_pool(4);
		let slot = pool.zero_page(0).slot_index();
		pool.write_page(slot, None).unwrap();
		// Force eviction of page 0 by filling every other slot and latest-pinning
		// a fifth page, then read page 0 back from disk.
		pool.zero_page(32);
		pool.zero_page(64);
		pool.zero_page(96);
		pool.zero_page(128);

		let lease = pool.read_page(0, false, None).unwrap();
		assert_buf_eq!(lease.buffer(), [0u8; PAGE_SIZE].as_slice());
	}

	#[test]
	fn read_only_fast_path_serves_cached_page_without_upgrading() {
		let (_dir, pool) = test_pool(4);
		let slot = pool.zero_page(9).slot_index();
		let lease = pool.read_page_readonly(9, None).unwrap();
		assert_eq!(lease.slot_index(), slot);
		assert!(matches!(lease.guard(), ControlGuard::Shared(_)));
	}

	#[test]
	fn read_only_miss_falls_back_to_exclusive_path() {
		let (_dir, pool) = test_pool(4);
		let lease = pool.read_page_readonly(3, None).unwrap();
		assert!(matches!(lease.guard(), ControlGuard::Exclusive(_)));
	}

	#[test]
	fn page_exists_reports_false_absent_recovery_mode_as_an_error() {
		let (_dir, pool) = test_pool(4);
		assert!(pool.page_exists(99).is_err());
		assert_eq!(pool.control.read().slots[0].status, SlotStatus::Empty);
	}

	#[test]
	fn read_failure_leaves_slot_empty() {
		let dir = tempfile::tempdir().unwrap();
		let mut mock = MockPhysicalIo::new();
		mock.expect_read_page().returning(|segment, _, _, _, _| {
			Err(PoolError::OpenFailed {
				segment,
				source: io::Error::from(io::ErrorKind::PermissionDenied),
			})
		});
		let pool = pool_with_physical(&dir, 4, Box::new(mock));
		assert!(pool.read_page(1, false, None).is_err());
		assert_eq!(pool.control.read().slots[0].status, SlotStatus::Empty);
	}

	#[test]
	fn write_failure_restores_dirty_and_valid() {
		let dir = tempfile::tempdir().unwrap();
		let mut mock = MockPhysicalIo::new();
		mock.expect_write_page().returning(|segment, _, pageno, _, _| {
			Err(PoolError::WriteFailed {
				segment,
				pageno,
				source: io::Error::from(io::ErrorKind::Other),
			})
		});
		let pool = pool_with_physical(&dir, 4, Box::new(mock));
		let slot = pool.zero_page(7).slot_index();
		assert!(pool.write_page(slot, None).is_err());
		let state = pool.control.read();
		assert_eq!(state.slots[slot].status, SlotStatus::Valid);
		assert!(state.slots[slot].dirty);
	}

	#[test]
	fn redirty_during_write_is_preserved() {
		let dir = tempfile::tempdir().unwrap();
		let (ready_tx, ready_rx) = mpsc::channel::<()>();
		let (go_tx, go_rx) = mpsc::channel::<()>();

		let mut mock = MockPhysicalIo::new();
		mock.expect_write_page().returning(move |_, _, _, _, _| {
			ready_tx.send(()).unwrap();
			go_rx.recv().unwrap();
			Ok(())
		});

		let pool = Arc::new(pool_with_physical(&dir, 4, Box::new(mock)));
		let slot = pool.zero_page(42).slot_index();

		let writer_pool = pool.clone();
		let handle = thread::spawn(move || writer_pool.write_page(slot, None));

		ready_rx.recv().unwrap();
		pool.control.write().slots[slot].dirty = true;
		go_tx.send(()).unwrap();
		handle.join().unwrap().unwrap();

		let state = pool.control.read();
		assert_eq!(state.slots[slot].status, SlotStatus::Valid);
		assert!(state.slots[slot].dirty);
	}

	#[test]
	fn flush_writes_every_dirty_slot() {
		let (dir, pool) = test_pool(2);
		pool.zero_page(0);
		pool.zero_page(64);
		pool.flush(true).unwrap();
		assert!(dir.path().join("0000").exists());
		assert!(dir.path().join("0002").exists());
		let state = pool.control.read();
		assert!(state.slots.iter().all(|slot| !slot.dirty));
	}

	#[test]
	fn truncate_refuses_on_apparent_wraparound() {
		let dir = tempfile::tempdir().unwrap();
		let directory: Arc<dyn SegmentDirectory> =
			Arc::new(FsSegmentDirectory::open(dir.path()).unwrap());
		let physical = Box::new(FsPhysicalIo::new(Arc::new(
			FsSegmentDirectory::open(dir.path()).unwrap(),
		)));
		let config = PoolConfig {
			slot_count: 4,
			fsync_enabled: false,
			..PoolConfig::default()
		};
		// Wraparound-tolerant comparison, as in the original SLRU: treats a
		// cutoff far ahead numerically as actually *behind* the latest page.
		let pool = Pool::with_collaborators(
			"test",
			directory,
			config,
			|a: u32, b: u32| (a.wrapping_sub(b) as i32) < 0,
			physical,
			Box::new(NoWal),
			Box::new(NoMirror),
		);

		std::fs::write(dir.path().join("0000"), []).unwrap();
		pool.zero_page(0x10);

		pool.truncate(0x8000_0010);

		assert!(dir.path().join("0000").exists());
	}

	#[test]
	fn truncate_removes_segments_below_cutoff() {
		let (dir, pool) = test_pool(4);
		pool.zero_page(0);
		pool.zero_page(64);
		pool.flush(true).unwrap();
		assert!(dir.path().join("0000").exists());
		assert!(dir.path().join("0002").exists());

		pool.truncate(64);

		assert!(!dir.path().join("0000").exists());
		assert!(dir.path().join("0002").exists());
	}

	#[test]
	fn wal_flush_is_invoked_before_a_dirty_write_with_a_nonzero_lsn() {
		let dir = tempfile::tempdir().unwrap();
		let directory: Arc<dyn SegmentDirectory> =
			Arc::new(FsSegmentDirectory::open(dir.path()).unwrap());
		let physical = Box::new(FsPhysicalIo::new(Arc::new(
			FsSegmentDirectory::open(dir.path()).unwrap(),
		)));

		let mut wal = MockWalFlush::new();
		wal.expect_flush().withf(|lsn| *lsn == 77).returning(|_| Ok(()));

		let config = PoolConfig {
			slot_count: 4,
			lsn_groups_per_page: 1,
			fsync_enabled: false,
			..PoolConfig::default()
		};
		let pool = Pool::with_collaborators(
			"test",
			directory,
			config,
			numeric_precedes,
			physical,
			Box::new(wal),
			Box::new(NoMirror),
		);

		let slot = pool.zero_page(1).slot_index();
		pool.control.write().slots[slot].group_lsn[0] = 77;
		pool.write_page(slot, None).unwrap();
	}

	#[test]
	fn mirror_is_notified_on_successful_write_and_removed_segment() {
		let dir = tempfile::tempdir().unwrap();
		let directory: Arc<dyn SegmentDirectory> =
			Arc::new(FsSegmentDirectory::open(dir.path()).unwrap());
		let physical = Box::new(FsPhysicalIo::new(Arc::new(
			FsSegmentDirectory::open(dir.path()).unwrap(),
		)));

		let mut mirror = MockMirrorSink::new();
		mirror.expect_notify_write().returning(|_| ());
		mirror.expect_notify_remove().withf(|segment| *segment == 0).returning(|_| ());

		let config = PoolConfig {
			slot_count: 4,
			fsync_enabled: false,
			..PoolConfig::default()
		};
		let pool = Pool::with_collaborators(
			"test",
			directory,
			config,
			numeric_precedes,
			physical,
			Box::new(NoWal),
			Box::new(mirror),
		);

		pool.zero_page(0);
		pool.zero_page(64);
		pool.flush(true).unwrap();
		pool.truncate(32);
	}

	#[test]
	fn abandoned_write_in_progress_is_recovered_as_dirty() {
		let (_dir, pool) = test_pool(4);
		let slot = pool.zero_page(1).slot_index();
		{
			let mut state = pool.control.write();
			state.slots[slot].status = SlotStatus::WriteInProgress;
			state.slots[slot].dirty = false;
		}
		// No thread actually holds the per-slot lock, so wait_for_io must
		// detect the abandoned I/O and roll the slot back to dirty+valid.
		let state = pool.control.write();
		let state = pool.wait_for_io(state, slot);
		assert_eq!(state.slots[slot].status, SlotStatus::Valid);
		assert!(state.slots[slot].dirty);
	}
}
