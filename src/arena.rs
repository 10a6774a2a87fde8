use std::{
	alloc::{alloc_zeroed, dealloc, Layout},
	mem,
	ptr::{self, NonNull},
};

use crate::consts::PAGE_SIZE;

/// Owned backing storage for a pool's page slots: one contiguous allocation,
/// never reallocated or moved, sliced into fixed `PAGE_SIZE` windows by slot
/// index.
///
/// This replaces the pre-mapped shared-memory arena the original design
/// assumes; slots are addressed by index rather than by raw pointer, and the
/// arena is owned by a single process.
pub(crate) struct PageArena {
	buf: Option<NonNull<u8>>,
	slot_count: usize,
}

impl PageArena {
	pub fn new(slot_count: usize) -> Self {
		let buf_size = slot_count * PAGE_SIZE;
		let buf = if buf_size != 0 {
			// Safety: buf_size is non-zero, so the layout is not zero-sized.
			unsafe { alloc_zeroed(Layout::from_size_align(buf_size, 1).unwrap()) }
		} else {
			ptr::null_mut()
		};
		Self {
			buf: NonNull::new(buf),
			slot_count,
		}
	}

	fn slot_ptr(&self, index: usize) -> Option<NonNull<u8>> {
		if index >= self.slot_count {
			return None;
		}
		// Safety: the resulting pointer stays within the allocated buffer.
		Some(unsafe { self.buf?.add(index * PAGE_SIZE) })
	}

	/// # Safety
	/// The caller must ensure no mutable reference to the same slot exists
	/// for the lifetime of the returned slice. In practice this means the
	/// slot's per-slot I/O lock or the pool's control lock must be held in a
	/// mode that forbids concurrent writers.
	pub unsafe fn slot(&self, index: usize) -> &[u8] {
		let ptr = self
			.slot_ptr(index)
			.expect("page arena index out of bounds");
		std::slice::from_raw_parts(ptr.as_ptr(), PAGE_SIZE)
	}

	/// # Safety
	/// The caller must ensure no other reference, shared or mutable, to the
	/// same slot exists for the lifetime of the returned slice.
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn slot_mut(&self, index: usize) -> &mut [u8] {
		let ptr = self
			.slot_ptr(index)
			.expect("page arena index out of bounds");
		std::slice::from_raw_parts_mut(ptr.as_ptr(), PAGE_SIZE)
	}
}

// Safety: PageArena exposes no functionality that would make it unsafe to
// transfer across threads.
unsafe impl Send for PageArena {}

// Safety: the safety conditions are pushed onto the callers of `slot` and
// `slot_mut`, which are only reachable while holding the appropriate lock.
unsafe impl Sync for PageArena {}

impl Drop for PageArena {
	fn drop(&mut self) {
		if let Some(buf) = self.buf {
			let buf_size = self.slot_count * PAGE_SIZE;
			// Safety: `buf` is non-null and the layout matches the one used to
			// allocate it, since the arena is never reallocated.
			unsafe {
				dealloc(buf.as_ptr(), Layout::from_size_align(buf_size, mem::align_of::<u8>()).unwrap())
			}
		}
	}
}
