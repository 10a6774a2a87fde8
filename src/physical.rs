use std::{
	collections::HashMap,
	fs::{File, OpenOptions},
	io::{self, Read, Seek, SeekFrom, Write},
	sync::Arc,
};

#[cfg(test)]
use mockall::automock;

use log::info;

use crate::{consts::PAGE_SIZE, directory::SegmentDirectory, error::PoolError};

/// Translates page numbers into `(segment, offset)` pairs and performs the
/// actual reads and writes. Implementations never raise past this trait's
/// boundary: every syscall failure is captured into a [`PoolError`] and
/// returned, leaving the caller responsible for restoring slot state before
/// surfacing it further (see [`crate::pool::Pool`]).
#[cfg_attr(test, automock)]
pub trait PhysicalIo: Send + Sync {
	/// Reads exactly one page's worth of bytes for `pageno` out of `segment`
	/// at `offset`. When the segment file does not exist and `recovery_mode`
	/// is set, fills `buf` with zeroes and succeeds instead of failing.
	fn read_page(
		&self,
		segment: u32,
		offset: u64,
		pageno: u32,
		buf: &mut [u8],
		recovery_mode: bool,
	) -> Result<(), PoolError>;

	/// Writes one page's worth of bytes for `pageno` into `segment` at
	/// `offset`, creating the segment file if necessary. Fsyncs before
	/// closing when `fsync` is set and no flush context batches the sync.
	fn write_page(
		&self,
		segment: u32,
		offset: u64,
		pageno: u32,
		buf: &[u8],
		fsync: bool,
	) -> Result<(), PoolError>;

	/// Writes a page through a batching [`FlushContext`], deferring fsync to
	/// [`FlushContext::finish`].
	fn write_page_batched(
		&self,
		segment: u32,
		offset: u64,
		pageno: u32,
		buf: &[u8],
		ctx: &mut FlushContext,
	) -> Result<(), PoolError>;
}

/// A [`PhysicalIo`] backed by real segment files under a [`SegmentDirectory`].
pub struct FsPhysicalIo<D: SegmentDirectory> {
	directory: Arc<D>,
}

impl<D: SegmentDirectory> FsPhysicalIo<D> {
	pub fn new(directory: Arc<D>) -> Self {
		Self { directory }
	}

	fn open_rw(&self, segment: u32) -> io::Result<File> {
		OpenOptions::new()
			.read(true)
			.write(true)
			.open(self.directory.segment_path(segment))
	}

	fn open_or_create(&self, segment: u32) -> io::Result<File> {
		OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(false)
			.open(self.directory.segment_path(segment))
	}
}

impl<D: SegmentDirectory> PhysicalIo for FsPhysicalIo<D> {
	fn read_page(
		&self,
		segment: u32,
		offset: u64,
		pageno: u32,
		buf: &mut [u8],
		recovery_mode: bool,
	) -> Result<(), PoolError> {
		debug_assert_eq!(buf.len(), PAGE_SIZE);

		let mut file = match self.open_rw(segment) {
			Ok(file) => file,
			Err(source) if recovery_mode && source.kind() == io::ErrorKind::NotFound => {
				info!(
					"segment {} doesn't exist, reading page {pageno} as zeroes",
					self.directory.segment_path(segment).display()
				);
				buf.fill(0);
				return Ok(());
			}
			Err(source) => return Err(PoolError::OpenFailed { segment, source }),
		};

		file.seek(SeekFrom::Start(offset))
			.map_err(|source| PoolError::SeekFailed { segment, offset, source })?;

		file.read_exact(buf)
			.map_err(|source| PoolError::ReadFailed { segment, pageno, source })?;

		Ok(())
	}

	fn write_page(
		&self,
		segment: u32,
		offset: u64,
		pageno: u32,
		buf: &[u8],
		fsync: bool,
	) -> Result<(), PoolError> {
		debug_assert_eq!(buf.len(), PAGE_SIZE);

		let mut file = self
			.open_or_create(segment)
			.map_err(|source| PoolError::OpenFailed { segment, source })?;

		file.seek(SeekFrom::Start(offset))
			.map_err(|source| PoolError::SeekFailed { segment, offset, source })?;

		file.write_all(buf)
			.map_err(|source| PoolError::WriteFailed { segment, pageno, source })?;

		if fsync {
			file.sync_all()
				.map_err(|source| PoolError::FsyncFailed { segment, source })?;
		}

		Ok(())
	}

	fn write_page_batched(
		&self,
		segment: u32,
		offset: u64,
		pageno: u32,
		buf: &[u8],
		ctx: &mut FlushContext,
	) -> Result<(), PoolError> {
		debug_assert_eq!(buf.len(), PAGE_SIZE);

		if let Some(handle) = ctx.handles.get_mut(&segment) {
			return Self::write_through(handle, segment, offset, pageno, buf);
		}

		let mut file = self
			.open_or_create(segment)
			.map_err(|source| PoolError::OpenFailed { segment, source })?;

		Self::write_through(&mut file, segment, offset, pageno, buf)?;

		if ctx.handles.len() < ctx.max_handles {
			ctx.handles.insert(segment, file);
		} else {
			// Handle table is full: this write degrades to a one-shot open,
			// fsync it immediately since we won't revisit it in finish().
			if ctx.fsync_enabled {
				file.sync_all()
					.map_err(|source| PoolError::FsyncFailed { segment, source })?;
			}
		}

		Ok(())
	}
}

impl<D: SegmentDirectory> FsPhysicalIo<D> {
	fn write_through(
		file: &mut File,
		segment: u32,
		offset: u64,
		pageno: u32,
		buf: &[u8],
	) -> Result<(), PoolError> {
		file.seek(SeekFrom::Start(offset))
			.map_err(|source| PoolError::SeekFailed { segment, offset, source })?;
		file.write_all(buf)
			.map_err(|source| PoolError::WriteFailed { segment, pageno, source })?;
		Ok(())
	}
}

/// A short-lived cache of open segment file handles used to batch writes and
/// fsyncs across a checkpoint flush. Bounded by `max_handles`; once full,
/// further segments fall back to one-shot opens that fsync themselves.
pub struct FlushContext {
	handles: HashMap<u32, File>,
	max_handles: usize,
	fsync_enabled: bool,
}

impl FlushContext {
	pub fn new(max_handles: usize, fsync_enabled: bool) -> Self {
		Self {
			handles: HashMap::new(),
			max_handles,
			fsync_enabled,
		}
	}

	/// Fsyncs and closes every handle still owned by this context, returning
	/// the first failure encountered (after attempting every handle).
	pub fn finish(mut self) -> Result<(), PoolError> {
		let mut first_error = None;
		for (segment, file) in self.handles.drain() {
			if self.fsync_enabled {
				if let Err(source) = file.sync_all() {
					first_error.get_or_insert(PoolError::FsyncFailed { segment, source });
				}
			}
		}
		match first_error {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}
}
