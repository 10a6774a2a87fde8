use std::io;

use thiserror::Error;

/// Errors surfaced by the pool to its clients.
///
/// Construction of these variants always happens at the point a low-level
/// syscall fails; the orchestrating operation restores slot state to an
/// invariant-preserving snapshot before returning one of these, never the
/// other way around.
#[derive(Debug, Error)]
pub enum PoolError {
	#[error("could not open segment {segment:04X}: {source}")]
	OpenFailed {
		segment: u32,
		#[source]
		source: io::Error,
	},

	#[error("could not seek in segment {segment:04X} to offset {offset}: {source}")]
	SeekFailed {
		segment: u32,
		offset: u64,
		#[source]
		source: io::Error,
	},

	#[error("could not read page {pageno} from segment {segment:04X}: {source}")]
	ReadFailed {
		segment: u32,
		pageno: u32,
		#[source]
		source: io::Error,
	},

	#[error("could not write page {pageno} to segment {segment:04X}: {source}")]
	WriteFailed {
		segment: u32,
		pageno: u32,
		#[source]
		source: io::Error,
	},

	#[error("could not fsync segment {segment:04X}: {source}")]
	FsyncFailed {
		segment: u32,
		#[source]
		source: io::Error,
	},

	#[error("directory scan failed: {0}")]
	DirectoryScanFailed(#[from] io::Error),
}

/// Raised by a [`crate::wal::WalFlush`] implementation when durability cannot
/// be guaranteed. There is no recoverable path for this failure: the pool
/// panics rather than continue with a page written ahead of its WAL record.
#[derive(Debug, Error)]
#[error("WAL flush failed: {0}")]
pub struct WalFlushError(pub String);
