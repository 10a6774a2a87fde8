#[cfg(test)]
use mockall::automock;

use crate::error::WalFlushError;

/// The write-ahead log's durability contract, as seen by the pool: flushing
/// up to and including `lsn` either returns once durability is achieved, or
/// fails in a way that makes continuing unsafe. The pool never interprets
/// `lsn` beyond comparing/maxing raw values supplied by its clients.
#[cfg_attr(test, automock)]
pub trait WalFlush: Send + Sync {
	fn flush(&self, lsn: u64) -> Result<(), WalFlushError>;
}

/// A [`WalFlush`] for pools with no WAL dependency (`lsn_groups_per_page ==
/// 0`). Its `flush` is never called in that configuration; it exists so a
/// `Pool` can be constructed without a real WAL collaborator wired in yet.
pub struct NoWal;

impl WalFlush for NoWal {
	fn flush(&self, _lsn: u64) -> Result<(), WalFlushError> {
		Ok(())
	}
}
