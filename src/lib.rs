//! A small, fixed-size pool of fixed-size page buffers shared by many
//! concurrent worker threads, with at-most-one in-flight I/O per buffer and
//! a latest-page pinning rule tuned for append-dominated access patterns.
//!
//! This crate is the buffer-cache layer that sits between a transactional
//! database's append-mostly status logs (commit log, subtransaction log,
//! multixact tables, distributed-transaction logs) and their on-disk
//! segment files. It is oblivious to what's inside a page: callers read and
//! write raw page-sized blocks, and supply a [`wal::WalFlush`] collaborator,
//! a [`mirror::MirrorSink`] collaborator, and a page-order predicate that
//! together capture everything the pool itself does not need to know.
//!
//! The entry point is [`pool::Pool`].

mod arena;
mod config;
mod consts;
mod directory;
mod error;
mod mirror;
mod physical;
mod pool;
mod slot;
mod wal;

pub use config::PoolConfig;
pub use consts::{DEFAULT_MAX_FLUSH_HANDLES, DEFAULT_SLOT_COUNT, PAGE_SIZE, PAGES_PER_SEGMENT, SEGMENT_NAME_LEN};
pub use directory::{parse_segment_name, segment_file_name, FsSegmentDirectory, SegmentDirectory};
pub use error::{PoolError, WalFlushError};
pub use mirror::{MirrorSink, NoMirror};
pub use physical::{FlushContext, FsPhysicalIo, PhysicalIo};
pub use pool::{ControlGuard, PageLease, Pool};
pub use wal::{NoWal, WalFlush};
