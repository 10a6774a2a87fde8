//! Fixed sizes shared by the whole crate.

/// Size in bytes of one page slot's buffer.
pub const PAGE_SIZE: usize = 8192;

/// Number of pages stored in one segment file.
pub const PAGES_PER_SEGMENT: u32 = 32;

/// Length, in characters, of a segment file name (four uppercase hex digits).
pub const SEGMENT_NAME_LEN: usize = 4;

/// Default number of page slots in a pool with no explicit configuration.
pub const DEFAULT_SLOT_COUNT: usize = 64;

/// Default cap on concurrently open segment handles during a checkpoint flush,
/// beyond which writes degrade to one-shot opens.
pub const DEFAULT_MAX_FLUSH_HANDLES: usize = 16;
