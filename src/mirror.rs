#[cfg(test)]
use mockall::automock;

/// Notification hook for an external mirrored-file adapter. The cache treats
/// the mirror as write-through: it calls `notify_write` after every
/// successful physical write and `notify_remove` after every segment unlink,
/// and assumes the adapter itself handles propagation, durability and
/// checksum verification to the standby host.
#[cfg_attr(test, automock)]
pub trait MirrorSink: Send + Sync {
	fn notify_write(&self, segment: u32);
	fn notify_remove(&self, segment: u32);
}

/// A [`MirrorSink`] for pools with no mirror host configured.
pub struct NoMirror;

impl MirrorSink for NoMirror {
	fn notify_write(&self, _segment: u32) {}
	fn notify_remove(&self, _segment: u32) {}
}
