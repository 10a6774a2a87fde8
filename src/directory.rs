use std::{
	fs, io,
	path::{Path, PathBuf},
};

#[cfg(test)]
use mockall::automock;

use crate::consts::SEGMENT_NAME_LEN;

/// Formats a segment number as the four-uppercase-hex-digit name the pool
/// expects on disk.
pub fn segment_file_name(segment: u32) -> String {
	format!("{segment:0width$X}", width = SEGMENT_NAME_LEN)
}

/// Recognises a directory entry name as a segment file, returning its
/// segment number. A name qualifies iff it is exactly [`SEGMENT_NAME_LEN`]
/// characters, all drawn from the uppercase hex alphabet `[0-9A-F]`; this
/// matches the source alphabet exactly (lowercase hex is not a segment name).
pub fn parse_segment_name(name: &str) -> Option<u32> {
	if name.len() != SEGMENT_NAME_LEN {
		return None;
	}
	if !name
		.bytes()
		.all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
	{
		return None;
	}
	u32::from_str_radix(name, 16).ok()
}

/// The directory of segment files backing one pool. Lock-free: every method
/// only walks the filesystem.
#[cfg_attr(test, automock)]
pub trait SegmentDirectory: Send + Sync {
	fn path(&self) -> &Path;
	fn segment_path(&self, segment: u32) -> PathBuf;
	fn list_segments(&self) -> io::Result<Vec<u32>>;
	fn remove_segment(&self, segment: u32) -> io::Result<()>;
}

/// A [`SegmentDirectory`] backed by a real filesystem directory.
pub struct FsSegmentDirectory {
	path: PathBuf,
}

impl FsSegmentDirectory {
	pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
		let path = path.into();
		fs::create_dir_all(&path)?;
		Ok(Self { path })
	}
}

impl SegmentDirectory for FsSegmentDirectory {
	fn path(&self) -> &Path {
		&self.path
	}

	fn segment_path(&self, segment: u32) -> PathBuf {
		self.path.join(segment_file_name(segment))
	}

	fn list_segments(&self) -> io::Result<Vec<u32>> {
		let mut segments = Vec::new();
		for entry in fs::read_dir(&self.path)? {
			let entry = entry?;
			if !entry.file_type()?.is_file() {
				continue;
			}
			let name = entry.file_name();
			let Some(name) = name.to_str() else {
				continue;
			};
			if let Some(segment) = parse_segment_name(name) {
				segments.push(segment);
			}
		}
		Ok(segments)
	}

	fn remove_segment(&self, segment: u32) -> io::Result<()> {
		fs::remove_file(self.segment_path(segment))
	}
}
