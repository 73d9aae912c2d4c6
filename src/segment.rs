//! A segment is one append-only file holding a contiguous range of a topic's
//! message offsets, named `<offset_begin>.pubsub` with `offset_begin`
//! zero-padded to 12 decimal digits.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, BufWriter},
    path::{Path, PathBuf},
};

use log::{debug, trace, warn};

use crate::{error::SegmentError, frame};

/// Width of the zero-padded decimal offset in a segment's filename.
pub const OFFSET_WIDTH: usize = 12;

/// Extension used for segment files.
pub const EXTENSION: &str = "pubsub";

/// A loaded, validated segment: a path, its first offset, and the exclusive
/// upper bound established by scanning the file.
#[derive(Debug, Clone)]
pub struct Segment {
    path: PathBuf,
    offset_begin: u64,
    offset_end: u64,
}

impl Segment {
    /// The filename a segment beginning at `offset_begin` must have.
    pub fn filename(offset_begin: u64) -> String {
        format!("{offset_begin:0width$}.{EXTENSION}", width = OFFSET_WIDTH)
    }

    fn parse_offset(path: &Path) -> Result<u64, SegmentError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SegmentError::InvalidSegmentName(path.display().to_string()))?;
        if stem.len() != OFFSET_WIDTH || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SegmentError::InvalidSegmentName(stem.to_owned()));
        }
        stem.parse::<u64>()
            .map_err(|_| SegmentError::InvalidSegmentName(stem.to_owned()))
    }

    /// Open an existing segment file, parse its starting offset from the
    /// filename, and scan it front to back to establish `offset_end`.
    ///
    /// A trailing partial frame is tolerated (treated as not-yet-committed,
    /// per [`frame::decode_one`]); any other decode error is fatal for this
    /// segment.
    pub fn open(path: PathBuf) -> Result<Self, SegmentError> {
        let offset_begin = Self::parse_offset(&path)?;
        debug!("scanning segment {}", path.display());

        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        let mut count = 0u64;
        loop {
            match frame::decode_one(&mut reader) {
                Ok(frame::Frame::Message(_)) => count += 1,
                Ok(frame::Frame::Eof) => break,
                Err(crate::error::DecodeError::ShortRead) => {
                    trace!(
                        "segment {} has a trailing partial frame after {count} committed frame(s); treating as uncommitted",
                        path.display()
                    );
                    break;
                }
                Err(e) => {
                    warn!("segment {} failed validation: {e}", path.display());
                    return Err(e.into());
                }
            }
        }

        let offset_end = offset_begin + count;
        debug!(
            "segment {} validated: offset_begin={offset_begin} offset_end={offset_end}",
            path.display()
        );
        Ok(Self {
            path,
            offset_begin,
            offset_end,
        })
    }

    /// Create a brand-new, empty segment file named `<offset_begin>.pubsub`
    /// in `dir`. Used both for a topic's initial segment and for rotation.
    pub fn create(dir: &Path, offset_begin: u64) -> Result<Self, SegmentError> {
        let path = dir.join(Self::filename(offset_begin));
        OpenOptions::new().write(true).create_new(true).open(&path)?;
        debug!("created segment {}", path.display());
        Ok(Self {
            path,
            offset_begin,
            offset_end: offset_begin,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset_begin(&self) -> u64 {
        self.offset_begin
    }

    pub fn offset_end(&self) -> u64 {
        self.offset_end
    }

    /// Number of frames currently known to be committed in this segment.
    pub fn len(&self) -> u64 {
        self.offset_end - self.offset_begin
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Does this segment currently cover `offset`, i.e. is it the one a
    /// reader should open to start reading from `offset`?
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset_begin && offset < self.offset_end
    }

    /// Open this segment's file in append mode, wrapped in a buffered
    /// writer. Only ever called for the active (last) segment of a topic.
    pub fn append_writer(&self) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(BufWriter::new(file))
    }

    /// Current on-disk length in bytes, read fresh from the filesystem.
    pub fn len_on_disk(&self) -> io::Result<u64> {
        Ok(self.path.metadata()?.len())
    }

    /// Record that `n` more frames have been committed to this segment.
    pub(crate) fn advance(&mut self, n: u64) {
        self.offset_end += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn filename_is_zero_padded_12_digits() {
        assert_eq!(Segment::filename(0), "000000000000.pubsub");
        assert_eq!(Segment::filename(42), "000000000042.pubsub");
    }

    #[test]
    fn open_rejects_non_numeric_filename() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-a-number.pubsub");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(Segment::open(path), Err(SegmentError::InvalidSegmentName(_))));
    }

    #[test]
    fn open_validates_clean_two_frame_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000000000000.pubsub");
        let mut buf = Vec::new();
        buf.extend(frame::encode(b"a"));
        buf.extend(frame::encode(b"b"));
        std::fs::write(&path, &buf).unwrap();

        let seg = Segment::open(path).unwrap();
        assert_eq!(seg.offset_begin(), 0);
        assert_eq!(seg.offset_end(), 2);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000000000000.pubsub");
        let mut buf = Vec::new();
        buf.extend(frame::encode(b"a"));
        buf.extend(frame::encode(b"b"));
        buf[4] = 1; // first frame's magic byte
        std::fs::write(&path, &buf).unwrap();

        match Segment::open(path).unwrap_err() {
            SegmentError::Decode(crate::error::DecodeError::BadMagic(1)) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn open_tolerates_trailing_partial_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000000000005.pubsub");
        let mut buf = Vec::new();
        buf.extend(frame::encode(b"a"));
        buf.extend_from_slice(&frame::encode(b"partial")[..3]);
        std::fs::write(&path, &buf).unwrap();

        let seg = Segment::open(path).unwrap();
        assert_eq!(seg.offset_begin(), 5);
        assert_eq!(seg.offset_end(), 6);
    }
}
