//! Error taxonomy for the commit log and the broker built on top of it.
//!
//! Errors are split by the layer that raises them rather than collapsed into
//! one enum: a [`DecodeError`] is about one frame, a [`SegmentError`] about
//! validating a file, and so on up to [`SubscribeError`], which is what a
//! caller driving a subscription stream actually sees.

use std::io;

use thiserror::Error;

/// A waiting operation (a follower's `wait_bytes`, or a subscription) was
/// cancelled before it could complete.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// Failure to decode a single on-disk frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The underlying reader ended before a complete frame could be read.
    ///
    /// At end of a static file this is the clean-termination signal for a
    /// scan, not a corruption report; see [`crate::segment::Segment::open`].
    #[error("frame ended unexpectedly")]
    ShortRead,
    /// A frame's `magic` byte was not the supported format version (`0`).
    #[error("unsupported frame magic byte: {0}")]
    BadMagic(u8),
    /// A frame's declared length was outside the bounds this crate accepts.
    #[error("frame length {0} is out of bounds")]
    InvalidLength(u32),
    /// The payload's CRC-32 did not match the value stored in the frame.
    #[error("crc mismatch: got {got:#010x}, expected {expected:#010x}")]
    CrcMismatch { got: u32, expected: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure to open or validate a segment file.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// A `*.pubsub` entry whose base name does not parse as a 12-digit
    /// decimal offset.
    #[error("invalid segment filename: {0:?}")]
    InvalidSegmentName(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure at the topic level: loading segments, appending, or resolving an
/// offset to a segment.
#[derive(Debug, Error)]
pub enum TopicError {
    /// Two adjacent segments' offset ranges do not meet: `segments[i].offset_end
    /// != segments[i + 1].offset_begin`.
    #[error("segment {prev:012}.pubsub ends at {prev_end} but the next segment begins at {next}")]
    NonContiguousSegments { prev: u64, prev_end: u64, next: u64 },
    /// A subscribe offset fell outside the topic's valid range.
    #[error("offset {offset} is out of range for topic {topic:?}")]
    BadOffset { offset: u64, topic: String },
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure raised by [`crate::Broker`] operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// `subscribe` was called for a topic that has never been published to.
    #[error("unknown topic: {0:?}")]
    UnknownTopic(String),
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<BrokerError> for SubscribeError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::UnknownTopic(t) => SubscribeError::UnknownTopic(t),
            BrokerError::Topic(TopicError::BadOffset { offset, topic }) => SubscribeError::BadOffset { offset, topic },
            BrokerError::Topic(e) => SubscribeError::Io(io::Error::new(io::ErrorKind::Other, e)),
            BrokerError::Io(e) => SubscribeError::Io(e),
        }
    }
}

/// Failure surfaced to a caller driving a subscription stream.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("unknown topic: {0:?}")]
    UnknownTopic(String),
    #[error("offset {offset} is out of range for topic {topic:?}")]
    BadOffset { offset: u64, topic: String },
    #[error("subscription cancelled")]
    Cancelled,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Cancelled> for SubscribeError {
    fn from(_: Cancelled) -> Self {
        SubscribeError::Cancelled
    }
}
