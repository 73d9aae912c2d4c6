//! Segmented, append-only commit log storage and tailing subscriptions for a
//! persistent publish/subscribe message broker.
//!
//! This crate is the storage and delivery core: a [`Broker`] owns a
//! directory of [`Topic`](topic::Topic)s, each an ordered, contiguous run of
//! on-disk segments. Publishing appends frames to a topic's active segment
//! and wakes any live subscriptions; subscribing returns a stream that reads
//! from a requested offset forward, blocking at end-of-file rather than
//! terminating, and crossing segment boundaries as rotation occurs.
//!
//! What this crate deliberately does not do: RPC transport, payload schemas,
//! command-line front ends, consumer groups, replication, or retention.
//! Those are a caller's concern; see each module's docs for the boundary.

mod broker;
mod cursor;
mod error;
mod follower;
mod frame;
mod segment;
mod topic;
mod watch;

use std::time::Duration;

pub use crate::{
    broker::Broker,
    error::{BrokerError, Cancelled, DecodeError, SegmentError, SubscribeError, TopicError},
    watch::WatchBackend,
};

/// Broker-wide configuration. Covers the ambient concerns a front end needs
/// to tune (rotation threshold, durability floor, notification latency,
/// watcher backend) without this crate dictating transport, logging setup,
/// or process supervision around it.
#[derive(Clone, Copy, Debug)]
pub struct BrokerOptions {
    /// Size in bytes at which a topic's active segment is sealed and a new
    /// one started. `u64::MAX` disables rotation — the historical
    /// single-segment-per-topic behavior.
    ///
    /// Default: [`u64::MAX`] (rotation disabled).
    pub max_segment_size: u64,
    /// Whether to `fsync` the active segment's file after every flushed
    /// append, raising the durability floor from "survives process crash"
    /// to "survives OS crash" at the cost of per-publish latency.
    ///
    /// Default: `false`.
    pub fsync: bool,
    /// Upper bound on how long a follower with no early-wakeup hint takes to
    /// notice a file has grown. Early-wakeup hints (the topic's in-process
    /// `ping`, and [`WatchBackend::KernelNotify`] if selected) only ever
    /// shorten this bound, never lengthen it.
    ///
    /// Default: 250ms.
    pub poll_interval: Duration,
    /// Which external change-notification facility, if any, supplements
    /// followers' polling for cross-process writers.
    ///
    /// Default: [`WatchBackend::Polling`].
    pub watch_backend: WatchBackend,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_segment_size: u64::MAX,
            fsync: false,
            poll_interval: Duration::from_millis(250),
            watch_backend: WatchBackend::Polling,
        }
    }
}
