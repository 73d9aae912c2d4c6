//! A topic: an ordered list of segments, a single serialized writer, and
//! fan-out of "new bytes available" signals to active subscribers.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write as _},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    error::TopicError,
    frame,
    segment::Segment,
    BrokerOptions,
};

struct Listener {
    cancel: CancellationToken,
    tx: watch::Sender<u64>,
}

struct State {
    segments: Vec<Segment>,
    writer: Option<BufWriter<File>>,
    listeners: Vec<Listener>,
}

struct Inner {
    name: String,
    dir: PathBuf,
    options: BrokerOptions,
    state: Mutex<State>,
    /// Offset at which the current active segment begins. Cloned by
    /// subscription cursors to detect rotation without holding `state`.
    active_offset_begin: watch::Sender<u64>,
}

/// A cheaply-clonable handle to an open topic.
#[derive(Clone)]
pub struct Topic(Arc<Inner>);

impl Topic {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Load an existing topic directory: enumerate `*.pubsub` entries,
    /// validate each as a [`Segment`], sort by `offset_begin`, verify
    /// pairwise contiguity, and open the last one for append.
    ///
    /// Non-`.pubsub` entries in the directory are ignored. A malformed
    /// `.pubsub` entry (one whose name doesn't parse as a 12-digit decimal
    /// offset) is a hard error, since silently skipping it could hide a gap
    /// the contiguity check would otherwise catch.
    pub(crate) fn open(name: String, dir: PathBuf, options: BrokerOptions) -> Result<Self, TopicError> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(crate::segment::EXTENSION) {
                continue;
            }
            segments.push(Segment::open(path)?);
        }
        segments.sort_by_key(|s| s.offset_begin());

        for pair in segments.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.offset_end() != b.offset_begin() {
                return Err(TopicError::NonContiguousSegments {
                    prev: a.offset_begin(),
                    prev_end: a.offset_end(),
                    next: b.offset_begin(),
                });
            }
        }

        if segments.is_empty() {
            segments.push(Segment::create(&dir, 0)?);
        }

        let active = segments.last().expect("at least one segment always present");
        let writer = Some(active.append_writer()?);
        let active_offset_begin = active.offset_begin();

        info!(
            "loaded topic {name:?}: {} segment(s), active offset_begin={active_offset_begin}",
            segments.len()
        );

        Ok(Self(Arc::new(Inner {
            name,
            dir,
            options,
            state: Mutex::new(State {
                segments,
                writer,
                listeners: Vec::new(),
            }),
            active_offset_begin: watch::channel(active_offset_begin).0,
        })))
    }

    /// Create a brand-new topic: `mkdir dir` plus an empty initial segment
    /// `000000000000.pubsub`.
    pub(crate) fn create(name: String, dir: PathBuf, options: BrokerOptions) -> Result<Self, TopicError> {
        fs::create_dir_all(&dir)?;
        info!("created topic {name:?} at {}", dir.display());
        Self::open(name, dir, options)
    }

    /// Append `messages` in order, assigning each the next consecutive
    /// offset. Returns the assigned offsets. On success, broadcasts the new
    /// active segment size to all listeners and applies rotation if the
    /// segment has grown past `options.max_segment_size`.
    pub async fn append(&self, messages: Vec<Bytes>) -> Result<Vec<u64>, TopicError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let inner = self.0.clone();
        let mut state = inner.state.lock().await;

        let start_offset = state.segments.last().unwrap().offset_end();
        let count = messages.len() as u64;

        let writer = match state.writer.take() {
            Some(w) => w,
            None => {
                // A previous append's writer could not be recovered after an
                // I/O failure and a re-open also failed; surface the same
                // error rather than panicking on an absent writer.
                return Err(TopicError::Io(io::Error::other("active segment has no writer available")));
            }
        };
        let fsync = inner.options.fsync;
        let write_result = tokio::task::spawn_blocking(move || -> std::io::Result<BufWriter<File>> {
            for message in &messages {
                writer.write_all(&frame::encode(message))?;
            }
            writer.flush()?;
            if fsync {
                writer.get_ref().sync_data()?;
            }
            Ok(writer)
        })
        .await
        .expect("writer task panicked");

        let writer = match write_result {
            Ok(w) => w,
            Err(e) => {
                // The write/flush failed and the writer that attempted it is
                // gone with it. Re-open a fresh append handle onto the same
                // active segment so the topic doesn't get wedged: a later
                // append finds a usable writer (or, if the re-open itself
                // fails, a clean `IoError` instead of a panic) rather than
                // permanently missing `state.writer`.
                state.writer = state.segments.last().and_then(|s| s.append_writer().ok());
                return Err(TopicError::Io(e));
            }
        };
        state.writer = Some(writer);

        let offsets: Vec<u64> = (start_offset..start_offset + count).collect();
        state.segments.last_mut().unwrap().advance(count);

        let new_size = state.segments.last().unwrap().len_on_disk()?;
        broadcast(&mut state.listeners, new_size);

        self.maybe_rotate(&mut state).await?;

        Ok(offsets)
    }

    async fn maybe_rotate(&self, state: &mut State) -> Result<(), TopicError> {
        let active = state.segments.last().unwrap();
        let size = active.len_on_disk()?;
        if size < self.0.options.max_segment_size {
            return Ok(());
        }

        let new_offset = active.offset_end();
        debug!(
            "topic {:?}: segment {:012}.pubsub reached {size} bytes, rotating at offset {new_offset}",
            self.0.name,
            active.offset_begin()
        );

        // Flush and drop the old writer before creating the new segment, so
        // there is never a moment where two segments are both open for write.
        if let Some(mut writer) = state.writer.take() {
            writer.flush()?;
        }
        let new_segment = Segment::create(&self.0.dir, new_offset)?;
        state.writer = Some(new_segment.append_writer()?);
        state.segments.push(new_segment);

        // Publish the new active offset so subscription cursors following
        // the now-sealed segment know to cross over.
        let _ = self.0.active_offset_begin.send(new_offset);

        Ok(())
    }

    /// Register a listener bound to `cancel`; returns a channel on which
    /// size-growth hints for the active segment are delivered. The channel
    /// coalesces naturally (a `watch` only ever holds the newest value).
    pub(crate) async fn listen(&self, cancel: CancellationToken) -> watch::Receiver<u64> {
        let mut state = self.0.state.lock().await;
        let current = state.segments.last().and_then(|s| s.len_on_disk().ok()).unwrap_or(0);
        let (tx, rx) = watch::channel(current);
        state.listeners.push(Listener { cancel, tx });
        rx
    }

    /// The segment covering `offset`, by linear scan (segment counts are
    /// small). Rejects offsets outside `[segments[0].offset_begin,
    /// last.offset_end)`.
    pub(crate) async fn segment_for_offset(&self, offset: u64) -> Result<Segment, TopicError> {
        let state = self.0.state.lock().await;
        segment_for_offset_locked(&state.segments, offset, &self.0.name)
    }

    pub(crate) async fn segment_after(&self, offset_begin: u64) -> Option<Segment> {
        let state = self.0.state.lock().await;
        let idx = state.segments.iter().position(|s| s.offset_begin() == offset_begin)?;
        state.segments.get(idx + 1).cloned()
    }

    /// Is `offset_begin` no longer the active segment, i.e. has rotation
    /// moved the topic past it?
    pub(crate) fn is_sealed(&self, offset_begin: u64) -> bool {
        *self.0.active_offset_begin.borrow() != offset_begin
    }

    pub(crate) fn watch_backend(&self) -> crate::watch::WatchBackend {
        self.0.options.watch_backend
    }

    pub(crate) fn poll_interval(&self) -> std::time::Duration {
        self.0.options.poll_interval
    }

    pub fn segment_count(&self) -> usize {
        // Best-effort, lock-free-ish snapshot for logging; exact count isn't
        // safety-critical here.
        self.0.state.try_lock().map(|s| s.segments.len()).unwrap_or(0)
    }
}

fn segment_for_offset_locked(segments: &[Segment], offset: u64, topic: &str) -> Result<Segment, TopicError> {
    let first_begin = segments.first().map(|s| s.offset_begin()).unwrap_or(0);
    let last_end = segments.last().map(|s| s.offset_end()).unwrap_or(0);
    if offset < first_begin || offset > last_end {
        return Err(TopicError::BadOffset {
            offset,
            topic: topic.to_owned(),
        });
    }
    // offset == last_end is allowed: a subscriber starting exactly at the
    // current write position, to tail from "now".
    segments
        .iter()
        .rev()
        .find(|s| s.offset_begin() <= offset)
        .cloned()
        .ok_or(TopicError::BadOffset {
            offset,
            topic: topic.to_owned(),
        })
}

fn broadcast(listeners: &mut Vec<Listener>, new_size: u64) {
    listeners.retain(|l| {
        if l.cancel.is_cancelled() {
            return false;
        }
        // A `watch::Sender` always holds just the newest value, which is
        // exactly the coalescing behavior a capacity-1 channel would need.
        let _ = l.tx.send(new_size);
        true
    });
}
