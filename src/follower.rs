//! The tailing file reader: adapts a file that may still be growing into a
//! blocking byte stream that suspends at EOF instead of returning it.

use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use log::trace;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{error::Cancelled, watch::WatchBackend};

/// Upper bound on notification delay when no early-wakeup hint arrives.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Reads a file that may still be growing. [`Follower::wait_bytes`] is the
/// synchronization point: it suspends until enough bytes have been written,
/// then [`Follower::read_exact`] is guaranteed not to block.
pub struct Follower {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    size_rx: watch::Receiver<u64>,
    /// Size learned via an explicit [`Self::refresh`] call, which may be
    /// fresher than `size_rx` if the background task hasn't ticked yet.
    direct_size: u64,
    cancel: CancellationToken,
}

impl Follower {
    /// Open `path` for following, starting at byte `start_offset`.
    ///
    /// `ping` is the topic's in-process hint channel (any topic-wide append
    /// wakes every listener's follower); `watch_backend` additionally covers
    /// cross-process writers. Both are optimizations layered on top of the
    /// follower's own 250ms timer, which bounds notification delay on its own.
    pub async fn open(
        path: impl AsRef<Path>,
        start_offset: u64,
        ping: watch::Receiver<u64>,
        watch_backend: WatchBackend,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let (file, initial_size) = tokio::task::spawn_blocking(move || -> io::Result<(File, u64)> {
            let file = File::open(&open_path)?;
            let initial_size = file.metadata()?.len();
            Ok((file, initial_size))
        })
        .await
        .expect("blocking file open task panicked")?;
        let (size_tx, size_rx) = watch::channel(initial_size);

        spawn_background(
            path.clone(),
            initial_size,
            ping,
            watch_backend,
            poll_interval,
            size_tx,
            cancel.clone(),
        );

        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset: start_offset,
            size_rx,
            direct_size: initial_size,
            cancel,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes known to be available beyond `offset`, as of the last observed
    /// size (from either the background task or an explicit [`Self::refresh`]).
    /// Does not itself perform I/O.
    pub fn available(&self) -> u64 {
        (*self.size_rx.borrow()).max(self.direct_size).saturating_sub(self.offset)
    }

    /// Suspend until at least `n` unread bytes are available, or until
    /// cancelled.
    pub async fn wait_bytes(&mut self, n: u64) -> Result<(), Cancelled> {
        loop {
            if self.available() >= n {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Cancelled),
                changed = self.size_rx.changed() => {
                    changed.map_err(|_| Cancelled)?;
                }
            }
        }
    }

    /// Re-stat the file immediately rather than waiting for the background
    /// task's next tick. Used by the subscription cursor right after it
    /// learns a segment has been sealed by rotation, to rule out a race
    /// between the final flush and the rotation becoming visible.
    pub async fn refresh(&mut self) -> io::Result<()> {
        let size = tokio::fs::metadata(&self.path).await?.len();
        self.direct_size = self.direct_size.max(size);
        Ok(())
    }

    /// Read exactly `buf.len()` bytes, which [`Self::wait_bytes`] must have
    /// already guaranteed are available. Advances `offset`.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.reader.read_exact(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }
}

fn spawn_background(
    path: PathBuf,
    mut last_size: u64,
    mut ping: watch::Receiver<u64>,
    watch_backend: WatchBackend,
    poll_interval: Duration,
    size_tx: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut hint_rx = crate::watch::spawn(watch_backend, &path, cancel.clone());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("follower background task for {} cancelled", path.display());
                    return;
                }
                _ = ping.changed() => {}
                _ = hint_rx.recv() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
            let size = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    trace!("stat failed for {}: {e}", path.display());
                    continue;
                }
            };
            if size != last_size {
                last_size = size;
                if size_tx.send(size).is_err() {
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::tempdir;
    use tokio::time::{timeout, Duration};

    use super::*;

    fn idle_ping() -> watch::Receiver<u64> {
        watch::channel(0u64).1
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_bytes_returns_immediately_when_already_available() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        let mut follower = Follower::open(&path, 0, idle_ping(), WatchBackend::Polling, POLL_INTERVAL, CancellationToken::new())
            .await
            .unwrap();
        timeout(Duration::from_millis(50), follower.wait_bytes(5)).await.unwrap().unwrap();
        let mut buf = [0u8; 5];
        follower.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_bytes_wakes_up_when_file_grows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"ab").unwrap();

        let mut follower = Follower::open(&path, 0, idle_ping(), WatchBackend::Polling, POLL_INTERVAL, CancellationToken::new())
            .await
            .unwrap();

        let path2 = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path2).unwrap();
            f.write_all(b"cd").unwrap();
        });

        timeout(Duration::from_millis(500), follower.wait_bytes(4)).await.unwrap().unwrap();
        let mut buf = [0u8; 4];
        follower.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_interrupts_wait() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"").unwrap();

        let cancel = CancellationToken::new();
        let mut follower = Follower::open(&path, 0, idle_ping(), WatchBackend::Polling, POLL_INTERVAL, cancel.clone())
            .await
            .unwrap();

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel2.cancel();
        });

        let result = timeout(Duration::from_millis(500), follower.wait_bytes(1)).await.unwrap();
        assert_eq!(result, Err(Cancelled));
    }
}
