//! The size-change source: an early-wakeup capability for [`crate::follower::Follower`].
//!
//! A follower's background task always re-checks the file on a 250ms timer
//! regardless of what's configured here (see [`crate::follower`]), so this
//! module only ever *shortens* the worst-case notification delay. A backend
//! that fails to install, or isn't compiled in, degrades to a no-op: the
//! timer alone still satisfies the liveness bound.

use std::path::{Path, PathBuf};

use log::warn;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which external change-notification facility, if any, feeds early wakeups
/// to followers in a topic. In-process publishers are already covered by the
/// topic's own `ping` channel; this is for cross-process writers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WatchBackend {
    /// No OS facility is used; followers rely solely on their 250ms timer
    /// and the in-process `ping` hint.
    #[default]
    Polling,
    /// Use the operating system's file-change notification facility
    /// (inotify and equivalents, via the `notify` crate) as an early
    /// wakeup. Requires the `kernel-notify` feature.
    KernelNotify,
}

/// Spawn whatever background work `backend` requires to wake a follower
/// early, and return the receiving end of its hint channel. The channel's
/// payload carries no information; a send is purely "go re-check the file".
pub(crate) fn spawn(backend: WatchBackend, path: &Path, cancel: CancellationToken) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);
    match backend {
        WatchBackend::Polling => {}
        WatchBackend::KernelNotify => spawn_kernel_notify(path.to_path_buf(), tx, cancel),
    }
    rx
}

#[cfg(feature = "kernel-notify")]
fn spawn_kernel_notify(path: PathBuf, tx: mpsc::Sender<()>, cancel: CancellationToken) {
    std::thread::spawn(move || {
        use notify::{RecursiveMode, Watcher};

        let (std_tx, std_rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = std_tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!("failed to create kernel file watcher for {}: {e}; falling back to polling", path.display());
                return;
            }
        };
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!("failed to watch {}: {e}; falling back to polling", path.display());
            return;
        }

        loop {
            if cancel.is_cancelled() {
                return;
            }
            match std_rx.recv_timeout(std::time::Duration::from_millis(250)) {
                Ok(Ok(_event)) => {
                    if tx.blocking_send(()).is_err() {
                        return;
                    }
                }
                Ok(Err(e)) => warn!("file watch error on {}: {e}", path.display()),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }
    });
}

#[cfg(not(feature = "kernel-notify"))]
fn spawn_kernel_notify(path: PathBuf, _tx: mpsc::Sender<()>, _cancel: CancellationToken) {
    warn!(
        "kernel-notify backend requested for {} but this crate was built without the `kernel-notify` feature; falling back to polling",
        path.display()
    );
}
