use std::path::Path;
use std::sync::mpsc as raw_mpsc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// How often to re-check for the log file reappearing after rotation.
const ROTATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the reducing loop waits for a notification before checking
/// whether the engine is still listening. Bounds how long a finished
/// engine keeps this blocking task (and runtime shutdown) alive.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Watches the log file and its parent directory, reducing raw
/// notifications to two signal streams: `changed` (new bytes may be
/// available) and `rotated` (the file at the path was replaced).
///
/// Both channels have capacity 1 and are fed with `try_send`, so rapid
/// bursts coalesce into a single pending wakeup. When the watching task
/// dies, both channels close; a receiver seeing `None` must treat that
/// as fatal, there is no polling fallback. Dropping both receivers makes
/// the task exit within one idle poll interval.
pub struct ChangeWatcher {
    pub changed: mpsc::Receiver<()>,
    pub rotated: mpsc::Receiver<()>,
}

impl ChangeWatcher {
    /// Install watches on `log_path` and its parent directory and spawn
    /// the reducing task. Failing to install either watch is fatal.
    pub fn spawn(log_path: &Path) -> Result<Self> {
        let log_path = log_path.to_path_buf();
        let parent = log_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();

        let (raw_tx, raw_rx) = raw_mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .context("failed to create file system watcher")?;

        watcher
            .watch(&log_path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch log file {}", log_path.display()))?;
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch log directory {}", parent.display()))?;

        debug!(path = %log_path.display(), "file change watcher installed");

        let (changed_tx, changed_rx) = mpsc::channel(1);
        let (rotated_tx, rotated_rx) = mpsc::channel(1);

        tokio::task::spawn_blocking(move || {
            // The watcher lives inside this task; every exit path drops
            // it, which releases both watch handles.
            let mut watcher = watcher;
            if let Err(e) = watch_loop(&mut watcher, &raw_rx, &log_path, &changed_tx, &rotated_tx) {
                error!("change watcher terminated: {e:#}");
            }
        });

        Ok(Self {
            changed: changed_rx,
            rotated: rotated_rx,
        })
    }
}

enum Classified {
    Modified,
    Rotation,
    Ignored,
}

fn watch_loop(
    watcher: &mut RecommendedWatcher,
    raw_rx: &raw_mpsc::Receiver<Result<Event, notify::Error>>,
    log_path: &Path,
    changed_tx: &mpsc::Sender<()>,
    rotated_tx: &mpsc::Sender<()>,
) -> Result<()> {
    loop {
        let event = match raw_rx.recv_timeout(IDLE_POLL_INTERVAL) {
            Ok(received) => received.context("error reading file change notification")?,
            Err(raw_mpsc::RecvTimeoutError::Timeout) => {
                // Quiet period. Exit once the engine has dropped its
                // receivers so this task never outlives a shutdown.
                if changed_tx.is_closed() {
                    return Ok(());
                }
                continue;
            }
            Err(raw_mpsc::RecvTimeoutError::Disconnected) => {
                bail!("file change notification stream closed");
            }
        };

        match classify(&event, log_path) {
            Classified::Modified => {
                let _ = changed_tx.try_send(());
            }
            Classified::Rotation => {
                info!(path = %log_path.display(), "log file rotated");
                rearm_file_watch(watcher, log_path)?;

                // Queue the rotation before the wakeup so the engine
                // resets its file state before it tries to read.
                let _ = rotated_tx.try_send(());
                let _ = changed_tx.try_send(());
            }
            Classified::Ignored => {}
        }

        if changed_tx.is_closed() {
            // The engine is gone; nothing left to notify.
            return Ok(());
        }
    }
}

/// Decide what a raw notification means for the watched log file.
/// Directory events are filtered to the log file's base name.
fn classify(event: &Event, log_path: &Path) -> Classified {
    let names_log = event
        .paths
        .iter()
        .any(|p| p == log_path || p.file_name() == log_path.file_name());
    if !names_log {
        return Classified::Ignored;
    }

    match event.kind {
        EventKind::Create(_) | EventKind::Remove(_) => Classified::Rotation,
        EventKind::Modify(ModifyKind::Name(_)) => Classified::Rotation,
        EventKind::Modify(_) => Classified::Modified,
        _ => Classified::Ignored,
    }
}

/// After rotation, wait for a file to exist at the path again, then
/// move the file watch from the old inode to the new one.
fn rearm_file_watch(watcher: &mut RecommendedWatcher, log_path: &Path) -> Result<()> {
    while !log_path.exists() {
        std::thread::sleep(ROTATION_POLL_INTERVAL);
    }

    // The old inode's watch may already be gone with the file.
    let _ = watcher.unwatch(log_path);

    watcher
        .watch(log_path, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch rotated log file {}", log_path.display()))
}
