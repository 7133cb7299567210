//! Polling file watcher for configuration hot-reload
//!
//! Polls one file's modification time and invokes a callback once per
//! observed change. Polling is deliberate: the watched path is routinely a
//! symlink swapped by orchestration tooling, which native notification
//! backends miss.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Handle to a running watcher task.
#[derive(Debug)]
pub struct FileWatcher {
    token: CancellationToken,
}

impl FileWatcher {
    /// Start polling `path` every `interval`, calling `callback` on each
    /// detected modification-time change.
    ///
    /// A missing file is not an error; the callback fires once the file
    /// appears (and on every change after that).
    pub fn start<F>(path: PathBuf, interval: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();

        tokio::spawn(async move {
            let mut last_seen = mtime(&path).await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let current = mtime(&path).await;
                if current != last_seen && current.is_some() {
                    tracing::debug!(path = %path.display(), "watched file changed");
                    callback();
                }
                last_seen = current;
            }
            tracing::debug!(path = %path.display(), "watcher stopped");
        });

        Self { token }
    }

    /// Stop the watcher. Idempotent; the polling task exits promptly.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn mtime(path: &PathBuf) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}
