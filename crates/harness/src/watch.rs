//! Polling file watcher.
//!
//! A background task stats a fixed set of files and sends a notification
//! whenever one appears, changes size or mtime, or disappears. The run loop
//! drains the channel on its own tick; nothing is processed on the watcher
//! task itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed {
        path: PathBuf,
        len: u64,
        modified: Option<SystemTime>,
    },
    Removed {
        path: PathBuf,
    },
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Changed { path, .. } | Self::Removed { path } => path,
        }
    }
}

type Fingerprint = (u64, Option<SystemTime>);

#[derive(Debug)]
pub struct FileWatcher {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Start watching `paths`, checking every `interval`.
    pub fn spawn(paths: Vec<PathBuf>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let interval = interval.max(Duration::from_millis(10));

        let task = tokio::spawn(async move {
            let mut seen: HashMap<PathBuf, Fingerprint> = HashMap::new();
            loop {
                for path in &paths {
                    let current = tokio::fs::metadata(path)
                        .await
                        .ok()
                        .filter(std::fs::Metadata::is_file)
                        .map(|meta| (meta.len(), meta.modified().ok()));

                    let event = match (seen.get(path), current) {
                        (Some(previous), Some(now)) if *previous == now => None,
                        (_, Some((len, modified))) => {
                            seen.insert(path.clone(), (len, modified));
                            Some(WatchEvent::Changed {
                                path: path.clone(),
                                len,
                                modified,
                            })
                        }
                        (Some(_), None) => {
                            seen.remove(path);
                            Some(WatchEvent::Removed { path: path.clone() })
                        }
                        (None, None) => None,
                    };

                    if let Some(event) = event {
                        debug!(path = %event.path().display(), "watched file changed");
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }

                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        });

        Self {
            rx,
            cancel,
            task: Some(task),
        }
    }

    /// Take every notification queued since the last call.
    pub fn drain(&mut self) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn reports_creation_change_and_removal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.txt");
        let mut watcher = FileWatcher::spawn(vec![path.clone()], Duration::from_millis(20));

        settle().await;
        assert!(watcher.drain().is_empty());

        std::fs::write(&path, "Status=Processing\n").unwrap();
        settle().await;
        let events = watcher.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WatchEvent::Changed { len: 18, .. }));

        std::fs::write(&path, "Status=Processing\nPercentComplete=50\n").unwrap();
        settle().await;
        assert!(matches!(
            watcher.drain().as_slice(),
            [WatchEvent::Changed { .. }]
        ));

        std::fs::remove_file(&path).unwrap();
        settle().await;
        assert_eq!(
            watcher.drain(),
            vec![WatchEvent::Removed { path: path.clone() }]
        );

        watcher.stop().await;
    }

    #[tokio::test]
    async fn unchanged_files_are_quiet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Dataset.pek.tmp");
        std::fs::write(&path, "Scan = 1\n").unwrap();
        let mut watcher = FileWatcher::spawn(vec![path], Duration::from_millis(20));

        settle().await;
        assert_eq!(watcher.drain().len(), 1);
        settle().await;
        assert!(watcher.drain().is_empty());
    }
}
