use anyhow::Result;
use async_trait::async_trait;
use notify::event::CreateKind;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::utils::has_extension;

// Extra waits granted to a file that is still empty after the quiescence interval.
const EMPTY_FILE_RETRIES: usize = 2;

/// A receipt file appeared in Incoming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArrived {
    pub path: PathBuf,
}

/// Forwards creation events from Incoming into a channel. Dropping the
/// watcher ends the subscription.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
}

impl FolderWatcher {
    pub fn start(folder: &Path, extension: &str, tx: mpsc::UnboundedSender<FileArrived>) -> Result<Self> {
        let extension = extension.to_string();
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for arrived in arrivals(event, &extension) {
                    let _ = tx.send(arrived);
                }
            }
            Err(err) => warn!(error = %err, "watch error"),
        })?;

        watcher.watch(folder, RecursiveMode::NonRecursive)?;
        Ok(FolderWatcher { _watcher: watcher })
    }
}

fn arrivals(event: Event, extension: &str) -> Vec<FileArrived> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => return Vec::new(),
        EventKind::Create(_) => {}
        _ => return Vec::new(),
    }
    event
        .paths
        .into_iter()
        .filter(|path| has_extension(path, extension))
        .map(|path| FileArrived { path })
        .collect()
}

#[async_trait]
pub trait Delay: Send + Sync {
    async fn wait(&self, duration: Duration);
}

pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Holds a fresh arrival back for the quiescence interval so the writer can
/// finish flushing it.
pub struct Debouncer {
    delay: Arc<dyn Delay>,
    quiescence: Duration,
}

impl Debouncer {
    pub fn new(delay: Arc<dyn Delay>, quiescence: Duration) -> Self {
        Debouncer { delay, quiescence }
    }

    /// Waits, then reports whether a regular file is still there to be processed.
    pub async fn settle(&self, path: &Path) -> bool {
        for attempt in 0..=EMPTY_FILE_RETRIES {
            self.delay.wait(self.quiescence).await;
            match tokio::fs::metadata(path).await {
                Ok(metadata) if !metadata.is_file() => return false,
                Ok(metadata) if metadata.len() > 0 => return true,
                Ok(_) => debug!(path = %path.display(), attempt, "file still empty"),
                Err(_) => return false,
            }
        }
        true
    }
}
