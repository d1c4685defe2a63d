use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::services::processor::ReceiptProcessor;
use crate::services::watcher::{Debouncer, FileArrived, FolderWatcher};
use crate::utils::{file_name_of, has_extension};

/// Single consumer of receipt work. Startup reconciliation and live events
/// both funnel through here, one file at a time.
pub struct Pipeline {
    processor: ReceiptProcessor,
    debouncer: Debouncer,
    extension: String,
}

impl Pipeline {
    pub fn new(processor: ReceiptProcessor, debouncer: Debouncer, extension: String) -> Self {
        Pipeline {
            processor,
            debouncer,
            extension,
        }
    }

    /// Subscribes to Incoming, drains the files already there, then serves live
    /// events until `shutdown` flips to true.
    ///
    /// The subscription starts first so drops made during reconciliation are
    /// buffered, but nothing is dispatched from it until reconciliation is done.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _watcher = FolderWatcher::start(self.processor.folders().incoming(), &self.extension, tx)?;

        self.reconcile(&shutdown).await?;
        info!(folder = %self.processor.folders().incoming().display(), "watching for new receipts");
        self.run(rx, shutdown).await;
        Ok(())
    }

    /// Processes every receipt already in Incoming, in file-name order.
    /// Returns how many were attempted.
    pub async fn reconcile(&self, shutdown: &watch::Receiver<bool>) -> Result<usize> {
        let pending = scan_folder(self.processor.folders().incoming(), &self.extension);
        if pending.is_empty() {
            info!("incoming folder is empty");
            return Ok(0);
        }

        info!(count = pending.len(), "found receipts on startup, processing them now");
        let mut attempted = 0;
        for path in pending {
            if *shutdown.borrow() {
                info!(processed = attempted, "shutdown requested, stopping startup queue");
                break;
            }
            self.dispatch(&path).await;
            attempted += 1;
        }
        info!(attempted, "all caught up with the startup queue");
        Ok(attempted)
    }

    /// Serves arrivals strictly in order until shutdown or until every sender
    /// is gone. A file already being processed always finishes.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<FileArrived>, mut shutdown: watch::Receiver<bool>) {
        // Once the sender is gone no shutdown can be requested; keep serving.
        let mut can_stop = true;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed(), if can_stop => {
                    if changed.is_err() {
                        can_stop = false;
                    }
                }
                arrived = rx.recv() => match arrived {
                    Some(arrived) => self.handle_event(arrived).await,
                    None => break,
                },
            }
        }
        info!("stopped watching");
    }

    async fn handle_event(&self, arrived: FileArrived) {
        let path = arrived.path;
        debug!(file = %file_name_of(&path), "receipt arrived");
        if !self.debouncer.settle(&path).await {
            // Already committed (e.g. by reconciliation) or removed by the operator.
            debug!(file = %file_name_of(&path), "receipt no longer in incoming, skipping");
            return;
        }
        self.dispatch(&path).await;
    }

    async fn dispatch(&self, path: &Path) {
        if let Err(err) = self.processor.process(path).await {
            error!(file = %file_name_of(path), error = %err, "receipt could not be committed");
        }
    }
}

fn scan_folder(folder: &Path, extension: &str) -> Vec<PathBuf> {
    let mut entries = walkdir::WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| has_extension(e.path(), extension))
        .map(|e| e.path().to_path_buf())
        .collect::<Vec<_>>();
    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    entries
}
