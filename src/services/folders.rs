use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::{Outcome, ReceiptState};

#[derive(Debug, Error)]
pub enum FileSystemError {
    #[error("{0} is not in the Incoming folder")]
    NotIncoming(PathBuf),
    #[error("read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("move {from} -> {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    #[error("prepare {path}: {source}")]
    Prepare { path: PathBuf, source: io::Error },
}

/// The three receipt folders. A file's state is the folder that holds it and
/// `commit` is the only transition.
#[derive(Debug, Clone)]
pub struct ReceiptFolders {
    incoming: PathBuf,
    processed: PathBuf,
    error: PathBuf,
}

impl ReceiptFolders {
    /// Creates the folders under `root` when missing and pins their absolute paths.
    pub fn prepare(root: &Path) -> Result<Self, FileSystemError> {
        std::fs::create_dir_all(root).map_err(|source| FileSystemError::Prepare {
            path: root.to_path_buf(),
            source,
        })?;
        let root = std::fs::canonicalize(root).map_err(|source| FileSystemError::Prepare {
            path: root.to_path_buf(),
            source,
        })?;

        let folders = ReceiptFolders {
            incoming: root.join(ReceiptState::Incoming.dir_name()),
            processed: root.join(ReceiptState::Processed.dir_name()),
            error: root.join(ReceiptState::Error.dir_name()),
        };
        for dir in [&folders.incoming, &folders.processed, &folders.error] {
            std::fs::create_dir_all(dir).map_err(|source| FileSystemError::Prepare {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(folders)
    }

    pub fn incoming(&self) -> &Path {
        &self.incoming
    }

    pub fn dir(&self, state: ReceiptState) -> &Path {
        match state {
            ReceiptState::Incoming => &self.incoming,
            ReceiptState::Processed => &self.processed,
            ReceiptState::Error => &self.error,
        }
    }

    /// Moves a file out of Incoming into the folder for `outcome`.
    /// Returns the new path.
    pub fn commit(&self, path: &Path, outcome: Outcome) -> Result<PathBuf, FileSystemError> {
        if path.parent() != Some(self.incoming.as_path()) {
            return Err(FileSystemError::NotIncoming(path.to_path_buf()));
        }
        let file_name = path
            .file_name()
            .ok_or_else(|| FileSystemError::NotIncoming(path.to_path_buf()))?;

        let target = unique_destination(self.dir(outcome.target()), Path::new(file_name));
        std::fs::rename(path, &target).map_err(|source| FileSystemError::Move {
            from: path.to_path_buf(),
            to: target.clone(),
            source,
        })?;
        Ok(target)
    }

    /// Which folder currently holds `file_name`, if any.
    #[cfg(test)]
    pub fn locate(&self, file_name: &str) -> Option<ReceiptState> {
        [
            ReceiptState::Incoming,
            ReceiptState::Processed,
            ReceiptState::Error,
        ]
        .into_iter()
        .find(|state| self.dir(*state).join(file_name).is_file())
    }
}

// Never overwrite: `scan.pdf` becomes `scan-1.pdf`, `scan-2.pdf`, ...
fn unique_destination(dir: &Path, file_name: &Path) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{}-{}{}", stem, n, extension));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
