use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::Journal;
use crate::models::{ExtractedReceipt, JournalEntry, Outcome};
use crate::services::extraction::{Document, ExtractionClient, ExtractionError};
use crate::services::folders::{FileSystemError, ReceiptFolders};
use crate::services::sheets::{SinkError, SinkWriter};
use crate::utils::{file_name_of, mime_type_for, now_rfc3339, sha256_bytes};

/// Why one processing attempt failed. Every variant ends in quarantine today;
/// the tag lets callers tell retryable causes apart later.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),
}

/// Runs one receipt through extraction, the sink and the terminal move.
pub struct ReceiptProcessor {
    extractor: Arc<dyn ExtractionClient>,
    sink: Arc<dyn SinkWriter>,
    folders: ReceiptFolders,
    journal: Option<Arc<Mutex<Journal>>>,
}

impl ReceiptProcessor {
    pub fn new(
        extractor: Arc<dyn ExtractionClient>,
        sink: Arc<dyn SinkWriter>,
        folders: ReceiptFolders,
        journal: Option<Journal>,
    ) -> Self {
        ReceiptProcessor {
            extractor,
            sink,
            folders,
            journal: journal.map(|j| Arc::new(Mutex::new(j))),
        }
    }

    pub fn folders(&self) -> &ReceiptFolders {
        &self.folders
    }

    /// Processes `path` (a file in Incoming) and commits it to Processed or Error.
    ///
    /// Failures of the attempt itself are logged and turned into a quarantine
    /// move. `Err` is returned only when that move fails, in which case the file
    /// is left where it is.
    pub async fn process(&self, path: &Path) -> Result<Outcome, FileSystemError> {
        let file_name = file_name_of(path);
        info!(file = %file_name, "processing receipt");

        let mut file_hash = None;
        let (result, raw_json) = match self.read(path).await {
            Ok(bytes) => {
                file_hash = Some(sha256_bytes(&bytes));
                match self.extract(path, &file_name, bytes).await {
                    Ok((receipt, raw)) => (self.write(&file_name, &receipt).await, Some(raw)),
                    Err(err) => (Err(err), None),
                }
            }
            Err(err) => (Err(err), None),
        };

        let (outcome, rows, mut message) = match result {
            Ok(rows) => (Outcome::Success, rows, None),
            Err(err) => {
                warn!(file = %file_name, error = %err, "receipt failed, quarantining");
                (Outcome::Failure, 0, Some(err.to_string()))
            }
        };

        let final_outcome = match self.folders.commit(path, outcome) {
            Ok(target) => {
                info!(file = %file_name, outcome = %outcome, rows, to = %target.display(), "receipt committed");
                outcome
            }
            Err(err) if outcome == Outcome::Success => {
                error!(
                    file = %file_name,
                    rows,
                    error = %err,
                    "rows were appended but the file could not be moved to Processed"
                );
                message = Some(err.to_string());
                match self.folders.commit(path, Outcome::Failure) {
                    Ok(target) => {
                        warn!(file = %file_name, to = %target.display(), "receipt quarantined after move failure");
                        Outcome::Failure
                    }
                    Err(err) => {
                        error!(file = %file_name, error = %err, "quarantine move failed, file left in place");
                        self.record(&file_name, file_hash, "unmoved", rows, Some(err.to_string()), raw_json);
                        return Err(err);
                    }
                }
            }
            Err(err) => {
                error!(file = %file_name, error = %err, "quarantine move failed, file left in place");
                self.record(&file_name, file_hash, "unmoved", rows, Some(err.to_string()), raw_json);
                return Err(err);
            }
        };

        self.record(&file_name, file_hash, final_outcome.as_str(), rows, message, raw_json);
        Ok(final_outcome)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, PipelineError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| FileSystemError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(bytes)
    }

    async fn extract(
        &self,
        path: &Path,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(ExtractedReceipt, String), PipelineError> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_default();
        let document = Document {
            file_name: file_name.to_string(),
            mime_type: mime_type_for(&extension).to_string(),
            bytes,
        };

        info!(file = %file_name, "sending receipt for extraction");
        Ok(self.extractor.extract(&document).await?)
    }

    async fn write(&self, file_name: &str, receipt: &ExtractedReceipt) -> Result<usize, PipelineError> {
        let rows = receipt.to_rows();
        if rows.is_empty() {
            info!(file = %file_name, "no line items extracted, nothing to append");
            return Ok(0);
        }

        info!(file = %file_name, rows = rows.len(), "appending rows to sheet");
        self.sink.append(&rows).await?;
        Ok(rows.len())
    }

    fn record(
        &self,
        file_name: &str,
        file_hash: Option<String>,
        outcome: &str,
        rows: usize,
        message: Option<String>,
        extracted_json: Option<String>,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let entry = JournalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.to_string(),
            file_hash,
            outcome: outcome.to_string(),
            rows_appended: rows as i64,
            message,
            extracted_json,
            created_at: now_rfc3339(),
        };
        let result = match journal.lock() {
            Ok(journal) => journal.record(&entry).map_err(|e| e.to_string()),
            Err(_) => Err("journal lock poisoned".to_string()),
        };
        if let Err(err) = result {
            warn!(file = %file_name, error = %err, "could not write processing journal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReceiptState;
    use crate::services::testing::{RecordingSink, ScriptedExtractor, HAPPY_RECEIPT};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        folders: ReceiptFolders,
        extractor: Arc<ScriptedExtractor>,
        sink: Arc<RecordingSink>,
        processor: ReceiptProcessor,
    }

    fn fixture(extractor: ScriptedExtractor, sink: RecordingSink) -> Fixture {
        let dir = TempDir::new().unwrap();
        let folders = ReceiptFolders::prepare(dir.path()).unwrap();
        let extractor = Arc::new(extractor);
        let sink = Arc::new(sink);
        let processor = ReceiptProcessor::new(
            extractor.clone(),
            sink.clone(),
            folders.clone(),
            Some(Journal::in_memory().unwrap()),
        );
        Fixture {
            _dir: dir,
            folders,
            extractor,
            sink,
            processor,
        }
    }

    fn drop_file(folders: &ReceiptFolders, name: &str) -> std::path::PathBuf {
        let path = folders.incoming().join(name);
        std::fs::write(&path, b"%PDF-1.4 receipt").unwrap();
        path
    }

    fn journal_entries(processor: &ReceiptProcessor, file_name: &str) -> Vec<JournalEntry> {
        processor
            .journal
            .as_ref()
            .unwrap()
            .lock()
            .unwrap()
            .entries_for(file_name)
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_appends_one_row_and_processes_file() {
        let fx = fixture(ScriptedExtractor::replying(HAPPY_RECEIPT), RecordingSink::new());
        let path = drop_file(&fx.folders, "kvitto.pdf");

        let outcome = fx.processor.process(&path).await.unwrap();

        assert_eq!(outcome, Outcome::Success);
        let batches = fx.sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0][0].cells(),
            vec![
                json!("2024-05-01"),
                json!("X"),
                json!("Mjölk"),
                json!("Dairy"),
                json!(42.0),
                json!("1L"),
                json!(15.0),
                json!(120.5)
            ]
        );
        assert_eq!(fx.folders.locate("kvitto.pdf"), Some(ReceiptState::Processed));
        assert_eq!(fx.extractor.seen(), vec!["kvitto.pdf".to_string()]);

        let entries = journal_entries(&fx.processor, "kvitto.pdf");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "processed");
        assert_eq!(entries[0].rows_appended, 1);
    }

    #[tokio::test]
    async fn transport_failure_quarantines_without_rows() {
        let fx = fixture(ScriptedExtractor::failing(), RecordingSink::new());
        let path = drop_file(&fx.folders, "a.pdf");

        let outcome = fx.processor.process(&path).await.unwrap();

        assert_eq!(outcome, Outcome::Failure);
        assert!(fx.sink.rows().is_empty());
        assert_eq!(fx.folders.locate("a.pdf"), Some(ReceiptState::Error));
    }

    #[tokio::test]
    async fn empty_items_is_success_without_sink_write() {
        let fx = fixture(
            ScriptedExtractor::replying(r#"{"receipt_metadata":{"store":"X"},"items":[]}"#),
            RecordingSink::new(),
        );
        let path = drop_file(&fx.folders, "bags-only.pdf");

        let outcome = fx.processor.process(&path).await.unwrap();

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(fx.sink.calls(), 0);
        assert_eq!(fx.folders.locate("bags-only.pdf"), Some(ReceiptState::Processed));
    }

    #[tokio::test]
    async fn malformed_response_quarantines_without_rows() {
        let fx = fixture(
            ScriptedExtractor::replying("Sorry, I cannot help with that."),
            RecordingSink::new(),
        );
        let path = drop_file(&fx.folders, "blurry.pdf");

        let outcome = fx.processor.process(&path).await.unwrap();

        assert_eq!(outcome, Outcome::Failure);
        assert_eq!(fx.sink.calls(), 0);
        assert_eq!(fx.folders.locate("blurry.pdf"), Some(ReceiptState::Error));
    }

    #[tokio::test]
    async fn sink_failure_quarantines_and_keeps_extracted_json() {
        let fx = fixture(ScriptedExtractor::replying(HAPPY_RECEIPT), RecordingSink::failing());
        let path = drop_file(&fx.folders, "a.pdf");

        let outcome = fx.processor.process(&path).await.unwrap();

        assert_eq!(outcome, Outcome::Failure);
        assert!(fx.sink.rows().is_empty());
        assert_eq!(fx.folders.locate("a.pdf"), Some(ReceiptState::Error));

        let entries = journal_entries(&fx.processor, "a.pdf");
        assert_eq!(entries[0].outcome, "error");
        assert_eq!(entries[0].rows_appended, 0);
        assert!(entries[0].extracted_json.as_deref().unwrap().contains("Mjölk"));
        assert!(entries[0].message.is_some());
    }

    #[tokio::test]
    async fn row_count_matches_items_and_metadata_is_shared() {
        let raw = r#"{"receipt_metadata":{"store":"Hemköp","date":"2024-06-02","total_receipt_cost":99.0},
            "items":[{"product_name":"Ägg"},{"product_name":"Smör"},{"product_name":"Bröd"}]}"#;
        let fx = fixture(ScriptedExtractor::replying(raw), RecordingSink::new());
        let path = drop_file(&fx.folders, "a.pdf");

        fx.processor.process(&path).await.unwrap();

        let rows = fx.sink.rows();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.store == "Hemköp"
            && r.date == "2024-06-02"
            && r.total_receipt_cost == Some(99.0)));
        let names: Vec<_> = rows.iter().map(|r| r.product_name.as_str()).collect();
        assert_eq!(names, vec!["Ägg", "Smör", "Bröd"]);
    }

    #[tokio::test]
    async fn journal_hash_is_taken_from_the_extracted_bytes() {
        let fx = fixture(ScriptedExtractor::replying(HAPPY_RECEIPT), RecordingSink::new());
        let path = drop_file(&fx.folders, "hashed.pdf");

        fx.processor.process(&path).await.unwrap();

        let entries = journal_entries(&fx.processor, "hashed.pdf");
        assert_eq!(entries[0].file_hash.as_deref(), Some(sha256_bytes(b"%PDF-1.4 receipt").as_str()));
    }

    #[tokio::test]
    async fn failed_move_to_processed_is_quarantined_after_rows_were_written() {
        let fx = fixture(ScriptedExtractor::replying(HAPPY_RECEIPT), RecordingSink::new());
        let processed = fx.folders.dir(ReceiptState::Processed).to_path_buf();
        std::fs::remove_dir(&processed).unwrap();
        std::fs::write(&processed, b"not a folder").unwrap();
        let path = drop_file(&fx.folders, "a.pdf");

        let outcome = fx.processor.process(&path).await.unwrap();

        assert_eq!(outcome, Outcome::Failure);
        assert_eq!(fx.folders.locate("a.pdf"), Some(ReceiptState::Error));
        assert_eq!(fx.sink.rows().len(), 1);

        let entries = journal_entries(&fx.processor, "a.pdf");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "error");
        assert_eq!(entries[0].rows_appended, 1);
        assert!(entries[0].message.is_some());
    }

    #[tokio::test]
    async fn unreadable_file_fails_the_quarantine_move() {
        let fx = fixture(ScriptedExtractor::replying(HAPPY_RECEIPT), RecordingSink::new());
        let path = fx.folders.incoming().join("vanished.pdf");

        let err = fx.processor.process(&path).await.unwrap_err();

        assert!(matches!(err, FileSystemError::Move { .. }));
        assert_eq!(fx.sink.calls(), 0);
        assert_eq!(journal_entries(&fx.processor, "vanished.pdf")[0].outcome, "unmoved");
    }
}
