//! In-memory doubles for the extraction service, the sink and the debounce delay.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::models::{ExtractedReceipt, SinkRow};
use crate::services::extraction::{parse_receipt, Document, ExtractionClient, ExtractionError};
use crate::services::sheets::{SinkError, SinkWriter};
use crate::services::watcher::Delay;

pub const HAPPY_RECEIPT: &str = r#"{"receipt_metadata":{"store":"X","date":"2024-05-01","total_receipt_cost":120.50},"items":[{"product_name":"Mjölk","quantity_or_weight":"1L","item_total_price":15.00,"category":"Dairy","calories_per_100g":42}]}"#;

enum Reply {
    Raw(String),
    Unavailable,
}

/// Replies with canned response text, per file name or by default, and
/// remembers which files it was asked about.
pub struct ScriptedExtractor {
    default: Reply,
    by_file: HashMap<String, Reply>,
    hooks: HashMap<String, Box<dyn Fn() + Send + Sync>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedExtractor {
    pub fn replying(raw: &str) -> Self {
        ScriptedExtractor {
            default: Reply::Raw(raw.to_string()),
            by_file: HashMap::new(),
            hooks: HashMap::new(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        ScriptedExtractor {
            default: Reply::Unavailable,
            by_file: HashMap::new(),
            hooks: HashMap::new(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply(mut self, file_name: &str, raw: &str) -> Self {
        self.by_file
            .insert(file_name.to_string(), Reply::Raw(raw.to_string()));
        self
    }

    pub fn failing_for(mut self, file_name: &str) -> Self {
        self.by_file.insert(file_name.to_string(), Reply::Unavailable);
        self
    }

    /// Runs `hook` when `file_name` is extracted, before replying.
    pub fn on_extract(mut self, file_name: &str, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.insert(file_name.to_string(), Box::new(hook));
        self
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionClient for ScriptedExtractor {
    async fn extract(&self, document: &Document) -> Result<(ExtractedReceipt, String), ExtractionError> {
        self.seen.lock().unwrap().push(document.file_name.clone());
        if let Some(hook) = self.hooks.get(&document.file_name) {
            hook();
        }
        match self.by_file.get(&document.file_name).unwrap_or(&self.default) {
            Reply::Raw(raw) => Ok((parse_receipt(raw)?, raw.clone())),
            Reply::Unavailable => Err(ExtractionError::Api {
                status: 503,
                body: "service unavailable".to_string(),
            }),
        }
    }
}

/// Keeps every appended batch in memory.
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<SinkRow>>>,
    calls: Mutex<usize>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink {
            batches: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        RecordingSink {
            fail: true,
            ..Self::new()
        }
    }

    pub fn batches(&self) -> Vec<Vec<SinkRow>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn rows(&self) -> Vec<SinkRow> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl SinkWriter for RecordingSink {
    async fn append(&self, rows: &[SinkRow]) -> Result<(), SinkError> {
        *self.calls.lock().unwrap() += 1;
        if self.fail {
            return Err(SinkError::Api {
                status: 500,
                body: "backend error".to_string(),
            });
        }
        self.batches.lock().unwrap().push(rows.to_vec());
        Ok(())
    }
}

/// Returns immediately and counts the waits it was asked for.
#[derive(Default)]
pub struct CountingDelay {
    waits: Mutex<Vec<Duration>>,
}

impl CountingDelay {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delay for CountingDelay {
    async fn wait(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
    }
}
