use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::{normalize_date, parse_decimal};

#[derive(Debug, Clone)]
pub struct Settings {
    pub working_dir: PathBuf,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub credentials_file: PathBuf,
    pub sheet_id: String,
    pub sheet_range: String,
    pub extension: String,
    pub quiescence: Duration,
    pub journal_path: PathBuf,
}

/// Where a receipt file currently lives. The directory is the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptState {
    Incoming,
    Processed,
    Error,
}

impl ReceiptState {
    pub fn dir_name(self) -> &'static str {
        match self {
            ReceiptState::Incoming => "Incoming",
            ReceiptState::Processed => "Processed",
            ReceiptState::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn target(self) -> ReceiptState {
        match self {
            Outcome::Success => ReceiptState::Processed,
            Outcome::Failure => ReceiptState::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "processed",
            Outcome::Failure => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptMetadata {
    #[serde(default, deserialize_with = "lenient_text")]
    pub store: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub total_receipt_cost: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default, deserialize_with = "lenient_text")]
    pub product_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub quantity_or_weight: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub item_total_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub calories_per_100g: Option<f64>,
}

/// Structured document returned by the extraction service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedReceipt {
    pub receipt_metadata: ReceiptMetadata,
    pub items: Vec<LineItem>,
}

impl ExtractedReceipt {
    /// One row per item, in extraction order, with the metadata repeated.
    pub fn to_rows(&self) -> Vec<SinkRow> {
        let meta = &self.receipt_metadata;
        let date = normalize_date(meta.date.clone()).unwrap_or_default();
        let store = meta.store.clone().unwrap_or_default();
        self.items
            .iter()
            .map(|item| SinkRow {
                date: date.clone(),
                store: store.clone(),
                product_name: item.product_name.clone().unwrap_or_default(),
                category: item.category.clone().unwrap_or_default(),
                calories_per_100g: item.calories_per_100g,
                quantity_or_weight: item.quantity_or_weight.clone().unwrap_or_default(),
                item_total_price: item.item_total_price,
                total_receipt_cost: meta.total_receipt_cost,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkRow {
    pub date: String,
    pub store: String,
    pub product_name: String,
    pub category: String,
    pub calories_per_100g: Option<f64>,
    pub quantity_or_weight: String,
    pub item_total_price: Option<f64>,
    pub total_receipt_cost: Option<f64>,
}

impl SinkRow {
    /// Cells in sheet column order. Absent numbers become empty cells.
    pub fn cells(&self) -> Vec<Value> {
        vec![
            Value::from(self.date.as_str()),
            Value::from(self.store.as_str()),
            Value::from(self.product_name.as_str()),
            Value::from(self.category.as_str()),
            number_cell(self.calories_per_100g),
            Value::from(self.quantity_or_weight.as_str()),
            number_cell(self.item_total_price),
            number_cell(self.total_receipt_cost),
        ]
    }
}

fn number_cell(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(""))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub file_name: String,
    pub file_hash: Option<String>,
    pub outcome: String,
    pub rows_appended: i64,
    pub message: Option<String>,
    pub extracted_json: Option<String>,
    pub created_at: String,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => parse_decimal(&text).ok(),
        _ => None,
    })
}
