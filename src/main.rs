mod db;
mod models;
mod services;
mod utils;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::models::Settings;
use crate::services::crypto::resolve_secret;
use crate::services::folders::ReceiptFolders;
use crate::services::gemini::GeminiExtractor;
use crate::services::processor::ReceiptProcessor;
use crate::services::sheets::GoogleSheetsWriter;
use crate::services::state::Pipeline;
use crate::services::watcher::{Debouncer, TokioDelay};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "receipt_watcher=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = load_settings(|key| std::env::var(key).ok())?;
    let folders = ReceiptFolders::prepare(&settings.working_dir)?;

    let api_key = resolve_secret(&settings.gemini_api_key).context("GEMINI_API_KEY")?;
    let extractor = GeminiExtractor::new(api_key, settings.gemini_model.clone());
    let sink = GoogleSheetsWriter::from_credentials_file(
        &settings.credentials_file,
        settings.sheet_id.clone(),
        settings.sheet_range.clone(),
    )?;
    let journal = db::Journal::open(&settings.journal_path)
        .with_context(|| format!("open journal {}", settings.journal_path.display()))?;
    info!(
        processed = journal.count_by_outcome("processed")?,
        quarantined = journal.count_by_outcome("error")?,
        "processing journal opened"
    );

    let processor = ReceiptProcessor::new(Arc::new(extractor), Arc::new(sink), folders, Some(journal));
    let debouncer = Debouncer::new(Arc::new(TokioDelay), settings.quiescence);
    let pipeline = Pipeline::new(processor, debouncer, settings.extension.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current receipt");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(
        folder = %settings.working_dir.display(),
        extension = %settings.extension,
        "receipt watcher starting, press Ctrl+C to stop"
    );
    pipeline.start(shutdown_rx).await?;
    info!("receipt watcher stopped");
    Ok(())
}

fn load_settings(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings> {
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    let working_dir = PathBuf::from(get("RECEIPTS_DIR").unwrap_or_else(|| ".".to_string()));
    let gemini_api_key = get("GEMINI_API_KEY").ok_or_else(|| anyhow!("GEMINI_API_KEY is not set"))?;
    let sheet_id = get("SHEET_ID").ok_or_else(|| anyhow!("SHEET_ID is not set"))?;
    let quiescence_ms = match get("QUIESCENCE_MS") {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("QUIESCENCE_MS is not a number: {}", raw))?,
        None => 2000,
    };
    let journal_path = get("RECEIPT_JOURNAL")
        .map(PathBuf::from)
        .unwrap_or_else(|| working_dir.join("receipts.sqlite"));

    Ok(Settings {
        gemini_api_key,
        gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.5-flash-lite".to_string()),
        credentials_file: PathBuf::from(
            get("GOOGLE_APPLICATION_CREDENTIALS").unwrap_or_else(|| "credentials.json".to_string()),
        ),
        sheet_id,
        sheet_range: get("SHEET_RANGE").unwrap_or_else(|| "Sheet1".to_string()),
        extension: get("RECEIPT_EXTENSION")
            .map(|ext| ext.trim_start_matches('.').to_string())
            .unwrap_or_else(|| "pdf".to_string()),
        quiescence: Duration::from_millis(quiescence_ms),
        journal_path,
        working_dir,
    })
}
