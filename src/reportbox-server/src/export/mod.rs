//! Archive export service.
//!
//! - [`archive`] - the streaming ZIP writer
//! - [`ledger`] - outcomes of finished exports, used by purge
//!
//! [`ExportService::export_archive`] validates the id list, resolves every
//! report in one store lookup and starts the writer. The returned
//! [`ArchiveStream`] yields archive bytes as they are produced; it ends after
//! the outcome has been recorded.

mod archive;
mod ledger;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reportbox_storage::{BlobStore, RecordStore, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

pub use archive::{ArchiveChunk, ArchiveOptions, entry_name};
pub use ledger::{
    EntryFailure, ExportLedger, ExportOutcome, ExportState, FailureStage, WrittenEntry,
};

use archive::{ArchiveJob, ChannelSink, write_archive};

/// Export errors.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Empty or malformed identifier list. Raised before any store access.
    #[error("{0}")]
    InvalidRequest(String),

    /// No outcome is recorded under this export id.
    #[error("unknown export: {0}")]
    UnknownExport(String),

    /// The outcome does not allow a purge.
    #[error("{0}")]
    PurgeRefused(String),

    /// The writer or the consumer failed mid-stream.
    #[error("archive stream aborted: {0}")]
    StreamAborted(String),

    #[error(transparent)]
    Store(#[from] StorageError),
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportRequest {
    report_ids: Vec<serde_json::Value>,
}

/// Parse an export request body into report ids.
///
/// The body must be `{"reportIds": [...]}` with at least one id, and every id
/// a non-empty string.
pub fn parse_report_ids(body: &[u8]) -> Result<Vec<String>, ExportError> {
    let request: ExportRequest = serde_json::from_slice(body)
        .map_err(|e| ExportError::InvalidRequest(format!("malformed export request: {e}")))?;

    validate_report_ids(request.report_ids.into_iter().map(|value| match value {
        serde_json::Value::String(id) => Some(id),
        _ => None,
    }))
}

fn validate_report_ids(
    ids: impl IntoIterator<Item = Option<String>>,
) -> Result<Vec<String>, ExportError> {
    let mut out = Vec::new();
    for (index, id) in ids.into_iter().enumerate() {
        match id {
            Some(id) if !id.trim().is_empty() => out.push(id),
            _ => {
                return Err(ExportError::InvalidRequest(format!(
                    "reportIds[{index}] is not a valid report id"
                )));
            }
        }
    }
    if out.is_empty() {
        return Err(ExportError::InvalidRequest(
            "reportIds must not be empty".to_string(),
        ));
    }
    Ok(out)
}

/// Keep the first occurrence of every id.
fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// A running export.
pub struct ArchiveStream {
    pub export_id: String,
    /// Suggested download name, `reports-YYYY-MM-DD.zip`.
    pub file_name: String,
    /// Archive bytes. Ends with an `Err` item if the stream is aborted.
    pub body: ReceiverStream<ArchiveChunk>,
    /// Resolves once the writer is done and the outcome is recorded.
    pub outcome: JoinHandle<ExportOutcome>,
}

impl std::fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStream")
            .field("export_id", &self.export_id)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

/// Download name for an archive produced at `now`.
pub fn archive_file_name(now: DateTime<Utc>) -> String {
    format!("reports-{}.zip", now.format("%Y-%m-%d"))
}

/// Result of a purge.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeSummary {
    pub export_id: String,
    pub deleted: usize,
}

/// Builds archives from stored reports.
pub struct ExportService {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    ledger: Arc<ExportLedger>,
    options: ArchiveOptions,
}

impl ExportService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<ExportLedger>,
        options: ArchiveOptions,
    ) -> Self {
        Self {
            store,
            blobs,
            ledger,
            options,
        }
    }

    pub fn ledger(&self) -> &Arc<ExportLedger> {
        &self.ledger
    }

    /// Start streaming an archive of `report_ids`.
    ///
    /// Unknown ids are dropped. Files that cannot be read are skipped and
    /// recorded in the outcome; the archive still completes.
    pub async fn export_archive(&self, report_ids: Vec<String>) -> Result<ArchiveStream, ExportError> {
        let requested = dedup_ids(validate_report_ids(report_ids.into_iter().map(Some))?);

        let reports = self.store.find_reports(&requested).await?;
        let found: HashSet<&str> = reports.iter().map(|r| r.report.id.as_str()).collect();
        let unresolved: Vec<String> = requested
            .iter()
            .filter(|id| !found.contains(id.as_str()))
            .cloned()
            .collect();

        let export_id = Uuid::new_v4().to_string();
        info!(
            export_id = %export_id,
            requested = requested.len(),
            resolved = reports.len(),
            "Starting archive export"
        );
        if !unresolved.is_empty() {
            debug!(export_id = %export_id, ?unresolved, "Dropping unknown report ids");
        }

        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let (sink, control) = ChannelSink::new(tx, self.options.chunk_size);
        let job = ArchiveJob {
            export_id: export_id.clone(),
            requested,
            unresolved,
            reports,
            blobs: Arc::clone(&self.blobs),
            ledger: Arc::clone(&self.ledger),
            options: self.options,
        };

        let handle = tokio::runtime::Handle::current();
        let outcome =
            tokio::task::spawn_blocking(move || write_archive(job, sink, control, handle));

        Ok(ArchiveStream {
            export_id,
            file_name: archive_file_name(Utc::now()),
            body: ReceiverStream::new(rx),
            outcome,
        })
    }

    /// Look up a recorded outcome.
    pub async fn outcome(&self, export_id: &str) -> Result<ExportOutcome, ExportError> {
        self.ledger
            .get(export_id)
            .await
            .ok_or_else(|| ExportError::UnknownExport(export_id.to_string()))
    }

    /// Delete exactly the report rows of a complete export, in one pass.
    pub async fn purge(&self, export_id: &str) -> Result<PurgeSummary, ExportError> {
        let outcome = self.ledger.claim_purge(export_id).await?;
        let ids: Vec<String> = outcome
            .entries
            .iter()
            .map(|entry| entry.report_id.clone())
            .collect();

        let result = self.store.delete_reports(&ids).await;
        self.ledger.finish_purge(export_id, result.is_ok()).await;
        let deleted = result?;

        info!(export_id = %export_id, deleted, "Purged exported reports");
        Ok(PurgeSummary {
            export_id: export_id.to_string(),
            deleted,
        })
    }
}

#[cfg(test)]
mod tests;
