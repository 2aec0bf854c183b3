//! Export outcomes.
//!
//! Each archive stream records how it ended. The ledger keeps those outcomes
//! for a while so a teacher can check what was skipped and, for a complete
//! export, purge exactly the exported rows.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use super::ExportError;

/// Terminal state of an archive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    /// The archive was finalized and fully handed to the consumer.
    Completed,
    /// The writer or the consumer failed; the response was aborted.
    Aborted,
}

/// Where a per-entry failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// The file could not be opened; no entry was written.
    Open,
    /// Reading stopped before the end of the file; the entry was left out.
    Read,
}

/// A report whose file could not be archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFailure {
    pub report_id: String,
    pub location: String,
    pub stage: FailureStage,
    pub reason: String,
}

/// An entry written into the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WrittenEntry {
    pub report_id: String,
    pub name: String,
    /// Uncompressed size.
    pub size: u64,
}

/// How one export call ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    pub export_id: String,
    /// Requested ids, duplicates collapsed.
    pub requested: Vec<String>,
    /// Ids that resolved to a report, in archive order.
    pub resolved: Vec<String>,
    /// Ids with no matching report.
    pub unresolved: Vec<String>,
    pub entries: Vec<WrittenEntry>,
    pub failures: Vec<EntryFailure>,
    /// Reports left out because a later report claimed the same entry name.
    pub superseded: Vec<String>,
    pub state: ExportState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Compressed bytes handed to the consumer.
    pub bytes_written: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub purged: bool,
}

impl ExportOutcome {
    /// Every requested id resolved and every file was read in full.
    pub fn is_complete(&self) -> bool {
        self.state == ExportState::Completed
            && self.unresolved.is_empty()
            && self.failures.is_empty()
            && self.entries.len() == self.requested.len()
    }

    /// Why this outcome does not allow a purge, if it doesn't.
    pub fn purge_blocker(&self) -> Option<String> {
        if self.purged {
            return Some("export was already purged".to_string());
        }
        if self.state == ExportState::Aborted {
            return Some("export was aborted".to_string());
        }
        if !self.unresolved.is_empty() {
            return Some(format!(
                "{} requested report(s) did not resolve",
                self.unresolved.len()
            ));
        }
        if !self.failures.is_empty() {
            return Some(format!(
                "{} file(s) could not be read",
                self.failures.len()
            ));
        }
        if !self.superseded.is_empty() {
            return Some(format!(
                "{} report(s) were replaced by a later entry with the same name",
                self.superseded.len()
            ));
        }
        if !self.is_complete() {
            return Some("export did not archive every requested report".to_string());
        }
        None
    }
}

#[derive(Debug)]
struct LedgerEntry {
    outcome: ExportOutcome,
    recorded_at: Instant,
    purging: bool,
}

/// In-memory store of recent export outcomes.
#[derive(Debug)]
pub struct ExportLedger {
    ttl: Duration,
    entries: RwLock<HashMap<String, LedgerEntry>>,
}

impl ExportLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record(&self, outcome: ExportOutcome) {
        let mut entries = self.entries.write().await;
        entries.insert(
            outcome.export_id.clone(),
            LedgerEntry {
                outcome,
                recorded_at: Instant::now(),
                purging: false,
            },
        );
    }

    /// Look up an outcome that has not expired.
    pub async fn get(&self, export_id: &str) -> Option<ExportOutcome> {
        let entries = self.entries.read().await;
        entries
            .get(export_id)
            .filter(|entry| entry.recorded_at.elapsed() <= self.ttl)
            .map(|entry| entry.outcome.clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Evict expired outcomes. Entries being purged are kept.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.purging || entry.recorded_at.elapsed() <= self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Evicted expired export outcomes");
        }
        removed
    }

    /// Reserve an outcome for purging.
    ///
    /// Fails if the export is unknown, incomplete, already purged, or another
    /// purge of it is running. Must be followed by [`Self::finish_purge`].
    pub async fn claim_purge(&self, export_id: &str) -> Result<ExportOutcome, ExportError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(export_id)
            .filter(|entry| entry.recorded_at.elapsed() <= self.ttl)
            .ok_or_else(|| ExportError::UnknownExport(export_id.to_string()))?;

        if entry.purging {
            return Err(ExportError::PurgeRefused(
                "a purge of this export is already running".to_string(),
            ));
        }
        if let Some(reason) = entry.outcome.purge_blocker() {
            return Err(ExportError::PurgeRefused(reason));
        }

        entry.purging = true;
        Ok(entry.outcome.clone())
    }

    /// Release a claim taken by [`Self::claim_purge`].
    pub async fn finish_purge(&self, export_id: &str, purged: bool) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(export_id) {
            entry.purging = false;
            entry.outcome.purged |= purged;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str) -> ExportOutcome {
        let now = Utc::now();
        ExportOutcome {
            export_id: id.to_string(),
            requested: vec!["r1".to_string()],
            resolved: vec!["r1".to_string()],
            unresolved: vec![],
            entries: vec![WrittenEntry {
                report_id: "r1".to_string(),
                name: "Alice-a.pdf".to_string(),
                size: 3,
            }],
            failures: vec![],
            superseded: vec![],
            state: ExportState::Completed,
            abort_reason: None,
            bytes_written: 120,
            started_at: now,
            finished_at: now,
            purged: false,
        }
    }

    #[test]
    fn test_completeness() {
        assert!(outcome("e").is_complete());

        let mut failed = outcome("e");
        failed.failures.push(EntryFailure {
            report_id: "r1".to_string(),
            location: "a.pdf".to_string(),
            stage: FailureStage::Open,
            reason: "missing".to_string(),
        });
        assert!(!failed.is_complete());
        assert!(failed.purge_blocker().is_some());

        let mut aborted = outcome("e");
        aborted.state = ExportState::Aborted;
        assert_eq!(
            aborted.purge_blocker().as_deref(),
            Some("export was aborted")
        );
    }

    #[test]
    fn test_superseded_report_blocks_purge() {
        let mut shadowed = outcome("e");
        shadowed.requested.push("r0".to_string());
        shadowed.resolved.insert(0, "r0".to_string());
        shadowed.superseded.push("r0".to_string());

        assert!(!shadowed.is_complete());
        assert!(
            shadowed
                .purge_blocker()
                .unwrap()
                .contains("replaced by a later entry")
        );
    }

    #[tokio::test]
    async fn test_claim_purge_once() {
        let ledger = ExportLedger::new(Duration::from_secs(60));
        ledger.record(outcome("e1")).await;

        let claimed = ledger.claim_purge("e1").await.unwrap();
        assert_eq!(claimed.export_id, "e1");
        assert!(matches!(
            ledger.claim_purge("e1").await,
            Err(ExportError::PurgeRefused(_))
        ));

        ledger.finish_purge("e1", true).await;
        assert!(ledger.get("e1").await.unwrap().purged);
        assert!(matches!(
            ledger.claim_purge("e1").await,
            Err(ExportError::PurgeRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_purge_can_retry() {
        let ledger = ExportLedger::new(Duration::from_secs(60));
        ledger.record(outcome("e1")).await;

        ledger.claim_purge("e1").await.unwrap();
        ledger.finish_purge("e1", false).await;
        assert!(ledger.claim_purge("e1").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_and_expired() {
        let ledger = ExportLedger::new(Duration::ZERO);
        assert!(matches!(
            ledger.claim_purge("nope").await,
            Err(ExportError::UnknownExport(_))
        ));

        ledger.record(outcome("e1")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(ledger.get("e1").await.is_none());
        assert_eq!(ledger.cleanup_expired().await, 1);
        assert!(ledger.is_empty().await);
    }
}
