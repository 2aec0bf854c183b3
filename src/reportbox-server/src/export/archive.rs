//! Streaming ZIP producer.
//!
//! The archive is written on a blocking thread into a [`ChannelSink`], which
//! hands fixed-size chunks to a bounded channel. The response body drains the
//! channel, so a slow client stalls the writer instead of growing a buffer.
//!
//! Each file is spooled in full before its entry is started. A file that
//! fails part way is left out rather than written truncated.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use reportbox_storage::{BlobStore, ReportWithOwner};
use tempfile::SpooledTempFile;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, info, warn};
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, StreamWriter, ZipWriter};

use super::ledger::{
    EntryFailure, ExportLedger, ExportOutcome, ExportState, FailureStage, WrittenEntry,
};

const READ_BUF_SIZE: usize = 32 * 1024;

/// Chunks produced by the archive writer.
pub type ArchiveChunk = io::Result<Bytes>;

/// Tuning for one archive stream.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveOptions {
    /// Deflate level, clamped to 0..=9.
    pub compression_level: i64,
    pub chunk_size: usize,
    pub channel_capacity: usize,
    /// Bytes of one file held in memory before spooling moves to disk.
    pub spool_memory_limit: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression_level: 9,
            chunk_size: 64 * 1024,
            channel_capacity: 8,
            spool_memory_limit: 8 * 1024 * 1024,
        }
    }
}

impl ArchiveOptions {
    fn file_options(&self) -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.compression_level.clamp(0, 9)))
    }
}

/// `Write` end of the archive channel.
pub(crate) struct ChannelSink {
    tx: mpsc::Sender<ArchiveChunk>,
    buf: Vec<u8>,
    chunk_size: usize,
    shared: Arc<SinkShared>,
}

#[derive(Default)]
struct SinkShared {
    sent: AtomicU64,
    poisoned: AtomicBool,
}

/// Writer-side control over a [`ChannelSink`] that outlives the ZIP writer.
pub(crate) struct SinkControl {
    tx: mpsc::Sender<ArchiveChunk>,
    shared: Arc<SinkShared>,
}

impl ChannelSink {
    pub(crate) fn new(tx: mpsc::Sender<ArchiveChunk>, chunk_size: usize) -> (Self, SinkControl) {
        let shared = Arc::new(SinkShared::default());
        let control = SinkControl {
            tx: tx.clone(),
            shared: Arc::clone(&shared),
        };
        let chunk_size = chunk_size.max(1);
        let sink = Self {
            tx,
            buf: Vec::with_capacity(chunk_size),
            chunk_size,
            shared,
        };
        (sink, control)
    }

    fn send_chunk(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        let len = chunk.len() as u64;
        self.tx
            .blocking_send(Ok(Bytes::from(chunk)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))?;
        self.shared.sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn check_open(&self) -> io::Result<()> {
        if self.shared.poisoned.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive stream was aborted",
            ));
        }
        Ok(())
    }
}

impl Write for ChannelSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.chunk_size {
            self.send_chunk()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        self.send_chunk()
    }
}

impl SinkControl {
    /// Stop the sink and push a terminal error to the consumer. Only the
    /// first call has an effect.
    fn abort(&self, reason: &str) {
        if self.shared.poisoned.swap(true, Ordering::AcqRel) {
            return;
        }
        // The consumer may already be gone.
        let _ = self.tx.blocking_send(Err(io::Error::other(reason.to_string())));
    }

    /// Bytes handed to the consumer so far.
    pub(crate) fn bytes_sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }
}

type StreamZip = ZipWriter<StreamWriter<ChannelSink>>;

/// Everything the writer thread needs.
pub(crate) struct ArchiveJob {
    pub export_id: String,
    pub requested: Vec<String>,
    pub unresolved: Vec<String>,
    pub reports: Vec<ReportWithOwner>,
    pub blobs: Arc<dyn BlobStore>,
    pub ledger: Arc<ExportLedger>,
    pub options: ArchiveOptions,
}

/// `{owner}-{file}` with path separators flattened.
pub fn entry_name(owner_name: &str, file_name: &str) -> String {
    let raw = format!("{owner_name}-{file_name}");
    raw.chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect()
}

/// One archive entry and the reports that map to its name, latest first.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct EntryPlan {
    pub name: String,
    pub candidates: Vec<usize>,
}

/// Group reports by entry name, in resolution order.
///
/// A ZIP may not hold two entries with one name, so the last report wins:
/// each name sits where its last report does, and earlier reports with the
/// same name are only tried when every later one fails to read.
pub(crate) fn plan_entries(reports: &[ReportWithOwner]) -> Vec<EntryPlan> {
    let names: Vec<String> = reports
        .iter()
        .map(|entry| entry_name(&entry.owner_name, &entry.report.file_name))
        .collect();

    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, name) in names.iter().enumerate() {
        by_name.entry(name.as_str()).or_default().push(index);
    }

    names
        .iter()
        .enumerate()
        .filter_map(|(index, name)| {
            let group = by_name.get(name.as_str())?;
            (group.last() == Some(&index)).then(|| EntryPlan {
                name: name.clone(),
                candidates: group.iter().rev().copied().collect(),
            })
        })
        .collect()
}

/// A failure that ends the whole stream.
#[derive(Debug)]
struct Fatal(String);

impl From<io::Error> for Fatal {
    fn from(e: io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<zip::result::ZipError> for Fatal {
    fn from(e: zip::result::ZipError) -> Self {
        Self(e.to_string())
    }
}

#[derive(Default)]
struct Progress {
    entries: Vec<WrittenEntry>,
    failures: Vec<EntryFailure>,
    superseded: Vec<String>,
}

/// Write the archive for `job` into `sink`. Runs on a blocking thread.
///
/// The outcome is recorded in the ledger before the channel closes, so a
/// consumer that has seen the end of the body can already look it up.
pub(crate) fn write_archive(
    job: ArchiveJob,
    sink: ChannelSink,
    control: SinkControl,
    handle: Handle,
) -> ExportOutcome {
    let started_at = Utc::now();
    let resolved: Vec<String> = job.reports.iter().map(|r| r.report.id.clone()).collect();

    let mut progress = Progress::default();
    let mut zip = ZipWriter::new_stream(sink);
    let result = match write_entries(&job, &mut zip, &handle, &mut progress) {
        Ok(()) => finish_archive(zip),
        Err(fatal) => {
            // Poison first so dropping the writer cannot emit a central directory.
            control.abort(&fatal.0);
            drop(zip);
            Err(fatal)
        }
    };

    let (state, abort_reason) = match result {
        Ok(()) => {
            info!(
                export_id = %job.export_id,
                entries = progress.entries.len(),
                failures = progress.failures.len(),
                unresolved = job.unresolved.len(),
                bytes = control.bytes_sent(),
                "Archive export completed"
            );
            (ExportState::Completed, None)
        }
        Err(Fatal(reason)) => {
            error!(export_id = %job.export_id, error = %reason, "Archive stream aborted");
            control.abort(&reason);
            (ExportState::Aborted, Some(reason))
        }
    };

    let outcome = ExportOutcome {
        export_id: job.export_id.clone(),
        requested: job.requested,
        resolved,
        unresolved: job.unresolved,
        entries: progress.entries,
        failures: progress.failures,
        superseded: progress.superseded,
        state,
        abort_reason,
        bytes_written: control.bytes_sent(),
        started_at,
        finished_at: Utc::now(),
        purged: false,
    };

    handle.block_on(job.ledger.record(outcome.clone()));
    drop(control);
    outcome
}

fn write_entries(
    job: &ArchiveJob,
    zip: &mut StreamZip,
    handle: &Handle,
    progress: &mut Progress,
) -> Result<(), Fatal> {
    let options = job.options.file_options();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    for plan in plan_entries(&job.reports) {
        let mut written = false;
        for &index in &plan.candidates {
            let entry = &job.reports[index];
            if written {
                warn!(
                    report_id = %entry.report.id,
                    name = %plan.name,
                    "Entry name taken by a later report, leaving this one out"
                );
                progress.superseded.push(entry.report.id.clone());
                continue;
            }

            let Some((mut spool, size)) = spool_report(job, entry, handle, &mut buf, progress)?
            else {
                continue;
            };

            zip.start_file(plan.name.as_str(), options)?;
            io::copy(&mut spool, &mut *zip)?;
            written = true;

            debug!(report_id = %entry.report.id, name = %plan.name, size, "Archived report");
            progress.entries.push(WrittenEntry {
                report_id: entry.report.id.clone(),
                name: plan.name.clone(),
                size,
            });
        }
    }

    Ok(())
}

/// Read a report's file in full before its entry is started, so a read
/// failure leaves nothing behind in the archive.
///
/// Returns `None` after recording the failure when the file cannot be read.
fn spool_report(
    job: &ArchiveJob,
    entry: &ReportWithOwner,
    handle: &Handle,
    buf: &mut [u8],
    progress: &mut Progress,
) -> Result<Option<(SpooledTempFile, u64)>, Fatal> {
    let report = &entry.report;
    let location = report.file_url.as_str();
    let fail = |progress: &mut Progress, stage: FailureStage, reason: String| {
        progress.failures.push(EntryFailure {
            report_id: report.id.clone(),
            location: location.to_string(),
            stage,
            reason,
        });
    };

    let reader = match handle.block_on(job.blobs.open(location)) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(
                report_id = %report.id,
                location = %location,
                error = %e,
                "Skipping report whose file could not be opened"
            );
            fail(progress, FailureStage::Open, e.to_string());
            return Ok(None);
        }
    };

    let mut source = SyncIoBridge::new_with_handle(reader, handle.clone());
    let mut spool = SpooledTempFile::new(job.options.spool_memory_limit);
    let mut size = 0u64;
    loop {
        let n = match source.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(
                    report_id = %report.id,
                    location = %location,
                    bytes_read = size,
                    error = %e,
                    "Skipping report whose file failed mid-read"
                );
                fail(progress, FailureStage::Read, e.to_string());
                return Ok(None);
            }
        };
        spool.write_all(&buf[..n])?;
        size += n as u64;
    }

    spool.seek(SeekFrom::Start(0))?;
    Ok(Some((spool, size)))
}

fn finish_archive(zip: StreamZip) -> Result<(), Fatal> {
    let mut sink = zip.finish()?.into_inner();
    sink.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_name() {
        assert_eq!(entry_name("Alice", "a.pdf"), "Alice-a.pdf");
        assert_eq!(entry_name("A/B", "..\\x.pdf"), "A_B-.._x.pdf");
    }

    fn with_owner(id: &str, owner: &str, file: &str) -> ReportWithOwner {
        ReportWithOwner {
            report: reportbox_storage::Report::new(owner, file, file).with_id(id),
            owner_name: owner.to_string(),
            owner_student_id: String::new(),
        }
    }

    #[test]
    fn test_plan_keeps_resolution_order() {
        let reports = [with_owner("r1", "Alice", "a.pdf"), with_owner("r2", "Bob", "b.pdf")];
        let plan = plan_entries(&reports);
        assert_eq!(
            plan,
            vec![
                EntryPlan {
                    name: "Alice-a.pdf".into(),
                    candidates: vec![0],
                },
                EntryPlan {
                    name: "Bob-b.pdf".into(),
                    candidates: vec![1],
                },
            ]
        );
    }

    #[test]
    fn test_plan_last_report_wins_name() {
        let reports = [
            with_owner("r1", "Alice", "a.pdf"),
            with_owner("r2", "Bob", "b.pdf"),
            with_owner("r3", "Alice", "a.pdf"),
        ];
        let plan = plan_entries(&reports);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].name, "Bob-b.pdf");
        assert_eq!(plan[1].name, "Alice-a.pdf");
        assert_eq!(plan[1].candidates, vec![2, 0]);
    }

    #[test]
    fn test_sink_chunks_and_detects_disconnect() {
        let (tx, mut rx) = mpsc::channel(4);
        let (mut sink, control) = ChannelSink::new(tx, 4);

        sink.write_all(b"abcdef").unwrap();
        sink.flush().unwrap();
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(control.bytes_sent(), 6);

        drop(rx);
        let err = sink.write_all(b"ghij").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_abort_poisons_sink() {
        let (tx, mut rx) = mpsc::channel(4);
        let (mut sink, control) = ChannelSink::new(tx, 1024);

        control.abort("boom");
        control.abort("again");
        assert!(rx.blocking_recv().unwrap().is_err());
        assert!(sink.write(b"x").is_err());
        drop(control);
        drop(sink);
        assert!(rx.blocking_recv().is_none());
    }
}
