//! Tests for the archive export service.

use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use reportbox_storage::{
    BlobReader, BlobStore, JsonRecordStore, LocalBlobStore, RecordStore, Report, Role, User,
};
use tempfile::{TempDir, tempdir};
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;

use super::*;

struct Fixture {
    _dir: TempDir,
    store: Arc<JsonRecordStore>,
    service: ExportService,
}

async fn fixture_with(options: ArchiveOptions) -> Fixture {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.pdf"), b"alice's report").unwrap();
    std::fs::write(dir.path().join("b.pdf"), b"bob's report").unwrap();

    let store = Arc::new(JsonRecordStore::in_memory());
    store
        .insert_user(User::new("2021000001", "Alice", Role::Student).with_id("alice"))
        .await
        .unwrap();
    store
        .insert_user(User::new("2021000002", "Bob", Role::Student).with_id("bob"))
        .await
        .unwrap();
    store
        .insert_report(Report::new("alice", "a.pdf", "a.pdf").with_id("r1"))
        .await
        .unwrap();
    store
        .insert_report(Report::new("bob", "b.pdf", "b.pdf").with_id("r2"))
        .await
        .unwrap();

    let service = service_for(store.clone(), dir.path(), options);
    Fixture {
        _dir: dir,
        store,
        service,
    }
}

async fn fixture() -> Fixture {
    fixture_with(ArchiveOptions::default()).await
}

fn service_for(store: Arc<JsonRecordStore>, root: &Path, options: ArchiveOptions) -> ExportService {
    ExportService::new(
        store,
        Arc::new(LocalBlobStore::new(root)),
        Arc::new(ExportLedger::new(Duration::from_secs(60))),
        options,
    )
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn collect(stream: ArchiveStream) -> (Vec<u8>, ExportOutcome) {
    let mut body = stream.body;
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    let outcome = stream.outcome.await.unwrap();
    (bytes, outcome)
}

fn entries(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
    (0..zip.len())
        .map(|i| {
            let mut file = zip.by_index(i).unwrap();
            let mut content = Vec::new();
            file.read_to_end(&mut content).unwrap();
            (file.name().to_string(), content)
        })
        .collect()
}

fn names(archive: &[u8]) -> Vec<String> {
    entries(archive).into_iter().map(|(name, _)| name).collect()
}

#[test]
fn test_parse_report_ids() {
    assert_eq!(
        parse_report_ids(br#"{"reportIds": ["r1", "r2"]}"#).unwrap(),
        ids(&["r1", "r2"])
    );

    for body in [
        &br#"{"reportIds": []}"#[..],
        br#"{"reportIds": [""]}"#,
        br#"{"reportIds": ["r1", 7]}"#,
        br#"{"reportIds": "r1"}"#,
        br#"{}"#,
        b"not json",
    ] {
        assert!(
            matches!(parse_report_ids(body), Err(ExportError::InvalidRequest(_))),
            "accepted {}",
            String::from_utf8_lossy(body)
        );
    }
}

#[test]
fn test_archive_file_name() {
    let date = chrono::DateTime::parse_from_rfc3339("2024-03-09T23:59:00Z")
        .unwrap()
        .with_timezone(&Utc);
    assert_eq!(archive_file_name(date), "reports-2024-03-09.zip");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_export_names_entries_in_request_order() {
    let f = fixture().await;

    let stream = f.service.export_archive(ids(&["r2", "r1"])).await.unwrap();
    let (bytes, outcome) = collect(stream).await;

    assert_eq!(
        entries(&bytes),
        vec![
            ("Bob-b.pdf".to_string(), b"bob's report".to_vec()),
            ("Alice-a.pdf".to_string(), b"alice's report".to_vec()),
        ]
    );
    assert_eq!(outcome.state, ExportState::Completed);
    assert!(outcome.is_complete());
    assert_eq!(outcome.bytes_written, bytes.len() as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_ids_are_dropped() {
    let f = fixture().await;

    let stream = f
        .service
        .export_archive(ids(&["r1", "missing", "r1"]))
        .await
        .unwrap();
    let (bytes, outcome) = collect(stream).await;

    assert_eq!(names(&bytes), vec!["Alice-a.pdf"]);
    assert_eq!(outcome.requested, ids(&["r1", "missing"]));
    assert_eq!(outcome.unresolved, ids(&["missing"]));
    assert!(outcome.failures.is_empty());
    assert!(!outcome.is_complete());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_file_is_skipped() {
    let f = fixture().await;
    f.store
        .insert_report(Report::new("bob", "gone.pdf", "gone.pdf").with_id("r3"))
        .await
        .unwrap();

    let stream = f
        .service
        .export_archive(ids(&["r1", "r3", "r2"]))
        .await
        .unwrap();
    let (bytes, outcome) = collect(stream).await;

    assert_eq!(names(&bytes), vec!["Alice-a.pdf", "Bob-b.pdf"]);
    assert_eq!(outcome.state, ExportState::Completed);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].report_id, "r3");
    assert_eq!(outcome.failures[0].stage, FailureStage::Open);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_name_last_report_wins() {
    let f = fixture().await;
    f.store
        .insert_report(Report::new("alice", "a.pdf", "b.pdf").with_id("r4"))
        .await
        .unwrap();

    let stream = f
        .service
        .export_archive(ids(&["r1", "r2", "r4"]))
        .await
        .unwrap();
    let (bytes, outcome) = collect(stream).await;

    assert_eq!(
        entries(&bytes),
        vec![
            ("Bob-b.pdf".to_string(), b"bob's report".to_vec()),
            ("Alice-a.pdf".to_string(), b"bob's report".to_vec()),
        ]
    );
    assert_eq!(outcome.superseded, ids(&["r1"]));
    assert!(outcome.failures.is_empty());
    assert!(outcome.purge_blocker().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_name_falls_back_to_readable_report() {
    let f = fixture().await;
    f.store
        .insert_report(Report::new("alice", "a.pdf", "gone.pdf").with_id("r4"))
        .await
        .unwrap();

    let stream = f.service.export_archive(ids(&["r1", "r4"])).await.unwrap();
    let (bytes, outcome) = collect(stream).await;

    assert_eq!(
        entries(&bytes),
        vec![("Alice-a.pdf".to_string(), b"alice's report".to_vec())]
    );
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].report_id, "r4");
    assert!(outcome.superseded.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_larger_than_spool_limit() {
    let f = fixture_with(ArchiveOptions {
        spool_memory_limit: 4,
        ..ArchiveOptions::default()
    })
    .await;

    let (bytes, outcome) = collect(f.service.export_archive(ids(&["r1"])).await.unwrap()).await;

    assert_eq!(
        entries(&bytes),
        vec![("Alice-a.pdf".to_string(), b"alice's report".to_vec())]
    );
    assert_eq!(outcome.entries[0].size, 14);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_export_is_repeatable() {
    let f = fixture().await;

    let (first, _) = collect(f.service.export_archive(ids(&["r1", "r2"])).await.unwrap()).await;
    let (second, _) = collect(f.service.export_archive(ids(&["r1", "r2"])).await.unwrap()).await;

    assert_eq!(entries(&first), entries(&second));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_request_rejected_before_lookup() {
    let f = fixture().await;
    assert!(matches!(
        f.service.export_archive(vec![]).await,
        Err(ExportError::InvalidRequest(_))
    ));
    assert!(f.service.ledger().is_empty().await);
}

/// Serves "a.pdf" normally and fails "flaky.pdf" after a few bytes.
struct FlakyBlobs;

#[async_trait]
impl BlobStore for FlakyBlobs {
    async fn open(&self, location: &str) -> reportbox_storage::Result<BlobReader> {
        let chunks: Vec<io::Result<Bytes>> = match location {
            "flaky.pdf" => vec![
                Ok(Bytes::from_static(b"partial")),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset")),
            ],
            _ => vec![Ok(Bytes::from_static(b"whole"))],
        };
        Ok(Box::new(StreamReader::new(futures::stream::iter(chunks))))
    }

    async fn put(
        &self,
        _file_name: &str,
        _data: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> reportbox_storage::Result<String> {
        Err(reportbox_storage::StorageError::Unsupported("test double"))
    }

    async fn remove(&self, _location: &str) -> reportbox_storage::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_failure_leaves_entry_out() {
    let store = Arc::new(JsonRecordStore::in_memory());
    store
        .insert_user(User::new("1", "Alice", Role::Student).with_id("alice"))
        .await
        .unwrap();
    store
        .insert_report(Report::new("alice", "x.pdf", "flaky.pdf").with_id("r1"))
        .await
        .unwrap();
    store
        .insert_report(Report::new("alice", "y.pdf", "a.pdf").with_id("r2"))
        .await
        .unwrap();

    let service = ExportService::new(
        store,
        Arc::new(FlakyBlobs),
        Arc::new(ExportLedger::new(Duration::from_secs(60))),
        ArchiveOptions::default(),
    );

    let (bytes, outcome) = collect(service.export_archive(ids(&["r1", "r2"])).await.unwrap()).await;

    assert_eq!(
        entries(&bytes),
        vec![("Alice-y.pdf".to_string(), b"whole".to_vec())]
    );
    assert_eq!(outcome.state, ExportState::Completed);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].report_id, "r1");
    assert_eq!(outcome.failures[0].stage, FailureStage::Read);
    assert!(!outcome.is_complete());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consumer_disconnect_aborts() {
    let dir = tempdir().unwrap();
    // Incompressible payload so the archive cannot fit in the channel.
    let mut state = 0x2545_f491_u32;
    let noise: Vec<u8> = (0..256 * 1024)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect();
    std::fs::write(dir.path().join("big.bin"), &noise).unwrap();

    let store = Arc::new(JsonRecordStore::in_memory());
    store
        .insert_user(User::new("1", "Alice", Role::Student).with_id("alice"))
        .await
        .unwrap();
    store
        .insert_report(Report::new("alice", "big.bin", "big.bin").with_id("r1"))
        .await
        .unwrap();

    let service = service_for(
        store,
        dir.path(),
        ArchiveOptions {
            chunk_size: 1024,
            channel_capacity: 1,
            ..ArchiveOptions::default()
        },
    );

    let stream = service.export_archive(ids(&["r1"])).await.unwrap();
    let export_id = stream.export_id.clone();
    drop(stream.body);
    let outcome = stream.outcome.await.unwrap();

    assert_eq!(outcome.state, ExportState::Aborted);
    assert!(outcome.abort_reason.is_some());
    assert!(matches!(
        service.purge(&export_id).await,
        Err(ExportError::PurgeRefused(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_outcome_recorded_before_stream_ends() {
    let f = fixture().await;

    let stream = f.service.export_archive(ids(&["r1"])).await.unwrap();
    let export_id = stream.export_id.clone();
    let mut body = stream.body;
    while body.next().await.is_some() {}

    let outcome = f.service.outcome(&export_id).await.unwrap();
    assert_eq!(outcome.entries.len(), 1);
    assert_eq!(outcome.entries[0].name, "Alice-a.pdf");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_purge_deletes_exported_rows_once() {
    let f = fixture().await;

    let stream = f.service.export_archive(ids(&["r1"])).await.unwrap();
    let export_id = stream.export_id.clone();
    collect(stream).await;

    let summary = f.service.purge(&export_id).await.unwrap();
    assert_eq!(summary.deleted, 1);
    assert!(f.store.get_report("r1").await.unwrap().is_none());
    assert!(f.store.get_report("r2").await.unwrap().is_some());

    assert!(matches!(
        f.service.purge(&export_id).await,
        Err(ExportError::PurgeRefused(_))
    ));
    assert!(f.service.outcome(&export_id).await.unwrap().purged);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_purge_refuses_incomplete_export() {
    let f = fixture().await;

    let stream = f
        .service
        .export_archive(ids(&["r1", "missing"]))
        .await
        .unwrap();
    let export_id = stream.export_id.clone();
    collect(stream).await;

    assert!(matches!(
        f.service.purge(&export_id).await,
        Err(ExportError::PurgeRefused(_))
    ));
    assert!(f.store.get_report("r1").await.unwrap().is_some());

    assert!(matches!(
        f.service.purge("no-such-export").await,
        Err(ExportError::UnknownExport(_))
    ));
}
