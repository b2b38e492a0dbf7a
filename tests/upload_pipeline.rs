mod common;

use common::{server_error, test_config, Call, MockControlPlane, MockObjectStore};
use cloud_ingest::api::IngestionCounts;
use cloud_ingest::upload::{IngestionStatus, SkipReason, UploadOutcome};
use cloud_ingest::{
    ByteRecord, DownloadOptions, IngestClient, IngestError, OperationStatus, TextRecord,
    UploadOptions, UploadProgress, WriteMode,
};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn client(api: &Arc<MockControlPlane>, store: &Arc<MockObjectStore>) -> IngestClient {
    IngestClient::with_backends(test_config(), api.clone(), store.clone())
}

fn texts(count: usize, size: usize) -> Vec<TextRecord> {
    (0..count)
        .map(|i| TextRecord::new(format!("doc-{:03}.txt", i), "x".repeat(size)))
        .collect()
}

#[tokio::test]
async fn test_250_texts_upload_in_three_batches() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    let progress = UploadProgress::new();
    let options = UploadOptions {
        progress: Some(progress.clone()),
        ..Default::default()
    };

    let report = client(&api, &store)
        .upload_texts(texts(250, 1024), options)
        .await
        .unwrap();

    let mut sizes: Vec<usize> = api.reservations().iter().map(Vec::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![50, 100, 100]);

    assert_eq!(report.status, OperationStatus::Succeeded);
    assert_eq!(report.total_files, 250);
    assert_eq!(report.succeeded, 250);
    assert_eq!(report.bytes_uploaded, 250 * 1024);
    assert_eq!(report.session_id.as_deref(), Some("session-1"));
    assert_eq!(report.ingestion, Some(IngestionStatus::Succeeded));
    assert_eq!(store.puts().len(), 250);
    assert_eq!(api.close_calls(), 1);
    assert_eq!((progress.completed(), progress.total()), (250, 250));
}

#[tokio::test]
async fn test_oversized_file_is_skipped_without_reservation() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    let mut config = test_config();
    config.upload.max_batch_bytes = 4096;
    let client = IngestClient::with_backends(config, api.clone(), store.clone());

    let mut records = texts(5, 1024);
    records.insert(2, TextRecord::new("huge.txt", "x".repeat(5000)));

    let report = client
        .upload_texts(records, UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.total_files, 6);
    assert_eq!(report.succeeded, 5);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.status, OperationStatus::Succeeded);

    let huge = &report.files[2];
    assert_eq!(huge.name, "huge.txt");
    assert_eq!(
        huge.outcome,
        UploadOutcome::Skipped {
            reason: SkipReason::OversizedFile {
                size: 5000,
                max: 4096
            }
        }
    );
    assert!(api
        .reservations()
        .iter()
        .flatten()
        .all(|name| name != "huge.txt"));
    assert_eq!(store.attempts_for("huge.txt"), 0);
}

#[tokio::test]
async fn test_unsupported_files_make_no_network_calls() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("setup.exe"), b"MZ").unwrap();
    fs::write(dir.path().join("notes.md"), b"# notes").unwrap();

    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    let report = client(&api, &store)
        .upload_paths(&[dir.path().to_path_buf()], UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.total_files, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.status, OperationStatus::Succeeded);
    assert!(report.session_id.is_none());
    assert!(api.calls().is_empty());
    assert!(store.puts().is_empty());
}

#[tokio::test]
async fn test_directory_upload_reports_every_file_once() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
    fs::write(dir.path().join("b.pdf"), b"%PDF-1.4").unwrap();
    fs::write(dir.path().join("c.csv"), b"x,y").unwrap();
    fs::write(dir.path().join("a.txt.meta.json"), r#"{"author": "kim"}"#).unwrap();

    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    let options = UploadOptions {
        write_mode: WriteMode::Overwrite,
        ..Default::default()
    };
    let report = client(&api, &store)
        .upload_paths(&[dir.path().to_path_buf()], options)
        .await
        .unwrap();

    let mut names: Vec<&str> = report.files.iter().map(|f| f.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a.txt", "b.pdf", "c.csv"]);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.bytes_uploaded, 5 + 8);

    assert_eq!(
        api.calls()[0],
        Call::CreateSession {
            workspace: "docs".to_string(),
            write_mode: WriteMode::Overwrite,
        }
    );
}

#[tokio::test]
async fn test_transient_transfer_failures_are_retried() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    store.fail_transiently("doc-001.txt", 2);

    let report = client(&api, &store)
        .upload_texts(texts(3, 10), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Succeeded);
    assert_eq!(report.succeeded, 3);
    assert_eq!(store.attempts_for("doc-001.txt"), 3);
    assert_eq!(store.attempts_for("doc-000.txt"), 1);
}

#[tokio::test]
async fn test_permanent_transfer_failure_does_not_abort_siblings() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    store.fail_permanently("doc-001.txt", 403);

    let report = client(&api, &store)
        .upload_texts(texts(3, 10), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::PartiallyFailed);
    assert_eq!((report.succeeded, report.failed), (2, 1));
    assert_eq!(report.bytes_uploaded, 20);
    assert_eq!(store.attempts_for("doc-001.txt"), 1);

    let failed: Vec<_> = report.failed_files().map(|f| f.name.as_str()).collect();
    assert_eq!(failed, vec!["doc-001.txt"]);
    assert_eq!(api.close_calls(), 1);
}

#[tokio::test]
async fn test_expired_session_halts_uploads_and_skips_close() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    api.fail_reserve(IngestError::SessionExpired {
        session_id: "session-1".to_string(),
        expires_at: chrono::Utc::now(),
    });

    let report = client(&api, &store)
        .upload_texts(texts(4, 10), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Failed);
    assert_eq!(report.failed, 4);
    assert!(report.error.is_some());
    assert!(store.puts().is_empty());
    assert_eq!(api.close_calls(), 0);
    assert_eq!(api.status_calls(), 0);
}

#[tokio::test]
async fn test_open_failure_is_reported_per_file() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    for _ in 0..3 {
        api.fail_create(server_error());
    }

    let report = client(&api, &store)
        .upload_texts(texts(2, 10), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(api.create_calls(), 3);
    assert_eq!(report.status, OperationStatus::Failed);
    assert_eq!(report.failed, 2);
    assert!(report.session_id.is_none());
    assert!(report
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Control plane unavailable")));
}

#[tokio::test]
async fn test_auth_failure_on_open_is_an_error() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    api.fail_create(IngestError::Auth {
        status: 401,
        message: "bad key".to_string(),
    });

    let result = client(&api, &store)
        .upload_texts(texts(2, 10), UploadOptions::default())
        .await;

    assert!(matches!(result, Err(IngestError::Auth { status: 401, .. })));
    assert_eq!(api.create_calls(), 1);
}

#[tokio::test]
async fn test_close_conflict_counts_as_closed() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    api.fail_close(IngestError::SessionNotOpen {
        session_id: "session-1".to_string(),
        state: cloud_ingest::upload::session::SessionState::Closed,
    });

    let report = client(&api, &store)
        .upload_texts(texts(2, 10), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Succeeded);
    assert_eq!(api.close_calls(), 1);
}

#[tokio::test]
async fn test_non_blocking_upload_does_not_poll() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    let options = UploadOptions {
        blocking: false,
        ..Default::default()
    };

    let report = client(&api, &store)
        .upload_texts(texts(2, 10), options)
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Succeeded);
    assert_eq!(report.ingestion, None);
    assert_eq!(api.status_calls(), 0);
    assert_eq!(api.close_calls(), 1);
}

#[tokio::test]
async fn test_partial_ingestion_failure_is_reported() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    api.push_status(IngestionCounts {
        state: None,
        finished_files: Some(2),
        failed_files: Some(1),
    });

    let report = client(&api, &store)
        .upload_texts(texts(3, 10), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.ingestion, Some(IngestionStatus::PartiallyFailed));
    assert_eq!(report.status, OperationStatus::PartiallyFailed);
}

#[tokio::test]
async fn test_cancelled_upload_abandons_session() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let options = UploadOptions {
        cancel: Some(cancel),
        ..Default::default()
    };
    let report = client(&api, &store)
        .upload_texts(texts(3, 10), options)
        .await
        .unwrap();

    assert_eq!(report.failed, 3);
    assert_eq!(report.status, OperationStatus::Failed);
    assert!(store.puts().is_empty());
    assert_eq!(api.close_calls(), 0);
    assert_eq!(api.status_calls(), 0);
}

#[tokio::test]
async fn test_missing_workspace_is_rejected() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    let mut config = test_config();
    config.default_workspace = None;
    let client = IngestClient::with_backends(config, api.clone(), store);

    let result = client
        .upload_texts(texts(1, 10), UploadOptions::default())
        .await;
    assert!(matches!(result, Err(IngestError::WorkspaceNotDefined)));
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn test_concurrent_calls_keep_separate_progress() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    let client = client(&api, &store);
    let (small, large) = (UploadProgress::new(), UploadProgress::new());

    let (a, b) = tokio::join!(
        client.upload_texts(
            texts(3, 10),
            UploadOptions {
                progress: Some(small.clone()),
                ..Default::default()
            }
        ),
        client.upload_texts(
            texts(7, 10),
            UploadOptions {
                progress: Some(large.clone()),
                ..Default::default()
            }
        ),
    );

    assert_eq!(a.unwrap().succeeded, 3);
    assert_eq!(b.unwrap().succeeded, 7);
    assert_eq!((small.completed(), small.total()), (3, 3));
    assert_eq!((large.completed(), large.total()), (7, 7));
}

#[tokio::test]
async fn test_unobservable_ingestion_is_a_failure() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    api.fail_status(IngestError::Http {
        status: 404,
        message: "no such session".to_string(),
    });

    let report = client(&api, &store)
        .upload_texts(texts(3, 10), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.ingestion, None);
    assert_eq!(report.status, OperationStatus::Failed);
    assert!(report
        .error
        .as_deref()
        .is_some_and(|e| e.contains("ingestion status unavailable")));
    assert_eq!(api.status_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_never_outlives_the_deadline() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    store.throttle("doc-000.txt", Duration::from_secs(3600));
    let mut config = test_config();
    config.upload.retry_max_delay_ms = 2 * 60 * 60 * 1000;
    let client = IngestClient::with_backends(config, api.clone(), store.clone());

    let started = Instant::now();
    let report = client
        .upload_texts(
            texts(2, 10),
            UploadOptions {
                timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(report.status, OperationStatus::TimedOut);
    assert_eq!((report.succeeded, report.failed), (1, 1));
    assert_eq!(store.attempts_for("doc-000.txt"), 1);
    assert_eq!(api.status_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_is_capped_by_max_delay() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    store.throttle("doc-000.txt", Duration::from_secs(3600));

    let started = Instant::now();
    let report = client(&api, &store)
        .upload_texts(texts(2, 10), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Succeeded);
    assert_eq!(store.attempts_for("doc-000.txt"), 2);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_puts_never_exceed_concurrency() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::with_delay(Duration::from_millis(200)));
    let mut config = test_config();
    config.upload.concurrency = 3;
    config.upload.max_batch_size = 4;
    let client = IngestClient::with_backends(config, api.clone(), store.clone());

    let report = client
        .upload_texts(texts(20, 10), UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 20);
    assert_eq!(api.reservations().len(), 5);
    assert_eq!(store.peak_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_fails_unstarted_files() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::with_delay(Duration::from_secs(10)));
    let mut config = test_config();
    config.upload.concurrency = 2;
    let client = IngestClient::with_backends(config, api.clone(), store.clone());

    let report = client
        .upload_texts(
            texts(6, 10),
            UploadOptions {
                timeout: Some(Duration::from_secs(15)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Two rounds of puts start before the deadline; both finish
    assert_eq!(store.puts().len(), 4);
    assert_eq!((report.succeeded, report.failed), (4, 2));
    assert_eq!(report.status, OperationStatus::TimedOut);
    for file in report.failed_files() {
        match &file.outcome {
            UploadOutcome::Failed { reason } => assert!(reason.contains("deadline exceeded")),
            other => panic!("expected failure, got {:?}", other),
        }
    }
    assert_eq!(api.status_calls(), 0);
}

#[tokio::test]
async fn test_upload_bytes() {
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    let mut meta = serde_json::Map::new();
    meta.insert("source".to_string(), serde_json::json!("scanner"));
    let records = vec![
        ByteRecord::new("scan.pdf", b"%PDF-1.7 scan".to_vec()).with_metadata(meta.clone()),
        ByteRecord::new("notes.txt", "plain notes"),
    ];

    let report = client(&api, &store)
        .upload_bytes(records, UploadOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Succeeded);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.bytes_uploaded, 13 + 11);
    assert_eq!(
        api.reservations(),
        vec![vec!["scan.pdf".to_string(), "notes.txt".to_string()]]
    );
}

#[tokio::test]
async fn test_download_saves_files_and_metadata() {
    let dir = tempdir().unwrap();
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    api.set_files_page_size(2);
    api.add_remote_file("a.txt");
    api.add_remote_file("nested/a.txt");
    let missing = api.add_remote_file("b.txt");
    api.fail_download(&missing);

    let report = client(&api, &store)
        .download(DownloadOptions {
            dir: dir.path().join("out"),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::PartiallyFailed);
    assert_eq!((report.downloaded, report.failed), (2, 1));

    let failed: Vec<_> = report.files.iter().filter(|f| f.error.is_some()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].file_id, missing);

    // Same local name twice: neither copy is overwritten
    let out = dir.path().join("out");
    let saved: HashSet<String> = ["a.txt", "a_1.txt"]
        .iter()
        .map(|name| fs::read_to_string(out.join(name)).unwrap())
        .collect();
    assert_eq!(
        saved,
        HashSet::from(["a.txt".to_string(), "nested/a.txt".to_string()])
    );
    assert!(out.join("a.txt.meta.json").exists());
    assert!(out.join("a_1.txt.meta.json").exists());
    assert!(!out.join("b.txt").exists());

    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("a.txt.meta.json")).unwrap()).unwrap();
    assert!(meta["name"].as_str().is_some_and(|n| n.ends_with("a.txt")));
}

#[tokio::test]
async fn test_download_without_metadata() {
    let dir = tempdir().unwrap();
    let api = Arc::new(MockControlPlane::new());
    let store = Arc::new(MockObjectStore::new());
    api.add_remote_file("report.pdf");

    let report = client(&api, &store)
        .download(DownloadOptions {
            dir: dir.path().to_path_buf(),
            include_meta: false,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(report.status, OperationStatus::Succeeded);
    assert_eq!(report.downloaded, 1);
    assert!(dir.path().join("report.pdf").exists());
    assert!(!dir.path().join("report.pdf.meta.json").exists());
    assert_eq!(api.count(|c| matches!(c, Call::Meta { .. })), 0);
}
