mod common;

use common::{server_error, MockControlPlane};
use cloud_ingest::api::{FileDescriptor, PaginatedLister};
use cloud_ingest::deadline::Deadline;
use cloud_ingest::upload::rate_limiter::RateLimiter;
use cloud_ingest::upload::retry::{RetryExecutor, RetryStrategy};
use cloud_ingest::upload::session::{SessionManager, SessionState};
use cloud_ingest::{FileQuery, IngestError, WriteMode};
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;

fn manager(api: &Arc<MockControlPlane>) -> SessionManager {
    let retry = RetryExecutor::new(
        RetryStrategy::new(3, Duration::from_millis(1), Duration::from_millis(5)).without_jitter(),
    );
    SessionManager::new(api.clone(), retry, Arc::new(RateLimiter::default()))
}

fn descriptor(name: &str) -> FileDescriptor {
    FileDescriptor {
        name: name.to_string(),
        size: 1,
        content_type: "text/plain".to_string(),
        meta: None,
    }
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let api = Arc::new(MockControlPlane::new());
    let sessions = manager(&api);

    let mut session = sessions.open("docs", WriteMode::Keep).await.unwrap();
    assert_eq!(session.state(), SessionState::Open);

    sessions.close(&mut session).await.unwrap();
    sessions.close(&mut session).await.unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(api.close_calls(), 1);
}

#[tokio::test]
async fn test_no_reservation_after_close() {
    let api = Arc::new(MockControlPlane::new());
    let sessions = manager(&api);

    let mut session = sessions.open("docs", WriteMode::Keep).await.unwrap();
    sessions.close(&mut session).await.unwrap();

    let result = sessions
        .reserve_destinations(&session, &[descriptor("a.txt")], &Deadline::unbounded())
        .await;
    assert!(matches!(
        result,
        Err(IngestError::SessionNotOpen {
            state: SessionState::Closed,
            ..
        })
    ));
    assert!(api.reservations().is_empty());
}

#[tokio::test]
async fn test_cancelled_session_cannot_be_closed() {
    let api = Arc::new(MockControlPlane::new());
    let sessions = manager(&api);

    let mut session = sessions.open("docs", WriteMode::Fail).await.unwrap();
    sessions.cancel(&mut session).unwrap();
    assert_eq!(session.state(), SessionState::Cancelled);

    assert!(matches!(
        sessions.close(&mut session).await,
        Err(IngestError::SessionNotOpen { .. })
    ));
    assert_eq!(api.close_calls(), 0);
}

#[tokio::test]
async fn test_open_exhausts_retries_as_remote_unavailable() {
    let api = Arc::new(MockControlPlane::new());
    for _ in 0..3 {
        api.fail_create(server_error());
    }

    let result = manager(&api).open("docs", WriteMode::Keep).await;
    assert!(matches!(result, Err(IngestError::RemoteUnavailable { .. })));
    assert_eq!(api.create_calls(), 3);
}

#[tokio::test]
async fn test_open_recovers_after_transient_failure() {
    let api = Arc::new(MockControlPlane::new());
    api.fail_create(server_error());

    let session = manager(&api).open("docs", WriteMode::Keep).await.unwrap();
    assert_eq!(session.id, "session-1");
    assert_eq!(api.create_calls(), 2);
    assert!(session.expires_at > session.created_at);
}

#[tokio::test]
async fn test_reservation_keeps_positional_order() {
    let api = Arc::new(MockControlPlane::new());
    let sessions = manager(&api);
    let session = sessions.open("docs", WriteMode::Keep).await.unwrap();

    let files = [descriptor("b.txt"), descriptor("a.txt")];
    let destinations = sessions
        .reserve_destinations(&session, &files, &Deadline::unbounded())
        .await
        .unwrap();
    let names: Vec<_> = destinations.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["b.txt", "a.txt"]);
}

#[tokio::test]
async fn test_lister_walks_every_page() {
    let api = Arc::new(MockControlPlane::new());
    api.set_files_page_size(2);
    for i in 0..5 {
        api.add_remote_file(&format!("f{}.txt", i));
    }

    let files: Vec<_> = PaginatedLister::new(api.clone(), 100)
        .files("docs", FileQuery::default())
        .try_collect()
        .await
        .unwrap();

    assert_eq!(files.len(), 5);
    assert_eq!(
        api.count(|c| matches!(c, common::Call::ListFiles { .. })),
        3
    );
}
