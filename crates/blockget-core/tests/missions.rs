//! End-to-end mission tests against a local HTTP server

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use blockget_core::engine::{ledger_path, preallocate, BlockSet, MissionLedger, LEDGER_VERSION};
use blockget_core::{
    BlockgetCore, EngineError, FinishedCatalog, MemoryCatalog, MissionRequest, MissionStore,
};
use blockget_types::{ErrorCode, MissionEvent, MissionId, MissionStatus, Settings};
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use uuid::Uuid;

const BLOCK: u64 = 1024;

// ============================================================================
// Test server
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Honors `Range` with `206 Partial Content`
    Ranges,
    /// Ignores `Range` and always sends the whole body
    NoRanges,
    /// Chunked body without a content length
    NoLength,
    /// Like `Ranges`, but the range starting at this offset gets a 500
    FailAt(u64),
    /// Like `Ranges`, but the range starting at this offset is cut in half
    TruncateAt(u64),
    /// Like `Ranges`, but the range starting at this offset gets the whole
    /// body with a 200
    FullBodyAt(u64),
}

#[derive(Clone)]
struct ServerState {
    payload: Arc<Vec<u8>>,
    mode: Mode,
    delay: Duration,
    requests: Arc<AtomicUsize>,
}

struct TestServer {
    url: String,
    payload: Arc<Vec<u8>>,
    requests: Arc<AtomicUsize>,
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let range = value.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() { len - 1 } else { end.parse().ok()? };
    (start <= end && start < len).then_some((start, end.min(len - 1)))
}

async fn serve_file(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let len = state.payload.len() as u64;
    match state.mode {
        Mode::NoLength => {
            let chunks: Vec<Result<Bytes, std::io::Error>> = state
                .payload
                .chunks(4096)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            Body::from_stream(futures::stream::iter(chunks)).into_response()
        }
        Mode::NoRanges => (StatusCode::OK, state.payload.to_vec()).into_response(),
        mode => {
            let range = headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_range(v, len));
            match (range, mode) {
                (Some((start, _)), Mode::FailAt(offset)) if start == offset => {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
                (Some((start, end)), Mode::TruncateAt(offset)) if start == offset => {
                    let half = start as usize + (end - start + 1) as usize / 2;
                    (
                        StatusCode::PARTIAL_CONTENT,
                        [(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len))],
                        state.payload[start as usize..half].to_vec(),
                    )
                        .into_response()
                }
                (Some((start, _)), Mode::FullBodyAt(offset)) if start == offset => {
                    (StatusCode::OK, state.payload.to_vec()).into_response()
                }
                (Some((start, end)), _) => (
                    StatusCode::PARTIAL_CONTENT,
                    [(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len))],
                    state.payload[start as usize..=end as usize].to_vec(),
                )
                    .into_response(),
                (None, _) => (StatusCode::OK, state.payload.to_vec()).into_response(),
            }
        }
    }
}

async fn spawn_server(len: usize, mode: Mode, delay: Duration) -> TestServer {
    let state = ServerState {
        payload: Arc::new(payload(len)),
        mode,
        delay,
        requests: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/files/data.bin", get(serve_file))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        url: format!("http://{}/files/data.bin", addr),
        payload: state.payload,
        requests: state.requests,
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn settings(dir: &Path) -> Settings {
    Settings {
        download_dir: dir.to_path_buf(),
        block_size: BLOCK,
        default_threads: 4,
        ..Settings::default()
    }
}

async fn open_store(dir: &Path, catalog: Arc<MemoryCatalog>) -> MissionStore {
    let (event_tx, _) = broadcast::channel(4096);
    MissionStore::open(settings(dir), catalog, event_tx).await.unwrap()
}

async fn wait_for_end(events: &mut broadcast::Receiver<MissionEvent>, id: MissionId) -> MissionEvent {
    timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Ok(event @ (MissionEvent::Finished { .. } | MissionEvent::Failed { .. }))
                    if event.mission_id() == id =>
                {
                    return event
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("mission did not end in time")
}

async fn wait_for_progress(events: &mut broadcast::Receiver<MissionEvent>, id: MissionId) {
    timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(MissionEvent::Progress { id: event_id, .. }) = events.recv().await {
                if event_id == id {
                    return;
                }
            }
        }
    })
    .await
    .expect("no progress in time")
}

/// Ledger of a ranged mission with some blocks already on disk
async fn seed_partial_mission(
    dir: &Path,
    server: &TestServer,
    completed: &[u64],
    fallback: bool,
) -> MissionLedger {
    let name = "data.bin";
    let length = server.payload.len() as u64;
    let path = dir.join(name);
    preallocate(&path, length).await.unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    for index in completed {
        let start = (index * BLOCK) as usize;
        let end = ((index + 1) * BLOCK).min(length) as usize;
        bytes[start..end].copy_from_slice(&server.payload[start..end]);
    }
    std::fs::write(&path, &bytes).unwrap();

    let ledger = MissionLedger {
        version: LEDGER_VERSION,
        id: Uuid::new_v4(),
        url: server.url.clone(),
        location: dir.to_path_buf(),
        name: name.to_string(),
        is_audio: false,
        length: Some(length),
        block_size: BLOCK,
        completed: completed.iter().copied().collect::<BlockSet>(),
        thread_count: 3,
        fallback,
        finished: false,
        error: None,
        created_at: Utc::now(),
    };
    ledger.store(&ledger_path(dir, name)).await.unwrap();
    ledger
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_worker_download_matches_payload() {
    let server = spawn_server(10 * BLOCK as usize + 123, Mode::Ranges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    let store = open_store(dir.path(), catalog.clone()).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest {
            threads: Some(4),
            ..MissionRequest::new(&server.url)
        })
        .await
        .unwrap();
    assert_eq!(started.index, 0);

    let event = wait_for_end(&mut events, started.id).await;
    assert!(matches!(event, MissionEvent::Finished { .. }), "{:?}", event);

    let info = store.info(started.id).await.unwrap();
    assert_eq!(info.status, MissionStatus::Finished);
    assert_eq!(info.name, "data.bin");
    assert_eq!(info.blocks, 11);
    assert_eq!(info.thread_count, 4);
    assert!(!info.fallback);
    assert_eq!(info.done, server.payload.len() as u64);

    let written = std::fs::read(dir.path().join("data.bin")).unwrap();
    assert_eq!(written, *server.payload);
    assert!(!ledger_path(dir.path(), "data.bin").exists());

    // recorded before the finish event went out
    let records = catalog.load_missions().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].length, server.payload.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn threads_are_clamped_to_block_count() {
    let server = spawn_server(2 * BLOCK as usize + 1, Mode::Ranges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest {
            threads: Some(16),
            ..MissionRequest::new(&server.url)
        })
        .await
        .unwrap();
    wait_for_end(&mut events, started.id).await;

    let info = store.info(started.id).await.unwrap();
    assert_eq!(info.blocks, 3);
    assert_eq!(info.thread_count, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fallback_download_matches_payload() {
    let server = spawn_server(5 * BLOCK as usize + 7, Mode::NoRanges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest::new(&server.url))
        .await
        .unwrap();
    let event = wait_for_end(&mut events, started.id).await;
    assert!(matches!(event, MissionEvent::Finished { .. }), "{:?}", event);

    let info = store.info(started.id).await.unwrap();
    assert!(info.fallback);
    assert_eq!(info.thread_count, 1);

    let written = std::fs::read(dir.path().join("data.bin")).unwrap();
    assert_eq!(written, *server.payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_length_fails_with_server_unsupported() {
    let server = spawn_server(3 * BLOCK as usize, Mode::NoLength, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest::new(&server.url))
        .await
        .unwrap();
    match wait_for_end(&mut events, started.id).await {
        MissionEvent::Failed { code, .. } => assert_eq!(code, ErrorCode::ServerUnsupported.code()),
        other => panic!("unexpected event {:?}", other),
    }

    let info = store.info(started.id).await.unwrap();
    assert_eq!(info.status, MissionStatus::Error);
    assert_eq!(info.error, Some(ErrorCode::ServerUnsupported));

    // a stored error blocks plain resume
    assert!(!store.resume_mission(started.id).await.unwrap());

    // retry runs again and fails the same way
    assert!(store.retry_mission(started.id).await.unwrap());
    match wait_for_end(&mut events, started.id).await {
        MissionEvent::Failed { code, .. } => assert_eq!(code, ErrorCode::ServerUnsupported.code()),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn taken_names_get_a_numbered_variant() {
    let server = spawn_server(BLOCK as usize, Mode::Ranges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.bin"), b"keep me").unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest::new(&server.url))
        .await
        .unwrap();
    wait_for_end(&mut events, started.id).await;

    let info = store.info(started.id).await.unwrap();
    assert_eq!(info.name, "data (0).bin");
    assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), b"keep me");
    assert_eq!(
        std::fs::read(dir.path().join("data (0).bin")).unwrap(),
        *server.payload
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_then_resume_completes_the_file() {
    let server = spawn_server(40 * BLOCK as usize, Mode::Ranges, Duration::from_millis(20)).await;
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest {
            threads: Some(2),
            ..MissionRequest::new(&server.url)
        })
        .await
        .unwrap();
    wait_for_progress(&mut events, started.id).await;

    assert!(store.pause_mission(started.id).await.unwrap());
    assert!(!store.pause_mission(started.id).await.unwrap());
    assert_eq!(
        store.info(started.id).await.unwrap().status,
        MissionStatus::Paused
    );
    assert!(ledger_path(dir.path(), "data.bin").exists());

    assert!(store.resume_mission(started.id).await.unwrap());
    assert!(!store.resume_mission(started.id).await.unwrap());

    let event = wait_for_end(&mut events, started.id).await;
    assert!(matches!(event, MissionEvent::Finished { .. }), "{:?}", event);
    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        *server.payload
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_then_recovery_resumes_where_it_stopped() {
    let server = spawn_server(30 * BLOCK as usize, Mode::Ranges, Duration::from_millis(20)).await;
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());

    let id = {
        let store = open_store(dir.path(), catalog.clone()).await;
        let mut events = store.subscribe();
        let started = store
            .start_mission(MissionRequest {
                threads: Some(2),
                ..MissionRequest::new(&server.url)
            })
            .await
            .unwrap();
        wait_for_progress(&mut events, started.id).await;
        store.shutdown().await;
        started.id
    };

    let ledger = MissionLedger::load(&ledger_path(dir.path(), "data.bin"))
        .await
        .unwrap();
    assert_eq!(ledger.id, id);
    assert!(!ledger.completed.is_empty());
    assert!(!ledger.finished);

    let store = open_store(dir.path(), catalog.clone()).await;
    let info = store.info(id).await.unwrap();
    assert!(info.recovered);
    assert_eq!(info.status, MissionStatus::Paused);
    assert_eq!(info.completed_blocks, ledger.completed.len());

    let mut events = store.subscribe();
    assert!(store.resume_mission(id).await.unwrap());
    wait_for_end(&mut events, id).await;

    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        *server.payload
    );
    assert!(!store.info(id).await.unwrap().recovered);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovered_mission_only_fetches_missing_blocks() {
    let server = spawn_server(8 * BLOCK as usize + 10, Mode::Ranges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let ledger = seed_partial_mission(dir.path(), &server, &[0, 2, 5], false).await;

    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let info = store.info(ledger.id).await.unwrap();
    assert_eq!(info.done, 3 * BLOCK);

    let mut events = store.subscribe();
    assert!(store.resume_mission(ledger.id).await.unwrap());
    wait_for_end(&mut events, ledger.id).await;

    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        *server.payload
    );
    // nine blocks, three already done, no probe needed
    assert_eq!(server.requests.load(Ordering::SeqCst), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fallback_resume_keeps_completed_blocks() {
    let server = spawn_server(4 * BLOCK as usize, Mode::NoRanges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let ledger = seed_partial_mission(dir.path(), &server, &[1], true).await;

    // mark block 1 so a rewrite would be visible
    let path = dir.path().join("data.bin");
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[BLOCK as usize..2 * BLOCK as usize].fill(0xAB);
    std::fs::write(&path, &bytes).unwrap();

    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();
    assert!(store.resume_mission(ledger.id).await.unwrap());
    wait_for_end(&mut events, ledger.id).await;

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), server.payload.len());
    assert_eq!(written[..BLOCK as usize], server.payload[..BLOCK as usize]);
    assert!(written[BLOCK as usize..2 * BLOCK as usize].iter().all(|b| *b == 0xAB));
    assert_eq!(
        written[2 * BLOCK as usize..],
        server.payload[2 * BLOCK as usize..]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovered_mission_without_length_probes_again() {
    let server = spawn_server(3 * BLOCK as usize, Mode::Ranges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let ledger = MissionLedger {
        version: LEDGER_VERSION,
        id: Uuid::new_v4(),
        url: server.url.clone(),
        location: dir.path().to_path_buf(),
        name: "data.bin".to_string(),
        is_audio: true,
        length: None,
        block_size: BLOCK,
        completed: BlockSet::new(),
        thread_count: 2,
        fallback: false,
        finished: false,
        error: None,
        created_at: Utc::now(),
    };
    ledger
        .store(&ledger_path(dir.path(), "data.bin"))
        .await
        .unwrap();

    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();
    assert!(store.resume_mission(ledger.id).await.unwrap());
    wait_for_end(&mut events, ledger.id).await;

    let info = store.info(ledger.id).await.unwrap();
    assert!(info.is_audio);
    assert_eq!(info.length, Some(3 * BLOCK));
    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        *server.payload
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_removes_file_ledger_and_record() {
    let server = spawn_server(2 * BLOCK as usize, Mode::Ranges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    let store = open_store(dir.path(), catalog.clone()).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest::new(&server.url))
        .await
        .unwrap();
    wait_for_end(&mut events, started.id).await;

    store.delete_mission(started.id).await.unwrap();
    assert_eq!(store.count().await, 0);
    assert!(!dir.path().join("data.bin").exists());
    assert!(!ledger_path(dir.path(), "data.bin").exists());
    assert!(catalog.records().is_empty());
    assert!(matches!(
        store.info(started.id).await,
        Err(EngineError::NotFound(_))
    ));

    let removed = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(MissionEvent::MissionRemoved { id }) = events.recv().await {
                return id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(removed, started.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_stops_a_running_mission() {
    let server = spawn_server(40 * BLOCK as usize, Mode::Ranges, Duration::from_millis(20)).await;
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest::new(&server.url))
        .await
        .unwrap();
    wait_for_progress(&mut events, started.id).await;

    store.delete_mission(started.id).await.unwrap();
    assert!(!dir.path().join("data.bin").exists());
    assert!(!ledger_path(dir.path(), "data.bin").exists());

    // nothing recreates the files once the pool has stopped
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!ledger_path(dir.path(), "data.bin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn newest_missions_come_first() {
    let server = spawn_server(BLOCK as usize, Mode::Ranges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();

    let first = store
        .start_mission(MissionRequest {
            name: Some("first.bin".into()),
            ..MissionRequest::new(&server.url)
        })
        .await
        .unwrap();
    wait_for_end(&mut events, first.id).await;
    let second = store
        .start_mission(MissionRequest {
            name: Some("second.bin".into()),
            ..MissionRequest::new(&server.url)
        })
        .await
        .unwrap();
    wait_for_end(&mut events, second.id).await;

    assert_eq!(second.index, 0);
    assert_eq!(store.id_at(0).await, Some(second.id));
    assert_eq!(store.index_of(first.id).await, Some(1));
    let names: Vec<_> = store.list().await.into_iter().map(|m| m.name).collect();
    assert_eq!(names, ["second.bin", "first.bin"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarting_a_finished_mission_replaces_it() {
    let server = spawn_server(2 * BLOCK as usize, Mode::Ranges, Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    let store = open_store(dir.path(), catalog.clone()).await;
    let mut events = store.subscribe();

    let first = store
        .start_mission(MissionRequest::new(&server.url))
        .await
        .unwrap();
    wait_for_end(&mut events, first.id).await;

    let second = store
        .start_mission(MissionRequest::new(&server.url))
        .await
        .unwrap();
    wait_for_end(&mut events, second.id).await;

    assert_eq!(store.count().await, 1);
    assert!(store.mission(first.id).await.is_none());
    assert_eq!(store.info(second.id).await.unwrap().name, "data.bin");
    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        *server.payload
    );
}

#[tokio::test]
async fn file_locations_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;

    let result = store
        .start_mission(MissionRequest {
            location: Some(file),
            ..MissionRequest::new("http://127.0.0.1:9/data.bin")
        })
        .await;
    assert!(matches!(result, Err(EngineError::InvalidLocation(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_failure_stops_the_pool_and_keeps_the_block_open() {
    let server = spawn_server(
        40 * BLOCK as usize,
        Mode::FailAt(12 * BLOCK),
        Duration::from_millis(20),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(MemoryCatalog::new());
    let store = open_store(dir.path(), catalog.clone()).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest {
            threads: Some(4),
            ..MissionRequest::new(&server.url)
        })
        .await
        .unwrap();
    match wait_for_end(&mut events, started.id).await {
        MissionEvent::Failed { code, .. } => assert_eq!(code, ErrorCode::Network.code()),
        other => panic!("unexpected event {:?}", other),
    }

    let info = store.info(started.id).await.unwrap();
    assert_eq!(info.status, MissionStatus::Error);
    assert_eq!(info.error, Some(ErrorCode::Network));

    let ledger = MissionLedger::load(&ledger_path(dir.path(), "data.bin"))
        .await
        .unwrap();
    assert_eq!(ledger.error, Some(ErrorCode::Network));
    assert!(!ledger.completed.contains(12));
    assert!(ledger.completed.len() < 39);
    assert_eq!(info.completed_blocks, ledger.completed.len());
    assert!(catalog.records().is_empty());

    // the other workers were stopped with the pool
    let requests = server.requests.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.requests.load(Ordering::SeqCst), requests);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn truncated_block_fails_with_network_code() {
    let server = spawn_server(4 * BLOCK as usize, Mode::TruncateAt(2 * BLOCK), Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest {
            threads: Some(1),
            ..MissionRequest::new(&server.url)
        })
        .await
        .unwrap();
    match wait_for_end(&mut events, started.id).await {
        MissionEvent::Failed { code, .. } => assert_eq!(code, ErrorCode::Network.code()),
        other => panic!("unexpected event {:?}", other),
    }

    let ledger = MissionLedger::load(&ledger_path(dir.path(), "data.bin"))
        .await
        .unwrap();
    assert!(ledger.completed.contains(0));
    assert!(ledger.completed.contains(1));
    assert!(!ledger.completed.contains(2));
    assert_eq!(ledger.error, Some(ErrorCode::Network));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn block_served_without_range_fails_as_unsupported() {
    let server = spawn_server(3 * BLOCK as usize, Mode::FullBodyAt(BLOCK), Duration::ZERO).await;
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), Arc::new(MemoryCatalog::new())).await;
    let mut events = store.subscribe();

    let started = store
        .start_mission(MissionRequest {
            threads: Some(1),
            ..MissionRequest::new(&server.url)
        })
        .await
        .unwrap();
    match wait_for_end(&mut events, started.id).await {
        MissionEvent::Failed { code, .. } => {
            assert_eq!(code, ErrorCode::ServerUnsupported.code())
        }
        other => panic!("unexpected event {:?}", other),
    }

    let info = store.info(started.id).await.unwrap();
    assert_eq!(info.error, Some(ErrorCode::ServerUnsupported));
    let ledger = MissionLedger::load(&ledger_path(dir.path(), "data.bin"))
        .await
        .unwrap();
    assert_eq!(ledger.completed.iter().collect::<Vec<_>>(), vec![0]);
}

/// Each round exits the moment `Finished` arrives, the way the CLI does
#[test]
fn finished_missions_survive_an_immediate_exit() {
    let server_rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let server = server_rt.block_on(spawn_server(6 * BLOCK as usize, Mode::Ranges, Duration::ZERO));
    let data_dir = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();

    for round in 0..5 {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let core = BlockgetCore::new(data_dir.path().to_path_buf()).await.unwrap();
            let mut events = core.subscribe();
            let started = core
                .start_mission(MissionRequest {
                    location: Some(downloads.path().to_path_buf()),
                    name: Some(format!("part{round}.bin")),
                    ..MissionRequest::new(&server.url)
                })
                .await
                .unwrap();
            let event = wait_for_end(&mut events, started.id).await;
            assert!(matches!(event, MissionEvent::Finished { .. }), "{:?}", event);
        });
        drop(rt);
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let core = BlockgetCore::new(data_dir.path().to_path_buf()).await.unwrap();
        let mut finished: Vec<_> = core
            .list_missions()
            .await
            .into_iter()
            .filter(|m| m.location == downloads.path() && m.status == MissionStatus::Finished)
            .map(|m| m.name)
            .collect();
        finished.sort();
        assert_eq!(
            finished,
            ["part0.bin", "part1.bin", "part2.bin", "part3.bin", "part4.bin"]
        );
    });
}
