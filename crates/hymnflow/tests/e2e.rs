//! Runs with the filesystem adapters and the SQLite store.

mod common;

use std::sync::Arc;

use common::*;
use hymnflow::adapters::{Adapters, FfprobeProber, FsCacheWriter, JsonRecordCreator, LocalMediaUploader};
use hymnflow::store::{JobStateStore, SqliteStateStore};
use hymnflow::worker::{JobEvent, JobOutput, Stage};
use hymnflow::{Job, JobKind, JobSource, JobStatus, Orchestrator};

const TRACK: &str = "https://cdn.example.com/hymns/it-is-well.mp3";

fn local_adapters(harness: &TestHarness) -> Adapters {
    let root = harness.temp_path();
    Adapters {
        uploader: Arc::new(LocalMediaUploader::new(root.join("media"))),
        prober: Arc::new(FfprobeProber::new("/nonexistent/ffprobe")),
        records: Arc::new(JsonRecordCreator::new(root.join("records"))),
        fetcher: harness.fetcher.clone(),
        cache: Arc::new(FsCacheWriter::new(root.join("cache"))),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ingest_with_local_adapters() {
    let harness = TestHarness::new();
    let good = harness.write_input("Be_Thou_My_Vision.mp3", b"ID3 fake audio");
    let bad = harness.write_input("liner-notes.txt", b"not audio");
    let config = harness.config(2);
    let orchestrator =
        Orchestrator::start(&config, local_adapters(&harness), harness.store.clone()).unwrap();

    let handle = orchestrator.ingest([good, bad]).await.unwrap();
    let result = orchestrator.await_completion(&handle).await;

    // ffprobe is missing, so the good file still succeeds with the default duration.
    assert_eq!(result.succeeded, 1);
    assert_eq!(result.failed, 1);
    assert!(result.errors[0].message.starts_with("ValidationFailure: "));

    let done = result
        .jobs
        .iter()
        .find(|j| j.status == JobStatus::Done)
        .unwrap();
    let Some(JobOutput::Record { record_id, duration_secs, .. }) = &done.result else {
        panic!("expected a record, got {:?}", done.result);
    };
    assert_eq!(*duration_secs, 0);

    let record_path = harness.temp_path().join("records").join(format!("{}.json", record_id));
    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(record_path).unwrap()).unwrap();
    assert_eq!(record["title"], "Be Thou My Vision");
    assert_eq!(std::fs::read_dir(harness.temp_path().join("media")).unwrap().count(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_persists_to_sqlite_and_cache() {
    let harness = TestHarness::new();
    let db_path = harness.temp_path().join("state.db");
    let store = Arc::new(SqliteStateStore::open(&db_path).unwrap());
    let orchestrator =
        Orchestrator::start(&harness.config(1), local_adapters(&harness), store.clone()).unwrap();

    let handle = orchestrator
        .download(["https://cdn.example.com/hymns/abide-with-me.mp3"])
        .await
        .unwrap();
    let id = handle.job_ids()[0].clone();
    assert_eq!(orchestrator.await_completion(&handle).await.succeeded, 1);
    orchestrator.shutdown().await;

    let stored = store.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Done);
    assert_eq!(stored.progress, 100);
    let cached = std::fs::read(harness.temp_path().join("cache").join(format!("{}.bin", id))).unwrap();
    assert_eq!(cached, harness.fetcher.payload());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restore_requeues_interrupted_downloads() {
    let harness = TestHarness::new();
    let db_path = harness.temp_path().join("state.db");

    // State a crashed process could have left behind.
    let mut interrupted = Job::new(
        JobKind::CachedDownload,
        JobSource::remote("https://cdn.example.com/hymns/1.mp3"),
    );
    interrupted.apply(&JobEvent::Claim).unwrap();
    interrupted.apply(&JobEvent::Progress(30)).unwrap();
    interrupted.bytes_received = 30;

    let mut paused = Job::new(
        JobKind::CachedDownload,
        JobSource::remote("https://cdn.example.com/hymns/2.mp3"),
    );
    paused.apply(&JobEvent::Claim).unwrap();
    paused.apply(&JobEvent::Progress(60)).unwrap();
    paused.apply(&JobEvent::Pause).unwrap();
    paused.bytes_received = 60;

    {
        let store = SqliteStateStore::open(&db_path).unwrap();
        store.save(&interrupted).await.unwrap();
        store.save(&paused).await.unwrap();
    }

    let store = Arc::new(SqliteStateStore::open(&db_path).unwrap());
    let orchestrator =
        Orchestrator::start(&harness.config(2), local_adapters(&harness), store.clone()).unwrap();
    assert_eq!(orchestrator.restore().await.unwrap(), 1);

    let done = wait_for_job(&orchestrator, &interrupted.id, |j| j.status == JobStatus::Done).await;
    assert_eq!(done.progress, 100);

    // Paused jobs wait for the caller and restart from zero bytes.
    let still_paused = orchestrator.observe(&paused.id).unwrap();
    assert_eq!(still_paused.status, JobStatus::Paused);
    assert_eq!(still_paused.progress, 60);
    assert_eq!(still_paused.bytes_received, 0);

    orchestrator.resume(&paused.id).await.unwrap();
    wait_for_job(&orchestrator, &paused.id, |j| j.status == JobStatus::Done).await;
    assert_eq!(harness.fetcher.offsets(), vec![0, 0]);

    orchestrator.remove(&paused.id).await.unwrap();
    orchestrator.shutdown().await;

    let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![interrupted.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_paused_by_shutdown_resumes_after_restart() {
    let harness = TestHarness::new();
    let db_path = harness.temp_path().join("state.db");
    harness.fetcher.hold_at(50);

    let id = {
        let store = Arc::new(SqliteStateStore::open(&db_path).unwrap());
        let first = Orchestrator::start(&harness.config(1), local_adapters(&harness), store.clone()).unwrap();
        let handle = first.download([TRACK]).await.unwrap();
        let id = handle.job_ids()[0].clone();
        wait_for_job(&first, &id, |j| j.progress >= 50).await;
        first.shutdown().await;
        assert_eq!(store.load(&id).await.unwrap().unwrap().status, JobStatus::Paused);
        id
    };

    let store = Arc::new(SqliteStateStore::open(&db_path).unwrap());
    let second = Orchestrator::start_restored(&harness.config(1), local_adapters(&harness), store.clone())
        .await
        .unwrap();
    assert_eq!(second.observe(&id).unwrap().status, JobStatus::Paused);

    second.resume(&id).await.unwrap();
    let done = wait_for_job(&second, &id, |j| j.status == JobStatus::Done).await;
    assert_eq!(done.progress, 100);
    assert_eq!(harness.fetcher.offsets(), vec![0, 0]);
    second.shutdown().await;

    assert_eq!(store.load(&id).await.unwrap().unwrap().status, JobStatus::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_deletes_snapshot_not_yet_restored() {
    let harness = TestHarness::new();
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let mut job = Job::new(
        JobKind::CachedDownload,
        JobSource::remote("https://cdn.example.com/hymns/3.mp3"),
    );
    job.apply(&JobEvent::Claim).unwrap();
    assert_eq!(job.status, JobStatus::Active(Stage::Downloading));
    store.save(&job).await.unwrap();

    let orchestrator =
        Orchestrator::start(&harness.config(1), local_adapters(&harness), store.clone()).unwrap();
    orchestrator.remove(&job.id).await.unwrap();
    assert!(store.load(&job.id).await.unwrap().is_none());

    orchestrator.shutdown().await;
}
