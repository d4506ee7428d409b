use crate::error::StoreRejection;
use crate::relay::test_helpers::*;
use crate::store::{MemoryStore, PutFault};
use crate::types::{Event, JobId, JobState, Source};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const QUANTUM: usize = 1024;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn chat_media(id: i32) -> Source {
    Source::ChatMedia {
        message: message(id),
    }
}

/// Wait until the job has committed bytes and is reading its source again
async fn wait_for_resume(relay: &crate::relay::Relay, id: JobId) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(job) = relay.job(id).await.unwrap()
                && job.state == JobState::Fetching
                && job.bytes_transferred > 0
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job never resumed");
}

#[tokio::test]
async fn read_failure_resumes_from_the_committed_offset() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(512));
    let data = payload(8 * QUANTUM + 100);
    proxy.add_media(message(10), "movie.mkv", data.clone());
    proxy.fail_reads(message(10), 2);

    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy.clone()).await;
    let mut events = relay.subscribe();
    let _processor = relay.start_queue_processor();

    let id = relay
        .submit(message(1), chat_media(10), "/Telegram/movie.mkv")
        .await
        .unwrap();
    wait_for_state(&relay, id, JobState::Succeeded).await;

    let object = store.object("/Telegram/movie.mkv").unwrap();
    assert_eq!(object.as_ref(), data.as_slice());
    // Resumed passes keep reporting from the committed offset
    assert_progress_within(&drain_progress(&mut events, id), object.len());

    let offsets = proxy.open_offsets(&message(10));
    assert_eq!(offsets.len(), 3, "{offsets:?}");
    assert_eq!(offsets[0], 0);
    assert!(offsets[1] > 0 && offsets[2] > offsets[1], "{offsets:?}");
    assert!(offsets.iter().all(|o| *o as usize % QUANTUM == 0));

    // Every byte was sent once
    let sent: usize = store.put_log().iter().map(|(_, len)| len).sum();
    assert_eq!(sent, data.len());
}

#[tokio::test]
async fn lost_acknowledgements_do_not_duplicate_bytes() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(QUANTUM));
    let data = payload(4 * QUANTUM);
    proxy.add_media(message(10), "a.bin", data.clone());
    store.inject_put_fault(2 * QUANTUM as u64, PutFault::LoseAck, 1);
    store.inject_put_fault(3 * QUANTUM as u64, PutFault::Drop, 2);

    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy).await;
    let _processor = relay.start_queue_processor();

    let id = relay
        .submit(message(1), chat_media(10), "/Telegram/a.bin")
        .await
        .unwrap();
    wait_for_state(&relay, id, JobState::Succeeded).await;

    assert_eq!(store.object("/Telegram/a.bin").unwrap().as_ref(), data.as_slice());
    let row = relay.db.get_job(id).await.unwrap().unwrap();
    assert!(row.attempt_count >= 3, "attempts: {}", row.attempt_count);
}

#[tokio::test]
async fn expired_session_restarts_the_upload() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(QUANTUM));
    let data = payload(5 * QUANTUM + 1);
    proxy.add_media(message(10), "a.bin", data.clone());
    store.inject_put_fault(3 * QUANTUM as u64, PutFault::Expire, 1);

    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy.clone()).await;
    let mut events = relay.subscribe();
    let _processor = relay.start_queue_processor();

    let id = relay
        .submit(message(1), chat_media(10), "/Telegram/a.bin")
        .await
        .unwrap();
    wait_for_state(&relay, id, JobState::Succeeded).await;

    let object = store.object("/Telegram/a.bin").unwrap();
    assert_eq!(object.as_ref(), data.as_slice());
    assert_eq!(proxy.open_offsets(&message(10)), vec![0, 0]);
    // Re-sending from zero does not pull the reported progress back
    assert_progress_within(&drain_progress(&mut events, id), object.len());
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn terminal_rejection_fails_the_job_with_an_actionable_reason() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(QUANTUM));
    proxy.add_media(message(10), "a.bin", payload(3 * QUANTUM));
    store.inject_put_fault(
        QUANTUM as u64,
        PutFault::Reject(StoreRejection::QuotaExceeded("drive full".into())),
        1,
    );

    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy).await;
    let mut events = relay.subscribe();
    let _processor = relay.start_queue_processor();

    let id = relay
        .submit(message(1), chat_media(10), "/Telegram/a.bin")
        .await
        .unwrap();
    wait_for_state(&relay, id, JobState::Failed).await;

    let job = relay.job(id).await.unwrap().unwrap();
    let reason = job.error.unwrap();
    assert!(reason.contains("quota exceeded"), "{reason}");
    assert_eq!(job.bytes_transferred, QUANTUM as u64);

    // The partial upload is discarded
    assert!(store.object("/Telegram/a.bin").is_none());
    assert_eq!(store.aborted_paths(), vec!["/Telegram/a.bin".to_string()]);
    // A terminal rejection is not retried
    assert_eq!(
        store
            .put_log()
            .iter()
            .filter(|(offset, _)| *offset == QUANTUM as u64)
            .count(),
        1
    );

    let failed = loop {
        match events.recv().await.unwrap() {
            Event::Failed { id: failed, error } => break (failed, error),
            _ => continue,
        }
    };
    assert_eq!(failed.0, id);
    assert!(failed.1.contains("free up space"));
}

#[tokio::test]
async fn empty_source_fails_without_an_object() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(QUANTUM));
    proxy.add_media(message(10), "empty.txt", Vec::<u8>::new());

    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy).await;
    let _processor = relay.start_queue_processor();

    let id = relay
        .submit(message(1), chat_media(10), "/Telegram/empty.txt")
        .await
        .unwrap();
    wait_for_state(&relay, id, JobState::Failed).await;

    assert!(store.object_paths().is_empty());
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn remote_url_is_fetched_by_the_store() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(QUANTUM));
    let url = "https://files.example/archive.zip";
    store.serve_url(url, payload(3000));

    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy).await;
    let _processor = relay.start_queue_processor();

    let id = relay
        .submit(
            message(1),
            Source::RemoteUrl { url: url.into() },
            "/Telegram/archive.zip",
        )
        .await
        .unwrap();
    wait_for_state(&relay, id, JobState::Succeeded).await;

    assert_eq!(store.object("/Telegram/archive.zip").unwrap().len(), 3000);
    // Nothing went through an upload session
    assert!(store.put_log().is_empty());
}

#[tokio::test]
async fn remote_url_falls_back_to_streaming_when_the_store_cannot_fetch() {
    let server = MockServer::start().await;
    let body = payload(3 * QUANTUM + 17);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(QUANTUM));

    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy).await;
    let _processor = relay.start_queue_processor();

    let url = format!("{}/data.bin", server.uri());
    let id = relay
        .submit(message(1), Source::RemoteUrl { url }, "/Telegram/data.bin")
        .await
        .unwrap();
    wait_for_state(&relay, id, JobState::Succeeded).await;

    assert_eq!(
        store.object("/Telegram/data.bin").unwrap().as_ref(),
        body.as_slice()
    );
    assert!(!store.put_log().is_empty());
}

#[tokio::test]
async fn remote_url_streams_directly_when_delegation_is_off() {
    let server = MockServer::start().await;
    let body = payload(QUANTUM / 2);
    Mock::given(method("GET"))
        .and(path("/small.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(QUANTUM));
    let url = format!("{}/small.txt", server.uri());
    // Would succeed remotely, but must not be asked
    store.serve_url(&url, payload(1));

    let mut config = test_config(&temp_dir, QUANTUM);
    config.transfer.delegate_url_fetch = false;
    let (relay, _surface) = create_test_relay(config, store.clone(), proxy).await;
    let _processor = relay.start_queue_processor();

    let id = relay
        .submit(message(1), Source::RemoteUrl { url }, "/Telegram/small.txt")
        .await
        .unwrap();
    wait_for_state(&relay, id, JobState::Succeeded).await;

    assert_eq!(
        store.object("/Telegram/small.txt").unwrap().as_ref(),
        body.as_slice()
    );
}

#[tokio::test]
async fn shutdown_interrupts_and_restart_resumes_the_session() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(512));
    let data = payload(6 * QUANTUM + 10);
    proxy.add_media(message(10), "a.bin", data.clone());
    proxy.fail_reads(message(10), 1);
    proxy.hold_resumes();

    let (relay, _surface) = create_test_relay(
        test_config(&temp_dir, QUANTUM),
        store.clone(),
        proxy.clone(),
    )
    .await;
    let _processor = relay.start_queue_processor();

    let id = relay
        .submit(message(1), chat_media(10), "/Telegram/a.bin")
        .await
        .unwrap();
    wait_for_resume(&relay, id).await;
    let committed = relay.job(id).await.unwrap().unwrap().bytes_transferred;

    relay.shutdown().await.unwrap();

    let row = relay.db.get_job(id).await.unwrap().unwrap();
    assert_eq!(JobState::from_i32(row.state), JobState::Queued);
    assert!(row.upload_session_token.is_some());
    assert_eq!(store.open_sessions(), 1);
    drop(relay);

    proxy.release();
    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy.clone()).await;
    assert_eq!(relay.queued_jobs().await, vec![id]);
    let _processor = relay.start_queue_processor();
    wait_for_state(&relay, id, JobState::Succeeded).await;

    assert_eq!(store.object("/Telegram/a.bin").unwrap().as_ref(), data.as_slice());
    assert_eq!(proxy.open_offsets(&message(10)).last(), Some(&committed));
    assert!(store.aborted_paths().is_empty());
}

#[tokio::test]
async fn canceling_mid_upload_discards_the_session() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(512));
    proxy.add_media(message(10), "a.bin", payload(6 * QUANTUM));
    proxy.fail_reads(message(10), 1);
    proxy.hold_resumes();

    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy).await;
    let _processor = relay.start_queue_processor();

    let id = relay
        .submit(message(1), chat_media(10), "/Telegram/a.bin")
        .await
        .unwrap();
    wait_for_resume(&relay, id).await;

    relay.cancel(id).await.unwrap();
    wait_for_state(&relay, id, JobState::Canceled).await;
    wait_until_idle(&relay).await;

    assert!(store.object_paths().is_empty());
    assert_eq!(store.aborted_paths(), vec!["/Telegram/a.bin".to_string()]);
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn undecodable_job_is_dropped_on_restart() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(QUANTUM));
    let proxy = Arc::new(FakeProxy::new(QUANTUM));
    proxy.add_media(message(10), "a.bin", payload(QUANTUM));
    proxy.add_media(message(11), "b.bin", payload(QUANTUM));

    let (relay, _surface) = create_test_relay(
        test_config(&temp_dir, QUANTUM),
        store.clone(),
        proxy.clone(),
    )
    .await;
    let broken = relay
        .submit(message(1), chat_media(10), "/Telegram/a.bin")
        .await
        .unwrap();
    let intact = relay
        .submit(message(2), chat_media(11), "/Telegram/b.bin")
        .await
        .unwrap();
    sqlx::query("UPDATE jobs SET source = 'not json' WHERE id = ?")
        .bind(broken.0)
        .execute(relay.db.pool())
        .await
        .unwrap();
    drop(relay);

    let (relay, _surface) =
        create_test_relay(test_config(&temp_dir, QUANTUM), store.clone(), proxy).await;
    assert_eq!(relay.queued_jobs().await, vec![intact]);

    let dropped = relay.job(broken).await.unwrap().unwrap();
    assert_eq!(dropped.state, JobState::Failed);
    assert!(dropped.error.unwrap().contains("dropped"));

    let _processor = relay.start_queue_processor();
    wait_for_state(&relay, intact, JobState::Succeeded).await;
    assert_eq!(store.object_paths(), vec!["/Telegram/b.bin".to_string()]);
}
