//! Tests for failure paths: forged and duplicate stanzas, transport and
//! storage failures, bad arguments and closed streams.

use futures::StreamExt;
use serde_json::json;
use stanza_sync::{
    DigestAuthenticator, EngineConfig, MemoryInterchange, MemoryStorage, MemoryTransport,
    ReadOptions, ReadStream, Seq, Stanza, StanzaInput, StreamEvent, StreamName, SyncEngine,
    SyncError,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn name(s: &str) -> StreamName {
    StreamName::new(s).unwrap()
}

fn post(interchange: &MemoryInterchange, text: &str) -> Stanza {
    interchange.post(StanzaInput::message(name("friend"), json!({ "text": text })))
}

async fn start(
    interchange: &MemoryInterchange,
) -> (Arc<MemoryTransport>, Arc<MemoryStorage>, Arc<SyncEngine>) {
    let transport = interchange.client();
    let storage = Arc::new(MemoryStorage::new());
    let engine = SyncEngine::start(
        EngineConfig {
            batch_size: 10,
            retry_delay_ms: 20,
            max_retry_delay_ms: 100,
            ..Default::default()
        },
        transport.clone(),
        storage.clone(),
        Arc::new(DigestAuthenticator),
    )
    .await
    .unwrap();
    (transport, storage, engine)
}

async fn next_event(stream: &mut ReadStream) -> Option<StreamEvent> {
    tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("timed out waiting for an event")
}

async fn next_stanza(stream: &mut ReadStream) -> Stanza {
    loop {
        match next_event(stream).await {
            Some(StreamEvent::Stanza(stanza)) => return stanza,
            Some(StreamEvent::CaughtUp) => continue,
            other => panic!("unexpected {:?}", other),
        }
    }
}

async fn read_through_catch_up(engine: &SyncEngine, count: u64) -> ReadStream {
    let mut stream = engine
        .create_read_stream(ReadOptions::stream(name("friend")).from_seq(1))
        .unwrap();
    for seq in 1..=count {
        assert_eq!(next_stanza(&mut stream).await.seq, Seq(seq));
    }
    assert_eq!(next_event(&mut stream).await, Some(StreamEvent::CaughtUp));
    stream
}

// --- Authentication ---

#[tokio::test]
async fn test_forged_push_is_never_delivered() {
    let interchange = MemoryInterchange::new();
    let first = post(&interchange, "one");
    let (_transport, storage, engine) = start(&interchange).await;
    let mut stream = read_through_catch_up(&engine, 1).await;

    let mut forged = first.clone();
    forged.seq = Seq(2);
    forged.prev_seq = Seq(1);
    forged.payload = json!({ "text": "forged" });
    interchange.push_raw(forged);

    post(&interchange, "two");
    let delivered = next_stanza(&mut stream).await;
    assert_eq!(delivered.seq, Seq(2));
    assert_eq!(delivered.payload["text"], "two");
    assert_eq!(storage.stanza_count(), 2);
}

#[tokio::test]
async fn test_duplicate_pushes_are_discarded() {
    let interchange = MemoryInterchange::new();
    let first = post(&interchange, "one");
    let (_transport, _storage, engine) = start(&interchange).await;
    let mut stream = read_through_catch_up(&engine, 1).await;

    interchange.push_raw(first.clone());
    interchange.push_raw(first);
    post(&interchange, "two");

    assert_eq!(next_stanza(&mut stream).await.seq, Seq(2));
}

#[tokio::test]
async fn test_out_of_order_pushes_stay_ordered() {
    let interchange = MemoryInterchange::new();
    post(&interchange, "one");
    let (transport, _storage, engine) = start(&interchange).await;
    let mut stream = read_through_catch_up(&engine, 1).await;

    // Posted while deaf to pushes, then pushed newest first.
    transport.disconnect();
    let two = post(&interchange, "two");
    let three = post(&interchange, "three");
    transport.reconnect();
    interchange.push_raw(three);
    interchange.push_raw(two);

    assert_eq!(next_stanza(&mut stream).await.seq, Seq(2));
    assert_eq!(next_stanza(&mut stream).await.seq, Seq(3));
}

// --- Transport and storage failures ---

#[tokio::test]
async fn test_catch_up_survives_transport_failures() {
    let interchange = MemoryInterchange::new();
    post(&interchange, "one");
    let (transport, _storage, engine) = start(&interchange).await;
    transport.set_fail_requests(true);

    let mut stream = engine
        .create_read_stream(ReadOptions::stream(name("friend")).from_seq(1))
        .unwrap();
    let healer = transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        healer.set_fail_requests(false);
    });

    assert_eq!(next_stanza(&mut stream).await.seq, Seq(1));
    assert!(transport.request_count() >= 2);
}

#[tokio::test]
async fn test_checkpoint_failure_surfaces_before_event() {
    let interchange = MemoryInterchange::new();
    post(&interchange, "one");
    let (_transport, storage, engine) = start(&interchange).await;

    let stream = engine
        .create_read_stream(ReadOptions::stream(name("friend")).from_seq(1))
        .unwrap();
    let mut piped = engine.create_checkpoint_stream("k").unwrap().pipe(stream);

    // Let the stanza land in storage before writes start failing.
    engine
        .fetcher()
        .fetch_stanzas(&name("friend"), Seq(1), 10)
        .await
        .unwrap();
    storage.set_fail_writes(true);

    let first = tokio::time::timeout(WAIT, piped.next()).await.unwrap();
    assert!(matches!(first, Some(Err(SyncError::Storage(_)))));
    let second = tokio::time::timeout(WAIT, piped.next()).await.unwrap();
    assert!(matches!(second, Some(Ok(StreamEvent::Stanza(_)))));
}

// --- Arguments and lifecycle ---

#[tokio::test]
async fn test_invalid_options_fail_at_creation() {
    let interchange = MemoryInterchange::new();
    let (_transport, _storage, engine) = start(&interchange).await;

    let batched_feed = engine.create_read_stream(ReadOptions::all().batched(5));
    assert!(matches!(batched_feed, Err(SyncError::InvalidArgument(_))));

    let commit_without_key =
        engine.create_read_stream(ReadOptions::stream(name("friend")).auto_commit());
    assert!(matches!(commit_without_key, Err(SyncError::InvalidArgument(_))));

    assert!(matches!(
        engine.create_checkpoint_stream(""),
        Err(SyncError::InvalidArgument(_))
    ));
    assert!(StreamName::new("no spaces").is_err());
}

#[tokio::test]
async fn test_close_discards_in_flight_fetch() {
    let interchange = MemoryInterchange::new();
    post(&interchange, "one");
    interchange.set_latency(&name("friend"), Duration::from_millis(200));
    let (_transport, _storage, engine) = start(&interchange).await;

    let mut stream = engine
        .create_read_stream(ReadOptions::stream(name("friend")).from_seq(1))
        .unwrap();
    let early = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
    assert!(early.is_err());

    stream.close();
    stream.close();
    assert_eq!(next_event(&mut stream).await, None);
}

#[tokio::test]
async fn test_closed_engine_refuses_work() {
    let interchange = MemoryInterchange::new();
    let (_transport, _storage, engine) = start(&interchange).await;
    let mut feed = engine.create_read_stream(ReadOptions::all()).unwrap();

    engine.close();
    engine.close();

    assert!(engine.is_closed());
    assert!(matches!(
        engine.create_read_stream(ReadOptions::stream(name("friend"))),
        Err(SyncError::Closed)
    ));
    assert!(matches!(engine.create_checkpoint_stream("k"), Err(SyncError::Closed)));
    assert_eq!(next_event(&mut feed).await, None);
}

#[tokio::test]
async fn test_engine_close_ends_single_streams() {
    let interchange = MemoryInterchange::new();
    post(&interchange, "one");
    let (_transport, _storage, engine) = start(&interchange).await;
    let mut live = read_through_catch_up(&engine, 1).await;
    let mut pending = engine
        .create_read_stream(ReadOptions::stream(name("friend")).from_now())
        .unwrap();
    assert_eq!(next_event(&mut pending).await, Some(StreamEvent::CaughtUp));

    engine.close();

    assert_eq!(next_event(&mut live).await, None);
    assert_eq!(next_event(&mut pending).await, None);
}
