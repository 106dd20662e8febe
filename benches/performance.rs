//! Performance benchmarks for stanza storage and fetching.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use stanza_sync::{
    contiguous_prefix, DigestAuthenticator, ErrorSink, FileStorage, FileStorageConfig,
    MemoryInterchange, MemoryStorage, Seq, Stanza, StanzaFetcher, StanzaInput, StanzaQuery,
    Storage, StreamName,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn friend() -> StreamName {
    StreamName::new("friend").unwrap()
}

fn posted(interchange: &MemoryInterchange, count: usize) -> Vec<Stanza> {
    (0..count)
        .map(|i| interchange.post(StanzaInput::message(friend(), json!({ "i": i }))))
        .collect()
}

fn create_storage(dir: &TempDir) -> FileStorage {
    FileStorage::create(FileStorageConfig {
        path: dir.path().join("sync"),
        stanza_cache_size: 1000,
        create_if_missing: true,
        ..Default::default()
    })
    .unwrap()
}

/// Gap checking over runs of varying length
fn bench_contiguous_prefix(c: &mut Criterion) {
    let mut group = c.benchmark_group("contiguous_prefix");

    for len in [10, 100, 1000] {
        let run = posted(&MemoryInterchange::new(), len);
        group.bench_with_input(BenchmarkId::new("run_length", len), &run, |b, run| {
            b.iter(|| black_box(contiguous_prefix(run, Seq::ZERO)));
        });
    }

    group.finish();
}

/// Benchmark stanza insert on file storage
fn bench_file_insert(c: &mut Criterion) {
    let rt = runtime();
    let dir = TempDir::new().unwrap();
    let storage = create_storage(&dir);
    let interchange = MemoryInterchange::new();

    c.bench_function("file_insert", |b| {
        b.iter(|| {
            let stanza = interchange.post(StanzaInput::message(friend(), json!({"data": "test"})));
            rt.block_on(storage.insert_stanza(&stanza)).unwrap();
        });
    });
}

/// Range reads from the middle of a long stream
fn bench_file_list(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("file_list");

    for history in [100, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("history", history), &history, |b, &size| {
            let dir = TempDir::new().unwrap();
            let storage = create_storage(&dir);
            for stanza in posted(&MemoryInterchange::new(), size) {
                rt.block_on(storage.insert_stanza(&stanza)).unwrap();
            }

            let query = StanzaQuery::stream(friend())
                .from_seq(Seq(size as u64 / 2))
                .limit(50);
            b.iter(|| black_box(rt.block_on(storage.list_stanzas(&query)).unwrap()));
        });
    }

    group.finish();
}

/// Fetches served entirely from local storage
fn bench_fetch_local(c: &mut Criterion) {
    let rt = runtime();
    let interchange = MemoryInterchange::new();
    let storage = Arc::new(MemoryStorage::new());
    for stanza in posted(&interchange, 1000) {
        rt.block_on(storage.insert_stanza(&stanza)).unwrap();
    }
    let fetcher = StanzaFetcher::new(
        storage,
        interchange.client(),
        Arc::new(DigestAuthenticator),
        64,
        ErrorSink::default(),
    );

    c.bench_function("fetch_local_100", |b| {
        b.iter(|| {
            black_box(
                rt.block_on(fetcher.fetch_stanzas(&friend(), Seq(400), 100))
                    .unwrap(),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_contiguous_prefix,
    bench_file_insert,
    bench_file_list,
    bench_fetch_local,
);

criterion_main!(benches);
