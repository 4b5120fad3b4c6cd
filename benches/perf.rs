use criterion::{Criterion, black_box, criterion_group, criterion_main};
use seqlog::SequencerInstance;
use seqlog::config::SequencerConfig;
use seqlog::engine::SequencerEngine;
use seqlog::token::{ConflictKey, StreamId, TxResolutionInfo};
use tokio::runtime::Runtime;
use uuid::Uuid;

const CACHE_CAPACITY: usize = 10_000;
const STREAMS: usize = 8;

fn streams() -> Vec<StreamId> {
    (0..STREAMS).map(|_| Uuid::new_v4()).collect()
}

fn bench_engine_hot_paths(c: &mut Criterion) {
    let config = SequencerConfig::production().with_cache_capacity(CACHE_CAPACITY);
    let streams = streams();

    c.bench_function("engine_next_single_stream", |b| {
        let mut engine = SequencerEngine::new(&config).expect("engine");
        let target = [streams[0]];
        b.iter(|| black_box(engine.next(&target).expect("next")));
    });

    c.bench_function("engine_next_tx_evicting", |b| {
        let mut engine = SequencerEngine::new(&config).expect("engine");
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let stream = streams[(counter as usize) % STREAMS];
            let info = TxResolutionInfo::new(engine.query(&[]).token)
                .read(ConflictKey::new(stream, counter.wrapping_sub(1).to_be_bytes()))
                .write(ConflictKey::new(stream, counter.to_be_bytes()))
                .stream(stream);
            black_box(engine.next_tx(&info, &[]).expect("next_tx"))
        });
    });

    c.bench_function("engine_query_all_streams", |b| {
        let mut engine = SequencerEngine::new(&config).expect("engine");
        for stream in &streams {
            engine.next(&[*stream]).expect("seed");
        }
        b.iter(|| black_box(engine.query(&streams)));
    });
}

fn bench_executor_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let config = SequencerConfig::production().with_cache_capacity(CACHE_CAPACITY);
    let seq = rt.block_on(async { SequencerInstance::open(config).expect("open") });
    let stream = Uuid::new_v4();

    c.bench_function("executor_next_round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(seq.next(&[stream]).await.expect("next"));
            });
        })
    });

    c.bench_function("executor_next_tx_round_trip", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            rt.block_on(async {
                let snapshot = seq.query(&[]).await.expect("query").token;
                let info = TxResolutionInfo::new(snapshot)
                    .write(ConflictKey::new(stream, counter.to_be_bytes()))
                    .stream(stream);
                black_box(seq.next_tx(info, &[]).await.expect("next_tx"));
            });
        })
    });

    rt.block_on(async { seq.shutdown().await.expect("shutdown") });
}

criterion_group!(benches, bench_engine_hot_paths, bench_executor_round_trip);
criterion_main!(benches);
