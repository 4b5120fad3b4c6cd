use super::SequencerExecutor;
use crate::config::SequencerConfig;
use crate::engine::SequencerEngine;
use crate::error::SeqlogErrorCode;
use crate::token::{AbortCause, ConflictKey, Token, TxResolutionInfo};
use std::collections::HashSet;
use tokio::task::JoinSet;
use uuid::Uuid;

fn key(n: u8) -> ConflictKey {
    ConflictKey::new(Uuid::from_u128(42), vec![n])
}

#[tokio::test]
async fn concurrent_next_issues_unique_consecutive_tokens() {
    let executor = SequencerExecutor::start(&SequencerConfig::development()).expect("start");
    let mut tasks = JoinSet::new();
    for i in 0..64u128 {
        let executor = executor.clone();
        tasks.spawn(async move {
            executor
                .next_tokens(vec![Uuid::from_u128(i % 4)], 1)
                .await
                .expect("next")
                .sequence()
        });
    }
    let mut seen = HashSet::new();
    while let Some(joined) = tasks.join_next().await {
        assert!(seen.insert(joined.expect("join")));
    }
    assert_eq!(seen, (1..=64).collect::<HashSet<u64>>());
    assert_eq!(executor.watermarks().global_tail, 64);
    assert_eq!(executor.metrics().tokens_issued, 64);
    assert_eq!(executor.metrics().inflight_requests, 0);
}

#[tokio::test]
async fn metrics_split_commits_and_abort_causes() {
    let executor = SequencerExecutor::start(&SequencerConfig::development()).expect("start");
    let first = TxResolutionInfo::new(Token::new(0, 0)).write(key(1));
    executor.next_tx(first, vec![], 1).await.expect("commit");
    let second = TxResolutionInfo::new(Token::new(0, 1)).write(key(1));
    executor.next_tx(second, vec![], 1).await.expect("commit");

    let stale = TxResolutionInfo::new(Token::new(0, 1)).read(key(1));
    let resp = executor.next_tx(stale, vec![], 1).await.expect("abort");
    assert_eq!(resp.abort_cause(), Some(AbortCause::Conflict));

    executor.trim_cache(2).await.expect("trim");
    let trimmed = TxResolutionInfo::new(Token::new(0, 1));
    let resp = executor.next_tx(trimmed, vec![], 1).await.expect("abort");
    assert_eq!(resp.abort_cause(), Some(AbortCause::Trimmed));

    let metrics = executor.metrics();
    assert_eq!(metrics.tx_commits, 2);
    assert_eq!(metrics.tx_aborts_conflict, 1);
    assert_eq!(metrics.tx_aborts_trimmed, 1);
    assert_eq!(metrics.tx_aborts(), 2);
    assert_eq!(metrics.trims_total, 1);
    assert_eq!(metrics.trim_evictions, 0);
    assert!(!metrics.halted);
}

#[tokio::test]
async fn watermarks_are_published_after_each_request() {
    let executor = SequencerExecutor::start(&SequencerConfig::development()).expect("start");
    executor.on_become_primary(100).await.expect("primary");
    let marks = executor.watermarks();
    assert_eq!(marks.max_conflict_new_sequencer, 100);
    assert_eq!(marks.global_tail, 100);

    executor.trim_cache(20).await.expect("trim");
    assert_eq!(executor.watermarks().trim_mark, 20);
}

#[tokio::test]
async fn integrity_failure_halts_the_executor() {
    let config = SequencerConfig::development().with_cache_capacity(1);
    let mut engine = SequencerEngine::new(&config).expect("engine");
    let info = TxResolutionInfo::new(Token::new(0, 0)).write(key(1));
    engine.next_tx(&info, &[]).expect("commit");
    engine.cache_mut().forget_eviction_order();

    let executor = SequencerExecutor::with_engine(engine, &config);
    let info = TxResolutionInfo::new(Token::new(0, 1)).write(key(2));
    let err = executor.next_tx(info, vec![], 1).await.expect_err("fatal");
    assert_eq!(err.code(), SeqlogErrorCode::IntegrityError);
    assert!(executor.halted().is_some());
    assert!(executor.metrics().halted);

    let err = executor.query(vec![]).await.expect_err("halted");
    assert_eq!(err.code(), SeqlogErrorCode::Unavailable);
}

#[tokio::test]
async fn requests_after_shutdown_are_unavailable() {
    let executor = SequencerExecutor::start(&SequencerConfig::default()).expect("start");
    executor.next_tokens(vec![], 1).await.expect("next");
    executor.shutdown().await.expect("shutdown");

    let err = executor.next_tokens(vec![], 1).await.expect_err("stopped");
    assert_eq!(err.code(), SeqlogErrorCode::Unavailable);
    executor.shutdown().await.expect("second shutdown");
}

#[tokio::test]
async fn conflict_version_reads_through_the_queue() {
    let executor = SequencerExecutor::start(&SequencerConfig::default()).expect("start");
    let info = TxResolutionInfo::new(Token::new(0, 0)).write(key(3));
    let token = executor.next_tx(info, vec![], 1).await.expect("commit").sequence();
    assert_eq!(
        executor.conflict_version(key(3)).await.expect("lookup"),
        Some(token)
    );
    assert_eq!(executor.invalidate_all().await.expect("reset"), 1);
    assert_eq!(executor.conflict_version(key(3)).await.expect("lookup"), None);
}

#[tokio::test]
async fn transactional_block_counts_every_reserved_token() {
    let executor = SequencerExecutor::start(&SequencerConfig::development()).expect("start");
    let info = TxResolutionInfo::new(Token::new(0, 0)).write(key(5));
    let resp = executor.next_tx(info, vec![], 3).await.expect("commit");
    assert_eq!(resp.sequence(), 1);
    assert_eq!(executor.conflict_version(key(5)).await.expect("lookup"), Some(3));

    let metrics = executor.metrics();
    assert_eq!(metrics.tokens_issued, 3);
    assert_eq!(metrics.tx_commits, 1);
    assert_eq!(executor.watermarks().global_tail, 3);
}
