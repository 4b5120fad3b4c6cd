use seqlog::cache::ConflictCache;
use seqlog::config::SequencerConfig;
use seqlog::token::{ConflictKey, TxResolutionInfo};
use seqlog::{AbortCause, SequencerInstance, Token, TokenType};
use uuid::Uuid;

fn key(n: u8) -> ConflictKey {
    ConflictKey::new(Uuid::from_u128(0x5eed_0000 + n as u128), vec![n, n])
}

fn open(capacity: usize) -> SequencerInstance {
    SequencerInstance::open(SequencerConfig::development().with_cache_capacity(capacity))
        .expect("open sequencer")
}

/// Commits a blind write of `k` at the next address and returns it.
async fn write(seq: &SequencerInstance, k: ConflictKey) -> u64 {
    let tail = seq.query(&[]).await.expect("query").token;
    let resp = seq
        .next_tx(TxResolutionInfo::new(tail).write(k), &[])
        .await
        .expect("next_tx");
    assert_eq!(resp.resp_type, TokenType::Normal);
    resp.sequence()
}

async fn advance_to(seq: &SequencerInstance, tail: u64) {
    let current = seq.query(&[]).await.expect("query").sequence();
    if tail > current + 1 {
        seq.next_tokens(&[], tail - current - 1).await.expect("advance");
    }
}

#[test]
fn scenario_a_full_cache_evicts_lowest_version() {
    let mut cache = ConflictCache::new(2).expect("cache");
    cache.put(key(1), 10).expect("put");
    cache.put(key(2), 20).expect("put");
    cache.put(key(3), 30).expect("put");

    assert_eq!(cache.get_if_present(&key(1)), None);
    assert_eq!(cache.max_conflict_wildcard(), 10);
    assert_eq!(cache.len(), 2);
}

#[test]
fn scenario_c_invalidate_all_uses_running_max() {
    let mut cache = ConflictCache::new(2).expect("cache");
    cache.put(key(1), 10).expect("put");
    cache.put(key(2), 20).expect("put");
    cache.put(key(3), 30).expect("put");
    cache.invalidate_all();

    assert!(cache.is_empty());
    assert_eq!(cache.max_conflict_wildcard(), 30);
}

#[tokio::test]
async fn scenario_b_snapshot_below_wildcard_aborts_reader_of_evicted_key() {
    let seq = open(2);
    advance_to(&seq, 10).await;
    assert_eq!(write(&seq, key(1)).await, 10);
    advance_to(&seq, 20).await;
    assert_eq!(write(&seq, key(2)).await, 20);
    advance_to(&seq, 30).await;
    assert_eq!(write(&seq, key(3)).await, 30);

    assert_eq!(seq.conflict_version(&key(1)).await.expect("lookup"), None);
    assert_eq!(seq.watermarks().max_conflict_wildcard, 10);

    let resp = seq
        .next_tx(TxResolutionInfo::new(Token::new(0, 5)).read(key(1)), &[])
        .await
        .expect("next_tx");
    assert_eq!(resp.abort_cause(), Some(AbortCause::Conflict));
    assert_eq!(resp.token, Token::new(0, 30));
    seq.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn scenario_d_commit_records_write_set_at_issued_token() {
    let seq = open(16);
    seq.next_tokens(&[], 30).await.expect("advance");
    assert_eq!(seq.query(&[]).await.expect("query").sequence(), 30);

    let info = TxResolutionInfo::new(Token::new(0, 30))
        .read(key(9))
        .write(key(4));
    let resp = seq.next_tx(info, &[]).await.expect("next_tx");
    assert_eq!(resp.resp_type, TokenType::Normal);
    assert_eq!(resp.sequence(), 31);
    assert_eq!(seq.conflict_version(&key(4)).await.expect("lookup"), Some(31));
}

#[tokio::test]
async fn scenario_e_new_sequencer_watermark_aborts_older_snapshots() {
    let seq = open(16);
    write(&seq, key(1)).await;
    seq.on_become_primary(100).await.expect("election");

    for info in [
        TxResolutionInfo::new(Token::new(0, 50)),
        TxResolutionInfo::new(Token::new(0, 50)).read(key(1)),
        TxResolutionInfo::new(Token::new(0, 50)).read(key(2)).write(key(3)),
    ] {
        let resp = seq.next_tx(info, &[]).await.expect("next_tx");
        assert_eq!(resp.abort_cause(), Some(AbortCause::NewSequencer));
    }
    assert_eq!(seq.metrics().tx_aborts_new_sequencer, 3);
}

#[tokio::test]
async fn trim_notifications_are_idempotent() {
    let seq = open(16);
    for n in 1..=6 {
        write(&seq, key(n)).await;
    }
    seq.on_trim(4).await.expect("trim");
    let once = seq.watermarks();
    seq.trim_cache(4).await.expect("trim again");
    assert_eq!(seq.watermarks(), once);
    assert_eq!(once.cache_size, 3);
    assert_eq!(once.trim_mark, 4);
    assert_eq!(once.max_conflict_wildcard, 3);

    let resp = seq
        .next_tx(TxResolutionInfo::new(Token::new(0, 3)).read(key(6)), &[])
        .await
        .expect("next_tx");
    assert_eq!(resp.abort_cause(), Some(AbortCause::Trimmed));
}

#[tokio::test]
async fn plain_requests_leave_the_conflict_cache_alone() {
    let seq = open(4);
    let s = Uuid::from_u128(77);
    seq.next(&[s]).await.expect("next");
    seq.next(&[s]).await.expect("next");
    let q = seq.query(&[s]).await.expect("query");
    assert_eq!(q.stream_tail(&s), Some(2));
    assert_eq!(q.sequence(), 2);

    let marks = seq.watermarks();
    assert_eq!(marks.cache_size, 0);
    assert_eq!(marks.max_conflict_wildcard, 0);
    assert_eq!(seq.query(&[]).await.expect("query").sequence(), 2);
}

#[test]
fn zero_capacity_sequencer_refuses_to_start() {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let _guard = rt.enter();
    let err = SequencerInstance::open(SequencerConfig::default().with_cache_capacity(0))
        .err()
        .expect("zero capacity");
    assert_eq!(err.code_str(), "invalid_config");
}
