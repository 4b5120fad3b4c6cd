//! Single-threaded sequencer state machine.
//!
//! `SequencerEngine` owns the global counter, the per-stream tails, the trim
//! mark and the conflict cache. Every method runs to completion on `&mut self`
//! so no caller can observe a half-applied mutation; the executor provides
//! the serialization when the engine is shared.

pub mod counter;
pub mod resolver;
pub mod tails;


use crate::cache::ConflictCache;
use crate::config::SequencerConfig;
use crate::error::SeqlogError;
use crate::token::{
    ConflictKey, NON_ADDRESS, StreamId, Token, TokenResponse, TxResolutionInfo,
};
use counter::GlobalCounter;
use resolver::Verdict;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tails::StreamTailTracker;
use tracing::{debug, info, warn};

/// Consistent view of the values that gate certification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Watermarks {
    pub epoch: u64,
    pub global_tail: u64,
    pub max_conflict_wildcard: u64,
    pub max_conflict_new_sequencer: u64,
    pub trim_mark: u64,
    pub cache_size: usize,
}

/// State reported by the log when a sequencer takes over as primary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerBootstrap {
    pub epoch: u64,
    pub global_tail: u64,
    #[serde(default)]
    pub stream_tails: HashMap<StreamId, u64>,
}

#[derive(Debug)]
pub struct SequencerEngine {
    epoch: u64,
    counter: GlobalCounter,
    tails: StreamTailTracker,
    cache: ConflictCache,
    trim_mark: u64,
    max_tokens_per_request: u64,
}

impl SequencerEngine {
    pub fn new(config: &SequencerConfig) -> Result<Self, SeqlogError> {
        config.validate()?;
        Ok(Self {
            epoch: config.initial_epoch,
            counter: GlobalCounter::default(),
            tails: StreamTailTracker::default(),
            cache: ConflictCache::new(config.conflict_cache_capacity)?,
            trim_mark: NON_ADDRESS,
            max_tokens_per_request: config.max_tokens_per_request,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn global_tail(&self) -> u64 {
        self.counter.tail()
    }

    pub fn trim_mark(&self) -> u64 {
        self.trim_mark
    }

    pub fn cache(&self) -> &ConflictCache {
        &self.cache
    }

    #[cfg(test)]
    pub(crate) fn cache_mut(&mut self) -> &mut ConflictCache {
        &mut self.cache
    }

    pub fn stream_tail(&self, stream_id: &StreamId) -> u64 {
        self.tails.tail(stream_id)
    }

    pub fn conflict_version(&self, key: &ConflictKey) -> Option<u64> {
        self.cache.get_if_present(key)
    }

    pub fn watermarks(&self) -> Watermarks {
        let cache = self.cache.watermarks();
        Watermarks {
            epoch: self.epoch,
            global_tail: self.counter.tail(),
            max_conflict_wildcard: cache.max_conflict_wildcard,
            max_conflict_new_sequencer: cache.max_conflict_new_sequencer,
            trim_mark: self.trim_mark,
            cache_size: self.cache.len(),
        }
    }

    fn tail_token(&self) -> Token {
        Token::new(self.epoch, self.counter.tail())
    }

    /// Current global tail, or the highest tail among `streams` when any are
    /// named. Never mutates state.
    pub fn query(&self, streams: &[StreamId]) -> TokenResponse {
        if streams.is_empty() {
            return TokenResponse::normal(self.tail_token());
        }
        let stream_tails = self.tails.snapshot(streams);
        let max_tail = stream_tails.values().copied().max().unwrap_or(NON_ADDRESS);
        TokenResponse {
            token: Token::new(self.epoch, max_tail),
            stream_tails,
            ..TokenResponse::default()
        }
    }

    /// Reserves one token across `streams` without conflict checking.
    pub fn next(&mut self, streams: &[StreamId]) -> Result<TokenResponse, SeqlogError> {
        self.next_tokens(streams, 1)
    }

    /// Reserves `count` consecutive tokens across `streams`. A zero count is a
    /// query.
    pub fn next_tokens(
        &mut self,
        streams: &[StreamId],
        count: u64,
    ) -> Result<TokenResponse, SeqlogError> {
        if count == 0 {
            return Ok(self.query(streams));
        }
        self.check_token_count(count)?;
        let streams: BTreeSet<StreamId> = streams.iter().copied().collect();
        let first = self.counter.issue(count)?;
        let last = self.counter.tail();
        let (backpointer_map, stream_tails) = self.record_streams(&streams, last);
        Ok(TokenResponse {
            token: Token::new(self.epoch, first),
            backpointer_map,
            stream_tails,
            ..TokenResponse::default()
        })
    }

    /// Transactional token request. Aborts come back as data inside the
    /// response; only internal faults are errors.
    pub fn next_tx(
        &mut self,
        info: &TxResolutionInfo,
        streams: &[StreamId],
    ) -> Result<TokenResponse, SeqlogError> {
        self.next_tx_tokens(info, streams, 1)
    }

    /// Transactional request reserving `count` consecutive tokens. The write
    /// set is recorded at the last reserved address.
    pub fn next_tx_tokens(
        &mut self,
        info: &TxResolutionInfo,
        streams: &[StreamId],
        count: u64,
    ) -> Result<TokenResponse, SeqlogError> {
        if count == 0 {
            return Err(SeqlogError::Validation(
                "transactional token request must reserve at least one address".into(),
            ));
        }
        self.check_token_count(count)?;
        let mut targets = info.streams.clone();
        targets.extend(streams.iter().copied());
        match self.resolve(info, &targets, count)? {
            Verdict::Commit {
                token,
                backpointer_map,
                stream_tails,
            } => Ok(TokenResponse {
                token,
                backpointer_map,
                stream_tails,
                ..TokenResponse::default()
            }),
            Verdict::Abort(abort) => Ok(abort.into_response(self.tail_token())),
        }
    }

    fn check_token_count(&self, count: u64) -> Result<(), SeqlogError> {
        if count > self.max_tokens_per_request {
            return Err(SeqlogError::Validation(format!(
                "requested {count} tokens, limit is {}",
                self.max_tokens_per_request
            )));
        }
        Ok(())
    }

    fn record_streams(
        &mut self,
        streams: &BTreeSet<StreamId>,
        last: u64,
    ) -> (HashMap<StreamId, u64>, HashMap<StreamId, u64>) {
        let mut backpointers = HashMap::with_capacity(streams.len());
        let mut tails = HashMap::with_capacity(streams.len());
        for stream in streams {
            backpointers.insert(*stream, self.tails.record(*stream, last));
            tails.insert(*stream, self.tails.tail(stream));
        }
        (backpointers, tails)
    }

    /// Applies a log trim: conflict history below `address` is folded into the
    /// wildcard and snapshots below it abort as trimmed.
    pub fn trim_cache(&mut self, address: u64) -> Result<usize, SeqlogError> {
        let evicted = self.cache.invalidate_up_to(address)?;
        self.trim_mark = self.trim_mark.max(address);
        debug!(
            address,
            evicted,
            trim_mark = self.trim_mark,
            "sequencer cache trimmed"
        );
        Ok(evicted)
    }

    pub fn on_trim(&mut self, trim_mark: u64) -> Result<usize, SeqlogError> {
        self.trim_cache(trim_mark)
    }

    /// Installs the predecessor's tail as the new-sequencer watermark. Tokens
    /// at or below `prior_tail` are never reissued.
    pub fn on_become_primary(&mut self, prior_tail: u64) -> Result<(), SeqlogError> {
        let watermark = prior_tail.max(self.counter.tail());
        if watermark != prior_tail {
            warn!(
                prior_tail,
                local_tail = self.counter.tail(),
                "local tail is ahead of reported prior tail; using local tail as watermark"
            );
        }
        self.cache.update_max_conflict_address(watermark)?;
        self.counter.advance_to(watermark);
        info!(epoch = self.epoch, watermark, "sequencer became primary");
        Ok(())
    }

    /// Resets the engine to the tails reported by the log. Within the current
    /// epoch the global tail may not move backwards, since addresses up to the
    /// local tail have already been handed out.
    pub fn bootstrap(&mut self, bootstrap: SequencerBootstrap) -> Result<(), SeqlogError> {
        if bootstrap.epoch < self.epoch {
            return Err(SeqlogError::Validation(format!(
                "bootstrap epoch {} is older than current epoch {}",
                bootstrap.epoch, self.epoch
            )));
        }
        if bootstrap.epoch == self.epoch && bootstrap.global_tail < self.counter.tail() {
            return Err(SeqlogError::Validation(format!(
                "bootstrap global tail {} is behind local tail {} in epoch {}",
                bootstrap.global_tail,
                self.counter.tail(),
                self.epoch
            )));
        }
        if let Some((stream, tail)) = bootstrap
            .stream_tails
            .iter()
            .find(|(_, tail)| **tail > bootstrap.global_tail)
        {
            return Err(SeqlogError::Validation(format!(
                "stream {stream} tail {tail} is beyond global tail {}",
                bootstrap.global_tail
            )));
        }
        let dropped = self.cache.reset_for_epoch(bootstrap.global_tail);
        self.epoch = bootstrap.epoch;
        self.counter.reset(bootstrap.global_tail);
        self.tails.reset(bootstrap.stream_tails);
        info!(
            epoch = self.epoch,
            global_tail = bootstrap.global_tail,
            streams = self.tails.len(),
            dropped,
            "sequencer bootstrapped"
        );
        Ok(())
    }

    pub fn invalidate_all(&mut self) -> usize {
        self.cache.invalidate_all()
    }

    pub fn check_invariants(&self) -> Result<(), SeqlogError> {
        self.cache.check_invariants()
    }
}
