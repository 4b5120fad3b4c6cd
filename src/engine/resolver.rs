use super::SequencerEngine;
use crate::error::SeqlogError;
use crate::token::{AbortCause, ConflictKey, StreamId, Token, TokenResponse, TxResolutionInfo};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAbort {
    pub cause: AbortCause,
    pub conflict_key: Option<ConflictKey>,
    pub conflict_stream: Option<StreamId>,
}

impl TxAbort {
    fn without_key(cause: AbortCause) -> Self {
        Self {
            cause,
            conflict_key: None,
            conflict_stream: None,
        }
    }

    fn on_key(cause: AbortCause, key: &ConflictKey) -> Self {
        Self {
            cause,
            conflict_key: Some(key.clone()),
            conflict_stream: Some(key.stream_id),
        }
    }

    /// Abort responses carry the current tail, never a fresh token.
    pub fn into_response(self, tail: Token) -> TokenResponse {
        TokenResponse {
            resp_type: self.cause.into(),
            conflict_key: self.conflict_key,
            conflict_stream: self.conflict_stream,
            token: tail,
            ..TokenResponse::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Commit {
        token: Token,
        backpointer_map: HashMap<StreamId, u64>,
        stream_tails: HashMap<StreamId, u64>,
    },
    Abort(TxAbort),
}

impl SequencerEngine {
    /// Decides whether a transaction with the given snapshot may commit.
    /// Read-only; the first failing check wins.
    pub fn certify(&self, info: &TxResolutionInfo) -> Result<(), TxAbort> {
        let snapshot = info.snapshot;
        if snapshot.epoch != self.epoch {
            return Err(TxAbort::without_key(AbortCause::NewSequencer));
        }
        if snapshot.sequence < self.cache.max_conflict_new_sequencer() {
            return Err(TxAbort::without_key(AbortCause::NewSequencer));
        }
        if snapshot.sequence < self.trim_mark {
            return Err(TxAbort::without_key(AbortCause::Trimmed));
        }
        let wildcard = self.cache.max_conflict_wildcard();
        for key in &info.read_set {
            // Evicted history can hide a newer write to this key.
            if snapshot.sequence < wildcard {
                return Err(TxAbort::on_key(AbortCause::Conflict, key));
            }
            if let Some(version) = self.cache.get_if_present(key)
                && version > snapshot.sequence
            {
                return Err(TxAbort::on_key(AbortCause::Conflict, key));
            }
        }
        Ok(())
    }

    /// Certifies the transaction and, when it may commit, reserves `count`
    /// tokens, records its write set at the last of them and advances
    /// `streams`.
    pub fn resolve(
        &mut self,
        info: &TxResolutionInfo,
        streams: &BTreeSet<StreamId>,
        count: u64,
    ) -> Result<Verdict, SeqlogError> {
        if let Err(abort) = self.certify(info) {
            debug!(
                tx_id = %info.tx_id,
                cause = abort.cause.as_str(),
                snapshot = info.snapshot.sequence,
                conflict_key = abort.conflict_key.as_ref().map(|k| k.to_string()),
                "transaction aborted"
            );
            return Ok(Verdict::Abort(abort));
        }
        let first = self.counter.issue(count)?;
        let last = self.counter.tail();
        for key in &info.write_set {
            self.cache.put(key.clone(), last)?;
        }
        let (backpointer_map, stream_tails) = self.record_streams(streams, last);
        trace!(
            tx_id = %info.tx_id,
            first,
            last,
            writes = info.write_set.len(),
            streams = streams.len(),
            "transaction committed"
        );
        Ok(Verdict::Commit {
            token: Token::new(self.epoch, first),
            backpointer_map,
            stream_tails,
        })
    }
}
