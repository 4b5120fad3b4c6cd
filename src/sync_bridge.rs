use crate::SequencerInstance;
use crate::engine::{SequencerBootstrap, Watermarks};
use crate::error::SeqlogError;
use crate::executor::SequencerMetrics;
use crate::token::{ConflictKey, StreamId, TokenResponse, TxResolutionInfo};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

pub fn block_on_seqlog<F, T>(rt: &Handle, f: F) -> T
where
    F: Future<Output = T>,
{
    match Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| rt.block_on(f)),
        Err(_) => rt.block_on(f),
    }
}

/// Blocking facade over [`SequencerInstance`] for callers outside async code.
pub struct SequencerSync {
    inner: Arc<SequencerInstance>,
    rt: Handle,
}

impl SequencerSync {
    pub fn new(inner: Arc<SequencerInstance>, rt: Handle) -> Self {
        Self { inner, rt }
    }

    pub fn query(&self, streams: &[StreamId]) -> Result<TokenResponse, SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.query(streams))
    }

    pub fn next(&self, streams: &[StreamId]) -> Result<TokenResponse, SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.next(streams))
    }

    pub fn next_tokens(
        &self,
        streams: &[StreamId],
        count: u64,
    ) -> Result<TokenResponse, SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.next_tokens(streams, count))
    }

    pub fn next_tx(
        &self,
        info: TxResolutionInfo,
        streams: &[StreamId],
    ) -> Result<TokenResponse, SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.next_tx(info, streams))
    }

    pub fn next_tx_tokens(
        &self,
        info: TxResolutionInfo,
        streams: &[StreamId],
        count: u64,
    ) -> Result<TokenResponse, SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.next_tx_tokens(info, streams, count))
    }

    pub fn trim_cache(&self, address: u64) -> Result<(), SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.trim_cache(address))
    }

    pub fn on_trim(&self, trim_mark: u64) -> Result<(), SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.on_trim(trim_mark))
    }

    pub fn on_become_primary(&self, prior_tail: u64) -> Result<(), SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.on_become_primary(prior_tail))
    }

    pub fn bootstrap(&self, bootstrap: SequencerBootstrap) -> Result<(), SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.bootstrap(bootstrap))
    }

    pub fn invalidate_all(&self) -> Result<(), SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.invalidate_all())
    }

    pub fn conflict_version(&self, key: &ConflictKey) -> Result<Option<u64>, SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.conflict_version(key))
    }

    pub fn watermarks(&self) -> Watermarks {
        self.inner.watermarks()
    }

    pub fn metrics(&self) -> SequencerMetrics {
        self.inner.metrics()
    }

    pub fn shutdown(&self) -> Result<(), SeqlogError> {
        block_on_seqlog(&self.rt, self.inner.shutdown())
    }
}
