pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod sync_bridge;
pub mod token;

use crate::config::SequencerConfig;
use crate::engine::{SequencerBootstrap, Watermarks};
use crate::error::SeqlogError;
use crate::executor::{SequencerExecutor, SequencerMetrics};
use crate::token::{ConflictKey, StreamId, TokenResponse, TxResolutionInfo};
use tracing::info;

pub use crate::token::{AbortCause, NON_ADDRESS, Token, TokenType};

/// A running sequencer: the token and conflict-resolution authority of one
/// primary. All calls funnel through a single executor task.
#[derive(Clone)]
pub struct SequencerInstance {
    config: SequencerConfig,
    executor: SequencerExecutor,
}

impl SequencerInstance {
    /// Starts a sequencer. Must be called from within a tokio runtime.
    pub fn open(config: SequencerConfig) -> Result<Self, SeqlogError> {
        config.validate()?;
        info!(
            conflict_cache_capacity = config.conflict_cache_capacity,
            max_inflight_requests = config.max_inflight_requests,
            initial_epoch = config.initial_epoch,
            max_tokens_per_request = config.max_tokens_per_request,
            verify_invariants = config.verify_invariants,
            "opening sequencer"
        );
        let executor = SequencerExecutor::start(&config)?;
        Ok(Self { config, executor })
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Global tail, or the highest tail among `streams`. No side effects.
    pub async fn query(&self, streams: &[StreamId]) -> Result<TokenResponse, SeqlogError> {
        self.executor.query(streams.to_vec()).await
    }

    /// One token across `streams`, or on the global log when none are named.
    pub async fn next(&self, streams: &[StreamId]) -> Result<TokenResponse, SeqlogError> {
        self.executor.next_tokens(streams.to_vec(), 1).await
    }

    pub async fn next_tokens(
        &self,
        streams: &[StreamId],
        count: u64,
    ) -> Result<TokenResponse, SeqlogError> {
        self.executor.next_tokens(streams.to_vec(), count).await
    }

    /// Certifies a transaction and issues its commit token. Aborts are
    /// reported through `TokenResponse::resp_type`.
    pub async fn next_tx(
        &self,
        info: TxResolutionInfo,
        streams: &[StreamId],
    ) -> Result<TokenResponse, SeqlogError> {
        self.executor.next_tx(info, streams.to_vec(), 1).await
    }

    /// Like [`Self::next_tx`], reserving `count` consecutive tokens on commit.
    pub async fn next_tx_tokens(
        &self,
        info: TxResolutionInfo,
        streams: &[StreamId],
        count: u64,
    ) -> Result<TokenResponse, SeqlogError> {
        self.executor.next_tx(info, streams.to_vec(), count).await
    }

    pub async fn trim_cache(&self, address: u64) -> Result<(), SeqlogError> {
        self.executor.trim_cache(address).await.map(|_| ())
    }

    /// Trim notification from the log layer.
    pub async fn on_trim(&self, trim_mark: u64) -> Result<(), SeqlogError> {
        self.trim_cache(trim_mark).await
    }

    /// Election notification: `prior_tail` is the last tail known for the
    /// previous primary.
    pub async fn on_become_primary(&self, prior_tail: u64) -> Result<(), SeqlogError> {
        self.executor.on_become_primary(prior_tail).await
    }

    pub async fn bootstrap(&self, bootstrap: SequencerBootstrap) -> Result<(), SeqlogError> {
        self.executor.bootstrap(bootstrap).await
    }

    pub async fn invalidate_all(&self) -> Result<(), SeqlogError> {
        self.executor.invalidate_all().await.map(|_| ())
    }

    pub async fn conflict_version(&self, key: &ConflictKey) -> Result<Option<u64>, SeqlogError> {
        self.executor.conflict_version(key.clone()).await
    }

    pub fn watermarks(&self) -> Watermarks {
        self.executor.watermarks()
    }

    pub fn metrics(&self) -> SequencerMetrics {
        self.executor.metrics()
    }

    pub async fn shutdown(&self) -> Result<(), SeqlogError> {
        info!("shutting down sequencer");
        self.executor.shutdown().await
    }
}
