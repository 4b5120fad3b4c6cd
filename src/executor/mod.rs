//! Serialized request loop around [`SequencerEngine`].
//!
//! One tokio task owns the engine and drains a bounded channel in arrival
//! order, so token issuance, cache insertion and watermark updates of one
//! request are never interleaved with another. Watermarks are republished
//! after every request for readers that must not queue behind writers.

use crate::config::SequencerConfig;
use crate::engine::{SequencerBootstrap, SequencerEngine, Watermarks};
use crate::error::SeqlogError;
use crate::token::{AbortCause, ConflictKey, StreamId, TokenResponse, TxResolutionInfo};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[cfg(test)]
mod tests;

type Reply<T> = oneshot::Sender<Result<T, SeqlogError>>;

enum SequencerRequest {
    Query {
        streams: Vec<StreamId>,
        reply: Reply<TokenResponse>,
    },
    Next {
        streams: Vec<StreamId>,
        count: u64,
        reply: Reply<TokenResponse>,
    },
    NextTx {
        info: Box<TxResolutionInfo>,
        streams: Vec<StreamId>,
        count: u64,
        reply: Reply<TokenResponse>,
    },
    TrimCache {
        address: u64,
        reply: Reply<usize>,
    },
    BecomePrimary {
        prior_tail: u64,
        reply: Reply<()>,
    },
    Bootstrap {
        bootstrap: SequencerBootstrap,
        reply: Reply<()>,
    },
    InvalidateAll {
        reply: Reply<usize>,
    },
    ConflictVersion {
        key: ConflictKey,
        reply: Reply<Option<u64>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl SequencerRequest {
    fn reject(self, err: SeqlogError) {
        match self {
            SequencerRequest::Query { reply, .. }
            | SequencerRequest::Next { reply, .. }
            | SequencerRequest::NextTx { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SequencerRequest::TrimCache { reply, .. }
            | SequencerRequest::InvalidateAll { reply } => {
                let _ = reply.send(Err(err));
            }
            SequencerRequest::BecomePrimary { reply, .. }
            | SequencerRequest::Bootstrap { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SequencerRequest::ConflictVersion { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SequencerRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

#[derive(Debug, Default)]
struct ExecutorTelemetry {
    inflight_requests: AtomicUsize,
    requests_total: AtomicU64,
    request_errors: AtomicU64,
    queries_total: AtomicU64,
    tokens_issued: AtomicU64,
    tx_commits: AtomicU64,
    tx_aborts_conflict: AtomicU64,
    tx_aborts_new_sequencer: AtomicU64,
    tx_aborts_trimmed: AtomicU64,
    trims_total: AtomicU64,
    trim_evictions: AtomicU64,
    cache_resets: AtomicU64,
}

impl ExecutorTelemetry {
    fn observe_response(&self, resp: &TokenResponse, issued: u64) {
        match resp.abort_cause() {
            None => {
                self.tokens_issued.fetch_add(issued, Ordering::Relaxed);
            }
            Some(AbortCause::Conflict) => {
                self.tx_aborts_conflict.fetch_add(1, Ordering::Relaxed);
            }
            Some(AbortCause::NewSequencer) => {
                self.tx_aborts_new_sequencer.fetch_add(1, Ordering::Relaxed);
            }
            Some(AbortCause::Trimmed) => {
                self.tx_aborts_trimmed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequencerMetrics {
    pub inflight_requests: usize,
    pub requests_total: u64,
    pub request_errors: u64,
    pub queries_total: u64,
    pub tokens_issued: u64,
    pub tx_commits: u64,
    pub tx_aborts_conflict: u64,
    pub tx_aborts_new_sequencer: u64,
    pub tx_aborts_trimmed: u64,
    pub trims_total: u64,
    pub trim_evictions: u64,
    pub cache_resets: u64,
    pub halted: bool,
}

impl SequencerMetrics {
    pub fn tx_aborts(&self) -> u64 {
        self.tx_aborts_conflict + self.tx_aborts_new_sequencer + self.tx_aborts_trimmed
    }
}

struct ExecutorLoop {
    engine: SequencerEngine,
    verify_invariants: bool,
    telemetry: Arc<ExecutorTelemetry>,
    watermarks: Arc<RwLock<Watermarks>>,
    halted: Arc<RwLock<Option<SeqlogError>>>,
}

impl ExecutorLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<SequencerRequest>) {
        while let Some(req) = rx.recv().await {
            self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
            if let SequencerRequest::Shutdown { reply } = req {
                self.settle();
                info!("sequencer executor shutting down");
                let _ = reply.send(());
                break;
            }
            let halted = self.halted.read().clone();
            match halted {
                Some(cause) => {
                    self.telemetry.request_errors.fetch_add(1, Ordering::Relaxed);
                    self.settle();
                    req.reject(SeqlogError::unavailable(format!("sequencer halted: {cause}")));
                }
                None => self.handle(req),
            }
        }

        rx.close();
        while let Some(req) = rx.recv().await {
            self.telemetry
                .inflight_requests
                .fetch_sub(1, Ordering::Relaxed);
            req.reject(SeqlogError::unavailable("sequencer executor stopped"));
        }
    }

    /// Publishes the post-request watermarks and retires the request before
    /// its reply is sent, so a caller never observes older values.
    fn settle(&self) {
        *self.watermarks.write() = self.engine.watermarks();
        self.telemetry
            .inflight_requests
            .fetch_sub(1, Ordering::Relaxed);
    }

    fn handle(&mut self, req: SequencerRequest) {
        match req {
            SequencerRequest::Query { streams, reply } => {
                self.telemetry.queries_total.fetch_add(1, Ordering::Relaxed);
                let resp = self.engine.query(&streams);
                self.settle();
                let _ = reply.send(Ok(resp));
            }
            SequencerRequest::Next {
                streams,
                count,
                reply,
            } => {
                let result = self.engine.next_tokens(&streams, count);
                if let Ok(resp) = &result {
                    self.telemetry.observe_response(resp, count);
                }
                let result = self.finish(result, count > 0);
                self.settle();
                let _ = reply.send(result);
            }
            SequencerRequest::NextTx {
                info,
                streams,
                count,
                reply,
            } => {
                let result = self.engine.next_tx_tokens(&info, &streams, count);
                if let Ok(resp) = &result {
                    self.telemetry.observe_response(resp, count);
                    if !resp.is_abort() {
                        self.telemetry.tx_commits.fetch_add(1, Ordering::Relaxed);
                    }
                }
                let result = self.finish(result, true);
                self.settle();
                let _ = reply.send(result);
            }
            SequencerRequest::TrimCache { address, reply } => {
                let result = self.engine.trim_cache(address);
                if let Ok(evicted) = &result {
                    self.telemetry.trims_total.fetch_add(1, Ordering::Relaxed);
                    self.telemetry
                        .trim_evictions
                        .fetch_add(*evicted as u64, Ordering::Relaxed);
                }
                let result = self.finish(result, true);
                self.settle();
                let _ = reply.send(result);
            }
            SequencerRequest::BecomePrimary { prior_tail, reply } => {
                let result = self.engine.on_become_primary(prior_tail);
                let result = self.finish(result, true);
                self.settle();
                let _ = reply.send(result);
            }
            SequencerRequest::Bootstrap { bootstrap, reply } => {
                let result = self.engine.bootstrap(bootstrap);
                if result.is_ok() {
                    self.telemetry.cache_resets.fetch_add(1, Ordering::Relaxed);
                }
                let result = self.finish(result, true);
                self.settle();
                let _ = reply.send(result);
            }
            SequencerRequest::InvalidateAll { reply } => {
                let dropped = self.engine.invalidate_all();
                self.telemetry.cache_resets.fetch_add(1, Ordering::Relaxed);
                let result = self.finish(Ok(dropped), true);
                self.settle();
                let _ = reply.send(result);
            }
            SequencerRequest::ConflictVersion { key, reply } => {
                let version = self.engine.conflict_version(&key);
                self.settle();
                let _ = reply.send(Ok(version));
            }
            SequencerRequest::Shutdown { reply } => {
                self.settle();
                let _ = reply.send(());
            }
        }
    }

    fn finish<T>(
        &mut self,
        result: Result<T, SeqlogError>,
        mutated: bool,
    ) -> Result<T, SeqlogError> {
        let result = match result {
            Ok(value) if mutated && self.verify_invariants => {
                self.engine.check_invariants().map(|()| value)
            }
            other => other,
        };
        if let Err(err) = &result {
            self.telemetry.request_errors.fetch_add(1, Ordering::Relaxed);
            if err.is_fatal() {
                error!(error = %err, "conflict cache integrity lost; halting sequencer");
                *self.halted.write() = Some(err.clone());
            } else {
                debug!(error = %err, "sequencer request rejected");
            }
        }
        result
    }
}

#[derive(Clone)]
pub struct SequencerExecutor {
    tx: mpsc::Sender<SequencerRequest>,
    watermarks: Arc<RwLock<Watermarks>>,
    telemetry: Arc<ExecutorTelemetry>,
    halted: Arc<RwLock<Option<SeqlogError>>>,
    background_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SequencerExecutor {
    /// Spawns the request loop. Must be called from within a tokio runtime.
    pub fn start(config: &SequencerConfig) -> Result<Self, SeqlogError> {
        let engine = SequencerEngine::new(config)?;
        Ok(Self::with_engine(engine, config))
    }

    pub fn with_engine(engine: SequencerEngine, config: &SequencerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.max_inflight_requests.max(1));
        let watermarks = Arc::new(RwLock::new(engine.watermarks()));
        let telemetry = Arc::new(ExecutorTelemetry::default());
        let halted = Arc::new(RwLock::new(None));
        let worker = ExecutorLoop {
            engine,
            verify_invariants: config.verify_invariants,
            telemetry: Arc::clone(&telemetry),
            watermarks: Arc::clone(&watermarks),
            halted: Arc::clone(&halted),
        };
        let handle = tokio::spawn(worker.run(rx));
        Self {
            tx,
            watermarks,
            telemetry,
            halted,
            background_tasks: Arc::new(Mutex::new(vec![handle])),
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SequencerRequest,
    ) -> Result<T, SeqlogError> {
        let (reply, rx) = oneshot::channel();
        self.telemetry
            .inflight_requests
            .fetch_add(1, Ordering::Relaxed);
        if self.tx.send(build(reply)).await.is_err() {
            self.telemetry
                .inflight_requests
                .fetch_sub(1, Ordering::Relaxed);
            return Err(SeqlogError::unavailable("sequencer executor stopped"));
        }
        rx.await
            .map_err(|_| SeqlogError::unavailable("sequencer executor dropped the request"))?
    }

    pub async fn query(&self, streams: Vec<StreamId>) -> Result<TokenResponse, SeqlogError> {
        self.call(|reply| SequencerRequest::Query { streams, reply })
            .await
    }

    pub async fn next_tokens(
        &self,
        streams: Vec<StreamId>,
        count: u64,
    ) -> Result<TokenResponse, SeqlogError> {
        self.call(|reply| SequencerRequest::Next {
            streams,
            count,
            reply,
        })
        .await
    }

    pub async fn next_tx(
        &self,
        info: TxResolutionInfo,
        streams: Vec<StreamId>,
        count: u64,
    ) -> Result<TokenResponse, SeqlogError> {
        self.call(|reply| SequencerRequest::NextTx {
            info: Box::new(info),
            streams,
            count,
            reply,
        })
        .await
    }

    pub async fn trim_cache(&self, address: u64) -> Result<usize, SeqlogError> {
        self.call(|reply| SequencerRequest::TrimCache { address, reply })
            .await
    }

    pub async fn on_become_primary(&self, prior_tail: u64) -> Result<(), SeqlogError> {
        self.call(|reply| SequencerRequest::BecomePrimary { prior_tail, reply })
            .await
    }

    pub async fn bootstrap(&self, bootstrap: SequencerBootstrap) -> Result<(), SeqlogError> {
        self.call(|reply| SequencerRequest::Bootstrap { bootstrap, reply })
            .await
    }

    pub async fn invalidate_all(&self) -> Result<usize, SeqlogError> {
        self.call(|reply| SequencerRequest::InvalidateAll { reply })
            .await
    }

    pub async fn conflict_version(&self, key: ConflictKey) -> Result<Option<u64>, SeqlogError> {
        self.call(|reply| SequencerRequest::ConflictVersion { key, reply })
            .await
    }

    /// Watermarks as of the last completed request. Never waits on the queue.
    pub fn watermarks(&self) -> Watermarks {
        *self.watermarks.read()
    }

    pub fn halted(&self) -> Option<SeqlogError> {
        self.halted.read().clone()
    }

    pub fn metrics(&self) -> SequencerMetrics {
        let t = &self.telemetry;
        SequencerMetrics {
            inflight_requests: t.inflight_requests.load(Ordering::Relaxed),
            requests_total: t.requests_total.load(Ordering::Relaxed),
            request_errors: t.request_errors.load(Ordering::Relaxed),
            queries_total: t.queries_total.load(Ordering::Relaxed),
            tokens_issued: t.tokens_issued.load(Ordering::Relaxed),
            tx_commits: t.tx_commits.load(Ordering::Relaxed),
            tx_aborts_conflict: t.tx_aborts_conflict.load(Ordering::Relaxed),
            tx_aborts_new_sequencer: t.tx_aborts_new_sequencer.load(Ordering::Relaxed),
            tx_aborts_trimmed: t.tx_aborts_trimmed.load(Ordering::Relaxed),
            trims_total: t.trims_total.load(Ordering::Relaxed),
            trim_evictions: t.trim_evictions.load(Ordering::Relaxed),
            cache_resets: t.cache_resets.load(Ordering::Relaxed),
            halted: self.halted.read().is_some(),
        }
    }

    /// Stops the request loop after the requests already queued ahead of the
    /// shutdown marker. Later requests fail with `Unavailable`.
    pub async fn shutdown(&self) -> Result<(), SeqlogError> {
        let (reply, rx) = oneshot::channel();
        self.telemetry
            .inflight_requests
            .fetch_add(1, Ordering::Relaxed);
        if self
            .tx
            .send(SequencerRequest::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        } else {
            self.telemetry
                .inflight_requests
                .fetch_sub(1, Ordering::Relaxed);
        }
        let handles: Vec<JoinHandle<()>> = self.background_tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
