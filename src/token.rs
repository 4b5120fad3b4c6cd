use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Reserved address meaning "nothing written yet". The first issued token has
/// sequence 1.
pub const NON_ADDRESS: u64 = 0;

pub type StreamId = Uuid;

/// A position in the shared log, ordered by epoch first.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Token {
    pub epoch: u64,
    pub sequence: u64,
}

impl Token {
    pub fn new(epoch: u64, sequence: u64) -> Self {
        Self { epoch, sequence }
    }
}

/// Unit of conflict declared by a transaction: a stream plus an opaque
/// parameter, typically the hash of a map key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConflictKey {
    pub stream_id: StreamId,
    pub conflict_param: Vec<u8>,
}

impl ConflictKey {
    pub fn new(stream_id: StreamId, conflict_param: impl Into<Vec<u8>>) -> Self {
        Self {
            stream_id,
            conflict_param: conflict_param.into(),
        }
    }
}

impl std::fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/", self.stream_id)?;
        for b in &self.conflict_param {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AbortCause {
    /// A read key was overwritten after the snapshot, or its history was
    /// folded into the wildcard watermark.
    Conflict,
    /// The snapshot predates the current primary sequencer.
    NewSequencer,
    /// The snapshot predates the trim mark applied to the cache.
    Trimmed,
}

impl AbortCause {
    pub fn as_str(self) -> &'static str {
        match self {
            AbortCause::Conflict => "conflict",
            AbortCause::NewSequencer => "new_sequencer",
            AbortCause::Trimmed => "trimmed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TokenType {
    #[default]
    Normal,
    TxAbortConflict,
    TxAbortNewSequencer,
    TxAbortTrimmed,
}

impl TokenType {
    pub fn abort_cause(self) -> Option<AbortCause> {
        match self {
            TokenType::Normal => None,
            TokenType::TxAbortConflict => Some(AbortCause::Conflict),
            TokenType::TxAbortNewSequencer => Some(AbortCause::NewSequencer),
            TokenType::TxAbortTrimmed => Some(AbortCause::Trimmed),
        }
    }
}

impl From<AbortCause> for TokenType {
    fn from(cause: AbortCause) -> Self {
        match cause {
            AbortCause::Conflict => TokenType::TxAbortConflict,
            AbortCause::NewSequencer => TokenType::TxAbortNewSequencer,
            AbortCause::Trimmed => TokenType::TxAbortTrimmed,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub resp_type: TokenType,
    /// Key responsible for a `TxAbortConflict`, when one can be named.
    pub conflict_key: Option<ConflictKey>,
    pub conflict_stream: Option<StreamId>,
    /// The issued token, or the current tail for queries and aborts.
    pub token: Token,
    /// Per requested stream, the last address written to it before `token`.
    pub backpointer_map: HashMap<StreamId, u64>,
    pub stream_tails: HashMap<StreamId, u64>,
}

impl TokenResponse {
    pub fn normal(token: Token) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    pub fn is_abort(&self) -> bool {
        self.resp_type != TokenType::Normal
    }

    pub fn abort_cause(&self) -> Option<AbortCause> {
        self.resp_type.abort_cause()
    }

    pub fn sequence(&self) -> u64 {
        self.token.sequence
    }

    pub fn epoch(&self) -> u64 {
        self.token.epoch
    }

    pub fn stream_tail(&self, stream_id: &StreamId) -> Option<u64> {
        self.stream_tails.get(stream_id).copied()
    }

    pub fn backpointer(&self, stream_id: &StreamId) -> Option<u64> {
        self.backpointer_map.get(stream_id).copied()
    }
}

/// Conflict information a client transaction hands to the sequencer when it
/// asks for a commit token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxResolutionInfo {
    pub tx_id: Uuid,
    pub snapshot: Token,
    #[serde(default)]
    pub read_set: BTreeSet<ConflictKey>,
    #[serde(default)]
    pub write_set: BTreeSet<ConflictKey>,
    #[serde(default)]
    pub streams: BTreeSet<StreamId>,
}

impl TxResolutionInfo {
    pub fn new(snapshot: Token) -> Self {
        Self {
            tx_id: Uuid::new_v4(),
            snapshot,
            read_set: BTreeSet::new(),
            write_set: BTreeSet::new(),
            streams: BTreeSet::new(),
        }
    }

    pub fn read(mut self, key: ConflictKey) -> Self {
        self.read_set.insert(key);
        self
    }

    pub fn write(mut self, key: ConflictKey) -> Self {
        self.write_set.insert(key);
        self
    }

    pub fn stream(mut self, stream_id: StreamId) -> Self {
        self.streams.insert(stream_id);
        self
    }
}
