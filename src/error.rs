use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqlogErrorCode {
    Validation,
    InvalidConfig,
    IntegrityError,
    Unavailable,
}

impl SeqlogErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SeqlogErrorCode::Validation => "validation",
            SeqlogErrorCode::InvalidConfig => "invalid_config",
            SeqlogErrorCode::IntegrityError => "integrity_error",
            SeqlogErrorCode::Unavailable => "unavailable",
        }
    }
}

/// Faults raised by the sequencer.
///
/// Transaction aborts are not errors; they travel inside
/// [`crate::token::TokenResponse`]. An `IntegrityError` means the conflict
/// cache structures diverged and the owning sequencer halts.
#[derive(Debug, Clone, Error)]
pub enum SeqlogError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("integrity error: {message}")]
    IntegrityError { message: String },
    #[error("sequencer unavailable: {message}")]
    Unavailable { message: String },
}

impl SeqlogError {
    pub fn code(&self) -> SeqlogErrorCode {
        match self {
            SeqlogError::Validation(_) => SeqlogErrorCode::Validation,
            SeqlogError::InvalidConfig { .. } => SeqlogErrorCode::InvalidConfig,
            SeqlogError::IntegrityError { .. } => SeqlogErrorCode::IntegrityError,
            SeqlogError::Unavailable { .. } => SeqlogErrorCode::Unavailable,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SeqlogError::IntegrityError { .. })
    }

    pub(crate) fn integrity(message: impl Into<String>) -> Self {
        SeqlogError::IntegrityError {
            message: message.into(),
        }
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        SeqlogError::Unavailable {
            message: message.into(),
        }
    }
}
