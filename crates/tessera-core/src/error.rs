use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token `{id}`: {reason}")]
    Validation { id: String, reason: String },

    #[error("token processing failed: {0}")]
    Processing(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("token store is closed")]
    StoreClosed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no async runtime available: {0}")]
    Runtime(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TokenError {
    pub(crate) fn validation(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from the durable store rather than the caller's payload.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::StoreClosed)
    }
}
