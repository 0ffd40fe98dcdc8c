use thiserror::Error;

/// Run-level failures. Only `ScoringUnavailable` is survivable: it excludes a
/// single candidate and the run carries on.
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("paper source unavailable: {0}")]
    FetchUnavailable(String),

    #[error("scoring unavailable for {id}: {reason}")]
    ScoringUnavailable { id: String, reason: String },

    #[error("scoring aborted: {0}")]
    ScoringAborted(String),

    #[error("scoring failed for all {attempted} candidates")]
    AllScoringFailed { attempted: usize },

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
}

impl DigestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }
}
