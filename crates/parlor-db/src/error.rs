use thiserror::Error;
use uuid::Uuid;

/// Store-level failures. `Persistence` covers anything the backing
/// database reports; callers must not assume a write landed when they
/// see it. `Unauthorized` is a rights rejection and must not be retried.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("attachment encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("message {message_id} does not belong to {requester}")]
    Unauthorized { message_id: Uuid, requester: Uuid },

    #[error("message {0} not found")]
    NotFound(Uuid),

    #[error("store lock poisoned")]
    LockPoisoned,
}
