use thiserror::Error;
use uuid::Uuid;

use parlor_db::StoreError;
use parlor_realtime::SubscriptionError;

/// Session-level failures. None of these cross the UI boundary as a
/// panic; the view model decides what the user sees.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Rejected before any store call.
    #[error("message has no content or attachments")]
    EmptyMessage,

    #[error("no room is open")]
    NoActiveRoom,

    #[error("no failed entry with local id {0}")]
    UnknownLocalId(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("store task was cancelled")]
    TaskJoin,
}
