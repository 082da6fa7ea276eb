use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimal directory entry. Display name and avatar key are all this
/// subsystem may assume about a user; everything else belongs to the
/// profile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub avatar_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Attachment metadata is opaque pass-through. The storage service that
/// signs download URLs lives outside this subsystem; file contents are
/// never inspected here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub url: String,
}

/// A persisted direct message. `created_at` is assigned by the store and
/// is the authoritative ordering key. `is_read` is mutated only by the
/// receiver's read acknowledgment; content is never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: String,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    /// None only for attachments-only messages.
    pub content: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Ephemeral presence entry. Never persisted — the set of records is
/// reconstructed per session from whoever is currently attached to the
/// presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub online_at: DateTime<Utc>,
}

/// Latest activity in one room a user participates in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomActivity {
    pub room_id: String,
    pub other_user_id: Uuid,
    pub last_message: Message,
}

/// One conversation-list row: latest message plus the viewer's unread
/// count for that room. Derived, recomputed from the store on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub room_id: String,
    pub other_user_id: Uuid,
    pub last_message: Message,
    pub unread: i64,
}
