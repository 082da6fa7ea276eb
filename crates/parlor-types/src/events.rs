use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, PresenceRecord};

/// Events delivered over the realtime bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RoomEvent {
    /// A new message row was persisted
    MessageInsert { message: Message },

    /// A receiver acknowledged everything addressed to them in a room
    MessageRead { room_id: String, reader_id: Uuid },

    /// A sender removed one of their own messages
    MessageDelete { room_id: String, message_id: Uuid },

    /// A user attached to the presence channel
    PresenceJoin { record: PresenceRecord },

    /// A user detached from the presence channel
    PresenceLeave { user_id: Uuid },

    /// Full membership snapshot; replaces a tracker's local set wholesale
    PresenceSync { online: Vec<PresenceRecord> },
}

impl RoomEvent {
    /// Returns the room id if this event is scoped to a single room.
    /// Events that return `None` are global and reach every subscriber.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::MessageInsert { message } => Some(&message.room_id),
            Self::MessageRead { room_id, .. } => Some(room_id),
            Self::MessageDelete { room_id, .. } => Some(room_id),
            // Presence events are global
            _ => None,
        }
    }
}
