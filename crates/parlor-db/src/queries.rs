use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;
use uuid::Uuid;

use parlor_types::models::{AttachmentMeta, Message, RoomActivity, UserProfile};
use parlor_types::room;

use crate::Database;
use crate::error::StoreError;
use crate::models::{MessageRow, UserRow};

impl Database {
    // -- Users --

    pub fn upsert_user(
        &self,
        id: Uuid,
        username: &str,
        avatar_key: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, avatar_key) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     username = excluded.username,
                     avatar_key = excluded.avatar_key",
                rusqlite::params![id.to_string(), username, avatar_key],
            )?;
            Ok(())
        })
    }

    pub fn user_profile(&self, id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        self.with_conn(|conn| {
            let row = query_user_by_id(conn, &id.to_string())?;
            Ok(row.map(profile_from_row))
        })
    }

    // -- Messages --

    /// Persists a new message and returns the stored row, including the
    /// server-assigned timestamp. The room key is derived here so callers
    /// cannot disagree about it.
    pub fn insert_message(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: Option<&str>,
        attachments: &[AttachmentMeta],
    ) -> Result<Message, StoreError> {
        let id = Uuid::new_v4();
        let room_id = room::room_id(sender_id, receiver_id);
        let attachments_json = serde_json::to_string(attachments)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, room_id, sender_id, receiver_id, content, attachments)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.to_string(),
                    room_id,
                    sender_id.to_string(),
                    receiver_id.to_string(),
                    content,
                    attachments_json,
                ],
            )?;

            // Read the row back so the caller sees the timestamp the
            // store actually assigned.
            let row = query_message_by_id(conn, &id.to_string())?
                .ok_or(StoreError::NotFound(id))?;
            Ok(message_from_row(row))
        })
    }

    /// All messages for the pair's room, oldest first. This ordering is
    /// load-bearing for rendering; rowid breaks ties between rows that
    /// share a timestamp.
    pub fn room_history(&self, a: Uuid, b: Uuid) -> Result<Vec<Message>, StoreError> {
        let room_id = room::room_id(a, b);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, sender_id, receiver_id, content, attachments, is_read, created_at
                 FROM messages
                 WHERE room_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
            )?;

            let rows = stmt
                .query_map([&room_id], map_message_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows.into_iter().map(message_from_row).collect())
        })
    }

    /// Marks everything addressed to `reader` in the room as read.
    /// Idempotent; returns the number of rows that actually flipped so
    /// callers can skip downstream invalidation when nothing changed.
    pub fn mark_room_read(&self, room_id: &str, reader_id: Uuid) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE room_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                rusqlite::params![room_id, reader_id.to_string()],
            )?;
            Ok(n)
        })
    }

    /// Deletes a message, but only for its sender. Returns the room the
    /// message belonged to so callers can notify that room.
    pub fn delete_message(
        &self,
        message_id: Uuid,
        requester_id: Uuid,
    ) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT sender_id, room_id FROM messages WHERE id = ?1",
                    [message_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (sender_id, room_id) = row.ok_or(StoreError::NotFound(message_id))?;
            if sender_id != requester_id.to_string() {
                return Err(StoreError::Unauthorized {
                    message_id,
                    requester: requester_id,
                });
            }

            conn.execute(
                "DELETE FROM messages WHERE id = ?1",
                [message_id.to_string()],
            )?;
            Ok(room_id)
        })
    }

    /// Unread messages addressed to `user_id`, across all rooms.
    pub fn unread_count(&self, user_id: Uuid) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    /// Unread messages addressed to `user_id` in one room.
    pub fn room_unread_count(&self, room_id: &str, user_id: Uuid) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE room_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                rusqlite::params![room_id, user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }

    /// One entry per room the user has sent or received in, annotated
    /// with the most recent message, newest room first.
    pub fn active_rooms(&self, user_id: Uuid) -> Result<Vec<RoomActivity>, StoreError> {
        let uid = user_id.to_string();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.room_id, m.sender_id, m.receiver_id, m.content,
                        m.attachments, m.is_read, m.created_at
                 FROM messages m
                 JOIN (
                     SELECT room_id, MAX(rowid) AS last_rowid
                     FROM messages
                     WHERE sender_id = ?1 OR receiver_id = ?1
                     GROUP BY room_id
                 ) latest ON latest.last_rowid = m.rowid
                 ORDER BY m.created_at DESC, m.rowid DESC",
            )?;

            let rows = stmt
                .query_map([&uid], map_message_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(message_from_row)
                .map(|last_message| {
                    let other_user_id = if last_message.sender_id == user_id {
                        last_message.receiver_id
                    } else {
                        last_message.sender_id
                    };
                    RoomActivity {
                        room_id: last_message.room_id.clone(),
                        other_user_id,
                        last_message,
                    }
                })
                .collect())
        })
    }
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT id, username, avatar_key, created_at FROM users WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                avatar_key: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_message_by_id(conn: &Connection, id: &str) -> Result<Option<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, room_id, sender_id, receiver_id, content, attachments, is_read, created_at
         FROM messages WHERE id = ?1",
    )?;

    let row = stmt.query_row([id], map_message_row).optional()?;
    Ok(row)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        content: row.get(4)?,
        attachments: row.get(5)?,
        is_read: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn message_from_row(row: MessageRow) -> Message {
    let attachments = serde_json::from_str(&row.attachments).unwrap_or_else(|e| {
        warn!("Corrupt attachments on message '{}': {}", row.id, e);
        Vec::new()
    });

    Message {
        id: parse_uuid(&row.id, "id", &row.id),
        sender_id: parse_uuid(&row.sender_id, "sender_id", &row.id),
        receiver_id: parse_uuid(&row.receiver_id, "receiver_id", &row.id),
        room_id: row.room_id,
        content: row.content,
        attachments,
        is_read: row.is_read != 0,
        created_at: parse_timestamp(&row.created_at, &row.id),
    }
}

fn profile_from_row(row: UserRow) -> UserProfile {
    UserProfile {
        id: parse_uuid(&row.id, "id", &row.id),
        username: row.username,
        avatar_key: row.avatar_key,
        created_at: parse_timestamp(&row.created_at, &row.id),
    }
}

fn parse_uuid(value: &str, column: &str, row_id: &str) -> Uuid {
    value.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}' on row '{}': {}", column, value, row_id, e);
        Uuid::default()
    })
}

fn parse_timestamp(value: &str, row_id: &str) -> DateTime<Utc> {
    value
        .parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite stores timestamps as "YYYY-MM-DD HH:MM:SS" without
            // timezone. Parse as naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt created_at '{}' on row '{}': {}", value, row_id, e);
            DateTime::default()
        })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, StoreError>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, StoreError> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_users() -> (Database, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        db.upsert_user(a, "alice", None).unwrap();
        db.upsert_user(b, "bob", Some("avatars/bob.png")).unwrap();
        (db, a, b)
    }

    #[test]
    fn history_preserves_send_order() {
        let (db, a, b) = store_with_users();
        db.insert_message(a, b, Some("m1"), &[]).unwrap();
        db.insert_message(b, a, Some("m2"), &[]).unwrap();
        db.insert_message(a, b, Some("m3"), &[]).unwrap();

        let history = db.room_history(a, b).unwrap();
        let contents: Vec<_> = history
            .iter()
            .map(|m| m.content.as_deref().unwrap())
            .collect();
        assert_eq!(contents, ["m1", "m2", "m3"]);

        // Same room regardless of which side asks
        assert_eq!(db.room_history(b, a).unwrap().len(), 3);
    }

    #[test]
    fn sent_messages_start_unread() {
        let (db, a, b) = store_with_users();
        let msg = db.insert_message(a, b, Some("hello"), &[]).unwrap();
        assert!(!msg.is_read);
        assert_eq!(msg.sender_id, a);
        assert_eq!(msg.receiver_id, b);
        assert_eq!(db.unread_count(b).unwrap(), 1);
        assert_eq!(db.unread_count(a).unwrap(), 0);
    }

    #[test]
    fn mark_read_is_idempotent() {
        let (db, a, b) = store_with_users();
        let room = parlor_types::room::room_id(a, b);
        db.insert_message(a, b, Some("one"), &[]).unwrap();
        db.insert_message(a, b, Some("two"), &[]).unwrap();

        assert_eq!(db.mark_room_read(&room, b).unwrap(), 2);
        assert_eq!(db.unread_count(b).unwrap(), 0);

        // Second pass flips nothing and changes nothing
        assert_eq!(db.mark_room_read(&room, b).unwrap(), 0);
        assert_eq!(db.unread_count(b).unwrap(), 0);

        assert!(db.room_history(a, b).unwrap().iter().all(|m| m.is_read));
    }

    #[test]
    fn mark_read_only_touches_the_reader() {
        let (db, a, b) = store_with_users();
        let room = parlor_types::room::room_id(a, b);
        db.insert_message(a, b, Some("to bob"), &[]).unwrap();
        db.insert_message(b, a, Some("to alice"), &[]).unwrap();

        db.mark_room_read(&room, b).unwrap();
        assert_eq!(db.unread_count(b).unwrap(), 0);
        assert_eq!(db.unread_count(a).unwrap(), 1);
    }

    #[test]
    fn delete_requires_sender() {
        let (db, a, b) = store_with_users();
        let msg = db.insert_message(a, b, Some("mine"), &[]).unwrap();

        let err = db.delete_message(msg.id, b).unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized { .. }));
        assert_eq!(db.room_history(a, b).unwrap().len(), 1);

        let room = db.delete_message(msg.id, a).unwrap();
        assert_eq!(room, msg.room_id);
        assert!(db.room_history(a, b).unwrap().is_empty());
    }

    #[test]
    fn delete_missing_message_is_not_found() {
        let (db, a, _) = store_with_users();
        let err = db.delete_message(Uuid::new_v4(), a).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn unread_count_matches_recount_across_rooms() {
        let (db, a, b) = store_with_users();
        let c = Uuid::new_v4();
        db.upsert_user(c, "carol", None).unwrap();

        db.insert_message(b, a, Some("from bob"), &[]).unwrap();
        db.insert_message(c, a, Some("from carol 1"), &[]).unwrap();
        db.insert_message(c, a, Some("from carol 2"), &[]).unwrap();

        let recount: i64 = [b, c]
            .iter()
            .map(|&other| {
                let room = parlor_types::room::room_id(a, other);
                db.room_unread_count(&room, a).unwrap()
            })
            .sum();
        assert_eq!(db.unread_count(a).unwrap(), recount);
        assert_eq!(recount, 3);
    }

    #[test]
    fn active_rooms_are_newest_first_with_latest_message() {
        let (db, a, b) = store_with_users();
        let c = Uuid::new_v4();
        db.upsert_user(c, "carol", None).unwrap();

        db.insert_message(a, b, Some("old thread"), &[]).unwrap();
        db.insert_message(c, a, Some("newer thread"), &[]).unwrap();

        let rooms = db.active_rooms(a).unwrap();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].other_user_id, c);
        assert_eq!(rooms[0].last_message.content.as_deref(), Some("newer thread"));
        assert_eq!(rooms[1].other_user_id, b);

        // A reply moves the room to the top and replaces its latest message
        db.insert_message(b, a, Some("bob replies"), &[]).unwrap();
        let rooms = db.active_rooms(a).unwrap();
        assert_eq!(rooms[0].other_user_id, b);
        assert_eq!(rooms[0].last_message.content.as_deref(), Some("bob replies"));
    }

    #[test]
    fn attachments_round_trip_as_opaque_metadata() {
        let (db, a, b) = store_with_users();
        let meta = AttachmentMeta {
            name: "photo.jpg".into(),
            size: 48_123,
            mime: "image/jpeg".into(),
            url: "https://cdn.example/signed/photo.jpg".into(),
        };
        let msg = db.insert_message(a, b, None, &[meta.clone()]).unwrap();
        assert_eq!(msg.content, None);
        assert_eq!(msg.attachments, vec![meta.clone()]);

        let history = db.room_history(a, b).unwrap();
        assert_eq!(history[0].attachments, vec![meta]);
    }

    #[test]
    fn profiles_upsert_and_resolve() {
        let (db, a, _) = store_with_users();
        let profile = db.user_profile(a).unwrap().unwrap();
        assert_eq!(profile.username, "alice");
        assert_eq!(profile.avatar_key, None);

        db.upsert_user(a, "alice", Some("avatars/alice.png")).unwrap();
        let profile = db.user_profile(a).unwrap().unwrap();
        assert_eq!(profile.avatar_key.as_deref(), Some("avatars/alice.png"));

        assert!(db.user_profile(Uuid::new_v4()).unwrap().is_none());
    }
}
