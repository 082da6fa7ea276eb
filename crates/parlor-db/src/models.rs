/// Database row types — these map directly to SQLite rows.
/// Distinct from the parlor-types API models to keep the DB layer
/// independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub avatar_key: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: Option<String>,
    pub attachments: String,
    pub is_read: i64,
    pub created_at: String,
}
