use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use parlor_types::models::{AttachmentMeta, Message};

/// What a send call carries before the store has confirmed it.
#[derive(Debug, Clone)]
pub struct Draft {
    pub receiver_id: Uuid,
    pub content: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
}

/// One visible slot in the conversation. Optimistic sends start
/// `Pending`; the server row replaces the slot (`Confirmed`) or the
/// failure stays on screen (`Failed`) until retried or discarded.
#[derive(Debug, Clone)]
pub enum MessageEntry {
    Pending {
        local_id: Uuid,
        draft: Draft,
        queued_at: DateTime<Utc>,
    },
    Confirmed(Message),
    Failed {
        local_id: Uuid,
        draft: Draft,
        error: String,
    },
}

impl MessageEntry {
    /// Server-assigned id, known only once confirmed.
    pub fn message_id(&self) -> Option<Uuid> {
        match self {
            Self::Confirmed(m) => Some(m.id),
            _ => None,
        }
    }

    /// Local id of an unresolved slot.
    pub fn local_id(&self) -> Option<Uuid> {
        match self {
            Self::Pending { local_id, .. } | Self::Failed { local_id, .. } => Some(*local_id),
            Self::Confirmed(_) => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Pending { draft, .. } | Self::Failed { draft, .. } => draft.content.as_deref(),
            Self::Confirmed(m) => m.content.as_deref(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

/// Ordered message list for the open room. History seeds the list in
/// store order; live events append and are never re-sorted against it.
/// Dedupe is strictly by server id once the id is known; before that, a
/// send call owns exactly one pending slot.
pub struct RoomView {
    room_id: String,
    other_user_id: Uuid,
    own_user_id: Uuid,
    entries: Vec<MessageEntry>,
    seen_ids: HashSet<Uuid>,
}

impl RoomView {
    pub fn seed(
        room_id: String,
        other_user_id: Uuid,
        own_user_id: Uuid,
        history: Vec<Message>,
    ) -> Self {
        let mut seen_ids = HashSet::new();
        let entries = history
            .into_iter()
            .map(|m| {
                seen_ids.insert(m.id);
                MessageEntry::Confirmed(m)
            })
            .collect();
        Self {
            room_id,
            other_user_id,
            own_user_id,
            entries,
            seen_ids,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn other_user_id(&self) -> Uuid {
        self.other_user_id
    }

    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    pub fn push_pending(&mut self, local_id: Uuid, draft: Draft) {
        self.entries.push(MessageEntry::Pending {
            local_id,
            draft,
            queued_at: Utc::now(),
        });
    }

    /// Applies an insert notification. Returns false for duplicates.
    /// An echo of our own in-flight send adopts the pending slot, so the
    /// optimistic entry and the event never show up as two entries.
    pub fn apply_insert(&mut self, message: Message) -> bool {
        if !self.seen_ids.insert(message.id) {
            return false;
        }
        if message.sender_id == self.own_user_id {
            if let Some(pos) = self
                .entries
                .iter()
                .position(|e| pending_matches(e, &message))
            {
                self.entries[pos] = MessageEntry::Confirmed(message);
                return true;
            }
        }
        self.entries.push(MessageEntry::Confirmed(message));
        true
    }

    /// Resolves a pending slot with the store's row. When the realtime
    /// echo already adopted the slot, the duplicate is dropped instead.
    pub fn confirm(&mut self, local_id: Uuid, message: Message) {
        if self.seen_ids.contains(&message.id) {
            self.entries.retain(|e| e.local_id() != Some(local_id));
            return;
        }
        self.seen_ids.insert(message.id);
        match self.position_of(local_id) {
            Some(pos) => self.entries[pos] = MessageEntry::Confirmed(message),
            None => self.entries.push(MessageEntry::Confirmed(message)),
        }
    }

    /// Marks a pending slot failed. The slot stays visible.
    pub fn fail(&mut self, local_id: Uuid, error: String) {
        if let Some(pos) = self.position_of(local_id) {
            if let MessageEntry::Pending { draft, .. } = &self.entries[pos] {
                self.entries[pos] = MessageEntry::Failed {
                    local_id,
                    draft: draft.clone(),
                    error,
                };
            }
        }
    }

    /// Removes a failed slot and hands its draft back for a retry.
    pub fn take_failed(&mut self, local_id: Uuid) -> Option<Draft> {
        let pos = self.entries.iter().position(
            |e| matches!(e, MessageEntry::Failed { local_id: l, .. } if *l == local_id),
        )?;
        match self.entries.remove(pos) {
            MessageEntry::Failed { draft, .. } => Some(draft),
            other => {
                self.entries.insert(pos, other);
                None
            }
        }
    }

    /// Drops a deleted message. Its id stays in the seen set so a
    /// replayed insert event cannot resurrect it.
    pub fn remove(&mut self, message_id: Uuid) {
        self.entries.retain(|e| e.message_id() != Some(message_id));
    }

    /// Flips local copies after a read acknowledgment, avoiding a
    /// refetch.
    pub fn mark_read_local(&mut self, reader_id: Uuid) {
        for entry in &mut self.entries {
            if let MessageEntry::Confirmed(m) = entry {
                if m.receiver_id == reader_id {
                    m.is_read = true;
                }
            }
        }
    }

    /// Replaces confirmed history wholesale after missed events;
    /// unresolved slots keep their place at the tail.
    pub fn resync(&mut self, history: Vec<Message>) {
        let unresolved: Vec<MessageEntry> = self
            .entries
            .drain(..)
            .filter(|e| !e.is_confirmed())
            .collect();
        self.seen_ids.clear();
        for message in history {
            self.seen_ids.insert(message.id);
            self.entries.push(MessageEntry::Confirmed(message));
        }
        self.entries.extend(unresolved);
    }

    fn position_of(&self, local_id: Uuid) -> Option<usize> {
        self.entries.iter().position(|e| e.local_id() == Some(local_id))
    }
}

fn pending_matches(entry: &MessageEntry, message: &Message) -> bool {
    match entry {
        MessageEntry::Pending { draft, .. } => {
            draft.receiver_id == message.receiver_id
                && draft.content.as_deref() == message.content.as_deref()
                && draft.attachments == message.attachments
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(own: Uuid, other: Uuid) -> RoomView {
        RoomView::seed(parlor_types::room::room_id(own, other), other, own, vec![])
    }

    fn stored(view: &RoomView, sender: Uuid, receiver: Uuid, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            room_id: view.room_id().to_string(),
            sender_id: sender,
            receiver_id: receiver,
            content: Some(content.to_string()),
            attachments: vec![],
            is_read: false,
            created_at: Utc::now(),
        }
    }

    fn draft_to(receiver: Uuid, content: &str) -> Draft {
        Draft {
            receiver_id: receiver,
            content: Some(content.to_string()),
            attachments: vec![],
        }
    }

    #[test]
    fn confirm_then_echo_yields_one_entry() {
        let (own, other) = (Uuid::new_v4(), Uuid::new_v4());
        let mut v = view(own, other);
        let local_id = Uuid::new_v4();
        v.push_pending(local_id, draft_to(other, "hi"));

        let message = stored(&v, own, other, "hi");
        v.confirm(local_id, message.clone());
        assert!(!v.apply_insert(message)); // echo is a duplicate

        assert_eq!(v.entries().len(), 1);
        assert!(v.entries()[0].is_confirmed());
    }

    #[test]
    fn echo_then_confirm_yields_one_entry() {
        let (own, other) = (Uuid::new_v4(), Uuid::new_v4());
        let mut v = view(own, other);
        let local_id = Uuid::new_v4();
        v.push_pending(local_id, draft_to(other, "hi"));

        // The realtime echo lands before the store call returns and
        // adopts the pending slot
        let message = stored(&v, own, other, "hi");
        assert!(v.apply_insert(message.clone()));
        assert_eq!(v.entries().len(), 1);

        v.confirm(local_id, message);
        assert_eq!(v.entries().len(), 1);
        assert!(v.entries()[0].is_confirmed());
    }

    #[test]
    fn inbound_duplicates_are_suppressed_by_id() {
        let (own, other) = (Uuid::new_v4(), Uuid::new_v4());
        let mut v = view(own, other);
        let message = stored(&v, other, own, "hello");

        assert!(v.apply_insert(message.clone()));
        assert!(!v.apply_insert(message));
        assert_eq!(v.entries().len(), 1);
    }

    #[test]
    fn failed_slot_stays_visible_and_is_retryable() {
        let (own, other) = (Uuid::new_v4(), Uuid::new_v4());
        let mut v = view(own, other);
        let local_id = Uuid::new_v4();
        v.push_pending(local_id, draft_to(other, "doomed"));

        v.fail(local_id, "persistence failure".into());
        assert!(v.entries()[0].is_failed());
        assert_eq!(v.entries()[0].content(), Some("doomed"));

        let draft = v.take_failed(local_id).unwrap();
        assert_eq!(draft.content.as_deref(), Some("doomed"));
        assert!(v.entries().is_empty());
        assert!(v.take_failed(local_id).is_none());
    }

    #[test]
    fn deleted_ids_cannot_be_resurrected_by_replay() {
        let (own, other) = (Uuid::new_v4(), Uuid::new_v4());
        let mut v = view(own, other);
        let message = stored(&v, other, own, "gone");

        v.apply_insert(message.clone());
        v.remove(message.id);
        assert!(v.entries().is_empty());

        assert!(!v.apply_insert(message));
        assert!(v.entries().is_empty());
    }

    #[test]
    fn resync_replaces_history_but_keeps_unresolved_slots() {
        let (own, other) = (Uuid::new_v4(), Uuid::new_v4());
        let mut v = view(own, other);
        let m1 = stored(&v, other, own, "m1");
        let m2 = stored(&v, other, own, "m2");
        v.apply_insert(m1.clone());

        let local_id = Uuid::new_v4();
        v.push_pending(local_id, draft_to(other, "in flight"));

        v.resync(vec![m1, m2]);
        let contents: Vec<_> = v.entries().iter().map(|e| e.content().unwrap()).collect();
        assert_eq!(contents, ["m1", "m2", "in flight"]);
        assert!(v.entries()[2].is_pending());
    }

    #[test]
    fn read_ack_flips_local_copies_for_the_reader_only() {
        let (own, other) = (Uuid::new_v4(), Uuid::new_v4());
        let mut v = view(own, other);
        v.apply_insert(stored(&v, own, other, "outbound"));
        v.apply_insert(stored(&v, other, own, "inbound"));

        v.mark_read_local(other);
        let read_flags: Vec<bool> = v
            .entries()
            .iter()
            .map(|e| match e {
                MessageEntry::Confirmed(m) => m.is_read,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(read_flags, [true, false]);
    }
}
