use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use parlor_db::{Database, StoreError};
use parlor_realtime::{
    EventBus, PresenceChannel, PresenceTracker, RoomSubscription, SubscriptionError,
};
use parlor_types::events::RoomEvent;
use parlor_types::models::{AttachmentMeta, ConversationSummary, UserProfile};
use parlor_types::room;

use crate::config::SessionConfig;
use crate::entry::{Draft, MessageEntry, RoomView};
use crate::error::SessionError;

type SharedRoom = Arc<StdRwLock<Option<RoomView>>>;
type SharedSummaries = Arc<StdRwLock<Vec<ConversationSummary>>>;

/// One user's stateful chat surface: merges persisted history with live
/// events into the open room's ordered view, drives optimistic send and
/// read acknowledgment, and keeps the conversation list current.
///
/// The open room's view is owned by this session alone; the room event
/// task is the only other writer and both go through the same lock. At
/// most one room subscription is live at a time — switching rooms
/// releases the previous one before the new room is seeded.
pub struct ChatSession {
    user_id: Uuid,
    store: Arc<Database>,
    bus: EventBus,
    presence: PresenceTracker,
    config: SessionConfig,
    room: SharedRoom,
    summaries: SharedSummaries,
    read_marker: ReadMarker,
    room_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

impl ChatSession {
    pub fn new(
        user_id: Uuid,
        store: Arc<Database>,
        bus: EventBus,
        presence: PresenceChannel,
        config: SessionConfig,
    ) -> Self {
        let room: SharedRoom = Arc::new(StdRwLock::new(None));
        let summaries: SharedSummaries = Arc::new(StdRwLock::new(Vec::new()));
        let read_marker = ReadMarker {
            store: store.clone(),
            bus: bus.clone(),
            user_id,
            debounce: config.read_debounce,
            room: room.clone(),
            summaries: summaries.clone(),
            pending: Arc::new(StdMutex::new(None)),
        };

        Self {
            user_id,
            store,
            bus,
            presence: PresenceTracker::new(presence),
            config,
            room,
            summaries,
            read_marker,
            room_task: None,
            poll_task: None,
        }
    }

    /// Comes online: starts presence tracking, seeds the conversation
    /// list, and begins the summary poll.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.presence.track(self.user_id).await;
        refresh_summaries(&self.store, self.user_id, &self.summaries).await?;
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.poll_task = Some(self.spawn_summary_poller());
        Ok(())
    }

    /// Opens the conversation with `other_user_id`: fetches history,
    /// seeds the view, attaches the room subscription, and schedules
    /// the read acknowledgment.
    pub async fn open_room(&mut self, other_user_id: Uuid) -> Result<(), SessionError> {
        // Release the previous room before attaching the new one
        self.close_room();

        let room_id = room::room_id(self.user_id, other_user_id);

        // Subscribe before fetching so events raised during the fetch
        // are buffered rather than lost; they reconcile against the
        // seeded history by id.
        let sub = self.bus.subscribe(&room_id);

        let me = self.user_id;
        let history = self
            .store_call(move |db| db.room_history(me, other_user_id))
            .await?;

        {
            let mut guard = self.room.write().expect("room lock poisoned");
            *guard = Some(RoomView::seed(room_id.clone(), other_user_id, me, history));
        }
        self.room_task = Some(self.spawn_room_task(sub));

        // Opening a room acknowledges what the reader now sees, after a
        // short delay so rendering wins the race
        self.read_marker.schedule(room_id);
        Ok(())
    }

    /// Releases the open room and its subscription. Safe to call when
    /// no room is open. An already-scheduled read acknowledgment for
    /// the old room still completes; the mark is idempotent.
    pub fn close_room(&mut self) {
        if let Some(task) = self.room_task.take() {
            // Aborting drops the subscription handle, which tears down
            // its forwarding task
            task.abort();
        }
        *self.room.write().expect("room lock poisoned") = None;
    }

    /// Optimistic send: the entry is visible immediately, the store
    /// write runs off the async thread, and the slot resolves to
    /// `Confirmed` or `Failed`. Sends are not serialized — each call
    /// owns exactly one pending slot and id-based dedupe keeps
    /// overlapping sends safe.
    pub async fn send_message(
        &self,
        content: Option<String>,
        attachments: Vec<AttachmentMeta>,
    ) -> Result<Uuid, SessionError> {
        let content = content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if content.is_none() && attachments.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let local_id = Uuid::new_v4();
        let draft = {
            let mut guard = self.room.write().expect("room lock poisoned");
            let view = guard.as_mut().ok_or(SessionError::NoActiveRoom)?;
            let draft = Draft {
                receiver_id: view.other_user_id(),
                content,
                attachments,
            };
            view.push_pending(local_id, draft.clone());
            draft
        };

        self.dispatch_send(local_id, draft).await
    }

    /// Re-drives a failed send with its original draft. Retrying is an
    /// explicit user action, never automatic.
    pub async fn retry(&self, local_id: Uuid) -> Result<Uuid, SessionError> {
        let draft = {
            let mut guard = self.room.write().expect("room lock poisoned");
            let view = guard.as_mut().ok_or(SessionError::NoActiveRoom)?;
            let draft = view
                .take_failed(local_id)
                .ok_or(SessionError::UnknownLocalId(local_id))?;
            view.push_pending(local_id, draft.clone());
            draft
        };
        self.dispatch_send(local_id, draft).await
    }

    async fn dispatch_send(&self, local_id: Uuid, draft: Draft) -> Result<Uuid, SessionError> {
        let sender = self.user_id;
        let receiver = draft.receiver_id;
        let content = draft.content.clone();
        let attachments = draft.attachments.clone();
        let result = self
            .store_call(move |db| {
                db.insert_message(sender, receiver, content.as_deref(), &attachments)
            })
            .await;

        match result {
            Ok(message) => {
                {
                    let mut guard = self.room.write().expect("room lock poisoned");
                    if let Some(view) = guard.as_mut() {
                        if view.room_id() == message.room_id {
                            view.confirm(local_id, message.clone());
                        }
                    }
                }
                self.bus.publish(RoomEvent::MessageInsert { message });
                if let Err(e) = refresh_summaries(&self.store, sender, &self.summaries).await {
                    warn!("summary refresh failed: {}", e);
                }
                Ok(local_id)
            }
            Err(e) => {
                // The failed slot stays visible rather than silently
                // dropping the attempt
                let mut guard = self.room.write().expect("room lock poisoned");
                if let Some(view) = guard.as_mut() {
                    view.fail(local_id, e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Deletes one of the user's own messages; the store rejects
    /// everything else.
    pub async fn delete_message(&self, message_id: Uuid) -> Result<(), SessionError> {
        let requester = self.user_id;
        let room_id = self
            .store_call(move |db| db.delete_message(message_id, requester))
            .await?;

        {
            let mut guard = self.room.write().expect("room lock poisoned");
            if let Some(view) = guard.as_mut() {
                if view.room_id() == room_id {
                    view.remove(message_id);
                }
            }
        }
        self.bus.publish(RoomEvent::MessageDelete {
            room_id,
            message_id,
        });
        Ok(())
    }

    // -- Reactive state consumed by the UI surface --

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn active_room_id(&self) -> Option<String> {
        self.room
            .read()
            .expect("room lock poisoned")
            .as_ref()
            .map(|view| view.room_id().to_string())
    }

    /// Snapshot of the open room's ordered entries.
    pub fn messages(&self) -> Vec<MessageEntry> {
        self.room
            .read()
            .expect("room lock poisoned")
            .as_ref()
            .map(|view| view.entries().to_vec())
            .unwrap_or_default()
    }

    /// Snapshot of the conversation list, newest room first.
    pub fn conversation_list(&self) -> Vec<ConversationSummary> {
        self.summaries.read().expect("summary lock poisoned").clone()
    }

    /// Unread messages addressed to this user across all rooms,
    /// recounted from the store.
    pub async fn unread_total(&self) -> Result<i64, SessionError> {
        let me = self.user_id;
        self.store_call(move |db| db.unread_count(me)).await
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, SessionError> {
        self.store_call(move |db| db.user_profile(user_id)).await
    }

    pub fn online_user_ids(&self) -> HashSet<Uuid> {
        self.presence.online_users()
    }

    pub fn is_connected(&self) -> bool {
        self.presence.is_synced()
    }

    /// Graceful teardown: releases the room, stops polling, and leaves
    /// the presence channel.
    pub async fn shutdown(&mut self) {
        self.close_room();
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.presence.disconnect().await;
    }

    fn spawn_room_task(&self, sub: RoomSubscription) -> JoinHandle<()> {
        tokio::spawn(room_event_loop(
            self.user_id,
            self.store.clone(),
            self.room.clone(),
            self.summaries.clone(),
            self.read_marker.clone(),
            sub,
        ))
    }

    fn spawn_summary_poller(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let user_id = self.user_id;
        let summaries = self.summaries.clone();
        let period = self.config.summary_poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = refresh_summaries(&store, user_id, &summaries).await {
                    warn!("summary poll failed: {}", e);
                }
            }
        })
    }

    async fn store_call<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| {
                error!("store task join error: {}", e);
                SessionError::TaskJoin
            })?
            .map_err(SessionError::from)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        // Ungraceful teardown; `shutdown` is the graceful path
        if let Some(task) = self.room_task.take() {
            task.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

/// Applies one room's event feed to the shared view until the
/// subscription closes.
async fn room_event_loop(
    user_id: Uuid,
    store: Arc<Database>,
    room: SharedRoom,
    summaries: SharedSummaries,
    marker: ReadMarker,
    mut sub: RoomSubscription,
) {
    loop {
        match sub.recv().await {
            Ok(RoomEvent::MessageInsert { message }) => {
                let inbound = message.receiver_id == user_id;
                let room_key = message.room_id.clone();
                let appended = {
                    let mut guard = room.write().expect("room lock poisoned");
                    match guard.as_mut() {
                        Some(view) if view.room_id() == room_key => view.apply_insert(message),
                        _ => false,
                    }
                };
                if appended && inbound {
                    // Acknowledge new arrivals once the UI has had a
                    // chance to render them
                    marker.schedule(room_key);
                }
            }
            Ok(RoomEvent::MessageRead { room_id, reader_id }) => {
                {
                    let mut guard = room.write().expect("room lock poisoned");
                    if let Some(view) = guard.as_mut() {
                        if view.room_id() == room_id {
                            view.mark_read_local(reader_id);
                        }
                    }
                }
                // Read-state changes move badges, not content: refresh
                // the summaries instead of refetching history
                if let Err(e) = refresh_summaries(&store, user_id, &summaries).await {
                    warn!("summary refresh failed: {}", e);
                }
            }
            Ok(RoomEvent::MessageDelete {
                room_id,
                message_id,
            }) => {
                let mut guard = room.write().expect("room lock poisoned");
                if let Some(view) = guard.as_mut() {
                    if view.room_id() == room_id {
                        view.remove(message_id);
                    }
                }
            }
            Ok(_) => {} // presence flows through the tracker
            Err(SubscriptionError::Lagged(_)) => {
                // Missed events are a hint to resynchronize from the
                // store, not something to reconstruct
                let other = {
                    let guard = room.read().expect("room lock poisoned");
                    guard.as_ref().map(|view| view.other_user_id())
                };
                let Some(other) = other else { continue };
                let store_clone = store.clone();
                match tokio::task::spawn_blocking(move || store_clone.room_history(user_id, other))
                    .await
                {
                    Ok(Ok(history)) => {
                        let mut guard = room.write().expect("room lock poisoned");
                        if let Some(view) = guard.as_mut() {
                            view.resync(history);
                        }
                    }
                    Ok(Err(e)) => warn!("history resync failed: {}", e),
                    Err(e) => warn!("history resync task failed: {}", e),
                }
            }
            Err(SubscriptionError::Closed) => break,
        }
    }
}

/// Debounced read acknowledgment. The newest trigger restarts the
/// delay; the mark itself is idempotent, so coalescing loses nothing.
#[derive(Clone)]
struct ReadMarker {
    store: Arc<Database>,
    bus: EventBus,
    user_id: Uuid,
    debounce: Duration,
    room: SharedRoom,
    summaries: SharedSummaries,
    pending: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl ReadMarker {
    fn schedule(&self, room_id: String) {
        let marker = self.clone();
        let mut slot = self.pending.lock().expect("read-mark lock poisoned");
        if let Some(prev) = slot.take() {
            prev.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(marker.debounce).await;
            marker.run(room_id).await;
        }));
    }

    async fn run(&self, room_id: String) {
        let store = self.store.clone();
        let reader = self.user_id;
        let key = room_id.clone();
        let flipped =
            match tokio::task::spawn_blocking(move || store.mark_room_read(&key, reader)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!("read-mark failed for {}: {}", room_id, e);
                    return;
                }
                Err(e) => {
                    warn!("read-mark task failed: {}", e);
                    return;
                }
            };
        if flipped == 0 {
            return;
        }

        {
            let mut guard = self.room.write().expect("room lock poisoned");
            if let Some(view) = guard.as_mut() {
                if view.room_id() == room_id {
                    view.mark_read_local(reader);
                }
            }
        }
        self.bus.publish(RoomEvent::MessageRead {
            room_id,
            reader_id: reader,
        });
        if let Err(e) = refresh_summaries(&self.store, reader, &self.summaries).await {
            warn!("summary refresh failed: {}", e);
        }
    }
}

/// Recomputes the conversation list from the store: latest activity per
/// room plus the viewer's unread count for each.
async fn refresh_summaries(
    store: &Arc<Database>,
    user_id: Uuid,
    summaries: &SharedSummaries,
) -> Result<(), SessionError> {
    let store = store.clone();
    let list = tokio::task::spawn_blocking(
        move || -> Result<Vec<ConversationSummary>, StoreError> {
            let rooms = store.active_rooms(user_id)?;
            rooms
                .into_iter()
                .map(|activity| {
                    let unread = store.room_unread_count(&activity.room_id, user_id)?;
                    Ok(ConversationSummary {
                        room_id: activity.room_id,
                        other_user_id: activity.other_user_id,
                        last_message: activity.last_message,
                        unread,
                    })
                })
                .collect()
        },
    )
    .await
    .map_err(|e| {
        error!("store task join error: {}", e);
        SessionError::TaskJoin
    })??;

    *summaries.write().expect("summary lock poisoned") = list;
    Ok(())
}
