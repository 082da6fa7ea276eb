use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use parlor_types::events::RoomEvent;
use parlor_types::models::PresenceRecord;

use crate::bus::EventBus;

/// The shared presence channel — one per deployment, not one per room.
/// Holds who is currently attached; the truth is whoever is connected
/// right now, never history.
#[derive(Clone)]
pub struct PresenceChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    bus: EventBus,
    members: RwLock<HashMap<Uuid, PresenceRecord>>,
}

impl PresenceChannel {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                bus,
                members: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Attaches a user and announces the join. Returns the full
    /// membership snapshot, new member included — the caller's initial
    /// sync.
    pub async fn join(&self, user_id: Uuid) -> Vec<PresenceRecord> {
        let record = PresenceRecord {
            user_id,
            online_at: Utc::now(),
        };
        self.inner
            .members
            .write()
            .await
            .insert(user_id, record.clone());
        self.inner.bus.publish(RoomEvent::PresenceJoin { record });
        self.snapshot().await
    }

    /// Detaches a user and announces the leave, if they were attached.
    pub async fn leave(&self, user_id: Uuid) {
        let removed = self.inner.members.write().await.remove(&user_id);
        if removed.is_some() {
            self.inner.bus.publish(RoomEvent::PresenceLeave { user_id });
        }
    }

    pub async fn snapshot(&self) -> Vec<PresenceRecord> {
        self.inner.members.read().await.values().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Disconnected,
    Connecting,
    Synced,
}

struct TrackerShared {
    state: TrackerState,
    online: HashSet<Uuid>,
}

/// One client's view of the presence channel. `track` attaches and
/// syncs; the online set is mutated only by this tracker's event
/// handling, everyone else reads it.
pub struct PresenceTracker {
    channel: PresenceChannel,
    shared: Arc<StdRwLock<TrackerShared>>,
    user_id: Option<Uuid>,
    task: Option<JoinHandle<()>>,
}

impl PresenceTracker {
    pub fn new(channel: PresenceChannel) -> Self {
        Self {
            channel,
            shared: Arc::new(StdRwLock::new(TrackerShared {
                state: TrackerState::Disconnected,
                online: HashSet::new(),
            })),
            user_id: None,
            task: None,
        }
    }

    /// Begins broadcasting this user's presence and follows the channel:
    /// `Disconnected -> Connecting` on subscribe, `Connecting -> Synced`
    /// once the initial snapshot replaces the local set wholesale, then
    /// join/leave deltas keep it current. Re-tracking first detaches, so
    /// a reconnect always resyncs from scratch.
    pub async fn track(&mut self, user_id: Uuid) {
        self.disconnect().await;

        {
            let mut shared = self.shared.write().expect("presence lock poisoned");
            shared.state = TrackerState::Connecting;
            shared.online.clear();
        }

        // Tap the event stream before joining so no join/leave lands in
        // the gap between snapshot and subscription.
        let rx = self.channel.bus().subscribe_raw();
        let snapshot = self.channel.join(user_id).await;
        apply(&self.shared, &RoomEvent::PresenceSync { online: snapshot });

        self.task = Some(spawn_event_task(
            self.shared.clone(),
            self.channel.clone(),
            rx,
        ));
        self.user_id = Some(user_id);
        info!("{} tracking presence", user_id);
    }

    /// Detaches from the channel. The local set is stale the moment the
    /// connection is gone, so it is cleared rather than served.
    pub async fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        {
            let mut shared = self.shared.write().expect("presence lock poisoned");
            shared.state = TrackerState::Disconnected;
            shared.online.clear();
        }
        if let Some(user_id) = self.user_id.take() {
            self.channel.leave(user_id).await;
            info!("{} stopped tracking presence", user_id);
        }
    }

    /// Everyone currently observed online. Empty unless synced.
    pub fn online_users(&self) -> HashSet<Uuid> {
        let shared = self.shared.read().expect("presence lock poisoned");
        match shared.state {
            TrackerState::Synced => shared.online.clone(),
            _ => HashSet::new(),
        }
    }

    pub fn state(&self) -> TrackerState {
        self.shared.read().expect("presence lock poisoned").state
    }

    pub fn is_synced(&self) -> bool {
        self.state() == TrackerState::Synced
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        // Ungraceful teardown, like a dropped connection. A graceful
        // detach goes through `disconnect`.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn spawn_event_task(
    shared: Arc<StdRwLock<TrackerShared>>,
    channel: PresenceChannel,
    mut rx: broadcast::Receiver<RoomEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => apply(&shared, &event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("presence tracker lagged by {} events, resyncing", n);
                    let snapshot = channel.snapshot().await;
                    apply(&shared, &RoomEvent::PresenceSync { online: snapshot });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let mut s = shared.write().expect("presence lock poisoned");
                    s.state = TrackerState::Disconnected;
                    s.online.clear();
                    break;
                }
            }
        }
    })
}

fn apply(shared: &StdRwLock<TrackerShared>, event: &RoomEvent) {
    let mut s = shared.write().expect("presence lock poisoned");
    match event {
        RoomEvent::PresenceSync { online } => {
            // Wholesale replace corrects any drift
            s.online = online.iter().map(|r| r.user_id).collect();
            s.state = TrackerState::Synced;
        }
        RoomEvent::PresenceJoin { record } if s.state == TrackerState::Synced => {
            s.online.insert(record.user_id);
        }
        RoomEvent::PresenceLeave { user_id } if s.state == TrackerState::Synced => {
            s.online.remove(user_id);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn track_moves_through_connecting_to_synced() {
        let channel = PresenceChannel::new(EventBus::new());
        let me = Uuid::new_v4();

        let mut tracker = PresenceTracker::new(channel);
        assert_eq!(tracker.state(), TrackerState::Disconnected);
        assert!(tracker.online_users().is_empty());

        tracker.track(me).await;
        assert_eq!(tracker.state(), TrackerState::Synced);
        assert!(tracker.online_users().contains(&me));
    }

    #[tokio::test]
    async fn peers_observe_joins_and_leaves() {
        let channel = PresenceChannel::new(EventBus::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let mut tracker_a = PresenceTracker::new(channel.clone());
        let mut tracker_b = PresenceTracker::new(channel.clone());
        tracker_a.track(a).await;
        tracker_b.track(b).await;

        eventually(|| tracker_a.online_users() == HashSet::from([a, b])).await;
        eventually(|| tracker_b.online_users() == HashSet::from([a, b])).await;

        tracker_b.disconnect().await;
        assert!(tracker_b.online_users().is_empty());
        assert_eq!(tracker_b.state(), TrackerState::Disconnected);
        eventually(|| tracker_a.online_users() == HashSet::from([a])).await;
    }

    #[tokio::test]
    async fn reconnect_resyncs_to_exactly_the_connected_set() {
        let channel = PresenceChannel::new(EventBus::new());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let mut tracker_a = PresenceTracker::new(channel.clone());
        let mut tracker_b = PresenceTracker::new(channel.clone());
        tracker_a.track(a).await;
        tracker_b.track(b).await;
        eventually(|| tracker_a.online_users().len() == 2).await;

        // A drops; membership churns while it is away
        tracker_a.disconnect().await;
        let mut tracker_c = PresenceTracker::new(channel.clone());
        tracker_c.track(c).await;
        tracker_b.disconnect().await;

        // On reconnect the snapshot replaces local state: no ghost b,
        // no missing c
        tracker_a.track(a).await;
        assert_eq!(tracker_a.online_users(), HashSet::from([a, c]));
        eventually(|| tracker_c.online_users() == HashSet::from([a, c])).await;
    }

    #[tokio::test]
    async fn double_disconnect_is_harmless() {
        let channel = PresenceChannel::new(EventBus::new());
        let mut tracker = PresenceTracker::new(channel);
        tracker.track(Uuid::new_v4()).await;
        tracker.disconnect().await;
        tracker.disconnect().await;
        assert_eq!(tracker.state(), TrackerState::Disconnected);
    }
}
