use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use parlor_db::Database;
use parlor_realtime::{EventBus, PresenceChannel};
use parlor_session::{ChatSession, MessageEntry, SessionConfig};

/// Wires a store, bus, and presence channel, then runs two sessions
/// through a short exchange so the whole pipeline can be watched in the
/// logs.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "parlor_db=debug,parlor_realtime=debug,parlor_session=debug".into()
                }),
        )
        .init();

    // Config
    let config = SessionConfig::from_env();
    let store = match std::env::var("PARLOR_DB_PATH") {
        Ok(path) => Database::open(&PathBuf::from(path))?,
        Err(_) => Database::open_in_memory()?,
    };
    let store = Arc::new(store);

    // Shared realtime fabric
    let bus = EventBus::new();
    let presence = PresenceChannel::new(bus.clone());

    // Two local participants
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    store.upsert_user(alice, "alice", None)?;
    store.upsert_user(bob, "bob", None)?;

    let mut alice_session = ChatSession::new(
        alice,
        store.clone(),
        bus.clone(),
        presence.clone(),
        config.clone(),
    );
    let mut bob_session = ChatSession::new(
        bob,
        store.clone(),
        bus.clone(),
        presence.clone(),
        config.clone(),
    );
    alice_session.connect().await?;
    bob_session.connect().await?;

    alice_session.open_room(bob).await?;
    bob_session.open_room(alice).await?;

    alice_session
        .send_message(Some("hey bob".into()), vec![])
        .await?;
    bob_session
        .send_message(Some("hey! all good?".into()), vec![])
        .await?;
    alice_session
        .send_message(Some("all good.".into()), vec![])
        .await?;

    // Let the echoes and read acknowledgments settle
    tokio::time::sleep(config.read_debounce + Duration::from_millis(100)).await;

    info!("online: {} users", alice_session.online_user_ids().len());
    for entry in bob_session.messages() {
        match entry {
            MessageEntry::Confirmed(m) => {
                let who = store
                    .user_profile(m.sender_id)?
                    .map(|p| p.username)
                    .unwrap_or_else(|| m.sender_id.to_string());
                info!(
                    "[{}] {}: {} (read: {})",
                    m.created_at,
                    who,
                    m.content.as_deref().unwrap_or("<attachment>"),
                    m.is_read
                );
            }
            other => info!("unresolved entry: {:?}", other),
        }
    }
    info!("alice unread: {}", alice_session.unread_total().await?);
    info!("bob unread: {}", bob_session.unread_total().await?);

    alice_session.shutdown().await;
    bob_session.shutdown().await;
    Ok(())
}
