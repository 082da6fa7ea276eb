pub mod bus;
pub mod presence;

pub use bus::{EventBus, RoomSubscription, SubscriptionError};
pub use presence::{PresenceChannel, PresenceTracker, TrackerState};
