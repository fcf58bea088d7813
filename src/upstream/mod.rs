pub mod checker;
pub mod health;
pub mod ring;

pub use checker::{ActiveHealthChecker, HEALTH_EVENT_SOURCE};
pub use health::HealthChecker;
pub use ring::{PeerAddr, Ring, RingAction, RingCallback, RingError};
