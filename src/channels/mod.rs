//! Chat-transport seams and presence.

pub mod presence;
pub mod traits;

pub use presence::BotPresenceManager;
pub use traits::{Activity, Channel, ChannelError, KillBranchView, MessageHandle, PresenceSink};
