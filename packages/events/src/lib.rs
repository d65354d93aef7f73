// ABOUTME: Session event fan-out for Corral
// ABOUTME: One producer per session, N consumers, late joiners via snapshot-then-tail

pub mod channel;
pub mod coalesce;

// Re-export commonly used types
pub use channel::{ChannelError, SessionChannel, Snapshot, Subscription};
pub use coalesce::Coalescer;
