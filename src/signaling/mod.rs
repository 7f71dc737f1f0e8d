pub mod channel;
pub mod events;

pub use channel::{reconnect_backoff, Signaling, SignalingChannel};
pub use events::{OutboundSignal, ReportReason, SignalingEvent};
