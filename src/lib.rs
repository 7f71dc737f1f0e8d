//! Random one-to-one video chat client: camera/microphone capture, relay signaling,
//! matchmaking and a single WebRTC peer session at a time.

pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod pairing;
pub mod peer;
pub mod signaling;
pub mod utils;

#[cfg(feature = "desktop")]
pub mod commands;

pub use client::{ChatClient, ChatMessage, ChatSender, ClientEvent, ClientParts, ClientSnapshot};
pub use config::ClientConfig;
pub use error::{CaptureError, ClientError, ConfigError, SessionError, SignalingError, TransportError};
pub use media::{MediaCaptureManager, MediaHandle};
pub use pairing::{PairingCoordinator, PairingState};
pub use peer::{PeerSessionController, SessionState};
pub use signaling::{SignalingChannel, SignalingEvent};
