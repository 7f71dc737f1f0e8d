pub mod connection;
pub mod controller;
pub mod ice;
pub mod state;
pub mod transport;
pub mod types;

pub use controller::{PeerSessionController, SessionEvent, SessionTimeouts};
pub use state::{Session, GRACE_PERIOD};
pub use transport::{PeerTransport, SessionTransportEvent, TransportEvent, TransportFactory, TransportState};
pub use types::{
    DisconnectReason, FailureReason, IceCandidate, MediaKind, RemoteTrackInfo, Role, SdpKind,
    ServerConfig, SessionDescription, SessionId, SessionState,
};
