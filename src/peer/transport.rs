//! Seam between the session controller and the transport library.

use crate::error::TransportError;
use crate::media::LocalTrack;
use crate::peer::types::{IceCandidate, RemoteTrackInfo, SessionDescription, SessionId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection state as reported by the transport library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Trickled local candidate, to be forwarded immediately.
    LocalCandidate(IceCandidate),
    GatheringComplete,
    RemoteTrack(RemoteTrackInfo),
    ConnectionState(TransportState),
    NegotiationTimedOut,
    GracePeriodElapsed,
}

/// Transport callbacks fire on library threads; every event is tagged with the session that
/// produced it so the controller can drop events from sessions it already tore down.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTransportEvent {
    pub session_id: SessionId,
    pub event: TransportEvent,
}

pub type TransportEventSender = mpsc::UnboundedSender<SessionTransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<SessionTransportEvent>;

/// One peer connection. Description-producing calls also install the result as the local
/// description.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn attach_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError>;

    /// Removes local tracks from the connection without stopping them.
    async fn detach_tracks(&self) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        session_id: SessionId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
