use thiserror::Error;

/// Local media failures. These block session start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("permission prompt timed out")]
    TimedOut,
    #[error("media capture has been released")]
    Released,
}

/// Relay link failures. Recovered inside the channel by reconnecting.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("relay channel disconnected: {0}")]
    ChannelDisconnected(String),
    #[error("failed to send signal: {0}")]
    SendFailed(String),
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("malformed signaling frame: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("signaling events already subscribed")]
    AlreadySubscribed,
}

/// Errors raised by the peer transport library.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("transport is closed")]
    Closed,
}

/// Sequencing violations and session failures.
///
/// The sequencing variants are logged and ignored by the dispatch loop: the relay or a slow
/// network can legitimately reorder or duplicate signals.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already negotiating or connected")]
    AlreadyNegotiating,
    #[error("a partner search is already outstanding")]
    AlreadySearching,
    #[error("stale {0} signal discarded")]
    StaleSignal(&'static str),
    #[error("local media has not been acquired")]
    MediaNotAcquired,
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
}

impl SessionError {
    /// Sequencing errors are expected noise, not failures.
    pub fn is_sequencing(&self) -> bool {
        matches!(
            self,
            SessionError::AlreadyNegotiating
                | SessionError::AlreadySearching
                | SessionError::StaleSignal(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid relay url {0}")]
    InvalidRelayUrl(String),
    #[error("invalid ICE server {id}: {reason}")]
    InvalidIceServer { id: String, reason: &'static str },
    #[error("invalid reconnect policy: {0}")]
    InvalidReconnect(&'static str),
}

/// Everything the public client API can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("chat message is empty")]
    EmptyMessage,
    #[error("no connected partner")]
    NotConnected,
    #[error("client has shut down")]
    Shutdown,
}
