//! Relay wire format: JSON text frames shaped `{"event": "<name>", "data": <payload>}`.

use crate::peer::types::{IceCandidate, Role, SessionDescription, SessionId};
use serde::{Deserialize, Serialize};

/// Everything the relay (or the peer through it) can deliver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SignalingEvent {
    /// Legacy pairing notice: the receiver makes the offer.
    Ready { session_id: SessionId },
    MatchFound { session_id: SessionId, role: Role },
    Offer {
        session_id: SessionId,
        description: SessionDescription,
    },
    Answer {
        session_id: SessionId,
        description: SessionDescription,
    },
    IceCandidate {
        session_id: SessionId,
        candidate: IceCandidate,
    },
    PeerDisconnected { session_id: SessionId },
    ChatMessage(String),
    /// Produced by the channel itself after the relay link was re-established.
    #[serde(skip)]
    Reconnected,
}

impl SignalingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SignalingEvent::Ready { .. } => "ready",
            SignalingEvent::MatchFound { .. } => "match-found",
            SignalingEvent::Offer { .. } => "offer",
            SignalingEvent::Answer { .. } => "answer",
            SignalingEvent::IceCandidate { .. } => "ice-candidate",
            SignalingEvent::PeerDisconnected { .. } => "peer-disconnected",
            SignalingEvent::ChatMessage(_) => "chat-message",
            SignalingEvent::Reconnected => "reconnected",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportReason {
    Inappropriate,
    Nudity,
    Harassment,
    Spam,
    Underage,
    Other,
}

/// Everything this client sends to the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundSignal {
    FindPeer,
    CancelFind,
    Offer {
        session_id: SessionId,
        description: SessionDescription,
    },
    Answer {
        session_id: SessionId,
        description: SessionDescription,
    },
    IceCandidate {
        session_id: SessionId,
        candidate: IceCandidate,
    },
    ReportUser {
        reason: ReportReason,
        details: String,
    },
    ChatMessage(String),
}

impl OutboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundSignal::FindPeer => "find-peer",
            OutboundSignal::CancelFind => "cancel-find",
            OutboundSignal::Offer { .. } => "offer",
            OutboundSignal::Answer { .. } => "answer",
            OutboundSignal::IceCandidate { .. } => "ice-candidate",
            OutboundSignal::ReportUser { .. } => "report-user",
            OutboundSignal::ChatMessage(_) => "chat-message",
        }
    }

    /// Whether the signal still means something to the relay after it has lost our
    /// connection. Matchmaking and per-session traffic does not.
    pub fn survives_reconnect(&self) -> bool {
        matches!(self, OutboundSignal::ReportUser { .. })
    }
}
