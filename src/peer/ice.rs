use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::collections::VecDeque;
use tracing::{info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Remote candidates that arrived before the remote description. Flushed in arrival order,
/// never dropped.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IceCandidate> {
        self.queue.iter()
    }

    /// Empties the buffer, oldest first.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

/// Settings-screen servers to transport-library servers.
pub fn to_rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates<'a>(candidates: impl IntoIterator<Item = &'a IceCandidate>) -> CandidateStats {
    let mut stats = CandidateStats::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            stats.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            stats.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            stats.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        stats.host, stats.srflx, stats.relay
    );
    if stats.relay == 0 {
        warn!("No TURN relay candidates gathered; connections through symmetric NAT may fail");
    }
    stats
}
