use crate::peer::types::IceCandidate;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Installs the global subscriber. Safe to call more than once.
pub fn init() {
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("onvia=debug,info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".into()))
        .with_target(false)
        .try_init();
}

/// Trickle candidate line.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    info!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Snapshot of the nominated candidate pair, taken when the transport degrades.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
