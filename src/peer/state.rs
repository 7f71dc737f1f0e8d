use crate::peer::ice::CandidateBuffer;
use crate::peer::types::{
    IceCandidate, RemoteTrackInfo, Role, SessionDescription, SessionId, SessionState,
};
use std::time::Duration;

/// How long a connected transport may report `disconnected` before the session ends.
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// One pending or active peer relationship. Owned by the session controller.
#[derive(Debug)]
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) role: Role,
    pub(crate) state: SessionState,
    pub(crate) local_description: Option<SessionDescription>,
    pub(crate) remote_description: Option<SessionDescription>,
    pub(crate) pending_remote_candidates: CandidateBuffer,
    pub(crate) remote_tracks: Vec<RemoteTrackInfo>,
    pub(crate) applied_candidates: usize,
    pub(crate) local_candidates: Vec<IceCandidate>,
}

impl Session {
    pub(crate) fn new(id: SessionId, role: Role) -> Self {
        Self {
            id,
            role,
            state: SessionState::Negotiating,
            local_description: None,
            remote_description: None,
            pending_remote_candidates: CandidateBuffer::default(),
            remote_tracks: Vec::new(),
            applied_candidates: 0,
            local_candidates: Vec::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_remote_candidates(&self) -> &CandidateBuffer {
        &self.pending_remote_candidates
    }

    pub fn remote_tracks(&self) -> &[RemoteTrackInfo] {
        &self.remote_tracks
    }

    /// Remote candidates handed to the transport so far.
    pub fn applied_candidates(&self) -> usize {
        self.applied_candidates
    }

    /// Local candidates trickled to the peer.
    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    /// Answerer that has not seen the offer yet.
    pub(crate) fn awaiting_offer(&self) -> bool {
        self.role == Role::Answerer
            && self.state == SessionState::Negotiating
            && self.remote_description.is_none()
    }

    /// Offerer whose offer is out and unanswered.
    pub(crate) fn awaiting_answer(&self) -> bool {
        self.role == Role::Offerer
            && self.state == SessionState::Negotiating
            && self.local_description.is_some()
            && self.remote_description.is_none()
    }
}
