use crate::error::SessionError;
use crate::peer::controller::PeerSessionController;
use crate::peer::types::{DisconnectReason, Role, SessionDescription, SessionId, SessionState};
use crate::signaling::{OutboundSignal, Signaling};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", content = "sessionId", rename_all = "kebab-case")]
pub enum PairingState {
    Idle,
    /// `find-peer` is out and unanswered.
    Searching,
    Matched(SessionId),
}

/// Matchmaking requests against the relay. At most one search is outstanding at a time.
pub struct PairingCoordinator {
    signaling: Arc<dyn Signaling>,
    state: PairingState,
    requeue_on_failure: bool,
}

impl PairingCoordinator {
    pub fn new(signaling: Arc<dyn Signaling>, requeue_on_failure: bool) -> Self {
        Self {
            signaling,
            state: PairingState::Idle,
            requeue_on_failure,
        }
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    pub fn is_searching(&self) -> bool {
        self.state == PairingState::Searching
    }

    pub fn find_partner(&mut self) -> Result<(), SessionError> {
        match &self.state {
            PairingState::Idle => {
                info!("looking for a partner");
                self.signaling.send(OutboundSignal::FindPeer);
                self.state = PairingState::Searching;
                Ok(())
            }
            PairingState::Searching => Err(SessionError::AlreadySearching),
            PairingState::Matched(session_id) => {
                debug!(%session_id, "find_partner while matched");
                Err(SessionError::AlreadySearching)
            }
        }
    }

    /// Withdraws an outstanding search. Returns whether there was one.
    pub fn cancel_search(&mut self) -> bool {
        if !self.is_searching() {
            return false;
        }
        info!("search cancelled");
        self.signaling.send(OutboundSignal::CancelFind);
        self.state = PairingState::Idle;
        true
    }

    /// Relay paired us. Starts negotiation in the assigned role.
    pub async fn on_match_found(
        &mut self,
        session_id: SessionId,
        role: Role,
        controller: &mut PeerSessionController,
    ) -> Result<(), SessionError> {
        if !self.is_searching() {
            warn!(%session_id, state = ?self.state, "StaleSignal: match-found without a search");
            return Err(SessionError::StaleSignal("match-found"));
        }
        info!(%session_id, ?role, "partner found");
        self.state = PairingState::Matched(session_id.clone());
        let started = controller.start_negotiation(session_id, role).await;
        if started.is_err() {
            // Forget the match so the user can search again.
            self.state = PairingState::Idle;
        }
        started
    }

    /// Routes an inbound offer. An offer for the controller's session goes straight to it.
    /// An offer for an unknown session stands in for a match notice, so it is only taken
    /// while a search is outstanding.
    pub async fn on_offer(
        &mut self,
        session_id: SessionId,
        offer: SessionDescription,
        controller: &mut PeerSessionController,
    ) -> Result<(), SessionError> {
        let known = controller.session().is_some_and(|s| s.id() == &session_id);
        if !known {
            if !self.is_searching() {
                warn!(%session_id, state = ?self.state, "StaleSignal: offer without a search");
                return Err(SessionError::StaleSignal("offer"));
            }
            debug!(%session_id, "session opened by offer");
            self.on_match_found(session_id.clone(), Role::Answerer, controller)
                .await?;
        }
        controller.on_offer_received(session_id, offer).await
    }

    /// Called whenever the controller's session has ended. Idempotent: only the first call
    /// for the matched session has an effect. Returns whether a new search was sent.
    pub fn on_session_ended(&mut self, session_id: &SessionId, state: SessionState) -> bool {
        if self.state != PairingState::Matched(session_id.clone()) {
            return false;
        }
        self.state = PairingState::Idle;
        if self.requeue_on_failure && should_requeue(state) {
            info!(%session_id, ?state, "session lost; searching again");
            return self.find_partner().is_ok();
        }
        false
    }

    /// The relay link was re-established and the relay forgot us. The running session (if
    /// any) is gone too.
    pub async fn on_channel_reset(&mut self, controller: &mut PeerSessionController) {
        controller
            .disconnect_with(DisconnectReason::ChannelReset)
            .await;
        match self.state.clone() {
            PairingState::Idle => {}
            PairingState::Searching => {
                info!("re-sending search after relay reconnect");
                self.signaling.send(OutboundSignal::FindPeer);
            }
            PairingState::Matched(session_id) => {
                let state = controller.state();
                if !self.on_session_ended(&session_id, state) {
                    self.state = PairingState::Idle;
                }
            }
        }
    }
}

fn should_requeue(state: SessionState) -> bool {
    matches!(
        state,
        SessionState::Failed(_)
            | SessionState::Disconnected(DisconnectReason::TransportLost)
            | SessionState::Disconnected(DisconnectReason::ChannelReset)
    )
}
