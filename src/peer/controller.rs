//! Session state machine.
//!
//! ```text
//! Idle --start_negotiation--> Negotiating --first remote track--> Connected
//! Negotiating --transport failure / timeout--> Failed
//! Connected --transport lost | peer left | disconnect()--> Disconnected
//! Disconnected/Failed --start_negotiation--> Negotiating (new session)
//! ```
//!
//! The controller is driven from a single task (see [`crate::client`]); every method takes
//! `&mut self` and runs to completion before the next input is looked at. Callbacks from the
//! transport library arrive as [`SessionTransportEvent`]s tagged with their session id, and
//! anything tagged with a session other than the current one is dropped.

use crate::error::{SessionError, TransportError};
use crate::logger::dump_candidate;
use crate::media::MediaCaptureManager;
use crate::pairing::PairingCoordinator;
use crate::peer::ice::analyze_candidates;
use crate::peer::state::Session;
use crate::peer::transport::{
    PeerTransport, SessionTransportEvent, TransportEvent, TransportEventSender, TransportFactory,
    TransportState,
};
use crate::peer::types::{
    DisconnectReason, FailureReason, IceCandidate, RemoteTrackInfo, Role, SdpKind,
    SessionDescription, SessionId, SessionState,
};
use crate::signaling::{OutboundSignal, Signaling};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub negotiation: Duration,
    pub grace: Duration,
}

/// Lifecycle notifications, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        session_id: SessionId,
        state: SessionState,
    },
    LocalDescriptionSent {
        session_id: SessionId,
        kind: SdpKind,
    },
    RemoteDescriptionApplied {
        session_id: SessionId,
        kind: SdpKind,
    },
    CandidateApplied {
        session_id: SessionId,
        candidate: IceCandidate,
    },
    RemoteTrack {
        session_id: SessionId,
        track: RemoteTrackInfo,
    },
    /// The session's transport has been closed; nothing from it can reach the peer anymore.
    TransportClosed { session_id: SessionId },
}

pub struct PeerSessionController {
    signaling: Arc<dyn Signaling>,
    factory: Arc<dyn TransportFactory>,
    media: Arc<MediaCaptureManager>,
    timeouts: SessionTimeouts,
    transport_events: TransportEventSender,
    lifecycle: broadcast::Sender<SessionEvent>,
    session: Option<Session>,
    transport: Option<Arc<dyn PeerTransport>>,
    negotiation_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
}

impl PeerSessionController {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        factory: Arc<dyn TransportFactory>,
        media: Arc<MediaCaptureManager>,
        timeouts: SessionTimeouts,
        transport_events: TransportEventSender,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(128);
        Self {
            signaling,
            factory,
            media,
            timeouts,
            transport_events,
            lifecycle,
            session: None,
            transport: None,
            negotiation_timer: None,
            grace_timer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, |s| s.state)
    }

    /// The current session, or the last one once it has ended.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.lifecycle.subscribe()
    }

    fn is_current(&self, session_id: &SessionId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.state.is_active() && &s.id == session_id)
    }

    /// Builds a transport for a new session and, as offerer, sends the offer.
    pub async fn start_negotiation(
        &mut self,
        session_id: SessionId,
        role: Role,
    ) -> Result<(), SessionError> {
        let state = self.state();
        if !state.can_start() {
            warn!(%session_id, ?state, "start_negotiation rejected: session already active");
            return Err(SessionError::AlreadyNegotiating);
        }
        let media = self
            .media
            .handle()
            .filter(|h| h.is_valid())
            .ok_or(SessionError::MediaNotAcquired)?;

        info!(%session_id, ?role, "starting negotiation");
        let transport = self
            .factory
            .create(session_id.clone(), self.transport_events.clone())
            .await?;
        for track in media.tracks() {
            if let Err(e) = transport.attach_track(track.clone()).await {
                let _ = transport.close().await;
                return Err(e.into());
            }
        }

        self.session = Some(Session::new(session_id.clone(), role));
        self.transport = Some(transport.clone());
        self.publish_state();
        self.arm_negotiation_timer(&session_id);

        if role == Role::Offerer {
            match transport.create_offer().await {
                Ok(offer) => self.send_local_description(offer),
                Err(e) => {
                    self.teardown(SessionState::Failed(FailureReason::TransportError))
                        .await;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Accepted in `Idle` (the offer opens an answerer session) or when the current
    /// answerer session is still waiting for it. Anything else is stale; after a session
    /// has ended only a fresh match may open the next one.
    pub async fn on_offer_received(
        &mut self,
        session_id: SessionId,
        offer: SessionDescription,
    ) -> Result<(), SessionError> {
        if offer.kind != SdpKind::Offer {
            return Err(self.stale("offer", &session_id));
        }

        if self.session.is_none() {
            self.start_negotiation(session_id.clone(), Role::Answerer)
                .await?;
        } else if !self
            .session
            .as_ref()
            .is_some_and(|s| s.id == session_id && s.awaiting_offer())
        {
            return Err(self.stale("offer", &session_id));
        }

        self.apply_remote_description(offer).await?;

        let transport = self.current_transport()?;
        match transport.create_answer().await {
            Ok(answer) => {
                self.send_local_description(answer);
                Ok(())
            }
            Err(e) => {
                self.teardown(SessionState::Failed(FailureReason::TransportError))
                    .await;
                Err(e.into())
            }
        }
    }

    pub async fn on_answer_received(
        &mut self,
        session_id: SessionId,
        answer: SessionDescription,
    ) -> Result<(), SessionError> {
        let expected = answer.kind == SdpKind::Answer
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.id == session_id && s.awaiting_answer());
        if !expected {
            return Err(self.stale("answer", &session_id));
        }
        self.apply_remote_description(answer).await
    }

    /// Applies the candidate, or buffers it while the remote description is missing.
    pub async fn on_ice_candidate_received(
        &mut self,
        session_id: SessionId,
        candidate: IceCandidate,
    ) -> Result<(), SessionError> {
        if !self.is_current(&session_id) {
            return Err(self.stale("ice-candidate", &session_id));
        }
        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::StaleSignal("ice-candidate"));
        };
        if session.remote_description.is_none() {
            session.pending_remote_candidates.push(candidate);
            trace!(
                %session_id,
                "buffered remote candidate ({} pending)",
                session.pending_remote_candidates.len()
            );
            return Ok(());
        }

        let transport = self.current_transport()?;
        self.apply_candidate(&transport, &session_id, candidate)
            .await;
        Ok(())
    }

    /// Trickles a freshly gathered local candidate to the peer.
    pub fn on_local_ice_candidate_gathered(&mut self, session_id: SessionId, candidate: IceCandidate) {
        if !self.is_current(&session_id) {
            debug!(%session_id, "local candidate for a finished session dropped");
            return;
        }
        dump_candidate("LOCAL", &candidate);
        if let Some(session) = self.session.as_mut() {
            session.local_candidates.push(candidate.clone());
        }
        self.signaling.send(OutboundSignal::IceCandidate {
            session_id,
            candidate,
        });
    }

    pub async fn on_peer_disconnected(&mut self, session_id: SessionId) -> Result<(), SessionError> {
        if !self.is_current(&session_id) {
            return Err(self.stale("peer-disconnected", &session_id));
        }
        info!(%session_id, "peer left");
        self.disconnect_with(DisconnectReason::PeerLeft).await;
        Ok(())
    }

    pub async fn on_transport_event(&mut self, event: SessionTransportEvent) {
        let SessionTransportEvent { session_id, event } = event;
        if !self.is_current(&session_id) {
            debug!(%session_id, ?event, "event from a finished session dropped");
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.on_local_ice_candidate_gathered(session_id, candidate)
            }
            TransportEvent::GatheringComplete => {
                debug!(%session_id, "ICE gathering complete");
                if let Some(session) = self.session.as_ref() {
                    analyze_candidates(&session.local_candidates);
                }
            }
            TransportEvent::RemoteTrack(track) => self.on_remote_track(session_id, track),
            TransportEvent::ConnectionState(state) => self.on_connection_state(state).await,
            TransportEvent::NegotiationTimedOut => {
                if self.state() == SessionState::Negotiating {
                    warn!(%session_id, "negotiation timed out");
                    self.teardown(SessionState::Failed(FailureReason::NegotiationTimeout))
                        .await;
                }
            }
            TransportEvent::GracePeriodElapsed => {
                self.grace_timer = None;
                if self.state() == SessionState::Connected {
                    warn!(%session_id, "transport did not recover within the grace period");
                    self.disconnect_with(DisconnectReason::TransportLost).await;
                }
            }
        }
    }

    /// Closes the current transport and keeps local tracks for the next session.
    /// A no-op when nothing is active.
    pub async fn disconnect(&mut self) {
        self.disconnect_with(DisconnectReason::Local).await;
    }

    pub async fn disconnect_with(&mut self, reason: DisconnectReason) {
        if !self.state().is_active() {
            debug!("disconnect: no active session");
            return;
        }
        self.teardown(SessionState::Disconnected(reason)).await;
    }

    /// Ends the current session and asks the relay for a new partner. The old transport is
    /// closed before the search request leaves.
    pub async fn skip(&mut self, pairing: &mut PairingCoordinator) -> Result<(), SessionError> {
        self.disconnect().await;
        if let Some(session) = self.session.as_ref() {
            pairing.on_session_ended(&session.id, session.state);
        }
        if pairing.is_searching() {
            debug!("skip: search already outstanding");
            return Ok(());
        }
        pairing.find_partner()
    }

    fn on_remote_track(&mut self, session_id: SessionId, track: RemoteTrackInfo) {
        if let Some(session) = self.session.as_mut() {
            session.remote_tracks.push(track.clone());
        }
        self.emit(SessionEvent::RemoteTrack {
            session_id,
            track,
        });
        if self.state() == SessionState::Negotiating {
            if let Some(timer) = self.negotiation_timer.take() {
                timer.abort();
            }
            self.set_state(SessionState::Connected);
        }
    }

    async fn on_connection_state(&mut self, transport: TransportState) {
        match (self.state(), transport) {
            (_, TransportState::Connected) => {
                if let Some(timer) = self.grace_timer.take() {
                    info!("transport recovered");
                    timer.abort();
                }
            }
            (SessionState::Connected, TransportState::Disconnected) => {
                if self.grace_timer.is_none() {
                    info!(
                        "transport disconnected, waiting {:?} for recovery",
                        self.timeouts.grace
                    );
                    self.arm_grace_timer();
                }
            }
            (SessionState::Negotiating, TransportState::Failed | TransportState::Closed) => {
                self.teardown(SessionState::Failed(FailureReason::IceFailed))
                    .await;
            }
            (SessionState::Connected, TransportState::Failed | TransportState::Closed) => {
                self.disconnect_with(DisconnectReason::TransportLost).await;
            }
            (state, transport) => trace!(?state, ?transport, "transport state ignored"),
        }
    }

    async fn apply_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), SessionError> {
        let transport = self.current_transport()?;
        let kind = desc.kind;
        if let Err(e) = transport.set_remote_description(desc.clone()).await {
            warn!("remote {kind:?} rejected: {e}");
            self.teardown(SessionState::Failed(FailureReason::TransportError))
                .await;
            return Err(e.into());
        }

        let Some(session) = self.session.as_mut() else {
            return Err(TransportError::Closed.into());
        };
        session.remote_description = Some(desc);
        let session_id = session.id.clone();
        let pending = session.pending_remote_candidates.drain();
        self.emit(SessionEvent::RemoteDescriptionApplied {
            session_id: session_id.clone(),
            kind,
        });

        if !pending.is_empty() {
            debug!(%session_id, "flushing {} buffered candidate(s)", pending.len());
        }
        for candidate in pending {
            self.apply_candidate(&transport, &session_id, candidate)
                .await;
        }
        Ok(())
    }

    async fn apply_candidate(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        session_id: &SessionId,
        candidate: IceCandidate,
    ) {
        match transport.add_ice_candidate(candidate.clone()).await {
            Ok(()) => {
                dump_candidate("REMOTE", &candidate);
                if let Some(session) = self.session.as_mut() {
                    session.applied_candidates += 1;
                }
                self.emit(SessionEvent::CandidateApplied {
                    session_id: session_id.clone(),
                    candidate,
                });
            }
            Err(e) => warn!(%session_id, "failed to add remote candidate: {e}"),
        }
    }

    fn send_local_description(&mut self, desc: SessionDescription) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.local_description = Some(desc.clone());
        let session_id = session.id.clone();
        let kind = desc.kind;
        let signal = match kind {
            SdpKind::Offer => OutboundSignal::Offer {
                session_id: session_id.clone(),
                description: desc,
            },
            SdpKind::Answer => OutboundSignal::Answer {
                session_id: session_id.clone(),
                description: desc,
            },
        };
        self.signaling.send(signal);
        debug!(%session_id, "sent local {kind:?}");
        self.emit(SessionEvent::LocalDescriptionSent { session_id, kind });
    }

    /// Detaches local tracks, closes the transport, then publishes the final state.
    async fn teardown(&mut self, final_state: SessionState) {
        for timer in [self.negotiation_timer.take(), self.grace_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.detach_tracks().await {
                debug!("detach_tracks: {e}");
            }
            if let Err(e) = transport.close().await {
                warn!("closing transport: {e}");
            }
            if let Some(session) = self.session.as_ref() {
                self.emit(SessionEvent::TransportClosed {
                    session_id: session.id.clone(),
                });
            }
        }
        self.set_state(final_state);
    }

    fn current_transport(&self) -> Result<Arc<dyn PeerTransport>, SessionError> {
        self.transport
            .clone()
            .ok_or(SessionError::TransportFailure(TransportError::Closed))
    }

    fn stale(&self, what: &'static str, session_id: &SessionId) -> SessionError {
        warn!(%session_id, state = ?self.state(), "StaleSignal: {what} discarded");
        SessionError::StaleSignal(what)
    }

    fn set_state(&mut self, state: SessionState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state == state {
            return;
        }
        session.state = state;
        info!(session_id = %session.id, ?state, "session state changed");
        let session_id = session.id.clone();
        self.emit(SessionEvent::StateChanged { session_id, state });
    }

    fn publish_state(&mut self) {
        if let Some(session) = self.session.as_ref() {
            info!(session_id = %session.id, state = ?session.state, "session created");
            self.emit(SessionEvent::StateChanged {
                session_id: session.id.clone(),
                state: session.state,
            });
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.lifecycle.send(event);
    }

    fn arm_negotiation_timer(&mut self, session_id: &SessionId) {
        self.negotiation_timer = Some(self.schedule(
            session_id.clone(),
            self.timeouts.negotiation,
            TransportEvent::NegotiationTimedOut,
        ));
    }

    fn arm_grace_timer(&mut self) {
        if let Some(session) = self.session.as_ref() {
            self.grace_timer = Some(self.schedule(
                session.id.clone(),
                self.timeouts.grace,
                TransportEvent::GracePeriodElapsed,
            ));
        }
    }

    fn schedule(&self, session_id: SessionId, after: Duration, event: TransportEvent) -> JoinHandle<()> {
        let tx = self.transport_events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(SessionTransportEvent { session_id, event });
        })
    }
}

impl Drop for PeerSessionController {
    fn drop(&mut self) {
        for timer in [self.negotiation_timer.take(), self.grace_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }
}
