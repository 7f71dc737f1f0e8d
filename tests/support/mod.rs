#![allow(dead_code)]

use async_trait::async_trait;
use onvia_lib::error::{CaptureError, TransportError};
use onvia_lib::media::{LocalTrack, MediaCaptureManager, MediaConstraints, MediaDevices, SampleTrackDevices};
use onvia_lib::peer::transport::{
    PeerTransport, SessionTransportEvent, TransportEvent, TransportEventReceiver,
    TransportEventSender, TransportFactory,
};
use onvia_lib::peer::{
    IceCandidate, MediaKind, PeerSessionController, SdpKind, SessionDescription, SessionEvent,
    SessionId, SessionTimeouts,
};
use onvia_lib::signaling::{OutboundSignal, Signaling};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Attach(MediaKind),
    Detach,
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

/// In-memory transport that records every call.
pub struct FakeTransport {
    pub session_id: SessionId,
    ops: Mutex<Vec<Op>>,
    events: TransportEventSender,
}

impl FakeTransport {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, op: &Op) -> usize {
        self.ops.lock().iter().filter(|o| *o == op).count()
    }

    /// Pretends the transport library fired a callback.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(SessionTransportEvent {
            session_id: self.session_id.clone(),
            event,
        });
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn attach_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        self.record(Op::Attach(track.kind()));
        Ok(())
    }

    async fn detach_tracks(&self) -> Result<(), TransportError> {
        self.record(Op::Detach);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Op::CreateOffer);
        Ok(SessionDescription::offer(format!("offer-{}", self.session_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Op::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer-{}", self.session_id)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(Op::SetRemote(desc.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(Op::Close);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn get(&self, index: usize) -> Arc<FakeTransport> {
        self.created.lock()[index].clone()
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no transport created")
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        session_id: SessionId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(FakeTransport {
            session_id,
            ops: Mutex::new(Vec::new()),
            events,
        });
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<OutboundSignal>>,
}

impl RecordingSignaling {
    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(OutboundSignal::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl Signaling for RecordingSignaling {
    fn send(&self, signal: OutboundSignal) {
        self.sent.lock().push(signal);
    }
}

/// Permission prompt nobody answers.
pub struct StuckDevices;

#[async_trait]
impl MediaDevices for StuckDevices {
    async fn get_user_media(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<Vec<Arc<LocalTrack>>, CaptureError> {
        std::future::pending().await
    }
}

pub const TIMEOUTS: SessionTimeouts = SessionTimeouts {
    negotiation: Duration::from_secs(30),
    grace: Duration::from_secs(10),
};

pub struct Harness {
    pub controller: PeerSessionController,
    pub signaling: Arc<RecordingSignaling>,
    pub factory: Arc<FakeFactory>,
    pub media: Arc<MediaCaptureManager>,
    pub transport_events: TransportEventReceiver,
    pub lifecycle: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    pub async fn new() -> Self {
        let harness = Self::without_media();
        harness.media.acquire().await.unwrap();
        harness
    }

    pub fn without_media() -> Self {
        let signaling = Arc::new(RecordingSignaling::default());
        let factory = Arc::new(FakeFactory::default());
        let media = Arc::new(MediaCaptureManager::new(Arc::new(SampleTrackDevices::new("test"))));
        let (tx, transport_events) = mpsc::unbounded_channel();
        let controller = PeerSessionController::new(
            signaling.clone(),
            factory.clone(),
            media.clone(),
            TIMEOUTS,
            tx,
        );
        let lifecycle = controller.subscribe();
        Self {
            controller,
            signaling,
            factory,
            media,
            transport_events,
            lifecycle,
        }
    }

    /// Lifecycle events published so far.
    pub fn events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.lifecycle.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn transport_event(&mut self, session_id: &str, event: TransportEvent) {
        self.controller
            .on_transport_event(SessionTransportEvent {
                session_id: session_id.into(),
                event,
            })
            .await;
    }

    pub async fn remote_video(&mut self, session_id: &str) {
        self.transport_event(
            session_id,
            TransportEvent::RemoteTrack(onvia_lib::peer::RemoteTrackInfo {
                id: "remote-video".into(),
                kind: MediaKind::Video,
            }),
        )
        .await;
    }
}

pub fn candidate(n: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn sid(id: &str) -> SessionId {
    SessionId::from(id)
}
