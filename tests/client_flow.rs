mod support;

use onvia_lib::client::{ChatClient, ChatSender, ClientEvent, ClientParts};
use onvia_lib::config::{ClientConfig, DEFAULT_ICE_SERVERS};
use onvia_lib::error::{CaptureError, ClientError, ConfigError, SessionError};
use onvia_lib::media::{MediaDevices, SampleTrackDevices};
use onvia_lib::pairing::PairingState;
use onvia_lib::peer::transport::{TransportEvent, TransportState};
use onvia_lib::peer::{
    DisconnectReason, FailureReason, MediaKind, RemoteTrackInfo, Role, ServerConfig,
    SessionDescription, SessionState,
};
use onvia_lib::signaling::{OutboundSignal, ReportReason, SignalingEvent};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use support::{sid, FakeFactory, RecordingSignaling, StuckDevices};
use tokio::sync::{broadcast, mpsc};

struct Setup {
    client: ChatClient,
    events: broadcast::Receiver<ClientEvent>,
    relay: mpsc::UnboundedSender<SignalingEvent>,
    signaling: Arc<RecordingSignaling>,
    factory: Arc<FakeFactory>,
}

fn setup_with(config: ClientConfig, devices: Arc<dyn MediaDevices>) -> Setup {
    let signaling = Arc::new(RecordingSignaling::default());
    let factory = Arc::new(FakeFactory::default());
    let (relay, signaling_events) = mpsc::unbounded_channel();
    let client = ChatClient::spawn(
        &config,
        ClientParts {
            signaling: signaling.clone(),
            signaling_events,
            factory: factory.clone(),
            devices,
            ice_servers: Arc::new(RwLock::new(config.ice_servers.clone())),
        },
    );
    let events = client.subscribe();
    Setup {
        client,
        events,
        relay,
        signaling,
        factory,
    }
}

fn setup() -> Setup {
    setup_with(ClientConfig::default(), Arc::new(SampleTrackDevices::new("test")))
}

/// Waits for the first published state equal to `state`.
async fn wait_for_state(events: &mut broadcast::Receiver<ClientEvent>, state: SessionState) {
    wait_for(events, |e| matches!(e, ClientEvent::StateChanged { state: s, .. } if *s == state)).await;
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not published in time")
}

/// Lets the dispatch task drain everything queued so far. Needs paused time.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn stray_offer(id: &str) -> SignalingEvent {
    SignalingEvent::Offer {
        session_id: sid(id),
        description: SessionDescription::offer("v=0"),
    }
}

async fn connect_as_offerer(s: &mut Setup) {
    s.client.start_chat().await.unwrap();
    s.relay
        .send(SignalingEvent::MatchFound {
            session_id: sid("s1"),
            role: Role::Offerer,
        })
        .unwrap();
    wait_for_state(&mut s.events, SessionState::Negotiating).await;
    s.relay
        .send(SignalingEvent::Answer {
            session_id: sid("s1"),
            description: SessionDescription::answer("v=0"),
        })
        .unwrap();
    s.factory.last().emit(TransportEvent::RemoteTrack(RemoteTrackInfo {
        id: "remote-video".into(),
        kind: MediaKind::Video,
    }));
    wait_for_state(&mut s.events, SessionState::Connected).await;
}

#[tokio::test]
async fn start_chat_acquires_media_and_searches() {
    let mut s = setup();
    s.client.start_chat().await.unwrap();
    wait_for_state(&mut s.events, SessionState::AwaitingMatch).await;

    let snapshot = s.client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::AwaitingMatch);
    assert_eq!(snapshot.pairing, PairingState::Searching);
    assert!(snapshot.media_acquired);
    assert_eq!(s.signaling.sent(), vec![OutboundSignal::FindPeer]);

    let again = s.client.find_partner().await.unwrap_err();
    assert!(matches!(again, ClientError::Session(SessionError::AlreadySearching)));
    assert!(s.client.cancel_search().await.unwrap());
    assert_eq!(s.signaling.names(), vec!["find-peer", "cancel-find"]);
}

#[tokio::test]
async fn searching_needs_media_first() {
    let s = setup();
    let err = s.client.find_partner().await.unwrap_err();
    assert!(matches!(err, ClientError::Session(SessionError::MediaNotAcquired)));
    assert!(s.signaling.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unanswered_permission_prompt_times_out() {
    let s = setup_with(ClientConfig::default(), Arc::new(StuckDevices));
    let err = s.client.start_chat().await.unwrap_err();
    assert!(matches!(err, ClientError::Capture(CaptureError::TimedOut)));
    assert!(s.signaling.sent().is_empty());
}

#[tokio::test]
async fn chat_round_trip_while_connected() {
    let mut s = setup();
    connect_as_offerer(&mut s).await;

    let sent = s.client.send_chat_message("hi".into()).await.unwrap();
    assert_eq!(sent.sender, ChatSender::User);
    assert!(s
        .signaling
        .sent()
        .contains(&OutboundSignal::ChatMessage("hi".into())));

    let blank = s.client.send_chat_message("   ".into()).await.unwrap_err();
    assert!(matches!(blank, ClientError::EmptyMessage));

    s.relay
        .send(SignalingEvent::ChatMessage("hello".into()))
        .unwrap();
    let event = wait_for(&mut s.events, |e| {
        matches!(e, ClientEvent::ChatMessage(m) if m.sender == ChatSender::Stranger)
    })
    .await;
    let ClientEvent::ChatMessage(message) = event else {
        unreachable!()
    };
    assert_eq!(message.text, "hello");

    let snapshot = s.client.snapshot().await.unwrap();
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.session_id, Some(sid("s1")));
    assert_eq!(snapshot.role, Some(Role::Offerer));
}

#[tokio::test]
async fn chat_needs_a_partner() {
    let s = setup();
    let err = s.client.send_chat_message("hi".into()).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn partner_leaving_returns_to_idle_with_media() {
    let mut s = setup();
    connect_as_offerer(&mut s).await;

    s.relay
        .send(SignalingEvent::PeerDisconnected {
            session_id: sid("s1"),
        })
        .unwrap();
    wait_for_state(
        &mut s.events,
        SessionState::Disconnected(DisconnectReason::PeerLeft),
    )
    .await;

    let snapshot = s.client.snapshot().await.unwrap();
    assert_eq!(snapshot.pairing, PairingState::Idle);
    assert!(snapshot.media_acquired);
    assert_eq!(s.signaling.count("find-peer"), 1);
}

#[tokio::test]
async fn transport_failure_requeues() {
    let mut s = setup();
    s.client.start_chat().await.unwrap();
    s.relay
        .send(SignalingEvent::Ready {
            session_id: sid("s1"),
        })
        .unwrap();
    wait_for_state(&mut s.events, SessionState::Negotiating).await;
    assert_eq!(s.signaling.count("offer"), 1);

    s.factory
        .last()
        .emit(TransportEvent::ConnectionState(TransportState::Failed));
    wait_for(&mut s.events, |e| {
        matches!(
            e,
            ClientEvent::StateChanged { state: SessionState::AwaitingMatch, session_id: Some(id) } if *id == sid("s1")
        )
    })
    .await;

    assert_eq!(s.signaling.count("find-peer"), 2);
    let snapshot = s.client.snapshot().await.unwrap();
    assert_eq!(snapshot.pairing, PairingState::Searching);
}

#[tokio::test]
async fn failure_without_requeue_shows_failed() {
    let config = ClientConfig {
        requeue_on_failure: false,
        ..ClientConfig::default()
    };
    let mut s = setup_with(config, Arc::new(SampleTrackDevices::new("test")));
    s.client.start_chat().await.unwrap();
    s.relay
        .send(SignalingEvent::MatchFound {
            session_id: sid("s1"),
            role: Role::Offerer,
        })
        .unwrap();
    wait_for_state(&mut s.events, SessionState::Negotiating).await;

    s.factory
        .last()
        .emit(TransportEvent::ConnectionState(TransportState::Failed));
    wait_for_state(&mut s.events, SessionState::Failed(FailureReason::IceFailed)).await;
    assert_eq!(s.signaling.count("find-peer"), 1);
}

#[tokio::test]
async fn skip_moves_on_and_clears_chat() {
    let mut s = setup();
    connect_as_offerer(&mut s).await;
    s.client.send_chat_message("bye".into()).await.unwrap();

    s.client.skip().await.unwrap();
    wait_for(&mut s.events, |e| *e == ClientEvent::ChatCleared).await;

    let snapshot = s.client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::AwaitingMatch);
    assert!(snapshot.messages.is_empty());
    assert_eq!(s.factory.get(0).count(&support::Op::Close), 1);
    assert_eq!(s.signaling.names().last(), Some(&"find-peer"));
}

#[tokio::test]
async fn relay_reconnect_resends_search() {
    let s = setup();
    s.client.start_chat().await.unwrap();
    s.relay.send(SignalingEvent::Reconnected).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while s.signaling.count("find-peer") < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    let snapshot = s.client.snapshot().await.unwrap();
    assert_eq!(snapshot.pairing, PairingState::Searching);
}

#[tokio::test]
async fn report_goes_to_the_relay() {
    let mut s = setup();
    connect_as_offerer(&mut s).await;
    s.client
        .report_user(ReportReason::Spam, "ads".into())
        .await
        .unwrap();
    assert!(s.signaling.sent().contains(&OutboundSignal::ReportUser {
        reason: ReportReason::Spam,
        details: "ads".into()
    }));
}

#[tokio::test]
async fn toggles_are_published() {
    let mut s = setup();
    s.client.acquire_media().await.unwrap();
    assert!(!s.client.toggle_camera());
    wait_for(&mut s.events, |e| {
        *e == ClientEvent::MediaChanged {
            video: false,
            audio: true,
        }
    })
    .await;
    assert!(s.client.toggle_camera());
    assert!(!s.client.toggle_microphone());
    assert!(!s.client.media().unwrap().audio_enabled());
}

#[tokio::test]
async fn ice_servers_are_validated() {
    let s = setup();
    let turn = ServerConfig {
        id: "t".into(),
        r#type: "turn".into(),
        url: "turn.example:3478".into(),
        username: None,
        credential: None,
    };
    let err = s.client.set_ice_servers(vec![turn.clone()]).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Config(ConfigError::InvalidIceServer { .. })
    ));

    let with_creds = ServerConfig {
        username: Some("u".into()),
        credential: Some("p".into()),
        ..turn
    };
    s.client.set_ice_servers(vec![with_creds]).unwrap();
    assert_eq!(s.client.ice_servers()[0].url, "turn:turn.example:3478");

    s.client.set_ice_servers(Vec::new()).unwrap();
    assert_eq!(s.client.ice_servers(), *DEFAULT_ICE_SERVERS);
}

#[tokio::test]
async fn shutdown_releases_everything() {
    let mut s = setup();
    connect_as_offerer(&mut s).await;
    let media = s.client.media().unwrap();

    s.client.shutdown().await;

    assert!(!media.is_valid());
    assert_eq!(s.factory.last().count(&support::Op::Close), 1);
    assert!(matches!(
        s.client.snapshot().await,
        Err(ClientError::Shutdown)
    ));
}

#[tokio::test]
async fn offer_while_searching_opens_an_answerer_session() {
    let mut s = setup();
    s.client.start_chat().await.unwrap();
    s.relay.send(stray_offer("s9")).unwrap();
    wait_for_state(&mut s.events, SessionState::Negotiating).await;

    let snapshot = s.client.snapshot().await.unwrap();
    assert_eq!(snapshot.pairing, PairingState::Matched(sid("s9")));
    assert_eq!(snapshot.role, Some(Role::Answerer));
    assert_eq!(s.signaling.count("answer"), 1);
}

#[tokio::test(start_paused = true)]
async fn offer_after_cancel_is_ignored() {
    let s = setup();
    s.client.start_chat().await.unwrap();
    assert!(s.client.cancel_search().await.unwrap());

    s.relay.send(stray_offer("stray")).unwrap();
    settle().await;

    let snapshot = s.client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Idle);
    assert_eq!(snapshot.pairing, PairingState::Idle);
    assert_eq!(s.factory.count(), 0);
    assert_eq!(s.signaling.names(), vec!["find-peer", "cancel-find"]);
}

#[tokio::test(start_paused = true)]
async fn offer_after_end_chat_is_ignored() {
    let mut s = setup();
    connect_as_offerer(&mut s).await;
    s.client.end_chat().await.unwrap();

    s.relay.send(stray_offer("stray")).unwrap();
    settle().await;

    let snapshot = s.client.snapshot().await.unwrap();
    assert_eq!(
        snapshot.state,
        SessionState::Disconnected(DisconnectReason::Local)
    );
    assert_eq!(snapshot.pairing, PairingState::Idle);
    assert_eq!(snapshot.session_id, Some(sid("s1")));
    assert_eq!(s.factory.count(), 1);
    assert_eq!(s.signaling.count("answer"), 0);
}

#[tokio::test]
async fn skip_after_a_requeue_is_not_an_error() {
    let mut s = setup();
    s.client.start_chat().await.unwrap();
    s.relay
        .send(SignalingEvent::MatchFound {
            session_id: sid("s1"),
            role: Role::Offerer,
        })
        .unwrap();
    wait_for_state(&mut s.events, SessionState::Negotiating).await;
    s.factory
        .last()
        .emit(TransportEvent::ConnectionState(TransportState::Failed));
    wait_for_state(&mut s.events, SessionState::AwaitingMatch).await;

    s.client.skip().await.unwrap();
    assert_eq!(s.signaling.count("find-peer"), 2);
}
