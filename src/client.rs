//! Application-facing client.
//!
//! [`ChatClient`] is a cheap, cloneable handle. All session work happens on one dispatch task
//! that owns the [`PeerSessionController`] and the [`PairingCoordinator`] and takes user
//! commands, relay events and transport events one at a time, each to completion.

use crate::config::{validate_ice_servers, ClientConfig, DEFAULT_ICE_SERVERS};
use crate::error::{CaptureError, ClientError, SessionError};
use crate::media::{MediaCaptureManager, MediaDevices, MediaHandle, SampleTrackDevices};
use crate::pairing::{PairingCoordinator, PairingState};
use crate::peer::connection::WebRtcTransportFactory;
use crate::peer::controller::{PeerSessionController, SessionTimeouts};
use crate::peer::state::Session;
use crate::peer::transport::{TransportEventReceiver, TransportFactory};
use crate::peer::types::{RemoteTrackInfo, Role, ServerConfig, SessionId, SessionState};
use crate::signaling::{OutboundSignal, ReportReason, Signaling, SignalingChannel, SignalingEvent};
use crate::utils::random_id;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatSender {
    User,
    Stranger,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender: ChatSender,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(text: String, sender: ChatSender) -> Self {
        Self {
            id: random_id(),
            text,
            sender,
            timestamp: Utc::now(),
        }
    }
}

/// Pushed to every [`ChatClient::subscribe`]r.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    StateChanged {
        state: SessionState,
        session_id: Option<SessionId>,
    },
    ChatMessage(ChatMessage),
    ChatCleared,
    MediaChanged { video: bool, audio: bool },
    Error { message: String },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StateChanged { .. } => "state-changed",
            ClientEvent::ChatMessage(_) => "chat-message",
            ClientEvent::ChatCleared => "chat-cleared",
            ClientEvent::MediaChanged { .. } => "media-changed",
            ClientEvent::Error { .. } => "error",
        }
    }
}

/// Point-in-time view for UI polling.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub state: SessionState,
    pub pairing: PairingState,
    pub session_id: Option<SessionId>,
    pub role: Option<Role>,
    pub remote_tracks: Vec<RemoteTrackInfo>,
    pub media_acquired: bool,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub relay_connected: bool,
    pub messages: Vec<ChatMessage>,
}

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum Command {
    FindPartner(Reply<()>),
    CancelSearch(oneshot::Sender<bool>),
    Skip(Reply<()>),
    EndChat(oneshot::Sender<()>),
    SendChat(String, Reply<ChatMessage>),
    Report {
        reason: ReportReason,
        details: String,
        reply: Reply<()>,
    },
    Snapshot(oneshot::Sender<ClientSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// What a client is assembled from. [`ChatClient::connect`] builds the real ones.
pub struct ClientParts {
    pub signaling: Arc<dyn Signaling>,
    pub signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    pub factory: Arc<dyn TransportFactory>,
    pub devices: Arc<dyn MediaDevices>,
    /// Shared with the transport factory; read when each new transport is built.
    pub ice_servers: Arc<RwLock<Vec<ServerConfig>>>,
}

#[derive(Clone)]
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    media: Arc<MediaCaptureManager>,
    ice_servers: Arc<RwLock<Vec<ServerConfig>>>,
    acquire_timeout: Duration,
}

impl ChatClient {
    /// Connects to the relay and starts the dispatch task.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        crate::logger::init();
        let channel = SignalingChannel::connect(&config.relay_url, config.reconnect.clone()).await?;
        let signaling_events = channel.subscribe()?;
        let ice_servers = Arc::new(RwLock::new(config.ice_servers.clone()));
        let factory = WebRtcTransportFactory::new(ice_servers.clone())?;
        let parts = ClientParts {
            signaling: channel,
            signaling_events,
            factory: Arc::new(factory),
            devices: Arc::new(SampleTrackDevices::new(random_id())),
            ice_servers,
        };
        Ok(Self::spawn(&config, parts))
    }

    pub fn spawn(config: &ClientConfig, parts: ClientParts) -> Self {
        let media = Arc::new(MediaCaptureManager::new(parts.devices));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let controller = PeerSessionController::new(
            parts.signaling.clone(),
            parts.factory,
            media.clone(),
            SessionTimeouts {
                negotiation: config.negotiation_timeout,
                grace: config.grace_period,
            },
            transport_tx,
        );
        let pairing = PairingCoordinator::new(parts.signaling.clone(), config.requeue_on_failure);
        let (events, _) = broadcast::channel(256);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            controller,
            pairing,
            signaling: parts.signaling,
            media: media.clone(),
            events: events.clone(),
            messages: Vec::new(),
            chat_session: None,
            shown: (SessionState::Idle, None),
        };
        tokio::spawn(dispatcher.run(command_rx, parts.signaling_events, transport_rx));

        Self {
            commands,
            events,
            media,
            ice_servers: parts.ice_servers,
            acquire_timeout: config.acquire_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Acquires camera and microphone, then enters the matchmaking queue.
    pub async fn start_chat(&self) -> Result<(), ClientError> {
        self.acquire_media().await?;
        self.find_partner().await
    }

    /// Bounded by `ClientConfig::acquire_timeout`; a permission prompt nobody answers
    /// resolves to `CaptureError::TimedOut`.
    pub async fn acquire_media(&self) -> Result<MediaHandle, ClientError> {
        let handle = tokio::time::timeout(self.acquire_timeout, self.media.acquire())
            .await
            .map_err(|_| {
                warn!("media acquisition timed out after {:?}", self.acquire_timeout);
                CaptureError::TimedOut
            })??;
        self.publish_media();
        Ok(handle)
    }

    pub fn media(&self) -> Option<MediaHandle> {
        self.media.handle()
    }

    pub async fn find_partner(&self) -> Result<(), ClientError> {
        self.call(Command::FindPartner).await?
    }

    pub async fn cancel_search(&self) -> Result<bool, ClientError> {
        self.call(Command::CancelSearch).await
    }

    /// Ends the current session and searches again.
    pub async fn skip(&self) -> Result<(), ClientError> {
        self.call(Command::Skip).await?
    }

    /// Leaves the current session or search. Media stays acquired.
    pub async fn end_chat(&self) -> Result<(), ClientError> {
        self.call(Command::EndChat).await
    }

    pub fn toggle_camera(&self) -> bool {
        self.set_video_enabled(!self.media.video_enabled())
    }

    pub fn toggle_microphone(&self) -> bool {
        self.set_audio_enabled(!self.media.audio_enabled())
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        let enabled = self.media.set_video_enabled(enabled);
        self.publish_media();
        enabled
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        let enabled = self.media.set_audio_enabled(enabled);
        self.publish_media();
        enabled
    }

    pub async fn send_chat_message(&self, text: String) -> Result<ChatMessage, ClientError> {
        self.call(|reply| Command::SendChat(text, reply)).await?
    }

    pub async fn report_user(&self, reason: ReportReason, details: String) -> Result<(), ClientError> {
        self.call(|reply| Command::Report {
            reason,
            details,
            reply,
        })
        .await?
    }

    /// Replaces the ICE servers used by transports created from now on. An empty list
    /// restores the defaults.
    pub fn set_ice_servers(&self, servers: Vec<ServerConfig>) -> Result<(), ClientError> {
        let servers = if servers.is_empty() {
            DEFAULT_ICE_SERVERS.clone()
        } else {
            validate_ice_servers(servers)?
        };
        info!("ICE servers updated: {} entries", servers.len());
        *self.ice_servers.write() = servers;
        Ok(())
    }

    pub fn ice_servers(&self) -> Vec<ServerConfig> {
        self.ice_servers.read().clone()
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot, ClientError> {
        self.call(Command::Snapshot).await
    }

    /// Leaves any session or search, releases media and closes the relay link.
    pub async fn shutdown(&self) {
        if self.call(Command::Shutdown).await.is_err() {
            debug!("client already shut down");
        }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }

    fn publish_media(&self) {
        let _ = self.events.send(ClientEvent::MediaChanged {
            video: self.media.video_enabled(),
            audio: self.media.audio_enabled(),
        });
    }
}

struct Dispatcher {
    controller: PeerSessionController,
    pairing: PairingCoordinator,
    signaling: Arc<dyn Signaling>,
    media: Arc<MediaCaptureManager>,
    events: broadcast::Sender<ClientEvent>,
    messages: Vec<ChatMessage>,
    // Session the chat history belongs to.
    chat_session: Option<SessionId>,
    // Last published (state, session id).
    shown: (SessionState, Option<SessionId>),
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
        mut transport: TransportEventReceiver,
    ) {
        info!("client dispatch loop started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = signals.recv() => self.on_signal(event).await,
                Some(event) = transport.recv() => self.controller.on_transport_event(event).await,
            }
            self.sync();
        }
        info!("client dispatch loop stopped");
    }

    /// Returns false once the loop should stop.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::FindPartner(reply) => {
                let result = self
                    .require_media()
                    .and_then(|()| self.pairing.find_partner().map_err(ClientError::from));
                let _ = reply.send(result);
            }
            Command::CancelSearch(reply) => {
                let _ = reply.send(self.pairing.cancel_search());
            }
            Command::Skip(reply) => {
                let result = match self.require_media() {
                    Ok(()) => {
                        self.clear_chat();
                        self.controller
                            .skip(&mut self.pairing)
                            .await
                            .map_err(ClientError::from)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::EndChat(reply) => {
                self.pairing.cancel_search();
                self.controller.disconnect().await;
                self.clear_chat();
                let _ = reply.send(());
            }
            Command::SendChat(text, reply) => {
                let _ = reply.send(self.send_chat(text));
            }
            Command::Report {
                reason,
                details,
                reply,
            } => {
                let result = match self.controller.session() {
                    Some(session) => {
                        info!(session_id = %session.id(), ?reason, "reporting partner");
                        self.signaling
                            .send(OutboundSignal::ReportUser { reason, details });
                        Ok(())
                    }
                    None => Err(ClientError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn on_signal(&mut self, event: SignalingEvent) {
        trace!("dispatching {}", event.name());
        let result = match event {
            SignalingEvent::Ready { session_id } => {
                self.pairing
                    .on_match_found(session_id, Role::Offerer, &mut self.controller)
                    .await
            }
            SignalingEvent::MatchFound { session_id, role } => {
                self.pairing
                    .on_match_found(session_id, role, &mut self.controller)
                    .await
            }
            SignalingEvent::Offer {
                session_id,
                description,
            } => {
                self.pairing
                    .on_offer(session_id, description, &mut self.controller)
                    .await
            }
            SignalingEvent::Answer {
                session_id,
                description,
            } => {
                self.controller
                    .on_answer_received(session_id, description)
                    .await
            }
            SignalingEvent::IceCandidate {
                session_id,
                candidate,
            } => {
                self.controller
                    .on_ice_candidate_received(session_id, candidate)
                    .await
            }
            SignalingEvent::PeerDisconnected { session_id } => {
                self.controller.on_peer_disconnected(session_id).await
            }
            SignalingEvent::ChatMessage(text) => {
                if self.controller.state() == SessionState::Connected {
                    self.push_message(ChatMessage::new(text, ChatSender::Stranger));
                } else {
                    debug!("chat message outside a session dropped");
                }
                Ok(())
            }
            SignalingEvent::Reconnected => {
                self.pairing.on_channel_reset(&mut self.controller).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            if e.is_sequencing() {
                debug!("ignored: {e}");
            } else {
                warn!("session error: {e}");
                self.emit(ClientEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Keeps pairing in step with the controller and publishes what the user sees.
    fn sync(&mut self) {
        if let Some(session) = self.controller.session() {
            if session.state().is_ended() {
                self.pairing.on_session_ended(session.id(), session.state());
            }
        }

        let active = self
            .controller
            .session()
            .filter(|s| s.state().is_active())
            .map(|s| s.id().clone());
        if active.is_some() && active != self.chat_session {
            self.clear_chat();
            self.chat_session = active;
        }

        let shown = (
            self.shown_state(),
            self.controller.session().map(|s| s.id().clone()),
        );
        if shown != self.shown {
            self.shown = shown.clone();
            let (state, session_id) = shown;
            self.emit(ClientEvent::StateChanged { state, session_id });
        }
    }

    /// The controller never waits for a match; that part of the picture comes from pairing.
    fn shown_state(&self) -> SessionState {
        let state = self.controller.state();
        if !state.is_active() && self.pairing.is_searching() {
            SessionState::AwaitingMatch
        } else {
            state
        }
    }

    fn require_media(&self) -> Result<(), ClientError> {
        match self.media.handle() {
            Some(handle) if handle.is_valid() => Ok(()),
            _ => Err(SessionError::MediaNotAcquired.into()),
        }
    }

    fn send_chat(&mut self, text: String) -> Result<ChatMessage, ClientError> {
        if text.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if self.controller.state() != SessionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.signaling
            .send(OutboundSignal::ChatMessage(text.clone()));
        let message = ChatMessage::new(text, ChatSender::User);
        self.push_message(message.clone());
        Ok(message)
    }

    fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message.clone());
        self.emit(ClientEvent::ChatMessage(message));
    }

    fn clear_chat(&mut self) {
        if !self.messages.is_empty() {
            self.messages.clear();
            self.emit(ClientEvent::ChatCleared);
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        let session = self.controller.session();
        ClientSnapshot {
            state: self.shown_state(),
            pairing: self.pairing.state().clone(),
            session_id: session.map(|s| s.id().clone()),
            role: session.map(Session::role),
            remote_tracks: session
                .map(|s| s.remote_tracks().to_vec())
                .unwrap_or_default(),
            media_acquired: self.media.is_acquired(),
            video_enabled: self.media.video_enabled(),
            audio_enabled: self.media.audio_enabled(),
            relay_connected: self.signaling.is_connected(),
            messages: self.messages.clone(),
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down");
        self.pairing.cancel_search();
        self.controller.disconnect().await;
        self.media.release();
        self.signaling.close().await;
        self.sync();
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
