use crate::config::ReconnectPolicy;
use crate::error::SignalingError;
use crate::signaling::events::{OutboundSignal, SignalingEvent};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    error::ProtocolError, Error as WsError, Message,
};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of the relay link as the session components see it. Sending never blocks
/// and never fails from the caller's point of view.
#[async_trait]
pub trait Signaling: Send + Sync {
    fn send(&self, signal: OutboundSignal);

    fn is_connected(&self) -> bool {
        true
    }

    /// Flushes what is still pending and closes the link for good.
    async fn close(&self) {}
}

/// WebSocket link to the relay with transparent reconnect.
///
/// Inbound events go to a single subscriber in arrival order. Outbound signals issued while
/// the link is down wait in a retry queue. Once it is back, matchmaking and session signals
/// are dropped (the relay forgot both) and the rest is flushed in order.
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<OutboundSignal>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    link_up: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Opens the relay connection. Only this first attempt can fail; later drops are
    /// handled by reconnecting.
    pub async fn connect(
        relay_url: &str,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>, SignalingError> {
        let url = Url::parse(relay_url)?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ChannelDisconnected(e.to_string()))?;
        info!(url = %url, "relay connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link_up = Arc::new(AtomicBool::new(true));

        let link = RelayLink {
            url,
            backoff: reconnect_backoff(&policy),
            outbound: outbound_rx,
            inbound: inbound_tx,
            retry: VecDeque::new(),
            link_up: link_up.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(link.run(ws));

        Ok(Arc::new(Self {
            outbound: outbound_tx,
            inbound: Mutex::new(Some(inbound_rx)),
            link_up,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }))
    }

    /// Takes the inbound event stream. There is exactly one subscriber per channel.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        self.inbound
            .lock()
            .take()
            .ok_or(SignalingError::AlreadySubscribed)
    }

}

#[async_trait]
impl Signaling for SignalingChannel {
    fn send(&self, signal: OutboundSignal) {
        trace!("queueing {}", signal.name());
        if self.outbound.send(signal).is_err() {
            debug!("relay link task is gone; signal dropped");
        }
    }

    fn is_connected(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    /// Stops reconnecting. Signals already sent go out first when the link is up; anything
    /// waiting for a reconnect is dropped.
    async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Capped exponential backoff; never gives up.
pub fn reconnect_backoff(policy: &ReconnectPolicy) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: policy.initial_interval,
        initial_interval: policy.initial_interval,
        randomization_factor: policy.jitter,
        multiplier: policy.multiplier,
        max_interval: policy.max_interval,
        max_elapsed_time: None,
        ..Default::default()
    }
}

enum LinkEnd {
    Lost,
    Shutdown,
}

struct RelayLink {
    url: Url,
    backoff: ExponentialBackoff,
    outbound: mpsc::UnboundedReceiver<OutboundSignal>,
    inbound: mpsc::UnboundedSender<SignalingEvent>,
    retry: VecDeque<OutboundSignal>,
    link_up: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl RelayLink {
    async fn run(mut self, first: WsStream) {
        let mut ws = first;
        loop {
            match self.serve(ws).await {
                LinkEnd::Shutdown => break,
                LinkEnd::Lost => {}
            }
            self.link_up.store(false, Ordering::SeqCst);
            warn!("relay link lost; reconnecting");

            ws = match self.reconnect().await {
                Some(ws) => ws,
                None => break,
            };
            self.link_up.store(true, Ordering::SeqCst);
            info!(url = %self.url, "relay reconnected");
            self.discard_stale();
            // New logical session: the relay forgot our pairing state.
            if self.inbound.send(SignalingEvent::Reconnected).is_err() {
                break;
            }
        }
        self.link_up.store(false, Ordering::SeqCst);
        debug!("relay link task finished");
    }

    async fn serve(&mut self, ws: WsStream) -> LinkEnd {
        let (mut write, mut read) = ws.split();

        while let Some(signal) = self.retry.pop_front() {
            if let Err(e) = send_frame(&mut write, &signal).await {
                debug!("flush failed: {e}");
                self.retry.push_front(signal);
                return LinkEnd::Lost;
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    while let Ok(signal) = self.outbound.try_recv() {
                        if send_frame(&mut write, &signal).await.is_err() {
                            break;
                        }
                    }
                    let _ = write.close().await;
                    return LinkEnd::Shutdown;
                }
                signal = self.outbound.recv() => {
                    let Some(signal) = signal else {
                        let _ = write.close().await;
                        return LinkEnd::Shutdown;
                    };
                    if let Err(e) = send_frame(&mut write, &signal).await {
                        debug!("send failed: {e}");
                        self.retry.push_back(signal);
                        return LinkEnd::Lost;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.deliver(&text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.deliver(&text),
                        Err(_) => debug!("ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return LinkEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("relay websocket closed: {err}");
                            }
                            _ => warn!("relay websocket error: {err}"),
                        }
                        return LinkEnd::Lost;
                    }
                },
            }
        }
    }

    /// Drops queued signals that belonged to the lost relay session, keeping the rest in
    /// order. Pairing re-announces whatever it still needs after `Reconnected`.
    fn discard_stale(&mut self) {
        while let Ok(signal) = self.outbound.try_recv() {
            self.retry.push_back(signal);
        }
        let queued = self.retry.len();
        self.retry.retain(OutboundSignal::survives_reconnect);
        if self.retry.len() < queued {
            debug!("dropped {} stale signals after reconnect", queued - self.retry.len());
        }
    }

    fn deliver(&self, text: &str) {
        match serde_json::from_str::<SignalingEvent>(text) {
            Ok(event) => {
                trace!("received {}", event.name());
                let _ = self.inbound.send(event);
            }
            Err(e) => warn!("malformed relay frame ({e}): {text}"),
        }
    }

    /// Waits out the backoff between attempts. Signals sent meanwhile join the retry queue.
    async fn reconnect(&mut self) -> Option<WsStream> {
        self.backoff.reset();
        loop {
            let delay = self
                .backoff
                .next_backoff()
                .unwrap_or(self.backoff.max_interval);
            debug!("next relay attempt in {delay:?}");
            if !self.wait(delay).await {
                return None;
            }
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => return Some(ws),
                Err(e) => warn!("relay reconnect failed: {e}"),
            }
        }
    }

    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.shutdown.changed() => return false,
                signal = self.outbound.recv() => match signal {
                    Some(signal) => self.retry.push_back(signal),
                    None => return false,
                },
            }
        }
    }
}

async fn send_frame<S>(write: &mut S, signal: &OutboundSignal) -> Result<(), SignalingError>
where
    S: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = serde_json::to_string(signal)?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| SignalingError::SendFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let policy = ReconnectPolicy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        };
        let mut backoff = reconnect_backoff(&policy);
        let delays: Vec<_> = (0..8).filter_map(|_| backoff.next_backoff()).collect();
        assert_eq!(delays.len(), 8);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(1)));
        assert_eq!(delays[7], Duration::from_secs(1));
    }

    #[tokio::test]
    async fn bad_url_is_rejected() {
        let err = SignalingChannel::connect("not a url", ReconnectPolicy::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SignalingError::InvalidUrl(_)));
    }
}
