// Signaling channel: one WebSocket to the relay per space.
//
// The channel only moves typed messages. It never queues while closed and it
// never reconnects on its own; the session decides what to do on close.

mod backoff;
mod error;
pub mod message;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, sync::watch, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

pub use backoff::ReconnectPolicy;
pub use error::SignalingError;
pub use message::{IceCandidate, Role, SdpKind, SessionDescription, SignalingMessage};

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Entered on a transport error; always followed by `Disconnected`.
    Error,
}

#[derive(Debug)]
pub enum SignalingEvent {
    Message(SignalingMessage),
    /// The relay closed the socket.
    Closed,
    /// The socket failed; the channel is now disconnected.
    Error(SignalingError),
}

/// An inbound event tagged with the connection it came from.
#[derive(Debug)]
pub struct InboundSignal {
    pub epoch: u64,
    pub event: SignalingEvent,
}

/// Anything that can put a message on the wire.
pub trait SignalSender: Send + Sync {
    fn send(&self, message: SignalingMessage);
}

impl SignalSender for mpsc::UnboundedSender<SignalingMessage> {
    fn send(&self, message: SignalingMessage) {
        let _ = mpsc::UnboundedSender::send(self, message);
    }
}

/// Duplex connection to the signaling relay for one space.
pub struct SignalingChannel {
    relay_url: String,
    inbound: mpsc::UnboundedSender<InboundSignal>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Bumped on every connect so events from an old socket can be told apart.
    epoch: Arc<AtomicU64>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Inbound messages for every connection made by this channel are
    /// delivered, in arrival order, to `inbound`.
    pub fn new(relay_url: impl Into<String>, inbound: mpsc::UnboundedSender<InboundSignal>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            relay_url: relay_url.into(),
            inbound,
            state: Arc::new(state),
            epoch: Arc::new(AtomicU64::new(0)),
            outbound: None,
            reader: None,
            writer: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Identifies the current (or most recent) connection.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// `{relay}?spaceId=..&token=..`
    pub fn connect_url(relay_url: &str, space_id: &str, token: &str) -> Result<Url, SignalingError> {
        let mut url =
            Url::parse(relay_url).map_err(|e| SignalingError::InvalidUrl(format!("{relay_url}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SignalingError::InvalidUrl(format!(
                "{relay_url}: expected ws:// or wss://"
            )));
        }
        url.query_pairs_mut()
            .append_pair("spaceId", space_id)
            .append_pair("token", token);
        Ok(url)
    }

    /// Open the channel. Returns once the WebSocket handshake has completed.
    pub async fn connect(&mut self, space_id: &str, auth_token: &str) -> Result<(), SignalingError> {
        self.disconnect();

        let url = Self::connect_url(&self.relay_url, space_id, auth_token)?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ConnectionState::Connecting);
        debug!("signaling connecting to space {space_id}");

        let (socket, _response) = match connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                self.state.send_replace(ConnectionState::Error);
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(SignalingError::ConnectFailed(e.to_string()));
            }
        };
        let (mut write, mut read) = socket.split();

        // Writer: drains the outbound queue; dropping the sender closes the socket.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write.send(frame).await {
                    warn!("signaling write: {e}");
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        });

        // Reader: parses text frames and forwards them in arrival order.
        let inbound = self.inbound.clone();
        let state = self.state.clone();
        let current = self.epoch.clone();
        let reader = tokio::spawn(async move {
            let is_current = || current.load(Ordering::SeqCst) == epoch;
            let forward = |event| {
                let _ = inbound.send(InboundSignal { epoch, event });
            };
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(msg) => forward(SignalingEvent::Message(msg)),
                            Err(e) => warn!("signaling: dropping unparseable frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("signaling closed by relay");
                        if is_current() {
                            state.send_replace(ConnectionState::Disconnected);
                        }
                        forward(SignalingEvent::Closed);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("signaling transport error: {e}");
                        if is_current() {
                            state.send_replace(ConnectionState::Error);
                            state.send_replace(ConnectionState::Disconnected);
                        }
                        forward(SignalingEvent::Error(SignalingError::Transport(e.to_string())));
                        break;
                    }
                }
            }
        });

        self.outbound = Some(out_tx);
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.state.send_replace(ConnectionState::Connected);
        info!("signaling connected to space {space_id}");
        Ok(())
    }

    /// Serialize and transmit. Dropped (with a debug log) unless connected.
    pub fn send(&self, message: SignalingMessage) {
        if self.state() != ConnectionState::Connected {
            debug!("signaling not connected, dropping {}", message.kind());
            return;
        }
        let Some(outbound) = &self.outbound else { return };
        match serde_json::to_string(&message) {
            Ok(json) => {
                let _ = outbound.send(Message::Text(json));
            }
            Err(e) => warn!("signaling: could not encode {}: {e}", message.kind()),
        }
    }

    /// Close the socket. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // The writer sends a close frame once its queue is dropped.
        self.outbound = None;
        self.writer = None;
        if self.state() != ConnectionState::Disconnected {
            self.state.send_replace(ConnectionState::Disconnected);
            debug!("signaling disconnected");
        }
    }
}

impl SignalSender for SignalingChannel {
    fn send(&self, message: SignalingMessage) {
        SignalingChannel::send(self, message);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_carries_space_and_token() {
        let url = SignalingChannel::connect_url("wss://relay.example/signal", "space 1", "tok&en").unwrap();
        assert_eq!(url.path(), "/signal");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("spaceId".to_owned(), "space 1".to_owned()),
                ("token".to_owned(), "tok&en".to_owned()),
            ]
        );
    }

    #[test]
    fn connect_url_rejects_http() {
        let err = SignalingChannel::connect_url("https://relay.example", "s", "t").unwrap_err();
        assert!(matches!(err, SignalingError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn send_while_disconnected_is_a_noop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::new("ws://127.0.0.1:1", tx);
        channel.send(SignalingMessage::UserLeft { user_id: "a".into() });
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_connect_ends_disconnected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        // Port 1 on loopback refuses connections.
        let mut channel = SignalingChannel::new("ws://127.0.0.1:1/signal", tx);
        let err = channel.connect("space", "token").await.unwrap_err();
        assert!(matches!(err, SignalingError::ConnectFailed(_)));
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        channel.disconnect();
        channel.disconnect();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}
