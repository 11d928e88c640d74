// Shared fixtures for the integration tests: an in-process relay, a scripted
// microphone and a transport factory whose peers "connect" as soon as the
// offer/answer exchange completes.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{future::BoxFuture, SinkExt, StreamExt};
use livekit::webrtc::audio_source::native::NativeAudioSource;
use serde_json::{json, Value};
use spaces_core::{
    audio::{
        AudioError, CaptureBackend, CaptureHandle, CaptureRequest, CaptureSink, CaptureStream, DeafenFlag,
        InputDevice,
    },
    mesh::{
        PeerState, PeerTransport, RemoteStream, TrackSwap, TransportError, TransportEvents, TransportFactory,
        TransportState,
    },
    signaling::{IceCandidate, SdpKind, SessionDescription},
    LocalIdentity, MediaStack, Orchestrator, Role, SessionEvent, SessionSnapshot, SpacesConfig,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        Message,
    },
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "spaces_core=debug".into()))
        .with_test_writer()
        .try_init();
}

// ── Relay ─────────────────────────────────────────────────────────────────────

struct Member {
    conn: u64,
    role: Value,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct RelayState {
    spaces: HashMap<String, HashMap<String, Member>>,
    connections: HashMap<u64, JoinHandle<()>>,
    next_conn: u64,
}

/// Minimal signaling relay: announces, replays membership, routes by `to`,
/// broadcasts `user-left` when a socket closes.
pub struct Relay {
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
    accept: JoinHandle<()>,
}

impl Relay {
    pub async fn start() -> Relay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(RelayState::default()));

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = {
                    let mut s = accept_state.lock().unwrap();
                    s.next_conn += 1;
                    s.next_conn
                };
                let handle = tokio::spawn(serve(conn, stream, accept_state.clone()));
                accept_state.lock().unwrap().connections.insert(conn, handle);
            }
        });
        Relay { addr, state, accept }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/signal", self.addr)
    }

    pub fn members(&self, space: &str) -> Vec<String> {
        let s = self.state.lock().unwrap();
        let mut ids: Vec<String> = s
            .spaces
            .get(space)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Wait until the relay has registered exactly `expected` in `space`.
    pub async fn wait_members(&self, space: &str, expected: &[&str]) {
        tokio::time::timeout(WAIT, async {
            while self.members(space) != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for relay members");
    }

    /// Cut every socket without a close handshake or `user-left`.
    pub fn drop_connections(&self) {
        let mut s = self.state.lock().unwrap();
        for (_, handle) in s.connections.drain() {
            handle.abort();
        }
        s.spaces.clear();
    }

    /// Deliver a raw text frame to one member.
    pub fn inject(&self, space: &str, user_id: &str, text: &str) {
        let s = self.state.lock().unwrap();
        if let Some(member) = s.spaces.get(space).and_then(|m| m.get(user_id)) {
            let _ = member.tx.send(Message::Text(text.to_owned()));
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.accept.abort();
        self.drop_connections();
    }
}

async fn serve(conn: u64, stream: TcpStream, state: Arc<Mutex<RelayState>>) {
    let mut space: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        space = req.uri().query().and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("spaceId="))
                .map(str::to_owned)
        });
        Ok(resp)
    };
    let Ok(socket) = accept_hdr_async(stream, callback).await else { return };
    let Some(space) = space else { return };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (mut write, mut read) = socket.split();
    let mut user: Option<String> = None;
    loop {
        tokio::select! {
            Some(out) = rx.recv() => {
                if write.send(out).await.is_err() {
                    break;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(msg) = serde_json::from_str::<Value>(&text) {
                        route(&state, &space, conn, &tx, &mut user, msg);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
    if let Some(user) = user {
        depart(&state, &space, conn, &user);
    }
    state.lock().unwrap().connections.remove(&conn);
}

fn frame(value: &Value) -> Message {
    Message::Text(value.to_string())
}

fn route(
    state: &Mutex<RelayState>,
    space: &str,
    conn: u64,
    tx: &mpsc::UnboundedSender<Message>,
    user: &mut Option<String>,
    msg: Value,
) {
    match msg["type"].as_str() {
        Some("user-joined") => {
            let Some(id) = msg["userId"].as_str().map(str::to_owned) else { return };
            let mut s = state.lock().unwrap();
            let members = s.spaces.entry(space.to_owned()).or_default();
            for (other, member) in members.iter().filter(|(other, _)| **other != id) {
                let _ = member.tx.send(frame(&msg));
                let _ = tx.send(frame(&json!({
                    "type": "user-joined",
                    "userId": other,
                    "role": member.role,
                })));
            }
            members.insert(id.clone(), Member { conn, role: msg["role"].clone(), tx: tx.clone() });
            *user = Some(id);
        }
        Some("user-left") => {
            if let Some(id) = user.take() {
                depart(state, space, conn, &id);
            }
        }
        Some("offer" | "answer" | "ice-candidate") => {
            let s = state.lock().unwrap();
            let target = msg["to"]
                .as_str()
                .and_then(|to| s.spaces.get(space).and_then(|m| m.get(to)));
            if let Some(member) = target {
                let _ = member.tx.send(frame(&msg));
            }
        }
        _ => {}
    }
}

fn depart(state: &Mutex<RelayState>, space: &str, conn: u64, user_id: &str) {
    let mut s = state.lock().unwrap();
    let Some(members) = s.spaces.get_mut(space) else { return };
    if members.get(user_id).map(|m| m.conn) != Some(conn) {
        return;
    }
    members.remove(user_id);
    let left = json!({ "type": "user-left", "userId": user_id });
    for member in members.values() {
        let _ = member.tx.send(frame(&left));
    }
}

// ── Capture ───────────────────────────────────────────────────────────────────

/// A microphone that opens instantly, or reports a revoked permission.
#[derive(Default)]
pub struct ScriptedCapture {
    deny: AtomicBool,
    sinks: Mutex<Vec<CaptureSink>>,
    stopped: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedCapture {
    pub fn denying() -> Self {
        let capture = Self::default();
        capture.deny.store(true, Ordering::SeqCst);
        capture
    }

    pub fn sink(&self, index: usize) -> CaptureSink {
        self.sinks.lock().unwrap()[index].clone()
    }

    pub fn opened(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub fn stopped(&self) -> Vec<u64> {
        self.stopped.lock().unwrap().clone()
    }
}

struct ScriptedStream {
    id: u64,
    stopped: Arc<Mutex<Vec<u64>>>,
}

impl CaptureStream for ScriptedStream {
    fn source(&self) -> Option<NativeAudioSource> {
        None
    }

    fn stop(&mut self) {
        self.stopped.lock().unwrap().push(self.id);
    }
}

impl CaptureBackend for ScriptedCapture {
    fn open(&self, _request: &CaptureRequest, sink: CaptureSink) -> Result<Box<dyn CaptureStream>, AudioError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(AudioError::PermissionDenied);
        }
        let id = sink.capture_id();
        self.sinks.lock().unwrap().push(sink);
        Ok(Box::new(ScriptedStream { id, stopped: self.stopped.clone() }))
    }

    fn list_devices(&self) -> Result<Vec<InputDevice>, AudioError> {
        Ok(vec![
            InputDevice { id: "built-in".into(), name: "Built-in Microphone".into(), is_default: true },
            InputDevice { id: "usb".into(), name: "USB Microphone".into(), is_default: false },
        ])
    }
}

// ── Transports ────────────────────────────────────────────────────────────────

/// Builds transports that connect once both descriptions are in place.
#[derive(Default)]
pub struct LoopbackTransports {
    created: Mutex<Vec<String>>,
    closed: Arc<AtomicUsize>,
    /// The next this-many transports fail instead of connecting.
    failures: Arc<AtomicUsize>,
}

impl LoopbackTransports {
    /// Remote ids, in creation order.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl TransportFactory for LoopbackTransports {
    fn create(
        &self,
        user_id: &str,
        _ice_servers: &[String],
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        self.created.lock().unwrap().push(user_id.to_owned());
        Ok(Box::new(LoopbackTransport {
            events,
            closed: self.closed.clone(),
            failures: self.failures.clone(),
        }))
    }
}

struct LoopbackTransport {
    events: TransportEvents,
    closed: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    fn connected(&self) {
        self.events.state_changed(TransportState::Connecting);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.events.state_changed(TransportState::Failed);
            return;
        }
        self.events.state_changed(TransportState::Connected);
        self.events.remote_stream(RemoteStream {
            stream_id: format!("stream-{}", self.events.user_id()),
            track_id: format!("audio-{}", self.events.user_id()),
        });
    }

    fn candidate(&self) {
        self.events.local_candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        });
    }
}

impl PeerTransport for LoopbackTransport {
    fn attach_local_audio(&self, _capture: &CaptureHandle) -> Result<(), TransportError> {
        Ok(())
    }

    fn replace_local_audio(
        &self,
        _capture: &CaptureHandle,
    ) -> Result<TrackSwap, TransportError> {
        Ok(TrackSwap::Replaced)
    }

    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            self.candidate();
            Ok(SessionDescription::offer("v=0 loopback offer"))
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>> {
        Box::pin(async move {
            self.candidate();
            self.connected();
            Ok(SessionDescription::answer("v=0 loopback answer"))
        })
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if description.kind == SdpKind::Answer {
                self.connected();
            }
            Ok(())
        })
    }

    fn add_ice_candidate(&self, _candidate: IceCandidate) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Clients ───────────────────────────────────────────────────────────────────

/// One participant wired to scripted media.
pub struct Client {
    pub spaces: Orchestrator,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub capture: Arc<ScriptedCapture>,
    pub transports: Arc<LoopbackTransports>,
}

impl Client {
    pub fn new(user_id: &str, relay: &Relay) -> Client {
        Self::with(user_id, config(relay), ScriptedCapture::default())
    }

    pub fn with(user_id: &str, config: SpacesConfig, capture: ScriptedCapture) -> Client {
        let capture = Arc::new(capture);
        let transports = Arc::new(LoopbackTransports::default());
        let media = MediaStack {
            capture: capture.clone(),
            transports: transports.clone(),
            deafen: DeafenFlag::default(),
        };
        let identity = LocalIdentity {
            user_id: user_id.to_owned(),
            role: Role::Speaker,
            token: format!("token-{user_id}"),
        };
        let (event_tx, events) = mpsc::unbounded_channel();
        Client {
            spaces: Orchestrator::new(config, identity, media, event_tx),
            events,
            capture,
            transports,
        }
    }

    /// Wait until the published snapshot satisfies `ready`.
    pub async fn wait(&self, ready: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut rx = self.spaces.watch_snapshot();
        let snapshot = tokio::time::timeout(WAIT, rx.wait_for(ready))
            .await
            .expect("timed out waiting for session state")
            .expect("snapshot channel closed");
        snapshot.clone()
    }

    /// Wait for the first event matching `wanted`, skipping others.
    pub async fn wait_event(&mut self, mut wanted: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }
}

pub fn config(relay: &Relay) -> SpacesConfig {
    SpacesConfig { relay_url: relay.url(), ..SpacesConfig::default() }
}

pub fn roster_ids(snapshot: &SessionSnapshot) -> Vec<&str> {
    snapshot.roster.iter().map(|p| p.user_id.as_str()).collect()
}

/// Exactly one peer, connected, with remote audio.
pub fn converged_with(snapshot: &SessionSnapshot, user_id: &str) -> bool {
    matches!(
        snapshot.peers.as_slice(),
        [peer] if peer.user_id == user_id
            && peer.state == PeerState::Connected
            && peer.remote_stream.is_some()
    )
}
