// Peer connection mesh: one direct transport per remote participant.
//
// The manager is owned by the session task, so every mutation of the peer
// map happens on that one task. Transports report back through the receiver
// returned by `new`; the owner feeds those events to `on_transport_event`.
//
// Negotiation (per pair):
//   initiator:  create → attach audio → offer ──────────────▶ remote
//   responder:  create → attach audio → set offer → answer ─▶ initiator
//   both:       trickle ICE candidates once a local description exists

mod error;
mod rtc;
mod state;
mod transport;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

pub use error::MeshError;
pub use rtc::RtcTransportFactory;
pub use state::{PeerSignal, PeerState};
pub use transport::{
    PeerTransport, RemoteStream, TrackSwap, TransportError, TransportEvent, TransportEventKind,
    TransportEvents, TransportFactory, TransportState,
};

use crate::{
    audio::CaptureHandle,
    signaling::{IceCandidate, SdpKind, SessionDescription, SignalSender, SignalingMessage},
};

/// Read-only view of one entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSummary {
    pub user_id: String,
    pub state: PeerState,
    pub remote_stream: Option<RemoteStream>,
    /// `true` if the local side sent the offer.
    pub initiator: bool,
}

/// Something the owner should know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeshNotice {
    PeerConnected(String),
    RemoteStream { user_id: String, stream: RemoteStream },
    /// The entry is already gone; the owner may rebuild it.
    PeerFailed { user_id: String, error: MeshError },
}

struct PeerEntry {
    transport: Box<dyn PeerTransport>,
    generation: u64,
    state: PeerState,
    remote_stream: Option<RemoteStream>,
    initiator: bool,
    created: Instant,
    remote_description_set: bool,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
}

pub struct MeshManager {
    local_id: String,
    factory: Arc<dyn TransportFactory>,
    ice_servers: Vec<String>,
    local_audio: Option<CaptureHandle>,
    peers: BTreeMap<String, PeerEntry>,
    next_generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MeshManager {
    pub fn new(
        local_id: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        ice_servers: Vec<String>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id: local_id.into(),
            factory,
            ice_servers,
            local_audio: None,
            peers: BTreeMap::new(),
            next_generation: 0,
            events,
        };
        (manager, events_rx)
    }

    /// Install the local capture for future entries and swap it into the
    /// existing ones. Returns the peers whose track could not be replaced in
    /// place and need a fresh offer.
    pub fn set_local_audio(&mut self, capture: Option<CaptureHandle>) -> Vec<String> {
        self.local_audio = capture;
        let Some(capture) = &self.local_audio else {
            return Vec::new();
        };
        let mut renegotiate = Vec::new();
        for (user_id, entry) in &self.peers {
            match entry.transport.replace_local_audio(capture) {
                Ok(TrackSwap::Replaced) => debug!("replaced outbound track for {user_id}"),
                Ok(TrackSwap::NeedsRenegotiation) => renegotiate.push(user_id.clone()),
                Err(e) => {
                    warn!("could not replace outbound track for {user_id}: {e}");
                    renegotiate.push(user_id.clone());
                }
            }
        }
        renegotiate
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.peers.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn state(&self, user_id: &str) -> Option<PeerState> {
        self.peers.get(user_id).map(|e| e.state)
    }

    pub fn remote_stream(&self, user_id: &str) -> Option<&RemoteStream> {
        self.peers.get(user_id).and_then(|e| e.remote_stream.as_ref())
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.peers
            .iter()
            .map(|(user_id, entry)| PeerSummary {
                user_id: user_id.clone(),
                state: entry.state,
                remote_stream: entry.remote_stream.clone(),
                initiator: entry.initiator,
            })
            .collect()
    }

    /// Open a connection to `remote` and send it an offer. Any prior entry
    /// for `remote` is closed first. On failure no entry is left behind.
    pub async fn initiate(&mut self, remote: &str, outbox: &dyn SignalSender) -> Result<(), MeshError> {
        self.remove(remote);
        let (generation, transport) = self.build(remote)?;

        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                transport.close();
                return Err(negotiation_failed(remote, e));
            }
        };
        outbox.send(SignalingMessage::Offer {
            from: self.local_id.clone(),
            to: remote.to_owned(),
            offer,
        });
        self.insert(remote, generation, transport, true, false);
        info!("offer sent to {remote}");
        Ok(())
    }

    /// Answer an inbound offer, replacing any prior entry for `from`.
    pub async fn handle_offer(
        &mut self,
        from: &str,
        offer: SessionDescription,
        outbox: &dyn SignalSender,
    ) -> Result<(), MeshError> {
        if offer.kind != SdpKind::Offer {
            return Err(MeshError::NegotiationFailed {
                user_id: from.to_owned(),
                reason: "offer message carried an answer description".into(),
            });
        }
        self.remove(from);
        let (generation, transport) = self.build(from)?;

        let answer = match answer_offer(transport.as_ref(), offer).await {
            Ok(answer) => answer,
            Err(e) => {
                transport.close();
                return Err(negotiation_failed(from, e));
            }
        };
        outbox.send(SignalingMessage::Answer {
            from: self.local_id.clone(),
            to: from.to_owned(),
            answer,
        });
        self.insert(from, generation, transport, false, true);
        info!("answer sent to {from}");
        Ok(())
    }

    /// Apply an answer to the pending entry for `from`. No entry: no-op.
    /// A rejected answer removes the entry.
    pub async fn handle_answer(&mut self, from: &str, answer: SessionDescription) -> Result<(), MeshError> {
        let Some(entry) = self.peers.get_mut(from) else {
            warn!("answer from {from} without a pending connection, ignoring");
            return Ok(());
        };
        if answer.kind != SdpKind::Answer {
            warn!("answer message from {from} carried an offer description, ignoring");
            return Ok(());
        }
        if !entry.initiator {
            // Glare or a duplicate delivery: we answered their offer instead.
            warn!("answer from {from} but we did not offer, ignoring");
            return Ok(());
        }
        let applied = entry.transport.set_remote_description(answer).await;
        match applied {
            Ok(()) => {
                entry.remote_description_set = true;
                debug!("answer from {from} applied");
                for candidate in std::mem::take(&mut entry.pending_candidates) {
                    if let Err(e) = entry.transport.add_ice_candidate(candidate).await {
                        warn!("buffered candidate from {from} rejected: {e}");
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.remove(from);
                Err(negotiation_failed(from, e))
            }
        }
    }

    /// Apply a remote candidate. No entry: no-op. Candidates that arrive
    /// before the remote description are held until it is set.
    pub async fn handle_ice_candidate(&mut self, from: &str, candidate: IceCandidate) {
        let Some(entry) = self.peers.get_mut(from) else {
            debug!("ice candidate from {from} without a connection, ignoring");
            return;
        };
        if !entry.remote_description_set {
            entry.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = entry.transport.add_ice_candidate(candidate).await {
            warn!("ice candidate from {from} rejected: {e}");
        }
    }

    /// Send a fresh offer to an existing peer on a new transport.
    pub async fn renegotiate(&mut self, user_id: &str, outbox: &dyn SignalSender) -> Result<(), MeshError> {
        if !self.contains(user_id) {
            return Err(MeshError::UnknownPeer(user_id.to_owned()));
        }
        self.initiate(user_id, outbox).await
    }

    /// Close and discard the entry for `user_id`. Returns whether one existed.
    pub fn remove(&mut self, user_id: &str) -> bool {
        let Some(entry) = self.peers.remove(user_id) else {
            return false;
        };
        entry.transport.close();
        info!("connection to {user_id} closed ({:?})", entry.state);
        true
    }

    pub fn teardown_all(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        for (user_id, entry) in std::mem::take(&mut self.peers) {
            entry.transport.close();
            debug!("connection to {user_id} closed");
        }
        info!("mesh torn down");
    }

    /// Apply one transport event. Events for replaced or removed entries are
    /// dropped. Terminal states remove the entry.
    pub fn on_transport_event(
        &mut self,
        event: TransportEvent,
        outbox: &dyn SignalSender,
    ) -> Option<MeshNotice> {
        let TransportEvent { user_id, generation, kind } = event;
        let entry = match self.peers.get_mut(&user_id) {
            Some(entry) if entry.generation == generation => entry,
            _ => {
                debug!("dropping stale transport event for {user_id} (generation {generation})");
                return None;
            }
        };

        match kind {
            TransportEventKind::LocalCandidate(candidate) => {
                outbox.send(SignalingMessage::IceCandidate {
                    from: self.local_id.clone(),
                    to: user_id,
                    candidate,
                });
                None
            }
            TransportEventKind::RemoteStream(stream) => {
                info!("remote audio from {user_id} arrived");
                entry.remote_stream = Some(stream.clone());
                Some(MeshNotice::RemoteStream { user_id, stream })
            }
            TransportEventKind::StateChanged(transport_state) => {
                let previous = entry.state;
                let state = previous.on(PeerSignal::Transport(transport_state));
                entry.state = state;
                debug!("{user_id}: {previous:?} -> {state:?} ({transport_state:?})");
                match state {
                    PeerState::Connected if previous != PeerState::Connected => {
                        info!("connected to {user_id}");
                        Some(MeshNotice::PeerConnected(user_id))
                    }
                    PeerState::Failed => {
                        warn!("connection to {user_id} failed");
                        self.remove(&user_id);
                        Some(MeshNotice::PeerFailed {
                            error: MeshError::TransportFailed(user_id.clone()),
                            user_id,
                        })
                    }
                    PeerState::Closed => {
                        self.remove(&user_id);
                        None
                    }
                    _ => None,
                }
            }
        }
    }

    /// Remove every entry that has not connected within `timeout`.
    pub fn expire_stalled(&mut self, now: Instant, timeout: Duration) -> Vec<MeshNotice> {
        let stalled: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, e)| e.state != PeerState::Connected && now.duration_since(e.created) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stalled
            .into_iter()
            .map(|user_id| {
                warn!("connection to {user_id} timed out after {timeout:?}");
                self.remove(&user_id);
                MeshNotice::PeerFailed {
                    error: MeshError::NegotiationTimeout(user_id.clone()),
                    user_id,
                }
            })
            .collect()
    }

    /// Create a transport and attach the local audio, if any.
    fn build(&mut self, user_id: &str) -> Result<(u64, Box<dyn PeerTransport>), MeshError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = TransportEvents::new(user_id, generation, self.events.clone());
        let transport = self
            .factory
            .create(user_id, &self.ice_servers, events)
            .map_err(|e| negotiation_failed(user_id, e))?;

        if let Some(capture) = &self.local_audio {
            if let Err(e) = transport.attach_local_audio(capture) {
                transport.close();
                return Err(MeshError::Track { user_id: user_id.to_owned(), reason: e.0 });
            }
        }
        Ok((generation, transport))
    }

    fn insert(
        &mut self,
        user_id: &str,
        generation: u64,
        transport: Box<dyn PeerTransport>,
        initiator: bool,
        remote_description_set: bool,
    ) {
        let entry = PeerEntry {
            transport,
            generation,
            state: PeerState::Connecting.on(PeerSignal::Negotiated),
            remote_stream: None,
            initiator,
            created: Instant::now(),
            remote_description_set,
            pending_candidates: Vec::new(),
        };
        if let Some(prior) = self.peers.insert(user_id.to_owned(), entry) {
            prior.transport.close();
        }
    }
}

impl Drop for MeshManager {
    fn drop(&mut self) {
        self.teardown_all();
    }
}

async fn answer_offer(
    transport: &dyn PeerTransport,
    offer: SessionDescription,
) -> Result<SessionDescription, TransportError> {
    transport.set_remote_description(offer).await?;
    transport.create_answer().await
}

fn negotiation_failed(user_id: &str, e: TransportError) -> MeshError {
    MeshError::NegotiationFailed { user_id: user_id.to_owned(), reason: e.0 }
}
