// The seam between the mesh manager and a concrete WebRTC stack.
//
// A transport reports asynchronously (ICE candidates, connection state,
// remote tracks) through `TransportEvents`, which tags every event with the
// entry generation it belongs to.

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    audio::CaptureHandle,
    signaling::{IceCandidate, SessionDescription},
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A remote participant's audio as it arrived on the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteStream(RemoteStream),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportEvent {
    pub user_id: String,
    pub generation: u64,
    pub kind: TransportEventKind,
}

/// Callback side of a transport. Cheap to clone into callbacks.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    user_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub(crate) fn new(user_id: &str, generation: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { user_id: user_id.to_owned(), generation, tx }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(TransportEventKind::LocalCandidate(candidate));
    }

    pub fn state_changed(&self, state: TransportState) {
        self.emit(TransportEventKind::StateChanged(state));
    }

    pub fn remote_stream(&self, stream: RemoteStream) {
        self.emit(TransportEventKind::RemoteStream(stream));
    }

    fn emit(&self, kind: TransportEventKind) {
        let _ = self.tx.send(TransportEvent {
            user_id: self.user_id.clone(),
            generation: self.generation,
            kind,
        });
    }
}

/// Outcome of swapping the outbound track after a device switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackSwap {
    Replaced,
    /// The transport has no outbound sender; a fresh offer is needed.
    NeedsRenegotiation,
}

/// One direct connection to one remote participant.
pub trait PeerTransport: Send + Sync {
    fn attach_local_audio(&self, capture: &CaptureHandle) -> Result<(), TransportError>;

    fn replace_local_audio(&self, capture: &CaptureHandle) -> Result<TrackSwap, TransportError>;

    /// Create an offer and install it as the local description.
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>>;

    /// Create an answer to the installed remote offer and install it locally.
    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, TransportError>>;

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    fn add_ice_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), TransportError>>;

    fn close(&self);
}

pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        user_id: &str,
        ice_servers: &[String],
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
