// Orchestrator: one Spaces session per space.
//
// `join` acquires the microphone, connects signaling and announces us, then
// hands everything to a session task (see actor.rs). The orchestrator talks
// to that task only through commands; state comes back as a watched
// snapshot plus a stream of `SessionEvent`s.

mod actor;
mod error;
mod roster;

use std::sync::Arc;

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

pub use error::SessionError;
pub use roster::Participant;

use crate::{
    audio::{AudioController, CaptureBackend, DeafenFlag, InputDevice},
    config::SpacesConfig,
    mesh::{MeshError, MeshManager, PeerSummary, RemoteStream, TransportFactory},
    signaling::{ConnectionState, Role, SignalingChannel},
};
use actor::{Command, Inputs, Session};

/// Who we are in the space.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    pub user_id: String,
    pub role: Role,
    /// Bearer credential for the relay.
    pub token: String,
}

/// Media plumbing shared by every session of one orchestrator.
#[derive(Clone)]
pub struct MediaStack {
    pub capture: Arc<dyn CaptureBackend>,
    pub transports: Arc<dyn TransportFactory>,
    /// Gates speaker playback; also handed to the audio output.
    pub deafen: DeafenFlag,
}

/// Everything the caller may want to render, as of the last change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub space_id: Option<String>,
    pub signaling: ConnectionState,
    pub roster: Vec<Participant>,
    pub muted: bool,
    pub deafened: bool,
    pub streaming: bool,
    pub device_id: Option<String>,
    pub peers: Vec<PeerSummary>,
    pub last_error: Option<SessionError>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            space_id: None,
            signaling: ConnectionState::Disconnected,
            roster: Vec::new(),
            muted: true,
            deafened: false,
            streaming: false,
            device_id: None,
            peers: Vec::new(),
            last_error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    RosterChanged(Vec<Participant>),
    MuteChanged(bool),
    DeafenChanged(bool),
    /// The OS muted (`true`) or unmuted the input. An unmute does not
    /// unmute the session.
    HardwareMuteChanged(bool),
    ConnectionStateChanged(ConnectionState),
    PeerConnected(String),
    RemoteStream { user_id: String, stream: RemoteStream },
    PeerFailed { user_id: String, error: MeshError },
    Error(SessionError),
    Left,
}

struct ActiveSession {
    space_id: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

pub struct Orchestrator {
    config: SpacesConfig,
    identity: LocalIdentity,
    media: MediaStack,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    level: Arc<watch::Sender<u8>>,
    active: Option<ActiveSession>,
}

impl Orchestrator {
    pub fn new(
        config: SpacesConfig,
        identity: LocalIdentity,
        media: MediaStack,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let (level, _) = watch::channel(0u8);
        Self {
            config,
            identity,
            media,
            events,
            snapshot: Arc::new(snapshot),
            level: Arc::new(level),
            active: None,
        }
    }

    /// Join `space_id`: start the microphone (muted), connect signaling and
    /// announce ourselves.
    ///
    /// A microphone failure does not stop the join; it is reported as the
    /// session's last error and the session continues listen-only. A
    /// signaling failure releases the microphone and is returned.
    pub async fn join(&mut self, space_id: &str) -> Result<(), SessionError> {
        if let Some(active) = &self.active {
            if !active.task.is_finished() {
                return Err(SessionError::AlreadyJoined(active.space_id.clone()));
            }
        }
        self.active = None;
        info!("joining space {space_id} as {}", self.identity.user_id);

        let (signal_tx, signals) = mpsc::unbounded_channel();
        let signaling = SignalingChannel::new(self.config.relay_url.clone(), signal_tx);
        let (mesh, transports) = MeshManager::new(
            self.identity.user_id.clone(),
            self.media.transports.clone(),
            self.config.ice_servers.clone(),
        );
        let (audio, captures) = AudioController::new(
            self.media.capture.clone(),
            self.config.constraints,
            self.config.level_interval,
            self.media.deafen.clone(),
        );
        let audio = audio.share_level(self.level.clone());

        let mut session = Session::new(
            signaling,
            mesh,
            audio,
            space_id.to_owned(),
            self.identity.clone(),
            self.config.clone(),
            self.events.clone(),
            self.snapshot.clone(),
        );

        match session.audio.start_audio(self.config.input_device.as_deref()).await {
            Ok(capture) => {
                session.mesh.set_local_audio(Some(capture));
            }
            Err(e) => {
                warn!("joining {space_id} without a microphone");
                session.report(e.into());
            }
        }
        session.publish();

        session.emit(SessionEvent::ConnectionStateChanged(ConnectionState::Connecting));
        if let Err(e) = session.signaling.connect(space_id, &self.identity.token).await {
            session.audio.stop_audio();
            let error = SessionError::from(e);
            session.report(error.clone());
            session.emit(SessionEvent::ConnectionStateChanged(ConnectionState::Disconnected));
            self.snapshot.send_replace(SessionSnapshot {
                last_error: Some(error.clone()),
                ..Default::default()
            });
            return Err(error);
        }
        session.announce();
        session.emit(SessionEvent::ConnectionStateChanged(ConnectionState::Connected));
        session.publish();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let inputs = Inputs { commands: command_rx, signals, transports, captures };
        let task = tokio::spawn(session.run(inputs));
        self.active = Some(ActiveSession { space_id: space_id.to_owned(), commands, task });
        Ok(())
    }

    /// Leave the current space. Does nothing if not joined.
    pub async fn leave(&mut self) {
        let Some(active) = self.active.take() else { return };
        let (done, wait) = oneshot::channel();
        if active.commands.send(Command::Leave(done)).is_ok() {
            let _ = wait.await;
        }
        if let Err(e) = active.task.await {
            warn!("session task for {} ended abnormally: {e}", active.space_id);
        }
        self.snapshot.send_replace(SessionSnapshot::default());
    }

    /// Returns the new muted state.
    pub async fn toggle_mute(&self) -> Result<bool, SessionError> {
        self.request(Command::ToggleMute).await?
    }

    /// Returns the new deafened state.
    pub async fn toggle_deafen(&self) -> Result<bool, SessionError> {
        self.request(Command::ToggleDeafen).await
    }

    /// Move capture to another input. The new capture starts muted.
    pub async fn switch_device(&self, device_id: &str) -> Result<(), SessionError> {
        let device_id = device_id.to_owned();
        self.request(|reply| Command::SwitchDevice(device_id, reply)).await?
    }

    pub fn list_devices(&self) -> Result<Vec<InputDevice>, SessionError> {
        Ok(self.media.capture.list_devices()?)
    }

    pub fn is_joined(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.task.is_finished())
    }

    pub fn local_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Input level, 0–100.
    pub fn watch_level(&self) -> watch::Receiver<u8> {
        self.level.subscribe()
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.snapshot.borrow().roster.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.snapshot.borrow().muted
    }

    pub fn last_error(&self) -> Option<SessionError> {
        self.snapshot.borrow().last_error.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NotJoined)?;
        let (reply, response) = oneshot::channel();
        active
            .commands
            .send(command(reply))
            .map_err(|_| SessionError::NotJoined)?;
        response.await.map_err(|_| SessionError::NotJoined)
    }
}
