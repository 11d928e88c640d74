// The per-space task. It owns the audio controller, the mesh and the
// signaling channel, and is the only place any of them is mutated.

use std::{
    collections::{HashMap, HashSet},
    ops::ControlFlow,
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::{roster::Roster, LocalIdentity, SessionError, SessionEvent, SessionSnapshot};
use crate::{
    audio::{AudioController, AudioNotice, CaptureEvent},
    config::{InitiatorPolicy, SpacesConfig},
    mesh::{MeshError, MeshManager, MeshNotice, TransportEvent},
    signaling::{
        ConnectionState, InboundSignal, SignalingChannel, SignalingError, SignalingEvent, SignalingMessage,
    },
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// How long after a reconnect the relay has to replay the membership.
const RESYNC_GRACE: Duration = Duration::from_secs(2);

pub(crate) enum Command {
    ToggleMute(oneshot::Sender<Result<bool, SessionError>>),
    ToggleDeafen(oneshot::Sender<bool>),
    SwitchDevice(String, oneshot::Sender<Result<(), SessionError>>),
    Leave(oneshot::Sender<()>),
}

/// Receivers the run loop selects over. Kept outside `Session` so the loop
/// can borrow them while handlers borrow the session.
pub(crate) struct Inputs {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub signals: mpsc::UnboundedReceiver<InboundSignal>,
    pub transports: mpsc::UnboundedReceiver<TransportEvent>,
    pub captures: mpsc::UnboundedReceiver<CaptureEvent>,
}

#[derive(Clone, Copy, Debug)]
struct PendingReconnect {
    attempt: u32,
    at: Instant,
}

/// Membership replayed since the last reconnect.
#[derive(Debug)]
struct Resync {
    until: Instant,
    seen: HashSet<String>,
}

// Field order is drop order: signaling, then the mesh, then the microphone.
pub(crate) struct Session {
    pub signaling: SignalingChannel,
    pub mesh: MeshManager,
    pub audio: AudioController,
    pub space_id: String,
    pub identity: LocalIdentity,
    pub config: SpacesConfig,
    pub roster: Roster,
    pub last_error: Option<SessionError>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub snapshot: Arc<watch::Sender<SessionSnapshot>>,
    /// Consecutive rebuilds per peer; cleared once the peer connects.
    rebuilds: HashMap<String, u32>,
    reconnect: Option<PendingReconnect>,
    resync: Option<Resync>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signaling: SignalingChannel,
        mesh: MeshManager,
        audio: AudioController,
        space_id: String,
        identity: LocalIdentity,
        config: SpacesConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
        snapshot: Arc<watch::Sender<SessionSnapshot>>,
    ) -> Self {
        Self {
            signaling,
            mesh,
            audio,
            space_id,
            identity,
            config,
            roster: Roster::default(),
            last_error: None,
            events,
            snapshot,
            rebuilds: HashMap::new(),
            reconnect: None,
            resync: None,
        }
    }

    pub async fn run(mut self, mut inputs: Inputs) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reconnect_at = self.reconnect.map(|r| r.at);
            tokio::select! {
                command = inputs.commands.recv() => match command {
                    Some(command) => {
                        if self.on_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        // The orchestrator was dropped without leaving.
                        self.shutdown();
                        break;
                    }
                },
                Some(signal) = inputs.signals.recv() => self.on_signal(signal).await,
                Some(event) = inputs.transports.recv() => self.on_transport(event).await,
                Some(event) = inputs.captures.recv() => self.on_capture(event),
                _ = sweep.tick() => self.on_sweep().await,
                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.try_reconnect().await
                }
            }
            self.publish();
        }
        debug!("session task for space {} finished", self.space_id);
    }

    /// Tell the relay who we are. Also used after a reconnect.
    pub fn announce(&self) {
        self.signaling.send(SignalingMessage::UserJoined {
            user_id: self.identity.user_id.clone(),
            role: self.identity.role,
        });
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Surface an error. Only session-level errors become `last_error`;
    /// per-peer failures must not mask a dead relay or a lost microphone.
    pub fn report(&mut self, error: SessionError) {
        warn!("space {}: {error}", self.space_id);
        if error.is_session_level() {
            self.last_error = Some(error.clone());
        }
        self.emit(SessionEvent::Error(error));
    }

    pub fn publish(&self) {
        let audio = self.audio.state();
        self.snapshot.send_replace(SessionSnapshot {
            space_id: Some(self.space_id.clone()),
            signaling: self.signaling.state(),
            roster: self.roster.participants(),
            muted: audio.muted,
            deafened: audio.deafened,
            streaming: audio.streaming,
            device_id: audio.device_id,
            peers: self.mesh.summaries(),
            last_error: self.last_error.clone(),
        });
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Replies go out after the snapshot reflects the command. Breaks once
    /// the session has shut down.
    async fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::ToggleMute(reply) => {
                let result = self.audio.toggle_mute().map_err(SessionError::from);
                if let Ok(muted) = result {
                    self.emit(SessionEvent::MuteChanged(muted));
                }
                self.publish();
                let _ = reply.send(result);
            }
            Command::ToggleDeafen(reply) => {
                let deafened = self.audio.toggle_deafen();
                self.emit(SessionEvent::DeafenChanged(deafened));
                self.publish();
                let _ = reply.send(deafened);
            }
            Command::SwitchDevice(device_id, reply) => {
                let result = self.switch_device(&device_id).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Leave(done) => {
                self.shutdown();
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn switch_device(&mut self, device_id: &str) -> Result<(), SessionError> {
        let capture = match self.audio.switch_device(device_id).await {
            Ok(capture) => capture,
            Err(e) => {
                // The old capture is already released.
                self.mesh.set_local_audio(None);
                self.emit(SessionEvent::MuteChanged(true));
                let error = SessionError::from(e);
                self.report(error.clone());
                return Err(error);
            }
        };
        self.emit(SessionEvent::MuteChanged(true));
        for user_id in self.mesh.set_local_audio(Some(capture)) {
            info!("renegotiating with {user_id} for the new input device");
            if let Err(e) = self.mesh.renegotiate(&user_id, &self.signaling).await {
                self.report(e.into());
            }
        }
        Ok(())
    }

    // ── Signaling ────────────────────────────────────────────────────────────

    async fn on_signal(&mut self, signal: InboundSignal) {
        if signal.epoch != self.signaling.epoch() {
            debug!("dropping event from an old signaling connection");
            return;
        }
        match signal.event {
            SignalingEvent::Message(message) => self.dispatch(message).await,
            SignalingEvent::Closed => self.signaling_lost(SignalingError::ConnectionLost),
            SignalingEvent::Error(e) => self.signaling_lost(e),
        }
    }

    async fn dispatch(&mut self, message: SignalingMessage) {
        if let Some(to) = message.recipient() {
            if to != self.identity.user_id {
                warn!("{} addressed to {to} delivered to us, ignoring", message.kind());
                return;
            }
        }
        match message {
            SignalingMessage::UserJoined { user_id, role } => {
                if user_id == self.identity.user_id {
                    return;
                }
                if let Some(resync) = &mut self.resync {
                    resync.seen.insert(user_id.clone());
                }
                if self.roster.join(&user_id, role) {
                    info!("{user_id} joined space {}", self.space_id);
                    self.emit(SessionEvent::RosterChanged(self.roster.participants()));
                }
                if self.should_offer_on_join(&user_id) {
                    self.connect_peer(&user_id).await;
                }
            }
            SignalingMessage::UserLeft { user_id } => {
                if user_id == self.identity.user_id {
                    return;
                }
                if self.roster.leave(&user_id) {
                    info!("{user_id} left space {}", self.space_id);
                    self.emit(SessionEvent::RosterChanged(self.roster.participants()));
                }
                self.rebuilds.remove(&user_id);
                self.mesh.remove(&user_id);
            }
            SignalingMessage::Offer { from, offer, .. } => {
                if let Err(e) = self.mesh.handle_offer(&from, offer, &self.signaling).await {
                    self.peer_failed(e).await;
                }
            }
            SignalingMessage::Answer { from, answer, .. } => {
                if let Err(e) = self.mesh.handle_answer(&from, answer).await {
                    self.peer_failed(e).await;
                }
            }
            SignalingMessage::IceCandidate { from, candidate, .. } => {
                self.mesh.handle_ice_candidate(&from, candidate).await;
            }
        }
    }

    fn should_offer_on_join(&self, user_id: &str) -> bool {
        // A re-announce after a reconnect must not tear down a live entry.
        if self.mesh.contains(user_id) {
            return false;
        }
        match self.config.initiator {
            InitiatorPolicy::LowestId => self.is_initiator_for(user_id),
            InitiatorPolicy::OnJoinNotice => self.audio.is_streaming(),
        }
    }

    fn is_initiator_for(&self, user_id: &str) -> bool {
        self.identity.user_id.as_str() < user_id
    }

    async fn connect_peer(&mut self, user_id: &str) {
        if let Err(e) = self.mesh.initiate(user_id, &self.signaling).await {
            self.report(e.into());
        }
    }

    fn signaling_lost(&mut self, error: SignalingError) {
        self.signaling.disconnect();
        self.resync = None;
        self.emit(SessionEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        self.report(error.into());
        self.schedule_reconnect(1);
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        self.reconnect = self.config.reconnect.delay_for(attempt).map(|delay| {
            info!("reconnecting to space {} in {delay:?} (attempt {attempt})", self.space_id);
            PendingReconnect { attempt, at: Instant::now() + delay }
        });
        if self.reconnect.is_none() && attempt > 1 {
            warn!("giving up on signaling for space {} after {} attempts", self.space_id, attempt - 1);
        }
    }

    async fn try_reconnect(&mut self) {
        let Some(pending) = self.reconnect.take() else { return };
        self.emit(SessionEvent::ConnectionStateChanged(ConnectionState::Connecting));
        match self.signaling.connect(&self.space_id, &self.identity.token).await {
            Ok(()) => {
                info!("signaling reconnected to space {}", self.space_id);
                // The relay replays the membership after the announce; anyone
                // it does not replay within the grace period left meanwhile.
                self.resync = Some(Resync { until: Instant::now() + RESYNC_GRACE, seen: HashSet::new() });
                self.announce();
                self.emit(SessionEvent::ConnectionStateChanged(ConnectionState::Connected));
            }
            Err(e) => {
                self.emit(SessionEvent::ConnectionStateChanged(ConnectionState::Disconnected));
                self.report(e.into());
                self.schedule_reconnect(pending.attempt + 1);
            }
        }
    }

    // ── Mesh ─────────────────────────────────────────────────────────────────

    async fn on_transport(&mut self, event: TransportEvent) {
        let Some(notice) = self.mesh.on_transport_event(event, &self.signaling) else {
            return;
        };
        match notice {
            MeshNotice::PeerConnected(user_id) => {
                self.rebuilds.remove(&user_id);
                self.emit(SessionEvent::PeerConnected(user_id));
            }
            MeshNotice::RemoteStream { user_id, stream } => {
                self.emit(SessionEvent::RemoteStream { user_id, stream });
            }
            MeshNotice::PeerFailed { error, .. } => self.peer_failed(error).await,
        }
    }

    async fn on_sweep(&mut self) {
        let expired = self
            .mesh
            .expire_stalled(Instant::now(), self.config.negotiation_timeout);
        for notice in expired {
            if let MeshNotice::PeerFailed { error, .. } = notice {
                self.peer_failed(error).await;
            }
        }
        self.finish_resync(Instant::now());
    }

    /// Drop participants the relay did not replay after a reconnect, along
    /// with any connection to someone no longer on the roster.
    fn finish_resync(&mut self, now: Instant) {
        if !self.resync.as_ref().is_some_and(|r| r.until <= now) {
            return;
        }
        let Some(resync) = self.resync.take() else { return };
        let departed: Vec<String> = self
            .roster
            .participants()
            .into_iter()
            .map(|p| p.user_id)
            .filter(|id| !resync.seen.contains(id))
            .collect();
        for user_id in &departed {
            info!("{user_id} left space {} while we were disconnected", self.space_id);
            self.roster.leave(user_id);
            self.rebuilds.remove(user_id);
        }
        for peer in self.mesh.summaries() {
            if !self.roster.contains(&peer.user_id) {
                self.mesh.remove(&peer.user_id);
            }
        }
        if !departed.is_empty() {
            self.emit(SessionEvent::RosterChanged(self.roster.participants()));
        }
    }

    /// Report a failed entry and rebuild it if we are its initiator.
    async fn peer_failed(&mut self, error: MeshError) {
        let user_id = error.user_id().to_owned();
        self.mesh.remove(&user_id);
        warn!("space {}: {error}", self.space_id);
        self.emit(SessionEvent::PeerFailed { user_id: user_id.clone(), error });

        if !self.roster.contains(&user_id) || !self.is_initiator_for(&user_id) {
            return;
        }
        let attempts = self.rebuilds.entry(user_id.clone()).or_insert(0);
        *attempts += 1;
        if *attempts > self.config.max_peer_rebuilds {
            warn!("giving up on {user_id} after {} rebuilds", self.config.max_peer_rebuilds);
            return;
        }
        info!("rebuilding connection to {user_id} (attempt {attempts})");
        self.connect_peer(&user_id).await;
    }

    // ── Audio ────────────────────────────────────────────────────────────────

    fn on_capture(&mut self, event: CaptureEvent) {
        match self.audio.apply(event) {
            Some(AudioNotice::HardwareMuted) => {
                self.emit(SessionEvent::HardwareMuteChanged(true));
                self.emit(SessionEvent::MuteChanged(true));
            }
            Some(AudioNotice::HardwareUnmuted) => {
                self.emit(SessionEvent::HardwareMuteChanged(false));
            }
            Some(AudioNotice::Ended(e)) => {
                self.mesh.set_local_audio(None);
                self.emit(SessionEvent::MuteChanged(true));
                self.report(e.into());
            }
            None => {}
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Graceful leave: announce, close signaling, close every peer, then
    /// release the microphone.
    fn shutdown(&mut self) {
        info!("leaving space {}", self.space_id);
        self.signaling.send(SignalingMessage::UserLeft { user_id: self.identity.user_id.clone() });
        self.signaling.disconnect();
        self.mesh.teardown_all();
        self.audio.stop_audio();
        self.reconnect = None;
        self.resync = None;
        self.roster.clear();
        self.snapshot.send_replace(SessionSnapshot::default());
        self.emit(SessionEvent::Left);
    }
}
