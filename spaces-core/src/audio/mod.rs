// Local audio stream controller.
//
// Owns the microphone capture for one session: start/stop, mute, deafen,
// device switch and the input level meter. Backend events (hardware mute,
// device loss) come back through the receiver returned by `new` and must be
// fed to `apply` by the owner.

mod capture;
mod error;
pub mod meter;
mod playback;

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub use capture::{
    CaptureBackend, CaptureEvent, CaptureEventKind, CaptureHandle, CaptureRequest, CaptureSink,
    CaptureStream, CpalCapture, InputDevice,
};
pub use error::AudioError;
pub use playback::{AudioOutput, DeafenFlag};

use crate::config::AudioConstraints;
use meter::LevelMeter;

/// Point-in-time view of the local audio state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalAudioState {
    pub streaming: bool,
    pub muted: bool,
    pub deafened: bool,
    /// 0–100.
    pub level: u8,
    pub device_id: Option<String>,
}

/// What a backend event meant for the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AudioNotice {
    HardwareMuted,
    HardwareUnmuted,
    /// The capture is gone; the controller has already cleaned up.
    Ended(AudioError),
}

struct ActiveCapture {
    handle: CaptureHandle,
    stream: Box<dyn CaptureStream>,
    meter_task: JoinHandle<()>,
}

pub struct AudioController {
    backend: Arc<dyn CaptureBackend>,
    constraints: AudioConstraints,
    level_interval: Duration,
    events: mpsc::UnboundedSender<CaptureEvent>,
    next_capture_id: u64,
    active: Option<ActiveCapture>,
    muted: bool,
    deafened: DeafenFlag,
    level: Arc<watch::Sender<u8>>,
}

impl AudioController {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        constraints: AudioConstraints,
        level_interval: Duration,
        deafened: DeafenFlag,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (level, _) = watch::channel(0u8);
        deafened.set(false);
        let controller = Self {
            backend,
            constraints,
            level_interval,
            events,
            next_capture_id: 0,
            active: None,
            muted: true,
            deafened,
            level: Arc::new(level),
        };
        (controller, events_rx)
    }

    /// Publish the input level on `level` instead of a private channel, so
    /// subscribers survive across controllers.
    pub fn share_level(mut self, level: Arc<watch::Sender<u8>>) -> Self {
        level.send_replace(0);
        self.level = level;
        self
    }

    pub fn state(&self) -> LocalAudioState {
        LocalAudioState {
            streaming: self.is_streaming(),
            muted: self.muted,
            deafened: self.deafened.get(),
            level: self.level(),
            device_id: self
                .active
                .as_ref()
                .and_then(|a| a.handle.device_id().map(str::to_owned)),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn level(&self) -> u8 {
        *self.level.borrow()
    }

    /// The running capture, if any.
    pub fn capture(&self) -> Option<&CaptureHandle> {
        self.active.as_ref().map(|a| &a.handle)
    }

    /// Acquire the microphone. The new track always starts muted.
    pub async fn start_audio(&mut self, device_id: Option<&str>) -> Result<CaptureHandle, AudioError> {
        if self.active.is_some() {
            self.release();
        }
        self.muted = true;

        self.next_capture_id += 1;
        let capture_id = self.next_capture_id;
        let enabled = Arc::new(AtomicBool::new(false));
        let meter = Arc::new(LevelMeter::default());
        let sink = CaptureSink::new(capture_id, enabled.clone(), meter.clone(), self.events.clone());
        let request = CaptureRequest {
            device_id: device_id.map(str::to_owned),
            constraints: self.constraints,
        };

        // Opening may block on a permission prompt; keep it off the runtime.
        let backend = self.backend.clone();
        let open_request = request.clone();
        let stream = tokio::task::spawn_blocking(move || backend.open(&open_request, sink))
            .await
            .map_err(|e| AudioError::Backend(format!("capture open task failed: {e}")))?
            .inspect_err(|e| warn!("start audio: {e}"))?;

        let handle = CaptureHandle::new(capture_id, request.device_id, enabled, stream.source());
        let meter_task = meter::spawn_meter(meter, self.level_interval, self.level.clone());
        self.active = Some(ActiveCapture { handle: handle.clone(), stream, meter_task });
        info!("local audio started (capture {capture_id}, muted)");
        Ok(handle)
    }

    /// Flip the outbound track's enabled flag. Returns the new muted state.
    pub fn toggle_mute(&mut self) -> Result<bool, AudioError> {
        let active = self.active.as_ref().ok_or(AudioError::NoActiveStream)?;
        self.muted = !self.muted;
        active.handle.set_enabled(!self.muted);
        debug!("local audio muted={}", self.muted);
        Ok(self.muted)
    }

    /// Local-only: suppresses playback of remote audio. Returns the new state.
    pub fn toggle_deafen(&mut self) -> bool {
        let deafened = !self.deafened.get();
        self.deafened.set(deafened);
        debug!("local audio deafened={deafened}");
        deafened
    }

    /// Stop the current capture and start a new one on `device_id`.
    /// Peer connections must be given the returned handle.
    pub async fn switch_device(&mut self, device_id: &str) -> Result<CaptureHandle, AudioError> {
        info!("switching input device to {device_id}");
        self.release();
        self.start_audio(Some(device_id)).await
    }

    /// Stop capture and metering and reset every flag.
    pub fn stop_audio(&mut self) {
        self.release();
        self.muted = true;
        self.deafened.set(false);
    }

    /// Apply a backend event. Events from a previous capture are ignored.
    pub fn apply(&mut self, event: CaptureEvent) -> Option<AudioNotice> {
        let active = self.active.as_ref()?;
        if active.handle.id() != event.capture_id {
            debug!("ignoring event for stale capture {}", event.capture_id);
            return None;
        }
        match event.kind {
            CaptureEventKind::HardwareMuted(true) => {
                warn!("microphone muted by the system");
                self.muted = true;
                active.handle.set_enabled(false);
                Some(AudioNotice::HardwareMuted)
            }
            CaptureEventKind::HardwareMuted(false) => {
                // Stay muted until the user unmutes.
                info!("microphone unmuted by the system");
                Some(AudioNotice::HardwareUnmuted)
            }
            CaptureEventKind::Ended(reason) => {
                warn!("microphone track ended: {reason}");
                self.release();
                self.muted = true;
                Some(AudioNotice::Ended(AudioError::TrackEnded))
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.meter_task.abort();
            active.handle.set_enabled(false);
            active.stream.stop();
            info!("local audio stopped (capture {})", active.handle.id());
        }
        self.level.send_replace(0);
    }
}

impl Drop for AudioController {
    fn drop(&mut self) {
        self.release();
    }
}
