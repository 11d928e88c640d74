// Microphone capture: the backend seam and the CPAL → LiveKit bridge.
//
// CpalCapture: mic → NativeAudioSource (→ one shared local audio track)
//
// cpal::Stream deliberately opts out of Send, so each capture builds its
// stream on a dedicated OS thread that owns it for its whole lifetime. The
// thread blocks on a kill-channel recv() and exits (dropping the stream) when
// the capture is stopped.

use std::{
    borrow::Cow,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use livekit::webrtc::audio_frame::AudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::AudioSourceOptions;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{meter::LevelMeter, AudioError};
use crate::config::AudioConstraints;

// ── Backend seam ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

#[derive(Clone, Debug)]
pub struct CaptureRequest {
    /// `None` means the host's default input.
    pub device_id: Option<String>,
    pub constraints: AudioConstraints,
}

/// Something that can open microphone captures.
pub trait CaptureBackend: Send + Sync {
    /// Acquire the device and start capturing. Blocking: may wait on the OS
    /// permission prompt or on device start-up.
    fn open(&self, request: &CaptureRequest, sink: CaptureSink)
        -> Result<Box<dyn CaptureStream>, AudioError>;

    fn list_devices(&self) -> Result<Vec<InputDevice>, AudioError>;
}

/// A running capture. Stopping it releases the device.
pub trait CaptureStream: Send {
    /// WebRTC source fed by this capture, if it is backed by one.
    fn source(&self) -> Option<NativeAudioSource>;

    fn stop(&mut self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureEventKind {
    /// The OS or hardware muted (`true`) or unmuted (`false`) the input.
    HardwareMuted(bool),
    /// The input went away for good.
    Ended(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureEvent {
    pub capture_id: u64,
    pub kind: CaptureEventKind,
}

/// Handed to a backend on open; the backend reports through it.
#[derive(Clone)]
pub struct CaptureSink {
    capture_id: u64,
    enabled: Arc<AtomicBool>,
    meter: Arc<LevelMeter>,
    events: mpsc::UnboundedSender<CaptureEvent>,
}

impl CaptureSink {
    pub(crate) fn new(
        capture_id: u64,
        enabled: Arc<AtomicBool>,
        meter: Arc<LevelMeter>,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self { capture_id, enabled, meter, events }
    }

    pub fn capture_id(&self) -> u64 {
        self.capture_id
    }

    /// When `false` the backend must send silence instead of mic audio.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn record(&self, samples: &[f32]) {
        self.meter.record(samples);
    }

    pub fn hardware_muted(&self, muted: bool) {
        self.emit(CaptureEventKind::HardwareMuted(muted));
    }

    pub fn ended(&self, reason: impl Into<String>) {
        self.emit(CaptureEventKind::Ended(reason.into()));
    }

    fn emit(&self, kind: CaptureEventKind) {
        let _ = self.events.send(CaptureEvent { capture_id: self.capture_id, kind });
    }
}

/// Shared, read-only reference to the local microphone track.
///
/// Peer connections attach it; only the audio controller flips `enabled` or
/// stops the underlying capture.
#[derive(Clone)]
pub struct CaptureHandle {
    id: u64,
    device_id: Option<String>,
    enabled: Arc<AtomicBool>,
    source: Option<NativeAudioSource>,
}

impl CaptureHandle {
    pub(crate) fn new(
        id: u64,
        device_id: Option<String>,
        enabled: Arc<AtomicBool>,
        source: Option<NativeAudioSource>,
    ) -> Self {
        Self { id, device_id, enabled, source }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn native_source(&self) -> Option<NativeAudioSource> {
        self.source.clone()
    }
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("enabled", &self.is_enabled())
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

// ── CPAL backend ──────────────────────────────────────────────────────────────

/// Internal buffer of the WebRTC audio source.
const SOURCE_QUEUE_MS: u32 = 200;

/// Captures from a cpal input device into a LiveKit `NativeAudioSource`.
#[derive(Debug, Default)]
pub struct CpalCapture;

impl CaptureBackend for CpalCapture {
    fn open(
        &self,
        request: &CaptureRequest,
        sink: CaptureSink,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        // ── Step 1: Discover device config (no ownership of non-Send types) ──
        let (sample_rate, channels) = {
            let host = cpal::default_host();
            let dev = find_input_device(&host, request.device_id.as_deref())?;
            let cfg = dev.default_input_config().map_err(config_error)?;
            (cfg.sample_rate().0, cfg.channels() as u32)
        };

        // ── Step 2: Create the WebRTC audio source with voice processing ──────
        let options = AudioSourceOptions {
            echo_cancellation: request.constraints.echo_cancellation,
            noise_suppression: request.constraints.noise_suppression,
            auto_gain_control: request.constraints.auto_gain_control,
        };
        let source = NativeAudioSource::new(options, sample_rate, channels, SOURCE_QUEUE_MS);
        let source_feed = source.clone();

        // ── Step 3: Channels ─────────────────────────────────────────────────
        let (pcm_tx, pcm_rx) = std::sync::mpsc::sync_channel::<Vec<i16>>(8);
        let (kill_tx, kill_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<String, AudioError>>();

        // ── Step 4: Build+own the cpal stream on a dedicated thread ──────────
        let device_id = request.device_id.clone();
        let stream_sink = sink.clone();
        std::thread::spawn(move || {
            let host = cpal::default_host();
            let dev = match find_input_device(&host, device_id.as_deref()) {
                Ok(d) => d,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let name = dev.name().unwrap_or_else(|_| "unknown".into());
            let cfg = match dev.default_input_config() {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(config_error(e)));
                    return;
                }
            };
            let stream_cfg: cpal::StreamConfig = cfg.into();
            let data_sink = stream_sink.clone();
            let stream = match dev.build_input_stream(
                &stream_cfg,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    data_sink.record(data);
                    let samples: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                        .collect();
                    let _ = pcm_tx.try_send(samples);
                },
                // cpal has no OS mute notification, so this backend never
                // calls `hardware_muted`; only device loss is reported.
                move |e| match e {
                    cpal::StreamError::DeviceNotAvailable => {
                        stream_sink.ended("input device is no longer available")
                    }
                    other => warn!("cpal input error: {other}"),
                },
                None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(build_error(e)));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let err = match e {
                    cpal::PlayStreamError::DeviceNotAvailable => AudioError::DeviceNotFound(name),
                    cpal::PlayStreamError::BackendSpecific { err } => AudioError::classify(err.description),
                };
                let _ = ready_tx.send(Err(err));
                return;
            }
            let _ = ready_tx.send(Ok(name));
            // Block until the capture is stopped (kill_tx dropped → recv Err).
            let _ = kill_rx.recv();
            // `stream` is dropped here, releasing the microphone.
        });

        let device_name = ready_rx
            .recv()
            .map_err(|_| AudioError::Backend("input thread died before ready".into()))??;
        info!("audio capture started on {device_name} ({sample_rate} Hz, {channels} ch)");

        // ── Step 5: Feeder: PCM → NativeAudioSource, silence while disabled ───
        let rt_handle = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || {
            // Ends once the stream thread exits and pcm_tx is dropped.
            while let Ok(samples) = pcm_rx.recv() {
                let samples_per_channel = (samples.len() as u32) / channels.max(1);
                let data: Vec<i16> = if sink.is_enabled() {
                    samples
                } else {
                    vec![0i16; samples.len()]
                };
                let frame = AudioFrame {
                    data: Cow::Owned(data),
                    sample_rate,
                    num_channels: channels,
                    samples_per_channel,
                };
                let _ = rt_handle.block_on(source_feed.capture_frame(&frame));
            }
        });

        Ok(Box::new(CpalStream { source, kill: Some(kill_tx) }))
    }

    fn list_devices(&self) -> Result<Vec<InputDevice>, AudioError> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::classify(e.to_string()))?;
        Ok(devices
            .filter_map(|d| d.name().ok())
            .map(|name| InputDevice {
                is_default: default_name.as_deref() == Some(name.as_str()),
                id: name.clone(),
                name,
            })
            .collect())
    }
}

struct CpalStream {
    source: NativeAudioSource,
    /// Dropping this ends the capture thread and stops the cpal stream.
    kill: Option<std::sync::mpsc::Sender<()>>,
}

impl CaptureStream for CpalStream {
    fn source(&self) -> Option<NativeAudioSource> {
        Some(self.source.clone())
    }

    fn stop(&mut self) {
        self.kill.take();
    }
}

fn find_input_device(host: &cpal::Host, device_id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let Some(id) = device_id else {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no default input device".into()));
    };
    let devices = host
        .input_devices()
        .map_err(|e| AudioError::classify(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == id).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(id.to_owned()))
}

fn config_error(e: cpal::DefaultStreamConfigError) -> AudioError {
    match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            AudioError::DeviceNotFound("device disappeared while opening".into())
        }
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            AudioError::ConstraintsUnsupported("device cannot capture audio".into())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => AudioError::classify(err.description),
    }
}

fn build_error(e: cpal::BuildStreamError) -> AudioError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::DeviceNotFound("device disappeared while opening".into())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => {
            AudioError::ConstraintsUnsupported("stream configuration not supported".into())
        }
        cpal::BuildStreamError::InvalidArgument => {
            AudioError::ConstraintsUnsupported("invalid stream argument".into())
        }
        cpal::BuildStreamError::StreamIdOverflow => AudioError::DeviceBusy("no free stream ids".into()),
        cpal::BuildStreamError::BackendSpecific { err } => AudioError::classify(err.description),
    }
}
