// Speaker output for remote peers.
//
// Remote tracks push decoded i16 PCM into one shared ring buffer; the cpal
// output callback drains it. Writers interleave rather than mix, which is
// good enough for small spaces. While deafened nothing is written.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::warn;

use super::AudioError;

/// ~2 seconds at 48 kHz stereo.
const MAX_BUFFERED: usize = 192_000;

/// Local-only playback suppression, shared between the controller and sinks.
#[derive(Clone, Debug, Default)]
pub struct DeafenFlag(Arc<AtomicBool>);

impl DeafenFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, deafened: bool) {
        self.0.store(deafened, Ordering::Relaxed);
    }
}

/// Plays remote audio through the default output device.
pub struct AudioOutput {
    buf: Arc<Mutex<VecDeque<f32>>>,
    deafened: DeafenFlag,
    /// Dropping this ends the output thread and stops the cpal stream.
    _kill: std::sync::mpsc::Sender<()>,
}

impl AudioOutput {
    pub fn new(deafened: DeafenFlag) -> Result<Self, AudioError> {
        // ── Step 1: Discover output config ───────────────────────────────────
        let (sample_format, stream_config) = {
            let host = cpal::default_host();
            let dev = host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceNotFound("no default output device".into()))?;
            let cfg = dev
                .default_output_config()
                .map_err(|e| AudioError::classify(e.to_string()))?;
            (cfg.sample_format(), cfg.config())
        };

        // ── Step 2: Shared ring buffer ────────────────────────────────────────
        let buf = Arc::new(Mutex::new(VecDeque::with_capacity(MAX_BUFFERED)));

        let (kill_tx, kill_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), AudioError>>();

        // ── Step 3: Build+own the cpal output stream on a dedicated thread ────
        let buf_out = buf.clone();
        std::thread::spawn(move || {
            let host = cpal::default_host();
            let Some(dev) = host.default_output_device() else {
                let _ = ready_tx.send(Err(AudioError::DeviceNotFound("no default output device".into())));
                return;
            };
            let stream = match build_output_stream(sample_format, &stream_config, &dev, buf_out) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::classify(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            let _ = kill_rx.recv();
            // `stream` dropped here.
        });

        ready_rx
            .recv()
            .map_err(|_| AudioError::Backend("output thread died before ready".into()))??;

        Ok(Self { buf, deafened, _kill: kill_tx })
    }

    /// Queue a batch of samples for playback. Dropped while deafened.
    pub fn push_samples(&self, samples: &[i16]) {
        if self.deafened.get() {
            return;
        }
        push_into(&self.buf, samples);
    }
}

fn push_into(buf: &Mutex<VecDeque<f32>>, samples: &[i16]) {
    let Ok(mut guard) = buf.lock() else { return };
    guard.extend(samples.iter().map(|&s| s as f32 / i16::MAX as f32));
    // Cap to prevent unbounded growth.
    let excess = guard.len().saturating_sub(MAX_BUFFERED);
    guard.drain(..excess);
}

fn build_output_stream(
    fmt: cpal::SampleFormat,
    config: &cpal::StreamConfig,
    device: &cpal::Device,
    buf: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream, AudioError> {
    let stream = match fmt {
        cpal::SampleFormat::F32 => device.build_output_stream::<f32, _, _>(
            config,
            move |data: &mut [f32], _| {
                let mut g = buf.lock().ok();
                for s in data.iter_mut() {
                    *s = g.as_mut().and_then(|g| g.pop_front()).unwrap_or(0.0);
                }
            },
            |e| warn!("cpal output error: {e}"),
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream::<i16, _, _>(
            config,
            move |data: &mut [i16], _| {
                let mut g = buf.lock().ok();
                for s in data.iter_mut() {
                    *s = g
                        .as_mut()
                        .and_then(|g| g.pop_front())
                        .map(|f| (f * i16::MAX as f32) as i16)
                        .unwrap_or(0);
                }
            },
            |e| warn!("cpal output error: {e}"),
            None,
        ),
        other => {
            return Err(AudioError::ConstraintsUnsupported(format!(
                "unsupported output sample format: {other:?}"
            )))
        }
    };
    stream.map_err(|e| AudioError::classify(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_is_capped() {
        let buf = Mutex::new(VecDeque::new());
        push_into(&buf, &vec![i16::MAX; MAX_BUFFERED + 10]);
        let guard = buf.lock().unwrap();
        assert_eq!(guard.len(), MAX_BUFFERED);
        assert!((guard[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn deafen_flag_is_shared() {
        let flag = DeafenFlag::default();
        let other = flag.clone();
        flag.set(true);
        assert!(other.get());
    }
}
