// Input level metering.
//
// The capture callback records the loudest RMS seen since the last sample;
// a ticker task drains it every `level_interval` and publishes a smoothed
// 0–100 value. Advisory only: nothing gates on it.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};

/// Weight kept from the previous reading on each tick.
const SMOOTHING: f32 = 0.8;
/// Anything quieter than this reads as 0.
const FLOOR_DB: f32 = -60.0;

/// Lock-free peak-RMS accumulator shared with the capture thread.
#[derive(Debug, Default)]
pub struct LevelMeter {
    peak_bits: AtomicU32,
}

impl LevelMeter {
    pub fn record(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let sum: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum / samples.len() as f32).sqrt();
        let _ = self
            .peak_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                (rms > f32::from_bits(bits)).then_some(rms.to_bits())
            });
    }

    /// Loudest RMS since the previous call.
    pub fn take(&self) -> f32 {
        f32::from_bits(self.peak_bits.swap(0, Ordering::Relaxed))
    }
}

/// Map an RMS amplitude (0.0–1.0) onto 0–100 on a dB scale.
pub fn rms_to_level(rms: f32) -> f32 {
    if rms <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * rms.log10();
    ((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0) * 100.0
}

#[derive(Debug, Default)]
pub struct LevelSmoother {
    level: f32,
}

impl LevelSmoother {
    pub fn update(&mut self, rms: f32) -> u8 {
        self.level = self.level * SMOOTHING + rms_to_level(rms) * (1.0 - SMOOTHING);
        self.level.round().clamp(0.0, 100.0) as u8
    }
}

pub(crate) fn spawn_meter(
    meter: Arc<LevelMeter>,
    interval: Duration,
    level: Arc<watch::Sender<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut smoother = LevelSmoother::default();
        loop {
            ticker.tick().await;
            let value = smoother.update(meter.take());
            level.send_if_modified(|current| {
                let changed = *current != value;
                *current = value;
                changed
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scale_is_100_and_silence_is_0() {
        assert_eq!(rms_to_level(1.0), 100.0);
        assert_eq!(rms_to_level(0.0), 0.0);
        assert_eq!(rms_to_level(0.0001), 0.0);
        let mid = rms_to_level(0.03);
        assert!(mid > 30.0 && mid < 60.0, "{mid}");
    }

    #[test]
    fn meter_keeps_the_loudest_chunk_until_taken() {
        let meter = LevelMeter::default();
        meter.record(&[0.5; 64]);
        meter.record(&[0.1; 64]);
        assert!((meter.take() - 0.5).abs() < 1e-6);
        assert_eq!(meter.take(), 0.0);
    }

    #[test]
    fn smoother_rises_gradually() {
        let mut smoother = LevelSmoother::default();
        let first = smoother.update(1.0);
        let second = smoother.update(1.0);
        assert_eq!(first, 20);
        assert!(second > first && second < 100);
        for _ in 0..60 {
            smoother.update(1.0);
        }
        assert_eq!(smoother.update(1.0), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn meter_task_publishes_levels() {
        let meter = Arc::new(LevelMeter::default());
        let (tx, mut rx) = watch::channel(0u8);
        let task = spawn_meter(meter.clone(), Duration::from_millis(100), Arc::new(tx));

        meter.record(&[1.0; 32]);
        tokio::time::sleep(Duration::from_millis(150)).await;
        rx.changed().await.unwrap();
        assert!(*rx.borrow() > 0);
        task.abort();
    }
}
