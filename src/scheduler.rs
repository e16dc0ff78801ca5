use std::collections::VecDeque;
use std::time::Duration;

use metrics::histogram;
use tracing::info;

use crate::LATENCY_WINDOW;

/// Decides which incoming frames reach the inference path.
///
/// Inference is the slowest stage in the pipeline, so it runs on a
/// fraction of the frame rate: once every `skip + 1` frames, counted from
/// the first frame the scheduler observes. `skip = 0` processes every
/// frame.
#[derive(Debug)]
pub struct FrameScheduler {
    skip: u64,
    first_index: Option<u64>,
}

impl FrameScheduler {
    #[must_use]
    pub fn new(skip: u32) -> Self {
        Self {
            skip: u64::from(skip),
            first_index: None,
        }
    }

    /// True for frame indices `first, first + skip + 1, first + 2(skip + 1), ...`
    /// where `first` is the index seen on the first call.
    pub fn should_process(&mut self, frame_index: u64) -> bool {
        let first = *self.first_index.get_or_insert(frame_index);
        frame_index.saturating_sub(first) % (self.skip + 1) == 0
    }
}

/// Rolling window of per-inference latency samples.
///
/// Keeps the last `window` samples, records each into the
/// `fusion.inference.duration_ms` histogram, and logs a mean/std summary
/// every `window` samples.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    window: usize,
    since_report: usize,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}

impl LatencyWindow {
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            since_report: 0,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        histogram!("fusion.inference.duration_ms").record(ms);

        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);

        self.since_report += 1;
        if self.since_report >= self.window {
            self.since_report = 0;
            info!(
                samples = self.samples.len(),
                mean_ms = self.mean_ms(),
                std_dev_ms = self.std_dev_ms(),
                "inference latency"
            );
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean over the retained samples, in milliseconds.
    #[must_use]
    pub fn mean_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = self.samples.len() as f64;
        self.samples.iter().sum::<f64>() / n
    }

    /// Population standard deviation over the retained samples.
    #[must_use]
    pub fn std_dev_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mean = self.mean_ms();
        #[allow(clippy::cast_precision_loss)]
        let n = self.samples.len() as f64;
        let variance = self
            .samples
            .iter()
            .map(|s| (s - mean).powi(2))
            .sum::<f64>()
            / n;
        variance.sqrt()
    }
}
