use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::affine::AffineModel;
use crate::buffer::{BufferError, FrameBuffer, OverflowPolicy};
use crate::camera::{CameraEvent, ConnectionStatus};
use crate::engine::InferenceEngine;
use crate::ranker::{self, Recognition};
use crate::scheduler::{FrameScheduler, LatencyWindow};
use crate::tensor::{Normalization, TensorAssembler, TensorError};
use crate::writer::{ImageWriter, WriterError};
use crate::{Frame, FramePair, FRAME_BUFFER_CAPACITY, MAX_RESULTS};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("inference engine already attached")]
    EngineAttached,

    #[error("failed to start inference worker")]
    Spawn(#[source] std::io::Error),
}

/// Receives the ordered recognitions for each processed frame.
///
/// Results carry the sequence number of the frame that triggered them;
/// because inference latency can exceed the inter-frame interval, a result
/// may arrive after newer frames were already displayed. Consumers must
/// tolerate stale results and must not assume one result per displayed
/// frame.
pub trait ResultSink: Send {
    fn on_results(&self, sequence: u64, recognitions: Vec<Recognition>);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Process one frame out of every `frame_skip + 1`.
    pub frame_skip: u32,
    /// Top-k recognitions reported per processed frame.
    pub max_results: usize,
    pub normalization: Normalization,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: FRAME_BUFFER_CAPACITY,
            overflow: OverflowPolicy::Block,
            frame_skip: 0,
            max_results: MAX_RESULTS,
            normalization: Normalization::Raw,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    #[must_use]
    pub fn with_frame_skip(mut self, frame_skip: u32) -> Self {
        self.frame_skip = frame_skip;
        self
    }

    #[must_use]
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    #[must_use]
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }
}

struct Worker {
    job_tx: Sender<FramePair>,
    handle: JoinHandle<()>,
}

/// Owns the frame buffer, the affine registration, the scheduling state,
/// the optional recorder and - while one is attached - the inference
/// worker. Constructed and torn down with explicit start/stop boundaries
/// instead of reassignable handler fields.
///
/// The camera callback context feeds `handle_event`; the UI thread drains
/// `poll_display`; the single worker thread runs inference. The frame
/// buffer is the only structure touched by more than one of them, through
/// its push/poll contract; the inference path receives its own clone of
/// each eligible pair, so neither consumer can starve the other.
pub struct FusionPipeline {
    config: PipelineConfig,
    affine: Arc<AffineModel>,
    buffer: Arc<FrameBuffer>,
    scheduler: Mutex<FrameScheduler>,
    sequence: AtomicU64,
    worker: Mutex<Option<Worker>>,
    writer: Mutex<Option<ImageWriter>>,
}

impl FusionPipeline {
    #[must_use]
    pub fn new(affine: AffineModel, config: PipelineConfig) -> Self {
        let buffer = Arc::new(FrameBuffer::new(config.buffer_capacity, config.overflow));
        let scheduler = Mutex::new(FrameScheduler::new(config.frame_skip));
        Self {
            config,
            affine: Arc::new(affine),
            buffer,
            scheduler,
            sequence: AtomicU64::new(0),
            worker: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Single dispatch point for the camera collaborator.
    ///
    /// Called from the camera's callback context; may block on a full
    /// frame buffer (backpressure). A disconnect shuts the pipeline down.
    pub fn handle_event(&self, event: CameraEvent) -> Result<(), PipelineError> {
        match event {
            CameraEvent::StreamData { thermal, visible } => self.push_frames(thermal, visible),
            CameraEvent::ConnectionChanged(ConnectionStatus::Disconnected) => {
                info!("camera disconnected, shutting down pipeline");
                self.shutdown();
                Ok(())
            }
            CameraEvent::ConnectionChanged(status) => {
                debug!(?status, "connection status changed");
                Ok(())
            }
        }
    }

    /// Admits one thermal/visible pair: stamps the sequence number, queues
    /// it for display (and recording), and offers it to the inference
    /// worker when the scheduler elects this frame.
    pub fn push_frames(&self, thermal: Frame, visible: Frame) -> Result<(), PipelineError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let pair = FramePair::new(thermal, visible, sequence);
        counter!("fusion.frames.received").increment(1);

        self.buffer.push(pair.clone())?;

        if let Some(writer) = &*lock(&self.writer) {
            writer.save(pair.clone());
        }

        if lock(&self.scheduler).should_process(sequence) {
            self.offer_to_worker(pair);
        }

        Ok(())
    }

    /// Removes and returns the oldest displayable pair. Never blocks.
    #[must_use]
    pub fn poll_display(&self) -> Option<FramePair> {
        self.buffer.poll()
    }

    /// Spawns the inference worker around the given engine and sink.
    ///
    /// At most one engine can be attached; the worker thread owns it
    /// exclusively and releases it exactly once when it stops. The model's
    /// input size drives the tensor target dimensions.
    pub fn attach_engine(
        &self,
        engine: Box<dyn InferenceEngine>,
        sink: Box<dyn ResultSink>,
    ) -> Result<(), PipelineError> {
        let mut slot = lock(&self.worker);
        if slot.is_some() {
            return Err(PipelineError::EngineAttached);
        }

        let (width, height) = engine.input_size();
        let assembler = TensorAssembler::new(width, height, self.config.normalization)?;
        let affine = Arc::clone(&self.affine);
        let max_results = self.config.max_results;

        // Capacity 1: at most one pending job on top of the in-flight one.
        // A busy worker means the frame is simply not classified.
        let (job_tx, job_rx) = bounded::<FramePair>(1);
        let handle = thread::Builder::new()
            .name("inference".into())
            .spawn(move || worker_loop(&job_rx, engine, &assembler, &affine, sink, max_results))
            .map_err(PipelineError::Spawn)?;

        *slot = Some(Worker { job_tx, handle });
        Ok(())
    }

    /// Stops the inference worker, letting any in-flight call finish, and
    /// releases the engine. Display keeps running. Reconfiguring the
    /// engine (e.g. switching backend) is detach + attach: the join here
    /// is what guarantees the old engine is released before a new one is
    /// constructed.
    pub fn detach_engine(&self) {
        let worker = lock(&self.worker).take();
        if let Some(Worker { job_tx, handle }) = worker {
            drop(job_tx);
            if handle.join().is_err() {
                warn!("inference worker panicked");
            }
        }
    }

    #[must_use]
    pub fn is_engine_attached(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Starts persisting every incoming pair under `directory`.
    pub fn start_recording(&self, directory: impl Into<PathBuf>) -> Result<(), WriterError> {
        let writer = ImageWriter::new(directory)?;
        *lock(&self.writer) = Some(writer);
        Ok(())
    }

    /// Stops persisting; pending writes are flushed.
    pub fn stop_recording(&self) {
        lock(&self.writer).take();
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        lock(&self.writer).is_some()
    }

    /// Stops the whole pipeline: no further pushes are accepted (a blocked
    /// producer wakes with `Cancelled`), the in-flight inference finishes,
    /// the engine is released, and pending recordings are flushed.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.buffer.close();
        self.detach_engine();
        self.stop_recording();
    }

    fn offer_to_worker(&self, pair: FramePair) {
        let guard = lock(&self.worker);
        let Some(worker) = &*guard else {
            // Display-only mode: no engine attached.
            return;
        };
        match worker.job_tx.try_send(pair) {
            Ok(()) => {}
            Err(TrySendError::Full(pair)) => {
                counter!("fusion.inference.busy_dropped").increment(1);
                debug!(sequence = pair.sequence, "inference busy, frame not classified");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Drop for FusionPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The inference worker: blocks between jobs, assembles the tensor, runs
/// the engine, ranks the output and delivers it to the sink. A failed
/// frame is logged, counted and skipped; the next eligible frame is
/// attempted fresh. The engine is dropped - released - when the loop ends.
fn worker_loop(
    jobs: &Receiver<FramePair>,
    engine: Box<dyn InferenceEngine>,
    assembler: &TensorAssembler,
    affine: &AffineModel,
    sink: Box<dyn ResultSink>,
    max_results: usize,
) {
    let mut latency = LatencyWindow::default();

    for pair in jobs {
        let started = Instant::now();

        let tensor = match assembler.build(&pair, affine) {
            Ok(tensor) => tensor,
            Err(e) => {
                counter!("fusion.inference.errors").increment(1);
                warn!(sequence = pair.sequence, error = %e, "tensor assembly failed, frame skipped");
                continue;
            }
        };

        let output = match engine.run(tensor) {
            Ok(output) => output,
            Err(e) => {
                counter!("fusion.inference.errors").increment(1);
                warn!(sequence = pair.sequence, error = %e, "inference failed, frame skipped");
                continue;
            }
        };

        let recognitions = ranker::rank(&output, engine.labels().as_slice(), max_results);
        latency.record(started.elapsed());
        counter!("fusion.frames.classified").increment(1);

        sink.on_results(pair.sequence, recognitions);
    }

    debug!("inference worker stopped, engine released");
}
