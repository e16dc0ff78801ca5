use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::FramePair;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("frame buffer closed while enqueueing")]
    Cancelled,
}

/// What `push` does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Block the producer until a consumer makes room (backpressure).
    #[default]
    Block,
    /// Evict the oldest pending pair and enqueue the new one.
    DropOldest,
}

/// Bounded FIFO queue of frame pairs between the camera callback thread and
/// the display consumer.
///
/// One producer, one or more consumers. Pairs are immutable units; the
/// queue hands out ownership of whole pairs, so concurrent push/poll can
/// never observe a torn value. `close` wakes a producer blocked in `push`.
pub struct FrameBuffer {
    tx: Sender<FramePair>,
    rx: Receiver<FramePair>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    closed: AtomicBool,
    capacity: usize,
    policy: OverflowPolicy,
}

impl FrameBuffer {
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let (close_tx, close_rx) = bounded(0);
        Self {
            tx,
            rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            closed: AtomicBool::new(false),
            capacity,
            policy,
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, OverflowPolicy::Block)
    }

    /// Enqueues a pair at the tail, in FIFO admission order.
    ///
    /// Under `OverflowPolicy::Block` this blocks while the buffer is full
    /// and fails with `Cancelled` if the buffer is closed, including while
    /// blocked; the pair is not enqueued in that case. Under `DropOldest`
    /// it never blocks: the oldest pending pair is evicted instead.
    pub fn push(&self, pair: FramePair) -> Result<(), BufferError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BufferError::Cancelled);
        }

        match self.policy {
            OverflowPolicy::Block => {
                select! {
                    send(self.tx, pair) -> res => res.map_err(|_| BufferError::Cancelled),
                    recv(self.close_rx) -> _ => Err(BufferError::Cancelled),
                }
            }
            OverflowPolicy::DropOldest => {
                let mut pair = pair;
                loop {
                    match self.tx.try_send(pair) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Full(rejected)) => {
                            if self.rx.try_recv().is_ok() {
                                counter!("fusion.buffer.dropped").increment(1);
                            }
                            pair = rejected;
                        }
                        Err(TrySendError::Disconnected(_)) => return Err(BufferError::Cancelled),
                    }
                }
            }
        }
    }

    /// Removes and returns the oldest pending pair, if any. Never blocks.
    #[must_use]
    pub fn poll(&self) -> Option<FramePair> {
        self.rx.try_recv().ok()
    }

    /// Stops accepting pushes and wakes any producer blocked in `push`.
    /// Pairs already enqueued remain pollable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut guard) = self.close_tx.lock() {
            if guard.take().is_some() {
                debug!(pending = self.len(), "frame buffer closed");
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
