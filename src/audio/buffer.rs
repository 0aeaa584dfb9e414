//! Lock-free sample buffers between the platform callbacks and the session loops
//!
//! [`SampleQueue`] is a single-producer single-consumer ring of PCM samples
//! feeding the output callback. [`FrameAssembler`] cuts the input callback's
//! arbitrarily sized chunks into fixed-size frames.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::frame::AudioFrame;
use crate::constants::BYTES_PER_SAMPLE;

/// Lock-free ring of PCM samples
pub struct SampleQueue {
    queue: ArrayQueue<i16>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl SampleQueue {
    /// Create a queue holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push every sample of `frame` that fits. Returns the number of bytes
    /// accepted; anything short of `frame.len()` is an overflow.
    pub fn push_frame(&self, frame: &AudioFrame) -> usize {
        let mut accepted = 0;
        for sample in frame.samples() {
            if self.queue.push(sample).is_err() {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                break;
            }
            accepted += 1;
        }
        accepted * BYTES_PER_SAMPLE
    }

    /// Fill `out` from the queue, padding with silence on underrun.
    /// Returns the number of real samples written.
    pub fn pop_into(&self, out: &mut [i16]) -> usize {
        let mut filled = 0;
        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(sample) => {
                    *slot = sample;
                    filled += 1;
                }
                None => *slot = 0,
            }
        }
        if filled < out.len() && filled > 0 {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        filled
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Number of callbacks that ran dry part-way through
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a sample queue
pub type SharedSampleQueue = Arc<SampleQueue>;

/// Create a new shared sample queue
pub fn create_shared_queue(capacity: usize) -> SharedSampleQueue {
    Arc::new(SampleQueue::new(capacity))
}

/// Accumulates samples and yields frames of a fixed sample count
pub struct FrameAssembler {
    pending: Vec<i16>,
    samples_per_frame: usize,
}

impl FrameAssembler {
    pub fn new(samples_per_frame: usize) -> Self {
        let samples_per_frame = samples_per_frame.max(1);
        Self {
            pending: Vec::with_capacity(samples_per_frame * 2),
            samples_per_frame,
        }
    }

    /// Append samples and hand every completed frame to `emit`
    pub fn push(&mut self, samples: impl IntoIterator<Item = i16>, mut emit: impl FnMut(AudioFrame)) {
        for sample in samples {
            self.pending.push(sample);
            if self.pending.len() == self.samples_per_frame {
                emit(AudioFrame::from_samples(&self.pending));
                self.pending.clear();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
