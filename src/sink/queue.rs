use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Bounded FIFO of samples between a writer and a device render callback.
///
/// Writers block while the queue is full. A flush bumps the queue's epoch,
/// which makes every write that started before it return early.
pub struct SampleQueue {
    state: Mutex<QueueState>,
    space: Condvar,
    capacity: usize,
}

struct QueueState {
    samples: VecDeque<f32>,
    epoch: u64,
    closed: bool,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                samples: VecDeque::with_capacity(capacity),
                epoch: 0,
                closed: false,
            }),
            space: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Current flush epoch. Every flush or close advances it.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Append `samples`, blocking while the queue is full.
    ///
    /// Returns how many samples were accepted; fewer than `samples.len()` when
    /// a flush or close happened while waiting.
    pub fn push(&self, samples: &[f32]) -> usize {
        let epoch = self.epoch();
        self.push_at(epoch, samples)
    }

    /// Like [`push`](Self::push), but only while the queue is still at
    /// `epoch`. A writer holding an epoch from before a flush gets 0.
    pub fn push_at(&self, epoch: u64, samples: &[f32]) -> usize {
        let mut state = self.state.lock();
        let mut written = 0;

        while written < samples.len() {
            if state.closed || state.epoch != epoch {
                break;
            }
            let room = self.capacity - state.samples.len();
            if room == 0 {
                self.space.wait(&mut state);
                continue;
            }
            let n = room.min(samples.len() - written);
            state.samples.extend(&samples[written..written + n]);
            written += n;
        }

        written
    }

    /// Fill `out` from the front of the queue, padding with silence.
    ///
    /// Called from the device's render callback; never blocks on writers.
    /// Returns the number of queued samples consumed.
    pub fn render(&self, out: &mut [f32]) -> usize {
        let mut state = self.state.lock();
        let n = out.len().min(state.samples.len());
        for (dst, src) in out.iter_mut().zip(state.samples.drain(..n)) {
            *dst = src;
        }
        drop(state);

        out[n..].fill(0.0);
        if n > 0 {
            self.space.notify_all();
        }
        n
    }

    /// Drop all queued samples and release blocked writers.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);
        self.space.notify_all();
    }

    /// Flush and refuse further writes until [`reopen`](Self::reopen).
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.closed = true;
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);
        self.space.notify_all();
    }

    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }
}
