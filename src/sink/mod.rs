//! Real-time audio output.
//!
//! A [`PlaybackSink`] accepts mono f32 chunks in order and blocks the writer
//! while its buffer is full. [`BufferedSink`] implements it over any
//! [`OutputDevice`]: writers fill a bounded [`SampleQueue`] and the device's
//! render callback drains it.
//!
//! ```text
//! consumer thread                      device thread
//!     │                                     │
//! [write chunk]──►SampleQueue (bounded)──►[render callback]
//!     ▲ blocks while full                   │ pads with silence when empty
//! ```

mod buffered;
#[cfg(feature = "cpal")]
mod cpal_device;
mod queue;
mod wav;

pub use buffered::BufferedSink;
#[cfg(feature = "cpal")]
pub use cpal_device::CpalDevice;
pub use queue::SampleQueue;
pub use wav::WavSink;

use std::sync::Arc;

use crate::TtsError;

/// Destination for synthesized audio.
pub trait PlaybackSink: Send + Sync {
    /// Prepare output at `sample_rate`. Reopening with the same format reuses
    /// the running output; a different format replaces it.
    fn open(&self, sample_rate: u32, channels: u16) -> Result<(), TtsError>;

    /// Enqueue samples for output, blocking while the buffer is full.
    ///
    /// Returns the number of samples accepted, which is short of
    /// `samples.len()` only when [`stop_and_flush`](Self::stop_and_flush) or
    /// [`close`](Self::close) interrupted the write.
    fn write(&self, samples: &[f32]) -> Result<usize, TtsError>;

    /// Discard everything buffered but not yet rendered and wake any blocked
    /// writer. The sink stays open, but writes accept nothing until the next
    /// [`open`](Self::open), including writes that were already on their way.
    fn stop_and_flush(&self);

    /// Stop output and release the device.
    fn close(&self);
}

/// A running device output stream. Dropping it stops rendering.
pub trait OutputStream: Send {}

/// Audio device backend for [`BufferedSink`].
pub trait OutputDevice: Send + Sync {
    /// Start rendering from `queue` at `sample_rate`, fanning mono samples out
    /// to the device's channels.
    fn start(
        &self,
        sample_rate: u32,
        channels: u16,
        queue: Arc<SampleQueue>,
    ) -> Result<Box<dyn OutputStream>, TtsError>;
}

impl<D: OutputDevice> OutputDevice for Arc<D> {
    fn start(
        &self,
        sample_rate: u32,
        channels: u16,
        queue: Arc<SampleQueue>,
    ) -> Result<Box<dyn OutputStream>, TtsError> {
        (**self).start(sample_rate, channels, queue)
    }
}
