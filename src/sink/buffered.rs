use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{OutputDevice, OutputStream, PlaybackSink, SampleQueue};
use crate::TtsError;

/// The sink currently rendering in this process. Opening another sink shuts
/// this one down first. Always locked before any sink's own stream lock.
static RENDERING: Mutex<Option<Weak<SinkShared>>> = parking_lot::const_mutex(None);

struct OpenStream {
    sample_rate: u32,
    channels: u16,
    /// Queue epoch at the last `open`. Writes carry it so that a stop
    /// invalidates them until the sink is opened again.
    epoch: u64,
    _stream: Box<dyn OutputStream>,
}

struct SinkShared {
    queue: Arc<SampleQueue>,
    stream: Mutex<Option<OpenStream>>,
}

impl SinkShared {
    fn shutdown(&self) {
        self.queue.close();
        if let Some(open) = self.stream.lock().take() {
            log::debug!(
                "Closed output stream ({} Hz, {} ch)",
                open.sample_rate,
                open.channels
            );
        }
    }
}

/// [`PlaybackSink`] that buffers samples for an [`OutputDevice`].
///
/// Only one `BufferedSink` renders per process: `open` on one sink closes
/// whichever other sink was rendering.
pub struct BufferedSink<D> {
    device: D,
    shared: Arc<SinkShared>,
}

impl<D: OutputDevice> BufferedSink<D> {
    /// `capacity` is the buffer size in samples; writers block beyond it.
    pub fn new(device: D, capacity: usize) -> Self {
        Self {
            device,
            shared: Arc::new(SinkShared {
                queue: Arc::new(SampleQueue::new(capacity)),
                stream: Mutex::new(None),
            }),
        }
    }

    pub fn queue(&self) -> &Arc<SampleQueue> {
        &self.shared.queue
    }

    pub fn is_open(&self) -> bool {
        self.shared.stream.lock().is_some()
    }

    /// Replace the device stream with one in the new format.
    fn restart(
        &self,
        stream: &mut Option<OpenStream>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<(), TtsError> {
        if stream.take().is_some() {
            log::debug!("Output format changed, restarting stream");
        }
        self.shared.queue.flush();
        self.shared.queue.reopen();
        let started = self
            .device
            .start(sample_rate, channels, Arc::clone(&self.shared.queue))?;
        log::info!("Opened output stream at {sample_rate} Hz, {channels} ch");
        *stream = Some(OpenStream {
            sample_rate,
            channels,
            epoch: self.shared.queue.epoch(),
            _stream: started,
        });
        Ok(())
    }
}

impl<D: OutputDevice> PlaybackSink for BufferedSink<D> {
    fn open(&self, sample_rate: u32, channels: u16) -> Result<(), TtsError> {
        if sample_rate == 0 || channels == 0 {
            return Err(TtsError::SinkUnavailable(format!(
                "unsupported format {sample_rate} Hz, {channels} ch"
            )));
        }

        let mut rendering = RENDERING.lock();
        if let Some(previous) = rendering.take().and_then(|w| w.upgrade()) {
            if !Arc::ptr_eq(&previous, &self.shared) {
                log::info!("Closing previously open sink before switching output");
                previous.shutdown();
            }
        }

        let mut stream = self.shared.stream.lock();
        let reusable = stream
            .as_ref()
            .is_some_and(|open| open.sample_rate == sample_rate && open.channels == channels);

        if reusable {
            self.shared.queue.reopen();
            if let Some(open) = stream.as_mut() {
                open.epoch = self.shared.queue.epoch();
            }
        } else {
            self.restart(&mut stream, sample_rate, channels)?;
        }

        *rendering = Some(Arc::downgrade(&self.shared));
        Ok(())
    }

    fn write(&self, samples: &[f32]) -> Result<usize, TtsError> {
        let epoch = self
            .shared
            .stream
            .lock()
            .as_ref()
            .map(|open| open.epoch)
            .ok_or_else(|| TtsError::SinkUnavailable("sink is not open".to_string()))?;
        Ok(self.shared.queue.push_at(epoch, samples))
    }

    fn stop_and_flush(&self) {
        self.shared.queue.flush();
    }

    fn close(&self) {
        self.shared.shutdown();
    }
}

impl<D> Drop for BufferedSink<D> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
