use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::PlaybackSink;
use crate::TtsError;

struct OpenFile {
    sample_rate: u32,
    channels: u16,
    writer: hound::WavWriter<BufWriter<File>>,
}

/// Sink that writes 32-bit float WAV instead of rendering to a device.
///
/// Each session is appended to the same file while the format stays the
/// same; a format change finalizes the file and starts it over. Writes
/// between `stop_and_flush` and the next `open` are discarded.
pub struct WavSink {
    path: PathBuf,
    file: Mutex<Option<OpenFile>>,
    stopped: AtomicBool,
}

impl WavSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn finalize(open: OpenFile) -> Result<(), TtsError> {
        open.writer.finalize()?;
        Ok(())
    }
}

impl PlaybackSink for WavSink {
    fn open(&self, sample_rate: u32, channels: u16) -> Result<(), TtsError> {
        let mut file = self.file.lock();
        self.stopped.store(false, Ordering::SeqCst);
        if file
            .as_ref()
            .is_some_and(|f| f.sample_rate == sample_rate && f.channels == channels)
        {
            return Ok(());
        }
        if let Some(previous) = file.take() {
            Self::finalize(previous)?;
        }

        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(&self.path, spec)
            .map_err(|e| TtsError::SinkUnavailable(format!("{}: {e}", self.path.display())))?;
        log::info!("Writing audio to {}", self.path.display());
        *file = Some(OpenFile {
            sample_rate,
            channels,
            writer,
        });
        Ok(())
    }

    fn write(&self, samples: &[f32]) -> Result<usize, TtsError> {
        let mut file = self.file.lock();
        let open = file
            .as_mut()
            .ok_or_else(|| TtsError::SinkUnavailable("sink is not open".to_string()))?;
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(0);
        }
        for &sample in samples {
            for _ in 0..open.channels {
                open.writer.write_sample(sample)?;
            }
        }
        Ok(samples.len())
    }

    fn stop_and_flush(&self) {
        // Samples already written stay in the file.
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        if let Some(open) = self.file.lock().take() {
            if let Err(e) = Self::finalize(open) {
                log::error!("Failed to finalize {}: {e}", self.path.display());
            }
        }
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        self.close();
    }
}
