//! # tts-stream
//!
//! Offline, on-device text-to-speech with real-time streaming playback.
//!
//! ## Features
//!
//! - **Streaming synthesis**: engines hand out audio chunk by chunk through a
//!   callback that can stop generation early
//! - **Back-pressured playback**: a bounded channel between the synthesis
//!   worker and the playback worker keeps memory use constant
//! - **Per-language engine cache**: at most one loaded engine per language,
//!   constructed once even under concurrent requests
//! - **Piper voices**: `vits-piper` ONNX models (feature `piper`)
//! - **Audio output**: `cpal` device output (feature `cpal`) or WAV files
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! tts-stream = { version = "0.1", features = ["piper", "cpal"] }
//! ```
//!
//! ```ignore
//! use std::sync::Arc;
//! use tts_stream::{
//!     cache::EngineCache, config::TtsConfig, engines::piper::PiperLoader,
//!     registry::JsonRegistry, sink::{BufferedSink, CpalDevice}, speaker::Speaker,
//! };
//!
//! let config = TtsConfig::from_json_file("tts.json".as_ref())?;
//! let registry = Arc::new(JsonRegistry::open("registry.json".as_ref())?);
//! let cache = Arc::new(EngineCache::new(registry.clone(), Arc::new(PiperLoader::from_config(&config))));
//! let sink = Arc::new(BufferedSink::new(CpalDevice::new(), config.sink_buffer_samples(22050)));
//!
//! let (speaker, events) = Speaker::new(cache, sink, &config)?;
//! speaker.set_language("eng");
//! speaker.speak("Hello, world!");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod assets;
pub mod cache;
pub mod config;
pub mod engines;
pub mod error;
pub mod events;
pub mod registry;
pub mod session;
pub mod sink;
pub mod speaker;

pub use error::TtsError;

use std::path::Path;

/// One buffer of mono f32 samples produced by one synthesis step.
pub type AudioChunk = Vec<f32>;

/// The result of a whole-utterance synthesis.
///
/// Contains raw f32 audio samples and the sample rate of the output audio.
#[derive(Debug)]
pub struct SynthesisResult {
    /// Raw audio samples as f32 values
    pub samples: Vec<f32>,
    /// Sample rate of the audio (22050 for most Piper voices)
    pub sample_rate: u32,
}

impl SynthesisResult {
    /// Write the audio to a 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), TtsError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Continuation signal returned by a chunk callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkControl {
    Continue,
    Stop,
}

/// How a call to [`SynthesisEngine::generate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// Every chunk of the text was produced.
    Finished,
    /// The callback returned [`ChunkControl::Stop`].
    Stopped,
}

/// Request-scoped synthesis parameters.
///
/// These travel with each `generate` call instead of living on the engine so
/// that one cached engine never carries settings from a previous request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisParams {
    /// Speaker index for multi-speaker models.
    pub speaker_id: u32,
    /// Speech speed multiplier, default 1.0.
    pub speed: f32,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            speaker_id: 0,
            speed: 1.0,
        }
    }
}

/// Common interface for text-to-speech synthesis engines.
///
/// An engine wraps one loaded voice model. Generation is driven by a callback
/// that receives each chunk synchronously on the calling thread and decides
/// whether synthesis continues.
pub trait SynthesisEngine: Send {
    /// Output sample rate, fixed for the lifetime of the loaded model.
    fn sample_rate(&self) -> u32;

    /// Synthesize `text`, invoking `on_chunk` once per produced chunk.
    ///
    /// Returns [`GenerateOutcome::Stopped`] without error as soon as the
    /// callback asks to stop; no further chunks are produced after that.
    fn generate(
        &mut self,
        text: &str,
        params: &SynthesisParams,
        on_chunk: &mut dyn FnMut(&[f32]) -> ChunkControl,
    ) -> Result<GenerateOutcome, TtsError>;

    /// Synthesize the whole text into one buffer.
    fn synthesize(
        &mut self,
        text: &str,
        params: &SynthesisParams,
    ) -> Result<SynthesisResult, TtsError> {
        let mut samples = Vec::new();
        self.generate(text, params, &mut |chunk| {
            samples.extend_from_slice(chunk);
            ChunkControl::Continue
        })?;
        Ok(SynthesisResult {
            samples,
            sample_rate: self.sample_rate(),
        })
    }

    /// Synthesize speech from the given text and write to a WAV file.
    ///
    /// Default implementation calls `synthesize()` then `SynthesisResult::write_wav()`.
    fn synthesize_to_file(
        &mut self,
        text: &str,
        wav_path: &Path,
        params: &SynthesisParams,
    ) -> Result<(), TtsError> {
        self.synthesize(text, params)?.write_wav(wav_path)
    }
}
