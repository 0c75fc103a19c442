//! Piper (VITS) text-to-speech engine implementation.
//!
//! This module provides the `vits-piper` synthesis engine: a VITS ONNX model
//! driven by espeak-ng phonemes. Text is split into sentences and each
//! sentence is one inference step, so audio streams out sentence by sentence.
//!
//! # System Requirements
//!
//! **espeak-ng** must be installed, or its binary and `espeak-ng-data`
//! directory bundled and passed through [`EspeakConfig`]:
//! - **Linux**: `sudo apt-get install espeak-ng`
//! - **macOS**: `brew install espeak-ng`
//! - **Windows**: Download installer from <https://espeak-ng.org/download>
//!
//! # Model Directory Layout
//!
//! ```text
//! models/engUSA/
//! ├── model.onnx          # VITS voice
//! ├── model.onnx.json     # sample rate, espeak voice, phoneme id map
//! └── espeak-ng-data/     # optional bundled espeak-ng data
//! ```
//!
//! Voices: <https://huggingface.co/rhasspy/piper-voices>
//!
//! # Speakers and Speed
//!
//! Multi-speaker voices take the speaker index as the model's `sid` input;
//! indices at or beyond `num_speakers` are rejected. The speed multiplier
//! divides the voice's configured `length_scale`.

pub mod config;
pub mod engine;
pub mod model;
pub mod phonemizer;

pub use config::VoiceConfig;
pub use engine::{PiperEngine, PiperLoader, PiperModelParams};
pub use model::PiperError;
pub use phonemizer::EspeakConfig;
