//! Speech synthesis engines.
//!
//! This module contains implementations of text-to-speech engines and the
//! [`EngineLoader`] seam the engine cache uses to construct them.
//!
//! # Available Engines
//!
//! Enable engines via Cargo features:
//! - `piper` - Piper VITS voices (ONNX format, espeak-ng required)

#[cfg(feature = "piper")]
pub mod piper;

#[cfg(test)]
pub(crate) mod scripted;

use crate::registry::LanguageProfile;
use crate::{SynthesisEngine, TtsError};

/// Constructs a loaded engine for an installed language.
///
/// Loading is expensive and blocking; callers run it off latency-sensitive
/// threads. Failures are reported as [`TtsError::EngineUnavailable`].
pub trait EngineLoader: Send + Sync {
    fn load(&self, profile: &LanguageProfile) -> Result<Box<dyn SynthesisEngine>, TtsError>;
}

impl<F> EngineLoader for F
where
    F: Fn(&LanguageProfile) -> Result<Box<dyn SynthesisEngine>, TtsError> + Send + Sync,
{
    fn load(&self, profile: &LanguageProfile) -> Result<Box<dyn SynthesisEngine>, TtsError> {
        self(profile)
    }
}
