use std::path::{Path, PathBuf};

use crate::config::TtsConfig;
use crate::engines::EngineLoader;
use crate::registry::{LanguageProfile, ModelType};
use crate::{ChunkControl, GenerateOutcome, SynthesisEngine, SynthesisParams, TtsError};

use super::model::{PiperError, PiperModel, DEFAULT_SAMPLE_RATE};
use super::phonemizer::{phonemize_sentences, EspeakConfig};

impl From<PiperError> for TtsError {
    fn from(e: PiperError) -> Self {
        TtsError::Synthesis(e.to_string())
    }
}

/// Parameters for configuring Piper model loading.
#[derive(Debug, Clone, Default)]
pub struct PiperModelParams {
    /// Number of CPU threads to use for inference.
    /// `None` uses the ORT default (typically all available cores).
    pub num_threads: Option<usize>,
}

/// Piper (VITS) text-to-speech engine.
///
/// Streams one chunk per sentence. Requires espeak-ng for phonemization.
///
/// ```rust,no_run
/// use tts_stream::{SynthesisEngine, SynthesisParams, engines::piper::PiperEngine};
/// use std::path::Path;
///
/// let mut engine = PiperEngine::new();
/// engine.load_model(Path::new("models/engUSA"), Some("model.onnx"), Default::default())?;
/// let result = engine.synthesize("Hello, world!", &SynthesisParams::default())?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PiperEngine {
    model: Option<PiperModel>,
    model_path: Option<PathBuf>,
    espeak: EspeakConfig,
}

impl Default for PiperEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PiperEngine {
    /// Create a new engine that uses `espeak-ng` from PATH.
    pub fn new() -> Self {
        Self::with_espeak(EspeakConfig::default())
    }

    /// Create a new engine with an explicit espeak-ng setup, e.g. a bundled
    /// binary or `espeak-ng-data` directory.
    pub fn with_espeak(espeak: EspeakConfig) -> Self {
        Self {
            model: None,
            model_path: None,
            espeak,
        }
    }

    pub fn load_model(
        &mut self,
        model_dir: &Path,
        model_file_name: Option<&str>,
        params: PiperModelParams,
    ) -> Result<(), PiperError> {
        let model = PiperModel::load(model_dir, model_file_name, params.num_threads)?;
        self.model = Some(model);
        self.model_path = Some(model_dir.to_path_buf());
        Ok(())
    }

    pub fn unload_model(&mut self) {
        self.model = None;
        self.model_path = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Number of voices in the loaded model (0 when unloaded).
    pub fn num_speakers(&self) -> u32 {
        self.model.as_ref().map_or(0, |m| m.config().num_speakers)
    }
}

impl Drop for PiperEngine {
    fn drop(&mut self) {
        if let Some(path) = &self.model_path {
            log::debug!("Releasing Piper model {}", path.display());
        }
        self.unload_model();
    }
}

impl SynthesisEngine for PiperEngine {
    fn sample_rate(&self) -> u32 {
        self.model
            .as_ref()
            .map_or(DEFAULT_SAMPLE_RATE, |m| m.sample_rate())
    }

    fn generate(
        &mut self,
        text: &str,
        params: &SynthesisParams,
        on_chunk: &mut dyn FnMut(&[f32]) -> ChunkControl,
    ) -> Result<GenerateOutcome, TtsError> {
        let Some(model) = self.model.as_mut() else {
            return Err(TtsError::unavailable("piper", PiperError::ModelNotLoaded));
        };

        if !(params.speed.is_finite() && params.speed > 0.0) {
            return Err(TtsError::InvalidParameter(format!(
                "speed must be positive, got {}",
                params.speed
            )));
        }
        let num_speakers = model.config().num_speakers.max(1);
        if params.speaker_id >= num_speakers {
            return Err(PiperError::SpeakerOutOfRange {
                speaker_id: params.speaker_id,
                num_speakers,
            }
            .into());
        }

        let sentences = phonemize_sentences(text, &model.config().espeak.voice, &self.espeak)?;
        if sentences.is_empty() {
            log::warn!("No phonemes produced for text: {text:?}");
            return Ok(GenerateOutcome::Finished);
        }

        for (i, phonemes) in sentences.iter().enumerate() {
            let ids = model.config().phoneme_ids(phonemes);
            let audio = model.infer(&ids, params.speaker_id, params.speed)?;
            log::debug!(
                "Sentence {}/{}: {} ids -> {} samples",
                i + 1,
                sentences.len(),
                ids.len(),
                audio.len()
            );
            if audio.is_empty() {
                continue;
            }
            if on_chunk(&audio) == ChunkControl::Stop {
                return Ok(GenerateOutcome::Stopped);
            }
        }

        Ok(GenerateOutcome::Finished)
    }
}

/// Loads `vits-piper` languages from `<models_root>/<lang><country>/`.
#[derive(Debug, Clone)]
pub struct PiperLoader {
    models_root: PathBuf,
    espeak: EspeakConfig,
    params: PiperModelParams,
}

impl PiperLoader {
    pub fn new(models_root: impl Into<PathBuf>, espeak: EspeakConfig, params: PiperModelParams) -> Self {
        Self {
            models_root: models_root.into(),
            espeak,
            params,
        }
    }

    pub fn from_config(config: &TtsConfig) -> Self {
        Self::new(
            config.models_dir.clone(),
            EspeakConfig {
                bin_path: config.espeak_bin.clone(),
                data_path: config.espeak_data.clone(),
            },
            PiperModelParams {
                num_threads: config.num_threads,
            },
        )
    }

    pub fn model_dir(&self, profile: &LanguageProfile) -> PathBuf {
        self.models_root.join(profile.model_dir_name())
    }

    /// The configured espeak setup, falling back to an `espeak-ng-data`
    /// directory shipped inside the language's model directory.
    fn espeak_for(&self, model_dir: &Path) -> EspeakConfig {
        let mut espeak = self.espeak.clone();
        if espeak.data_path.is_none() {
            let bundled = model_dir.join("espeak-ng-data");
            if bundled.is_dir() {
                espeak.data_path = Some(bundled);
            }
        }
        espeak
    }
}

impl EngineLoader for PiperLoader {
    fn load(&self, profile: &LanguageProfile) -> Result<Box<dyn SynthesisEngine>, TtsError> {
        if profile.model_type != ModelType::VitsPiper {
            return Err(TtsError::unavailable(
                &profile.lang,
                format!("unsupported model type {:?}", profile.model_type),
            ));
        }

        let model_dir = self.model_dir(profile);
        if !model_dir.is_dir() {
            return Err(TtsError::unavailable(
                &profile.lang,
                format!("model directory {} does not exist", model_dir.display()),
            ));
        }

        let mut engine = PiperEngine::with_espeak(self.espeak_for(&model_dir));
        engine
            .load_model(&model_dir, Some(&profile.model_file_name), self.params.clone())
            .map_err(|e| TtsError::unavailable(&profile.lang, e))?;
        Ok(Box::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unloaded_engine_is_unavailable() {
        let mut engine = PiperEngine::new();
        assert_eq!(engine.sample_rate(), DEFAULT_SAMPLE_RATE);
        let err = engine
            .generate("hello", &SynthesisParams::default(), &mut |_| {
                ChunkControl::Continue
            })
            .unwrap_err();
        assert!(matches!(err, TtsError::EngineUnavailable { .. }));
    }

    #[test]
    fn loader_rejects_other_model_types() {
        let loader = PiperLoader::new("models", EspeakConfig::default(), Default::default());
        let profile = LanguageProfile::new("eng", "USA", "model.onnx", ModelType::Kokoro);
        let err = loader.load(&profile).err().unwrap();
        assert!(matches!(err, TtsError::EngineUnavailable { language, .. } if language == "eng"));
    }

    #[test]
    fn loader_reports_missing_model_directory() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PiperLoader::new(dir.path(), EspeakConfig::default(), Default::default());
        let profile = LanguageProfile::new("deu", "DEU", "model.onnx", ModelType::VitsPiper);
        assert!(matches!(
            loader.load(&profile),
            Err(TtsError::EngineUnavailable { .. })
        ));
    }

    #[test]
    fn bundled_espeak_data_is_used_when_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("engUSA");
        std::fs::create_dir_all(model_dir.join("espeak-ng-data")).unwrap();

        let loader = PiperLoader::new(dir.path(), EspeakConfig::default(), Default::default());
        let espeak = loader.espeak_for(&model_dir);
        assert_eq!(espeak.data_path, Some(model_dir.join("espeak-ng-data")));
    }
}
