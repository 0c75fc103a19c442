use std::path::{Path, PathBuf};

use ndarray::{arr1, Array2};
use ort::execution_providers::CPUExecutionProvider;
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

use super::config::VoiceConfig;

/// Sample rate reported before a model is loaded.
pub const DEFAULT_SAMPLE_RATE: u32 = 22050;

#[derive(thiserror::Error, Debug)]
pub enum PiperError {
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error(
        "espeak-ng not found. Install: Linux: `sudo apt-get install espeak-ng`, \
         macOS: `brew install espeak-ng`, Windows: https://espeak-ng.org/download"
    )]
    EspeakNotFound,
    #[error("Phonemization failed: {0}")]
    PhonemizerFailed(String),
    #[error("Model not loaded. Call load_model() first.")]
    ModelNotLoaded,
    #[error("Invalid voice config: {0}")]
    Config(String),
    #[error("Speaker {speaker_id} out of range (model has {num_speakers})")]
    SpeakerOutOfRange { speaker_id: u32, num_speakers: u32 },
}

/// Internal Piper ONNX model state.
pub struct PiperModel {
    session: Session,
    config: VoiceConfig,
    /// True for multi-speaker models that take a `sid` input.
    has_sid_input: bool,
}

impl PiperModel {
    /// Load a Piper voice from a directory.
    ///
    /// The directory must contain:
    /// - An `.onnx` file (`model_file_name` if given and present)
    /// - Its voice config, `<model>.onnx.json` or `config.json`
    pub fn load(
        model_dir: &Path,
        model_file_name: Option<&str>,
        num_threads: Option<usize>,
    ) -> Result<Self, PiperError> {
        let onnx_path = find_onnx_file(model_dir, model_file_name)?;
        log::info!("Loading Piper model from {}", onnx_path.display());

        let config = VoiceConfig::load(&find_config_file(&onnx_path)?)?;
        let session = init_session(&onnx_path, num_threads)?;
        let has_sid_input = session.inputs().iter().any(|input| input.name() == "sid");

        log::info!(
            "Detected: sample_rate={}, speakers={}, sid_input={}, espeak_voice='{}'",
            config.audio.sample_rate,
            config.num_speakers,
            has_sid_input,
            config.espeak.voice
        );

        Ok(Self {
            session,
            config,
            has_sid_input,
        })
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.audio.sample_rate
    }

    /// Run one VITS inference over a sentence of phoneme ids.
    ///
    /// `speed` divides the configured length scale, so 2.0 halves durations.
    pub fn infer(
        &mut self,
        ids: &[i64],
        speaker_id: u32,
        speed: f32,
    ) -> Result<Vec<f32>, PiperError> {
        let input = Array2::from_shape_vec((1, ids.len()), ids.to_vec())?;
        let input_lengths = arr1(&[ids.len() as i64]);
        let scales = {
            let inference = &self.config.inference;
            arr1(&[
                inference.noise_scale,
                inference.length_scale / speed,
                inference.noise_w,
            ])
        };

        let output = if self.has_sid_input {
            let sid = arr1(&[speaker_id as i64]);
            let inputs = inputs![
                "input" => TensorRef::from_array_view(input.view())?,
                "input_lengths" => TensorRef::from_array_view(input_lengths.view())?,
                "scales" => TensorRef::from_array_view(scales.view())?,
                "sid" => TensorRef::from_array_view(sid.view())?,
            ];
            self.session.run(inputs)?
        } else {
            let inputs = inputs![
                "input" => TensorRef::from_array_view(input.view())?,
                "input_lengths" => TensorRef::from_array_view(input_lengths.view())?,
                "scales" => TensorRef::from_array_view(scales.view())?,
            ];
            self.session.run(inputs)?
        };

        // Waveform is the first output, shaped [1, 1, 1, samples].
        let first_output = output
            .iter()
            .next()
            .ok_or_else(|| PiperError::Ort(ort::Error::new("No output from model")))?;
        let waveform = first_output.1.try_extract_array::<f32>()?;

        Ok(waveform.iter().copied().collect())
    }
}

/// Find the ONNX model file in the given directory.
///
/// Prefers `preferred` when it exists, then falls back to the first `.onnx`
/// file found.
fn find_onnx_file(model_dir: &Path, preferred: Option<&str>) -> Result<PathBuf, PiperError> {
    if let Some(name) = preferred {
        let path = model_dir.join(name);
        if path.exists() {
            return Ok(path);
        }
        log::warn!("{} not found, scanning {}", name, model_dir.display());
    }

    for entry in std::fs::read_dir(model_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("onnx") {
            log::info!("Using ONNX file: {}", path.display());
            return Ok(path);
        }
    }

    Err(PiperError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("No .onnx file found in {}", model_dir.display()),
    )))
}

/// Locate the voice config: `<model>.onnx.json`, else `config.json` beside it.
fn find_config_file(onnx_path: &Path) -> Result<PathBuf, PiperError> {
    let mut sidecar = onnx_path.as_os_str().to_owned();
    sidecar.push(".json");
    let sidecar = PathBuf::from(sidecar);
    if sidecar.exists() {
        return Ok(sidecar);
    }

    if let Some(dir) = onnx_path.parent() {
        let fallback = dir.join("config.json");
        if fallback.exists() {
            return Ok(fallback);
        }
    }

    Err(PiperError::Config(format!(
        "No voice config found for {} (expected {})",
        onnx_path.display(),
        sidecar.display()
    )))
}

fn init_session(onnx_path: &Path, num_threads: Option<usize>) -> Result<Session, PiperError> {
    let providers = vec![CPUExecutionProvider::default().build()];

    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers(providers)?;

    if let Some(threads) = num_threads {
        builder = builder
            .with_intra_threads(threads)?
            .with_inter_threads(threads)?;
    }

    Ok(builder.commit_from_file(onnx_path)?)
}
