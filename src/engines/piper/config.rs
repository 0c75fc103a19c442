use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::model::PiperError;

const PAD: char = '_';
const BOS: char = '^';
const EOS: char = '$';

/// Voice configuration shipped next to a Piper model (`model.onnx.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    pub audio: AudioConfig,
    #[serde(default)]
    pub espeak: EspeakVoice,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default = "default_num_speakers")]
    pub num_speakers: u32,
    phoneme_id_map: HashMap<String, Vec<i64>>,
    #[serde(skip)]
    symbols: HashMap<char, Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EspeakVoice {
    pub voice: String,
}

impl Default for EspeakVoice {
    fn default() -> Self {
        Self {
            voice: "en-us".to_string(),
        }
    }
}

/// Default VITS sampling scales.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub noise_scale: f32,
    pub length_scale: f32,
    pub noise_w: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            noise_scale: 0.667,
            length_scale: 1.0,
            noise_w: 0.8,
        }
    }
}

fn default_num_speakers() -> u32 {
    1
}

impl VoiceConfig {
    pub fn load(path: &Path) -> Result<Self, PiperError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, PiperError> {
        let mut config: Self = serde_json::from_str(content)
            .map_err(|e| PiperError::Config(format!("Failed to parse JSON: {e}")))?;

        if config.audio.sample_rate == 0 {
            return Err(PiperError::Config("audio.sample_rate must be > 0".to_string()));
        }

        let mut symbols = HashMap::with_capacity(config.phoneme_id_map.len());
        for (k, v) in &config.phoneme_id_map {
            let mut chars = k.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) => {
                    symbols.insert(ch, v.clone());
                }
                _ => log::warn!("Skipping multi-character phoneme {k:?}"),
            }
        }
        if symbols.is_empty() {
            return Err(PiperError::Config("'phoneme_id_map' is empty".to_string()));
        }
        config.symbols = symbols;

        Ok(config)
    }

    /// Map one sentence of phonemes to model input ids.
    ///
    /// Produces `BOS PAD (p PAD)* EOS`. Phonemes missing from the map are
    /// dropped.
    pub fn phoneme_ids(&self, phonemes: &[char]) -> Vec<i64> {
        let pad = self.symbol_ids(PAD, 0);
        let mut ids = Vec::with_capacity(phonemes.len() * 2 + 3);
        ids.extend_from_slice(&self.symbol_ids(BOS, 1));
        ids.extend_from_slice(&pad);

        for ch in phonemes {
            if let Some(phoneme) = self.symbols.get(ch) {
                ids.extend_from_slice(phoneme);
                ids.extend_from_slice(&pad);
            }
        }

        ids.extend_from_slice(&self.symbol_ids(EOS, 2));
        ids
    }

    fn symbol_ids(&self, symbol: char, fallback: i64) -> Vec<i64> {
        self.symbols
            .get(&symbol)
            .cloned()
            .unwrap_or_else(|| vec![fallback])
    }
}
