//! Runtime configuration.
//!
//! Loaded from a JSON file or assembled with [`TtsConfigBuilder`]. Every field
//! has a default, so a config file only needs the keys it changes:
//!
//! ```json
//! { "models_dir": "/data/tts/models", "channel_capacity": 8 }
//! ```

use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::TtsError;

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct TtsConfig {
    /// Root holding one `<lang><country>` directory per installed language.
    pub models_dir: PathBuf,
    /// Where the language registry is persisted. `None` keeps it in memory.
    pub registry_path: Option<PathBuf>,
    /// Maximum number of synthesized chunks queued ahead of playback.
    pub channel_capacity: usize,
    /// Capacity of the playback ring, in milliseconds of audio.
    pub sink_buffer_ms: u32,
    /// Number of device channels the mono stream is fanned out to.
    pub output_channels: u16,
    /// espeak-ng binary. `None` uses `espeak-ng` from PATH.
    pub espeak_bin: Option<PathBuf>,
    /// espeak-ng data directory (`espeak-ng-data`).
    pub espeak_data: Option<PathBuf>,
    /// Inference threads per engine. `None` uses the ORT default.
    pub num_threads: Option<usize>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            registry_path: None,
            channel_capacity: 4,
            sink_buffer_ms: 250,
            output_channels: 1,
            espeak_bin: None,
            espeak_data: None,
            num_threads: None,
        }
    }
}

impl TtsConfig {
    /// Read a JSON config file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self, TtsError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TtsError> {
        if self.channel_capacity == 0 {
            return Err(TtsError::InvalidParameter(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.sink_buffer_ms == 0 {
            return Err(TtsError::InvalidParameter(
                "sink_buffer_ms must be at least 1".to_string(),
            ));
        }
        if self.output_channels == 0 {
            return Err(TtsError::InvalidParameter(
                "output_channels must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Playback ring capacity in samples at `sample_rate`.
    pub fn sink_buffer_samples(&self, sample_rate: u32) -> usize {
        let samples = sample_rate as u64 * self.sink_buffer_ms as u64 / 1000;
        (samples as usize).max(1)
    }
}
