//! Installed languages and their stored voice parameters.
//!
//! The pipeline treats the registry as synchronous and authoritative. It only
//! keeps registry data beyond one request through the active-language snapshot
//! taken by [`EngineCache::set_active`](crate::cache::EngineCache::set_active).

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::TtsConfig;
use crate::{SynthesisParams, TtsError};

/// Synthesis architecture a model needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    VitsPiper,
    Kokoro,
    Matcha,
    #[serde(other)]
    Unknown,
}

/// Per-language voice settings the user can adjust.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub speaker_id: u32,
    pub speed: f32,
    pub gain: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            speaker_id: 0,
            speed: 1.0,
            gain: 1.0,
        }
    }
}

impl VoiceParams {
    pub fn synthesis_params(&self) -> SynthesisParams {
        SynthesisParams {
            speaker_id: self.speaker_id,
            speed: self.speed,
        }
    }
}

/// One installed language as persisted in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    /// ISO 639-3 language code, used as the language identifier.
    pub lang: String,
    /// Country/locale suffix, e.g. `"USA"`. May be empty.
    #[serde(default)]
    pub country: String,
    pub model_file_name: String,
    #[serde(default)]
    pub speaker_id: u32,
    #[serde(default = "unity")]
    pub speed: f32,
    #[serde(default = "unity")]
    pub gain: f32,
    pub model_type: ModelType,
}

fn unity() -> f32 {
    1.0
}

impl LanguageProfile {
    /// A profile with default voice parameters.
    pub fn new(
        lang: impl Into<String>,
        country: impl Into<String>,
        model_file_name: impl Into<String>,
        model_type: ModelType,
    ) -> Self {
        let voice = VoiceParams::default();
        Self {
            lang: lang.into(),
            country: country.into(),
            model_file_name: model_file_name.into(),
            speaker_id: voice.speaker_id,
            speed: voice.speed,
            gain: voice.gain,
            model_type,
        }
    }

    pub fn id(&self) -> &str {
        &self.lang
    }

    /// Name of the per-language model directory, `<lang><country>`.
    pub fn model_dir_name(&self) -> String {
        format!("{}{}", self.lang, self.country)
    }

    pub fn voice(&self) -> VoiceParams {
        VoiceParams {
            speaker_id: self.speaker_id,
            speed: self.speed,
            gain: self.gain,
        }
    }

    fn set_voice(&mut self, voice: VoiceParams) {
        self.speaker_id = voice.speaker_id;
        self.speed = voice.speed;
        self.gain = voice.gain;
    }
}

/// Store of installed languages.
pub trait LanguageRegistry: Send + Sync {
    /// Installed languages in installation order.
    fn list_installed(&self) -> Vec<LanguageProfile>;

    fn get(&self, lang: &str) -> Option<LanguageProfile>;

    fn current(&self) -> Option<String>;

    fn set_current(&self, lang: &str) -> Result<(), TtsError>;

    /// Add a language, replacing any record with the same code.
    fn add(&self, profile: LanguageProfile) -> Result<(), TtsError>;

    /// Remove a language. Returns `false` if it was not installed.
    fn remove(&self, lang: &str) -> Result<bool, TtsError>;

    /// Persist adjusted voice parameters for one language.
    fn update_voice(&self, lang: &str, voice: VoiceParams) -> Result<(), TtsError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    current: Option<String>,
    #[serde(default)]
    languages: Vec<LanguageProfile>,
}

/// Registry persisted as a single JSON document.
///
/// Every mutation rewrites the file through a temporary sibling followed by a
/// rename, so a crash mid-write leaves the previous document intact.
pub struct JsonRegistry {
    path: Option<PathBuf>,
    data: RwLock<RegistryFile>,
}

impl JsonRegistry {
    /// Open the registry at `path`, starting empty if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, TtsError> {
        let data = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            RegistryFile::default()
        };
        log::info!(
            "Opened language registry at {} ({} installed)",
            path.display(),
            data.languages.len()
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            data: RwLock::new(data),
        })
    }

    /// A registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(RegistryFile::default()),
        }
    }

    /// Open the registry at `config.registry_path`, or an in-memory one when
    /// no path is configured.
    pub fn from_config(config: &TtsConfig) -> Result<Self, TtsError> {
        match &config.registry_path {
            Some(path) => Self::open(path),
            None => Ok(Self::in_memory()),
        }
    }

    /// Apply `change` to a copy of the document, persist the copy, and only
    /// then make it the in-memory state.
    fn modify<T>(
        &self,
        change: impl FnOnce(&mut RegistryFile) -> Result<T, TtsError>,
    ) -> Result<T, TtsError> {
        let mut data = self.data.write();
        let mut next = data.clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *data = next;
        Ok(out)
    }

    fn persist(&self, data: &RegistryFile) -> Result<(), TtsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl LanguageRegistry for JsonRegistry {
    fn list_installed(&self) -> Vec<LanguageProfile> {
        self.data.read().languages.clone()
    }

    fn get(&self, lang: &str) -> Option<LanguageProfile> {
        self.data
            .read()
            .languages
            .iter()
            .find(|p| p.lang == lang)
            .cloned()
    }

    fn current(&self) -> Option<String> {
        self.data.read().current.clone()
    }

    fn set_current(&self, lang: &str) -> Result<(), TtsError> {
        self.modify(|data| {
            if !data.languages.iter().any(|p| p.lang == lang) {
                return Err(TtsError::UnknownLanguage(lang.to_string()));
            }
            data.current = Some(lang.to_string());
            Ok(())
        })
    }

    fn add(&self, profile: LanguageProfile) -> Result<(), TtsError> {
        if profile.lang.is_empty() {
            return Err(TtsError::Registry("language code is empty".to_string()));
        }
        let lang = profile.lang.clone();
        self.modify(|data| {
            data.languages.retain(|p| p.lang != profile.lang);
            data.languages.push(profile);
            Ok(())
        })?;
        log::info!("Registered language {lang}");
        Ok(())
    }

    fn remove(&self, lang: &str) -> Result<bool, TtsError> {
        if self.get(lang).is_none() {
            return Ok(false);
        }
        self.modify(|data| {
            data.languages.retain(|p| p.lang != lang);
            if data.current.as_deref() == Some(lang) {
                data.current = None;
            }
            Ok(())
        })?;
        log::info!("Removed language {lang} from registry");
        Ok(true)
    }

    fn update_voice(&self, lang: &str, voice: VoiceParams) -> Result<(), TtsError> {
        self.modify(|data| {
            let profile = data
                .languages
                .iter_mut()
                .find(|p| p.lang == lang)
                .ok_or_else(|| TtsError::UnknownLanguage(lang.to_string()))?;
            profile.set_voice(voice);
            Ok(())
        })
    }
}
