//! Error type shared by the engines, the cache, the sinks and the sessions.

/// Errors produced anywhere in the synthesis-to-playback pipeline.
#[derive(thiserror::Error, Debug)]
pub enum TtsError {
    /// The model for a language could not be loaded. The previously active
    /// engine, if any, stays usable.
    #[error("Engine for '{language}' unavailable: {reason}")]
    EngineUnavailable { language: String, reason: String },
    #[error("Synthesis failed: {0}")]
    Synthesis(String),
    #[error("Audio sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("Engine for '{0}' is in use by an active session")]
    CacheContention(String),
    #[error("Language '{0}' is not installed")]
    UnknownLanguage(String),
    #[error("No active language. Call set_language() first.")]
    NoActiveLanguage,
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid session state: {0}")]
    InvalidState(&'static str),
    #[error("Registry error: {0}")]
    Registry(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TtsError {
    pub(crate) fn unavailable(language: &str, reason: impl ToString) -> Self {
        Self::EngineUnavailable {
            language: language.to_string(),
            reason: reason.to_string(),
        }
    }
}
