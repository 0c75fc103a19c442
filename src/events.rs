//! Status events reported by the playback control surface.

use std::sync::Arc;

use crate::registry::VoiceParams;
use crate::session::SessionOutcome;
use crate::TtsError;

/// Completion and failure notifications for [`Speaker`](crate::speaker::Speaker)
/// commands, which return before the work is done.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    SessionStarted {
        language: String,
    },
    SessionFinished {
        language: String,
        outcome: SessionOutcome,
    },
    LanguageChanged {
        language: String,
        sample_rate: u32,
    },
    VoiceChanged {
        language: String,
        voice: VoiceParams,
    },
    LanguageRemoved {
        language: String,
    },
    /// A command failed. Nothing else changed.
    Error(Arc<TtsError>),
}

impl TtsEvent {
    pub(crate) fn error(error: TtsError) -> Self {
        Self::Error(Arc::new(error))
    }
}
