//! Deterministic engine for exercising the pipeline in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{ChunkControl, GenerateOutcome, SynthesisEngine, SynthesisParams, TtsError};

/// Replays a fixed list of chunks, optionally pausing before each one.
pub(crate) struct ScriptedEngine {
    sample_rate: u32,
    chunks: Vec<Vec<f32>>,
    step_delay: Duration,
    fail_at: Option<usize>,
    /// Chunks handed to the callback across all calls.
    pub(crate) emitted: Arc<AtomicUsize>,
    /// Params of every `generate` call, oldest first.
    pub(crate) params_seen: Arc<Mutex<Vec<SynthesisParams>>>,
}

impl ScriptedEngine {
    pub(crate) fn new(sample_rate: u32, chunks: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            chunks,
            step_delay: Duration::ZERO,
            fail_at: None,
            emitted: Arc::new(AtomicUsize::new(0)),
            params_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// `count` chunks of `len` samples where chunk `i` holds the value `i + 1`.
    pub(crate) fn numbered(sample_rate: u32, count: usize, len: usize) -> Self {
        let chunks = (0..count).map(|i| vec![(i + 1) as f32; len]).collect();
        Self::new(sample_rate, chunks)
    }

    pub(crate) fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Fail with a synthesis error instead of producing chunk `index`.
    pub(crate) fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }
}

impl SynthesisEngine for ScriptedEngine {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn generate(
        &mut self,
        text: &str,
        params: &SynthesisParams,
        on_chunk: &mut dyn FnMut(&[f32]) -> ChunkControl,
    ) -> Result<GenerateOutcome, TtsError> {
        if text.contains('\u{0}') {
            return Err(TtsError::Synthesis("text contains NUL".to_string()));
        }
        self.params_seen.lock().push(*params);

        for (i, chunk) in self.chunks.iter().enumerate() {
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
            if self.fail_at == Some(i) {
                return Err(TtsError::Synthesis(format!("inference failed at step {i}")));
            }
            self.emitted.fetch_add(1, Ordering::SeqCst);
            if on_chunk(chunk) == ChunkControl::Stop {
                return Ok(GenerateOutcome::Stopped);
            }
        }
        Ok(GenerateOutcome::Finished)
    }
}
